//! Driver-facing types for device-group testing.
//!
//! This module holds the handle, descriptor and memory-property types that
//! flow across the [`DeviceGroupDriver`](crate::traits::DeviceGroupDriver)
//! seam, plus the bundled driver implementations.

#[cfg(feature = "gpu")]
pub mod adapters;
pub mod commands;
pub mod software;

pub use commands::{
    Access, Barrier, BufferImageCopy, Command, CommandBuffer, ImageCopy, ImageLayout, PipelineDesc,
    PolygonMode,
};
#[cfg(test)]
pub use software::FaultInjection;
pub use software::{PeerFeatureTable, SoftwareDriver, SoftwareGroup, SoftwarePlatform};

use crate::group::DeviceMask;

/// Opaque handle of a buffer object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u64);

/// Opaque handle of an image object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageHandle(pub u64);

/// Opaque handle of a memory allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryHandle(pub u64);

/// Opaque handle of a fence returned by a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FenceHandle(pub u64);

/// A resource that memory can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceHandle {
    Buffer(BufferHandle),
    Image(ImageHandle),
}

impl std::fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffer(h) => write!(f, "buffer#{}", h.0),
            Self::Image(h) => write!(f, "image#{}", h.0),
        }
    }
}

/// Two-dimensional extent in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels covered.
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Screen-space rectangle: signed offset plus extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const ZERO: Self = Self {
        x: 0,
        y: 0,
        width: 0,
        height: 0,
    };

    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Rectangle covering a whole extent from the origin.
    pub const fn full(extent: Extent) -> Self {
        Self::new(0, 0, extent.width, extent.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    pub fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= self.x as i64 && x < self.right() && y >= self.y as i64 && y < self.bottom()
    }

    /// Overlapping part of two rectangles, `None` when they do not overlap.
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let x0 = (self.x as i64).max(other.x as i64);
        let y0 = (self.y as i64).max(other.y as i64);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x0 >= x1 || y0 >= y1 {
            return None;
        }
        Some(Rect::new(
            x0 as i32,
            y0 as i32,
            (x1 - x0) as u32,
            (y1 - y0) as u32,
        ))
    }
}

/// Memory property flags reported per memory type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct MemoryPropertyFlags(pub u32);

impl MemoryPropertyFlags {
    pub const NONE: Self = Self(0);
    pub const DEVICE_LOCAL: Self = Self(1 << 0);
    pub const HOST_VISIBLE: Self = Self(1 << 1);
    pub const HOST_COHERENT: Self = Self(1 << 2);
    pub const HOST_CACHED: Self = Self(1 << 3);

    /// True if every flag in `other` is also set in `self`.
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for MemoryPropertyFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::fmt::Display for MemoryPropertyFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = [
            (Self::DEVICE_LOCAL, "DEVICE_LOCAL"),
            (Self::HOST_VISIBLE, "HOST_VISIBLE"),
            (Self::HOST_COHERENT, "HOST_COHERENT"),
            (Self::HOST_CACHED, "HOST_CACHED"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", set.join("|"))
        }
    }
}

/// One memory type of a physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    pub property_flags: MemoryPropertyFlags,
    pub heap_index: u32,
}

/// One memory heap of a physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryHeap {
    pub size: u64,
    /// Allocations spanning several devices get one instance per device.
    pub multi_instance: bool,
}

/// Memory types and heaps of one physical device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryProperties {
    pub types: Vec<MemoryType>,
    pub heaps: Vec<MemoryHeap>,
}

/// Size, alignment and allowed memory types of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    pub memory_type_bits: u32,
}

/// Buffer usage flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct BufferUsage(pub u32);

impl BufferUsage {
    pub const TRANSFER_SRC: Self = Self(1 << 0);
    pub const TRANSFER_DST: Self = Self(1 << 1);
    pub const VERTEX: Self = Self(1 << 2);
    pub const INDEX: Self = Self(1 << 3);
    pub const UNIFORM: Self = Self(1 << 4);
    pub const STORAGE: Self = Self(1 << 5);

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for BufferUsage {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Image usage flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct ImageUsage(pub u32);

impl ImageUsage {
    pub const TRANSFER_SRC: Self = Self(1 << 0);
    pub const TRANSFER_DST: Self = Self(1 << 1);
    pub const COLOR_ATTACHMENT: Self = Self(1 << 2);

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for ImageUsage {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Pixel formats the engine renders to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Rgba8Unorm,
}

impl Format {
    pub const fn bytes_per_pixel(&self) -> u32 {
        match self {
            Self::Rgba8Unorm => 4,
        }
    }

    /// Encodes a float colour into one texel.
    pub fn encode(&self, rgba: [f32; 4]) -> [u8; 4] {
        fn unorm(v: f32) -> u8 {
            let v = v.clamp(0.0, 1.0);
            (v * 255.0 + 0.5).floor() as u8
        }
        match self {
            Self::Rgba8Unorm => rgba.map(unorm),
        }
    }
}

/// Buffer creation descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
}

/// Image creation descriptor (2D, single mip, single layer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    pub extent: Extent,
    pub format: Format,
    pub usage: ImageUsage,
    /// Several images may be bound to the same memory and see the same texels.
    pub alias: bool,
    /// Memory may be bound with per-device split-instance rectangles.
    pub split_instance_bind: bool,
}

impl ImageDesc {
    /// Size of the tightly packed pixel data in bytes.
    pub fn data_size(&self) -> u64 {
        self.extent.area() * self.format.bytes_per_pixel() as u64
    }
}

/// Either kind of resource descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceDesc {
    Buffer(BufferDesc),
    Image(ImageDesc),
}

/// Memory allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationInfo {
    pub size: u64,
    pub memory_type_index: u32,
    /// Devices that back the allocation; `None` means the whole group.
    pub device_mask: Option<DeviceMask>,
    /// Allocation is dedicated to exactly this resource.
    pub dedicated: Option<ResourceHandle>,
}

/// How each device of the group reaches the instances of bound memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryBinding {
    /// Every device uses its own instance.
    Local,
    /// Device `i` uses instance `indices[i]`.
    DeviceIndices(Vec<u32>),
    /// `rects[d * n + m]` is the part of the image device `d` reads and writes
    /// through instance `m`.
    SplitInstance(Vec<Rect>),
}

impl MemoryBinding {
    pub fn needs_bind_memory2(&self) -> bool {
        !matches!(self, Self::Local)
    }
}

/// Device-level extensions a logical device can enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceExtensions {
    pub device_group: bool,
    pub bind_memory2: bool,
    pub dedicated_allocation: bool,
}

/// Platform-wide capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlatformCapabilities {
    /// Device groups can be enumerated and created at all.
    pub device_group_creation: bool,
    /// Extensions supported by the physical devices.
    pub extensions: DeviceExtensions,
}

/// Optional hardware features of a physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceFeatures {
    pub tessellation_shader: bool,
    pub fill_mode_non_solid: bool,
}

/// Identity of one physical device as reported by enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalDeviceInfo {
    pub name: String,
}

/// One enumerated device group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceGroupProperties {
    pub physical_devices: Vec<crate::group::PhysicalDeviceHandle>,
    pub subset_allocation: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_intersection() {
        let a = Rect::new(0, 0, 128, 256);
        let b = Rect::new(128, 0, 128, 256);
        assert!(a.intersection(&b).is_none());

        let c = Rect::new(100, 10, 50, 50);
        assert_eq!(a.intersection(&c), Some(Rect::new(100, 10, 28, 50)));
    }

    #[test]
    fn test_rect_contains_edges() {
        let r = Rect::new(128, 0, 128, 256);
        assert!(r.contains(128, 0));
        assert!(r.contains(255, 255));
        assert!(!r.contains(256, 0));
        assert!(!r.contains(127, 10));
    }

    #[test]
    fn test_memory_property_flags() {
        let flags = MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT;
        assert!(flags.contains(MemoryPropertyFlags::HOST_VISIBLE));
        assert!(flags.contains(MemoryPropertyFlags::NONE));
        assert!(!flags.contains(MemoryPropertyFlags::DEVICE_LOCAL));
        assert_eq!(flags.to_string(), "HOST_VISIBLE|HOST_COHERENT");
        assert_eq!(MemoryPropertyFlags::NONE.to_string(), "NONE");
    }

    #[test]
    fn test_image_data_size() {
        let desc = ImageDesc {
            extent: Extent::new(256, 256),
            format: Format::Rgba8Unorm,
            usage: ImageUsage::COLOR_ATTACHMENT,
            alias: false,
            split_instance_bind: false,
        };
        assert_eq!(desc.data_size(), 256 * 256 * 4);
    }

    #[test]
    fn test_format_encode_rounds() {
        let texel = Format::Rgba8Unorm.encode([0.125, 0.25, 0.75, 1.0]);
        assert_eq!(texel, [32, 64, 191, 255]);
        assert_eq!(Format::Rgba8Unorm.encode([-1.0, 2.0, 0.0, 0.5]), [0, 255, 0, 128]);
    }
}
