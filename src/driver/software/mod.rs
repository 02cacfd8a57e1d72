//! Deterministic in-process device group.
//!
//! `SoftwareDriver` implements [`DeviceGroupDriver`] by executing recorded
//! command buffers on the CPU. It keeps per-device memory instances, routes
//! every access through the resource's binding, enforces peer memory
//! features and image layouts, and can inject driver faults.

mod execute;
mod memory;

use self::memory::{MemoryLayout, MemoryObject};
use crate::driver::{
    AllocationInfo, BufferDesc, BufferHandle, CommandBuffer, DeviceExtensions, DeviceFeatures,
    DeviceGroupProperties, FenceHandle, Format, ImageDesc, ImageHandle, ImageLayout,
    MemoryBinding, MemoryHandle, MemoryHeap, MemoryProperties, MemoryPropertyFlags,
    MemoryRequirements, MemoryType, PhysicalDeviceInfo, PlatformCapabilities, ResourceDesc,
    ResourceHandle,
};
use crate::error::DriverError;
use crate::group::{DeviceMask, PeerFeatures, PhysicalDeviceHandle};
use crate::traits::DeviceGroupDriver;
use bytesize::ByteSize;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::time::Duration;

const BUFFER_ALIGNMENT: u64 = 256;
const IMAGE_ALIGNMENT: u64 = 4096;

/// One device group exposed by the simulated platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftwareGroup {
    pub device_count: u32,
    pub subset_allocation: bool,
}

impl SoftwareGroup {
    pub fn new(device_count: u32, subset_allocation: bool) -> Self {
        Self {
            device_count,
            subset_allocation,
        }
    }
}

/// Peer memory features keyed by `(heap, local device, remote device)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerFeatureTable {
    default: PeerFeatures,
    overrides: HashMap<(u32, u32, u32), PeerFeatures>,
}

impl PeerFeatureTable {
    /// Same features for every heap and device pair.
    pub fn uniform(features: PeerFeatures) -> Self {
        Self {
            default: features,
            overrides: HashMap::new(),
        }
    }

    /// Overrides one entry.
    #[cfg(test)]
    pub fn with(mut self, heap: u32, local: u32, remote: u32, features: PeerFeatures) -> Self {
        self.overrides.insert((heap, local, remote), features);
        self
    }

    pub fn get(&self, heap: u32, local: u32, remote: u32) -> PeerFeatures {
        self.overrides
            .get(&(heap, local, remote))
            .copied()
            .unwrap_or(self.default)
    }
}

impl Default for PeerFeatureTable {
    fn default() -> Self {
        Self::uniform(PeerFeatures::ALL)
    }
}

/// Driver defects the simulated device can reproduce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FaultInjection {
    /// Zero-based submission whose fence never signals.
    pub hang_on_submission: Option<u32>,
    /// Image copies into another device's instance land in the local one.
    pub misroute_peer_writes: bool,
}

/// Static description of the simulated platform.
#[derive(Debug, Clone)]
pub struct SoftwarePlatform {
    pub groups: Vec<SoftwareGroup>,
    pub capabilities: PlatformCapabilities,
    pub features: DeviceFeatures,
    pub memory: MemoryProperties,
    pub peer_features: PeerFeatureTable,
    /// Images may be created for split-instance binding.
    pub split_instance_bind: bool,
    pub buffer_type_bits: u32,
    pub image_type_bits: u32,
    pub faults: FaultInjection,
    /// Seed of the noise new allocations are filled with.
    pub seed: u64,
}

/// Host-visible non-coherent, host-visible coherent, then device-local on
/// a multi-instance heap.
pub fn default_memory_properties() -> MemoryProperties {
    MemoryProperties {
        types: vec![
            MemoryType {
                property_flags: MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_CACHED,
                heap_index: 1,
            },
            MemoryType {
                property_flags: MemoryPropertyFlags::HOST_VISIBLE
                    | MemoryPropertyFlags::HOST_COHERENT,
                heap_index: 1,
            },
            MemoryType {
                property_flags: MemoryPropertyFlags::DEVICE_LOCAL,
                heap_index: 0,
            },
        ],
        heaps: vec![
            MemoryHeap {
                size: 256 * 1024 * 1024,
                multi_instance: true,
            },
            MemoryHeap {
                size: 1024 * 1024 * 1024,
                multi_instance: false,
            },
        ],
    }
}

impl Default for SoftwarePlatform {
    fn default() -> Self {
        Self {
            groups: vec![SoftwareGroup::new(2, true)],
            capabilities: PlatformCapabilities {
                device_group_creation: true,
                extensions: DeviceExtensions {
                    device_group: true,
                    bind_memory2: true,
                    dedicated_allocation: true,
                },
            },
            features: DeviceFeatures {
                tessellation_shader: true,
                fill_mode_non_solid: true,
            },
            memory: default_memory_properties(),
            peer_features: PeerFeatureTable::default(),
            split_instance_bind: true,
            buffer_type_bits: 0b111,
            image_type_bits: 0b111,
            faults: FaultInjection::default(),
            seed: 0x5EED_0F_DE71CE,
        }
    }
}

/// Memory a resource is bound to and how devices reach its instances.
#[derive(Debug, Clone)]
struct Bound {
    memory: MemoryHandle,
    offset: u64,
    routing: MemoryBinding,
}

struct BufferObject {
    desc: BufferDesc,
    bound: Option<Bound>,
}

struct ImageObject {
    desc: ImageDesc,
    bound: Option<Bound>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    Signaled,
    Hung,
}

/// Objects of the logical device created over one group.
struct LogicalDevice {
    group_index: usize,
    device_count: u32,
    extensions: DeviceExtensions,
    buffers: HashMap<BufferHandle, BufferObject>,
    images: HashMap<ImageHandle, ImageObject>,
    memories: HashMap<MemoryHandle, MemoryObject>,
    /// Layout of each image as last transitioned by each device.
    layouts: HashMap<(ImageHandle, u32), ImageLayout>,
    heap_usage: Vec<u64>,
    fences: HashMap<FenceHandle, FenceState>,
    /// Set once a fence wait timed out; later submissions are refused.
    lost: bool,
}

/// Simulated device-group driver.
pub struct SoftwareDriver {
    platform: SoftwarePlatform,
    device: Option<LogicalDevice>,
    next_handle: u64,
    submissions: u32,
}

impl SoftwareDriver {
    pub fn new(platform: SoftwarePlatform) -> Self {
        Self {
            platform,
            device: None,
            next_handle: 1,
            submissions: 0,
        }
    }

    pub fn platform(&self) -> &SoftwarePlatform {
        &self.platform
    }

    /// Submissions accepted since the driver was created.
    pub fn submission_count(&self) -> u32 {
        self.submissions
    }

    /// Live objects on the current logical device (buffers, images, memory).
    pub fn live_objects(&self) -> (usize, usize, usize) {
        self.device.as_ref().map_or((0, 0, 0), |dev| {
            (dev.buffers.len(), dev.images.len(), dev.memories.len())
        })
    }

    fn device(&self) -> Result<&LogicalDevice, DriverError> {
        self.device.as_ref().ok_or(DriverError::NoDevice)
    }

    fn device_mut(&mut self) -> Result<&mut LogicalDevice, DriverError> {
        self.device.as_mut().ok_or(DriverError::NoDevice)
    }

    fn allocate_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn group_devices(&self, group_index: usize) -> Vec<PhysicalDeviceHandle> {
        let first: u32 = self.platform.groups[..group_index]
            .iter()
            .map(|g| g.device_count)
            .sum();
        let count = self.platform.groups[group_index].device_count;
        (first..first + count).map(PhysicalDeviceHandle).collect()
    }

    fn requirements(&self, desc: &ResourceDesc) -> Result<MemoryRequirements, DriverError> {
        match desc {
            ResourceDesc::Buffer(buffer) => {
                if buffer.size == 0 {
                    return Err(DriverError::InvalidParameter("buffer size is zero".into()));
                }
                Ok(MemoryRequirements {
                    size: buffer.size.next_multiple_of(BUFFER_ALIGNMENT),
                    alignment: BUFFER_ALIGNMENT,
                    memory_type_bits: self.platform.buffer_type_bits,
                })
            }
            ResourceDesc::Image(image) => {
                if image.extent.area() == 0 {
                    return Err(DriverError::InvalidParameter("image extent is empty".into()));
                }
                Ok(MemoryRequirements {
                    size: image.data_size().next_multiple_of(IMAGE_ALIGNMENT),
                    alignment: IMAGE_ALIGNMENT,
                    memory_type_bits: self.platform.image_type_bits,
                })
            }
        }
    }

    fn resource_desc(&self, resource: ResourceHandle) -> Result<ResourceDesc, DriverError> {
        let dev = self.device()?;
        match resource {
            ResourceHandle::Buffer(h) => dev
                .buffers
                .get(&h)
                .map(|b| ResourceDesc::Buffer(b.desc))
                .ok_or_else(|| DriverError::InvalidHandle(resource.to_string())),
            ResourceHandle::Image(h) => dev
                .images
                .get(&h)
                .map(|i| ResourceDesc::Image(i.desc))
                .ok_or_else(|| DriverError::InvalidHandle(resource.to_string())),
        }
    }

    fn is_bound(&self, resource: ResourceHandle) -> Result<bool, DriverError> {
        let dev = self.device()?;
        match resource {
            ResourceHandle::Buffer(h) => dev
                .buffers
                .get(&h)
                .map(|b| b.bound.is_some())
                .ok_or_else(|| DriverError::InvalidHandle(resource.to_string())),
            ResourceHandle::Image(h) => dev
                .images
                .get(&h)
                .map(|i| i.bound.is_some())
                .ok_or_else(|| DriverError::InvalidHandle(resource.to_string())),
        }
    }

    /// Dedicated memory takes its own resource, or an alias image created
    /// with the same descriptor.
    fn check_dedicated(
        &self,
        resource: ResourceHandle,
        owner: ResourceHandle,
    ) -> Result<(), DriverError> {
        if resource == owner {
            return Ok(());
        }
        let invalid = || DriverError::InvalidBinding {
            resource,
            reason: format!("memory is dedicated to {}", owner),
        };
        match (self.resource_desc(resource)?, self.resource_desc(owner)) {
            (ResourceDesc::Image(alias), Ok(ResourceDesc::Image(original)))
                if alias.alias && original.alias =>
            {
                let same = ImageDesc {
                    split_instance_bind: alias.split_instance_bind,
                    ..original
                } == alias;
                if same {
                    Ok(())
                } else {
                    Err(invalid())
                }
            }
            _ => Err(invalid()),
        }
    }

    fn validate_routing(
        &self,
        resource: ResourceHandle,
        desc: &ResourceDesc,
        routing: &MemoryBinding,
    ) -> Result<(), DriverError> {
        let dev = self.device()?;
        let n = dev.device_count;
        if routing.needs_bind_memory2() && !dev.extensions.bind_memory2 {
            return Err(DriverError::ExtensionNotEnabled("bind memory 2"));
        }
        let invalid = |reason: String| DriverError::InvalidBinding { resource, reason };
        match routing {
            MemoryBinding::Local => Ok(()),
            MemoryBinding::DeviceIndices(indices) => {
                if indices.len() != n as usize {
                    return Err(invalid(format!(
                        "{} device indices for {} devices",
                        indices.len(),
                        n
                    )));
                }
                if let Some(bad) = indices.iter().find(|&&i| i >= n) {
                    return Err(invalid(format!("device index {} out of range", bad)));
                }
                Ok(())
            }
            MemoryBinding::SplitInstance(rects) => {
                let ResourceDesc::Image(image) = desc else {
                    return Err(invalid("split-instance rects on a buffer".into()));
                };
                if !image.split_instance_bind {
                    return Err(invalid("image not created for split-instance binding".into()));
                }
                if rects.len() != (n * n) as usize {
                    return Err(invalid(format!(
                        "{} split-instance rects for {} devices",
                        rects.len(),
                        n
                    )));
                }
                let full = crate::driver::Rect::full(image.extent);
                if let Some(bad) = rects
                    .iter()
                    .find(|r| !r.is_empty() && r.intersection(&full) != Some(**r))
                {
                    return Err(invalid(format!("rect {:?} outside the image", bad)));
                }
                Ok(())
            }
        }
    }
}

impl DeviceGroupDriver for SoftwareDriver {
    fn name(&self) -> &str {
        "software"
    }

    fn capabilities(&self) -> PlatformCapabilities {
        self.platform.capabilities
    }

    fn enumerate_device_groups(&self) -> Vec<DeviceGroupProperties> {
        if !self.platform.capabilities.device_group_creation {
            return Vec::new();
        }
        (0..self.platform.groups.len())
            .map(|i| DeviceGroupProperties {
                physical_devices: self.group_devices(i),
                subset_allocation: self.platform.groups[i].subset_allocation,
            })
            .collect()
    }

    fn physical_device_info(&self, device: PhysicalDeviceHandle) -> Option<PhysicalDeviceInfo> {
        let total: u32 = self.platform.groups.iter().map(|g| g.device_count).sum();
        (device.0 < total).then(|| PhysicalDeviceInfo {
            name: format!("Software Device {}", device.0),
        })
    }

    fn physical_device_features(&self, _device: PhysicalDeviceHandle) -> DeviceFeatures {
        self.platform.features
    }

    fn memory_properties(&self, _device: PhysicalDeviceHandle) -> MemoryProperties {
        self.platform.memory.clone()
    }

    fn supports_split_instance_bind(&self, _device: PhysicalDeviceHandle, format: Format) -> bool {
        self.platform.split_instance_bind && format == Format::Rgba8Unorm
    }

    fn create_device(
        &mut self,
        group_index: usize,
        primary: PhysicalDeviceHandle,
        extensions: DeviceExtensions,
    ) -> Result<(), DriverError> {
        let Some(group) = self.platform.groups.get(group_index).copied() else {
            return Err(DriverError::GroupNotFound {
                index: group_index,
                available: self.platform.groups.len(),
            });
        };
        if !self.group_devices(group_index).contains(&primary) {
            return Err(DriverError::InvalidParameter(format!(
                "physical device {} is not in group {}",
                primary.0, group_index
            )));
        }
        let supported = self.platform.capabilities.extensions;
        if extensions.device_group && !supported.device_group {
            return Err(DriverError::ExtensionNotPresent("device group"));
        }
        if extensions.bind_memory2 && !supported.bind_memory2 {
            return Err(DriverError::ExtensionNotPresent("bind memory 2"));
        }
        if extensions.dedicated_allocation && !supported.dedicated_allocation {
            return Err(DriverError::ExtensionNotPresent("dedicated allocation"));
        }

        if self.device.is_some() {
            debug!("Replacing logical device");
        }
        self.device = Some(LogicalDevice {
            group_index,
            device_count: group.device_count,
            extensions,
            buffers: HashMap::new(),
            images: HashMap::new(),
            memories: HashMap::new(),
            layouts: HashMap::new(),
            heap_usage: vec![0; self.platform.memory.heaps.len()],
            fences: HashMap::new(),
            lost: false,
        });
        debug!(
            "Created logical device over group {} ({} devices)",
            group_index, group.device_count
        );
        Ok(())
    }

    fn peer_memory_features(
        &self,
        heap_index: u32,
        local_device: u32,
        remote_device: u32,
    ) -> Result<PeerFeatures, DriverError> {
        let dev = self.device()?;
        if local_device >= dev.device_count || remote_device >= dev.device_count {
            return Err(DriverError::InvalidParameter(format!(
                "device pair {}/{} outside group of {}",
                local_device, remote_device, dev.device_count
            )));
        }
        if local_device == remote_device {
            return Err(DriverError::InvalidParameter(
                "peer features need two different devices".into(),
            ));
        }
        if heap_index as usize >= self.platform.memory.heaps.len() {
            return Err(DriverError::InvalidParameter(format!(
                "heap {} does not exist",
                heap_index
            )));
        }
        Ok(self
            .platform
            .peer_features
            .get(heap_index, local_device, remote_device))
    }

    fn memory_requirements(&self, desc: &ResourceDesc) -> Result<MemoryRequirements, DriverError> {
        self.requirements(desc)
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferHandle, DriverError> {
        self.requirements(&ResourceDesc::Buffer(*desc))?;
        self.device()?;
        let handle = BufferHandle(self.allocate_handle());
        self.device_mut()?.buffers.insert(
            handle,
            BufferObject {
                desc: *desc,
                bound: None,
            },
        );
        trace!("Created buffer#{} ({} bytes)", handle.0, desc.size);
        Ok(handle)
    }

    fn create_image(&mut self, desc: &ImageDesc) -> Result<ImageHandle, DriverError> {
        self.requirements(&ResourceDesc::Image(*desc))?;
        if desc.split_instance_bind && !self.platform.split_instance_bind {
            return Err(DriverError::InvalidParameter(
                "split-instance binding not supported".into(),
            ));
        }
        self.device()?;
        let handle = ImageHandle(self.allocate_handle());
        self.device_mut()?.images.insert(
            handle,
            ImageObject {
                desc: *desc,
                bound: None,
            },
        );
        trace!(
            "Created image#{} ({}x{})",
            handle.0,
            desc.extent.width,
            desc.extent.height
        );
        Ok(handle)
    }

    fn allocate_memory(&mut self, info: &AllocationInfo) -> Result<MemoryHandle, DriverError> {
        let dev = self.device()?;
        let Some(memory_type) = self.platform.memory.types.get(info.memory_type_index as usize)
        else {
            return Err(DriverError::InvalidParameter(format!(
                "memory type {} does not exist",
                info.memory_type_index
            )));
        };
        if info.size == 0 {
            return Err(DriverError::InvalidParameter("allocation size is zero".into()));
        }
        let (heap_index, flags) = (memory_type.heap_index, memory_type.property_flags);
        let heap = self.platform.memory.heaps[heap_index as usize];

        let mask = info.device_mask.unwrap_or(DeviceMask::all(dev.device_count));
        if mask.is_empty() || !mask.within(dev.device_count) {
            return Err(DriverError::InvalidParameter(format!(
                "allocation device mask {} outside group of {}",
                mask, dev.device_count
            )));
        }

        if let Some(owner) = info.dedicated {
            if !dev.extensions.dedicated_allocation {
                return Err(DriverError::ExtensionNotEnabled("dedicated allocation"));
            }
            if self.is_bound(owner)? {
                return Err(DriverError::InvalidBinding {
                    resource: owner,
                    reason: "dedicated owner is already bound".into(),
                });
            }
        }

        let instances = if heap.multi_instance { mask.count() as u64 } else { 1 };
        let charged = info.size.saturating_mul(instances);
        let used = dev.heap_usage[heap_index as usize];
        if used.saturating_add(charged) > heap.size {
            warn!(
                "Heap {} exhausted: {} in use, {} requested",
                heap_index,
                ByteSize(used),
                ByteSize(charged)
            );
            return Err(DriverError::OutOfMemory {
                requested: info.size,
                memory_type: info.memory_type_index,
            });
        }

        let handle = MemoryHandle(self.allocate_handle());
        let seed = self.platform.seed;
        let object = MemoryObject::new(
            handle,
            MemoryLayout {
                size: info.size,
                type_index: info.memory_type_index,
                heap_index,
                flags,
                device_mask: mask,
                heap_multi_instance: heap.multi_instance,
                dedicated: info.dedicated,
            },
            seed,
        );
        let dev = self.device_mut()?;
        dev.heap_usage[heap_index as usize] += charged;
        dev.memories.insert(handle, object);
        debug!(
            "Allocated memory #{} ({}, type {}, mask {}{})",
            handle.0,
            ByteSize(info.size),
            info.memory_type_index,
            mask,
            if info.dedicated.is_some() { ", dedicated" } else { "" }
        );
        Ok(handle)
    }

    fn bind_memory(
        &mut self,
        resource: ResourceHandle,
        memory: MemoryHandle,
        offset: u64,
        binding: &MemoryBinding,
    ) -> Result<(), DriverError> {
        let desc = self.resource_desc(resource)?;
        if self.is_bound(resource)? {
            return Err(DriverError::InvalidBinding {
                resource,
                reason: "already bound".into(),
            });
        }
        let reqs = self.requirements(&desc)?;
        let (type_index, mem_size, dedicated) = {
            let mem = self
                .device()?
                .memories
                .get(&memory)
                .ok_or_else(|| DriverError::InvalidHandle(format!("memory #{}", memory.0)))?;
            (mem.type_index, mem.size, mem.dedicated)
        };
        if reqs.memory_type_bits & (1 << type_index) == 0 {
            return Err(DriverError::InvalidBinding {
                resource,
                reason: format!("memory type {} not allowed", type_index),
            });
        }
        if offset % reqs.alignment != 0 || offset.saturating_add(reqs.size) > mem_size {
            return Err(DriverError::InvalidBinding {
                resource,
                reason: format!("offset {} does not fit allocation of {} bytes", offset, mem_size),
            });
        }
        if let Some(owner) = dedicated {
            self.check_dedicated(resource, owner)?;
        }
        self.validate_routing(resource, &desc, binding)?;

        let bound = Bound {
            memory,
            offset,
            routing: binding.clone(),
        };
        let dev = self.device_mut()?;
        match resource {
            ResourceHandle::Buffer(h) => {
                if let Some(buffer) = dev.buffers.get_mut(&h) {
                    buffer.bound = Some(bound);
                }
            }
            ResourceHandle::Image(h) => {
                if let Some(image) = dev.images.get_mut(&h) {
                    image.bound = Some(bound);
                }
            }
        }
        if let Some(mem) = dev.memories.get_mut(&memory) {
            mem.bound += 1;
        }
        trace!("Bound {} to memory #{}+{} ({:?})", resource, memory.0, offset, binding);
        Ok(())
    }

    fn write_mapped(
        &mut self,
        memory: MemoryHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DriverError> {
        self.device_mut()?.memory_mut(memory)?.host_write(offset, data)
    }

    fn flush_mapped(&mut self, memory: MemoryHandle, offset: u64, size: u64) -> Result<(), DriverError> {
        self.device_mut()?.memory_mut(memory)?.flush(offset, size)
    }

    fn invalidate_mapped(
        &mut self,
        memory: MemoryHandle,
        offset: u64,
        size: u64,
    ) -> Result<(), DriverError> {
        self.device_mut()?.memory_mut(memory)?.invalidate(offset, size)
    }

    fn read_mapped(&self, memory: MemoryHandle, offset: u64, size: u64) -> Result<Vec<u8>, DriverError> {
        self.device()?.memory(memory)?.host_read(offset, size)
    }

    fn submit(
        &mut self,
        commands: &CommandBuffer,
        device_mask: DeviceMask,
    ) -> Result<FenceHandle, DriverError> {
        let dev = self.device()?;
        if dev.lost {
            return Err(DriverError::DeviceLost);
        }
        let count = dev.device_count;
        if device_mask.is_empty() || !device_mask.within(count) {
            return Err(DriverError::InvalidParameter(format!(
                "submission mask {} outside group of {}",
                device_mask, count
            )));
        }
        let index = self.submissions;
        self.submissions += 1;
        let fence = FenceHandle(self.allocate_handle());
        let faults = self.platform.faults;

        let state = if faults.hang_on_submission == Some(index) {
            warn!("Submission {} hangs (injected fault)", index);
            FenceState::Hung
        } else {
            let peers = &self.platform.peer_features;
            let Some(dev) = self.device.as_mut() else {
                return Err(DriverError::NoDevice);
            };
            execute::Executor::new(dev, peers, faults).run(commands, device_mask)?;
            FenceState::Signaled
        };
        let dev = self.device_mut()?;
        debug!(
            "Submission {} to group {} on {}: {} commands",
            index,
            dev.group_index,
            device_mask,
            commands.commands().len()
        );
        dev.fences.insert(fence, state);
        Ok(fence)
    }

    /// The simulated device never blocks; a hung fence reports the timeout
    /// straight away and loses the device.
    fn wait_for_fence(&mut self, fence: FenceHandle, timeout: Duration) -> Result<(), DriverError> {
        let dev = self.device_mut()?;
        match dev.fences.get(&fence).copied() {
            None => Err(DriverError::InvalidHandle(format!("fence #{}", fence.0))),
            Some(FenceState::Hung) => {
                dev.lost = true;
                Err(DriverError::Timeout(timeout))
            }
            Some(FenceState::Signaled) => {
                dev.fences.remove(&fence);
                Ok(())
            }
        }
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) -> Result<(), DriverError> {
        let dev = self.device_mut()?;
        let object = dev
            .buffers
            .remove(&buffer)
            .ok_or_else(|| DriverError::InvalidHandle(format!("buffer#{}", buffer.0)))?;
        dev.release(object.bound);
        Ok(())
    }

    fn destroy_image(&mut self, image: ImageHandle) -> Result<(), DriverError> {
        let dev = self.device_mut()?;
        let object = dev
            .images
            .remove(&image)
            .ok_or_else(|| DriverError::InvalidHandle(format!("image#{}", image.0)))?;
        dev.layouts.retain(|(handle, _), _| *handle != image);
        dev.release(object.bound);
        Ok(())
    }

    fn free_memory(&mut self, memory: MemoryHandle) -> Result<(), DriverError> {
        let dev = self.device_mut()?;
        let bound = dev.memory(memory)?.bound;
        if bound > 0 {
            return Err(DriverError::MemoryInUse {
                memory: memory.0,
                bound,
            });
        }
        if let Some(object) = dev.memories.remove(&memory) {
            let heap = object.heap_index as usize;
            let instances = if object.multi_instance {
                object.device_mask.count() as u64
            } else {
                1
            };
            dev.heap_usage[heap] =
                dev.heap_usage[heap].saturating_sub(object.size.saturating_mul(instances));
        }
        Ok(())
    }
}

impl LogicalDevice {
    fn memory(&self, memory: MemoryHandle) -> Result<&MemoryObject, DriverError> {
        self.memories
            .get(&memory)
            .ok_or_else(|| DriverError::InvalidHandle(format!("memory #{}", memory.0)))
    }

    fn memory_mut(&mut self, memory: MemoryHandle) -> Result<&mut MemoryObject, DriverError> {
        self.memories
            .get_mut(&memory)
            .ok_or_else(|| DriverError::InvalidHandle(format!("memory #{}", memory.0)))
    }

    fn release(&mut self, bound: Option<Bound>) {
        if let Some(bound) = bound {
            if let Some(mem) = self.memories.get_mut(&bound.memory) {
                mem.bound = mem.bound.saturating_sub(1);
            }
        }
    }
}
