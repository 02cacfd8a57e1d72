//! Core traits for device-group verification.
//!
//! This module defines the `DeviceGroupDriver` trait that every platform
//! backend must satisfy, plus the run configuration and per-case outcome.

use crate::driver::{
    AllocationInfo, BufferDesc, BufferHandle, CommandBuffer, DeviceExtensions, DeviceFeatures,
    DeviceGroupProperties, FenceHandle, Format, ImageDesc, ImageHandle, MemoryBinding,
    MemoryHandle, MemoryProperties, MemoryRequirements, PhysicalDeviceInfo, PlatformCapabilities,
    ResourceDesc, ResourceHandle,
};
use crate::error::DriverError;
use crate::group::{DeviceMask, GroupSelector, PeerFeatures, PhysicalDeviceHandle};
use std::path::PathBuf;
use std::time::Duration;

/// Default time a fence wait may take before the driver is declared hung.
pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for a verification run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Which group and primary device to test.
    pub selector: GroupSelector,
    /// Root directory holding reference images (`device_group/*.png`).
    pub asset_root: PathBuf,
    /// Directory for diff images of failed comparisons.
    pub artifact_dir: Option<PathBuf>,
    /// Upper bound on every fence wait.
    pub fence_timeout: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            selector: GroupSelector::default(),
            asset_root: PathBuf::from("assets"),
            artifact_dir: None,
            fence_timeout: DEFAULT_FENCE_TIMEOUT,
        }
    }
}

/// The single result reported for one test case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Pass,
    /// The configuration under test is not supported.
    Skip { reason: String },
    /// The driver misbehaved or the output did not match.
    Fail {
        message: String,
        /// Diff image written for the failure, if any.
        artifact: Option<PathBuf>,
    },
}

impl Outcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip { .. })
    }

    pub fn is_fail(&self) -> bool {
        matches!(self, Self::Fail { .. })
    }

    /// Short uppercase label for summaries.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Skip { .. } => "SKIP",
            Self::Fail { .. } => "FAIL",
        }
    }
}

/// Result of one case, as shown in the summary.
#[derive(Debug, Clone)]
pub struct CaseReport {
    /// Name of the case from the case table.
    pub case_name: &'static str,
    pub outcome: Outcome,
    /// Wall time of the case in milliseconds.
    pub duration_ms: u64,
}

/// Platform and driver collaborator.
///
/// Everything the verifier does to a device group goes through this trait:
/// enumeration and capability queries, resource creation, memory binding,
/// host mapping and submission. Implementations report failures as
/// [`DriverError`]; they never panic on bad input.
pub trait DeviceGroupDriver {
    /// Returns the name of this backend (e.g., "software").
    fn name(&self) -> &str;

    /// Platform-wide capabilities.
    fn capabilities(&self) -> PlatformCapabilities;

    /// Device groups in platform enumeration order.
    fn enumerate_device_groups(&self) -> Vec<DeviceGroupProperties>;

    fn physical_device_info(&self, device: PhysicalDeviceHandle) -> Option<PhysicalDeviceInfo>;

    fn physical_device_features(&self, device: PhysicalDeviceHandle) -> DeviceFeatures;

    fn memory_properties(&self, device: PhysicalDeviceHandle) -> MemoryProperties;

    /// True if images of `format` may be bound with split-instance rects.
    fn supports_split_instance_bind(&self, device: PhysicalDeviceHandle, format: Format) -> bool;

    /// Creates the logical device for group `group_index`.
    ///
    /// Replaces any previously created device and releases its objects.
    fn create_device(
        &mut self,
        group_index: usize,
        primary: PhysicalDeviceHandle,
        extensions: DeviceExtensions,
    ) -> Result<(), DriverError>;

    /// Ways `local_device` may access an instance on `remote_device` in heap `heap_index`.
    fn peer_memory_features(
        &self,
        heap_index: u32,
        local_device: u32,
        remote_device: u32,
    ) -> Result<PeerFeatures, DriverError>;

    /// Requirements a resource described by `desc` would have.
    fn memory_requirements(&self, desc: &ResourceDesc) -> Result<MemoryRequirements, DriverError>;

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<BufferHandle, DriverError>;

    fn create_image(&mut self, desc: &ImageDesc) -> Result<ImageHandle, DriverError>;

    fn allocate_memory(&mut self, info: &AllocationInfo) -> Result<MemoryHandle, DriverError>;

    /// Binds `resource` to `memory` at `offset` using `binding` to route
    /// devices to instances.
    fn bind_memory(
        &mut self,
        resource: ResourceHandle,
        memory: MemoryHandle,
        offset: u64,
        binding: &MemoryBinding,
    ) -> Result<(), DriverError>;

    /// Writes host data into a mapped allocation.
    fn write_mapped(
        &mut self,
        memory: MemoryHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), DriverError>;

    /// Makes host writes in the range visible to devices.
    fn flush_mapped(&mut self, memory: MemoryHandle, offset: u64, size: u64)
        -> Result<(), DriverError>;

    /// Makes device writes in the range visible to the host.
    fn invalidate_mapped(
        &mut self,
        memory: MemoryHandle,
        offset: u64,
        size: u64,
    ) -> Result<(), DriverError>;

    /// Reads host-visible bytes of a mapped allocation.
    fn read_mapped(&self, memory: MemoryHandle, offset: u64, size: u64)
        -> Result<Vec<u8>, DriverError>;

    /// Submits `commands` to every device in `device_mask`.
    fn submit(
        &mut self,
        commands: &CommandBuffer,
        device_mask: DeviceMask,
    ) -> Result<FenceHandle, DriverError>;

    /// Blocks until `fence` signals or `timeout` elapses.
    fn wait_for_fence(&mut self, fence: FenceHandle, timeout: Duration) -> Result<(), DriverError>;

    fn destroy_buffer(&mut self, buffer: BufferHandle) -> Result<(), DriverError>;

    fn destroy_image(&mut self, image: ImageHandle) -> Result<(), DriverError>;

    /// Frees an allocation. Fails while resources are still bound to it.
    fn free_memory(&mut self, memory: MemoryHandle) -> Result<(), DriverError>;
}
