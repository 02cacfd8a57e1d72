//! Resource allocation planning.
//!
//! Every resource of an iteration is planned from descriptor requirements
//! before anything is allocated or submitted: memory type, device
//! visibility mask, dedicated flag and binding. A failed precondition
//! therefore turns into a skip with no GPU work done.
//!
//! GPU-resident buffers are filled through host-visible staging buffers.
//! In pooled mode the staging buffers share one allocation at aligned
//! offsets; in dedicated mode every GPU-resident allocation is tied to its
//! resource.

use crate::driver::{
    AllocationInfo, BufferDesc, BufferUsage, Extent, Format, ImageDesc, ImageUsage,
    MemoryBinding, MemoryProperties, MemoryPropertyFlags, MemoryRequirements, ResourceDesc,
    ResourceHandle,
};
use crate::error::VerifierError;
use crate::group::{DeviceGroup, DeviceMask, PeerAccessMatrix, PeerFeatures, PhysicalDeviceHandle};
use crate::modes::TestMode;
use crate::partition::{self, DevicePair, Strategy};
use crate::scene::{self, Scene};
use crate::traits::DeviceGroupDriver;
use log::debug;

/// Properties staging and readback memory must have.
pub const HOST_ACCESS: MemoryPropertyFlags = MemoryPropertyFlags::HOST_VISIBLE;

/// Pipeline input a GPU-resident buffer feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferRole {
    Vertex,
    Index,
    Uniform,
    /// Tessellation level read by the tessellated pipeline.
    Storage,
}

impl BufferRole {
    pub fn usage(self) -> BufferUsage {
        let role = match self {
            Self::Vertex => BufferUsage::VERTEX,
            Self::Index => BufferUsage::INDEX,
            Self::Uniform => BufferUsage::UNIFORM,
            Self::Storage => BufferUsage::STORAGE,
        };
        role | BufferUsage::TRANSFER_DST
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Vertex => "vertex",
            Self::Index => "index",
            Self::Uniform => "uniform",
            Self::Storage => "storage",
        }
    }
}

/// Allocation and binding decisions for one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePlan {
    pub desc: ResourceDesc,
    pub requirements: MemoryRequirements,
    pub memory_type_index: u32,
    /// Devices that back the allocation.
    pub device_visibility_mask: DeviceMask,
    /// Allocation tied to this resource alone.
    pub dedicated: bool,
    pub binding: MemoryBinding,
}

impl ResourcePlan {
    /// Allocation request for this plan; `owner` is the created resource.
    pub fn allocation_info(&self, owner: ResourceHandle) -> AllocationInfo {
        AllocationInfo {
            size: self.requirements.size,
            memory_type_index: self.memory_type_index,
            device_mask: Some(self.device_visibility_mask),
            dedicated: self.dedicated.then_some(owner),
        }
    }
}

/// One GPU-resident buffer and the staging buffer that fills it.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedBuffer {
    pub role: BufferRole,
    pub data: Vec<u8>,
    pub device: ResourcePlan,
    pub staging: ResourcePlan,
    /// Offset of the staging buffer inside the staging pool.
    pub staging_offset: u64,
}

/// Shared host-visible allocation backing every staging buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingPool {
    pub size: u64,
    pub memory_type_index: u32,
    pub device_mask: DeviceMask,
}

impl StagingPool {
    pub fn allocation_info(&self) -> AllocationInfo {
        AllocationInfo {
            size: self.size,
            memory_type_index: self.memory_type_index,
            device_mask: Some(self.device_mask),
            dedicated: None,
        }
    }
}

/// Everything one device pair needs.
#[derive(Debug, Clone, PartialEq)]
pub struct PairPlan {
    pub pair: DevicePair,
    pub strategy: Strategy,
    pub buffers: Vec<StagedBuffer>,
    /// `None` in dedicated mode, where each staging buffer is allocated alone.
    pub staging_pool: Option<StagingPool>,
    pub render_target: ResourcePlan,
    /// Descriptor of the peer and read views aliasing the render target.
    pub view_desc: ImageDesc,
    pub readback: ResourcePlan,
}

/// First memory type allowed by `type_bits` whose flags contain `required`.
///
/// # Errors
///
/// Returns `NoCompatibleMemory` when no type qualifies.
pub fn select_memory_type(
    properties: &MemoryProperties,
    type_bits: u32,
    required: MemoryPropertyFlags,
) -> Result<u32, VerifierError> {
    properties
        .types
        .iter()
        .enumerate()
        .find(|(i, ty)| {
            *i < 32 && type_bits & (1 << i) != 0 && ty.property_flags.contains(required)
        })
        .map(|(i, _)| i as u32)
        .ok_or(VerifierError::NoCompatibleMemory {
            type_bits,
            required,
        })
}

/// Devices that must back a GPU-resident allocation used by `pair`.
///
/// Subset allocation provisions only the two devices of the pair; a group
/// that broadcasts allocations gets the full mask.
pub fn visibility_mask(group: &DeviceGroup, pair: DevicePair) -> DeviceMask {
    if group.subset_allocation() {
        pair.mask()
    } else {
        group.full_mask()
    }
}

/// Both devices of the pair must have generic-source access to each
/// other's instances of `memory_type_index`.
pub fn check_peer_fetch(
    driver: &dyn DeviceGroupDriver,
    group: &DeviceGroup,
    matrix: &mut PeerAccessMatrix,
    memory_type_index: u32,
    pair: DevicePair,
    reason: &str,
) -> Result<(), VerifierError> {
    for (src, dst) in [(pair.first, pair.second), (pair.second, pair.first)] {
        let features = matrix.query_peer_features(driver, group, memory_type_index, src, dst)?;
        if !features.supports(PeerFeatures::GENERIC_SRC) {
            debug!(
                "Device {} lacks generic-source access to device {} (type {})",
                src, dst, memory_type_index
            );
            return Err(VerifierError::unsupported(reason));
        }
    }
    Ok(())
}

/// Plans resources for every pair of an iteration.
pub struct Planner<'a> {
    driver: &'a dyn DeviceGroupDriver,
    group: &'a DeviceGroup,
    primary: PhysicalDeviceHandle,
    mode: TestMode,
    properties: MemoryProperties,
    extent: Extent,
}

impl<'a> Planner<'a> {
    /// Memory types are taken from `primary`, the device the logical
    /// device was opened on.
    pub fn new(
        driver: &'a dyn DeviceGroupDriver,
        group: &'a DeviceGroup,
        primary: PhysicalDeviceHandle,
        mode: TestMode,
        extent: Extent,
    ) -> Self {
        let properties = driver.memory_properties(primary);
        Self {
            driver,
            group,
            primary,
            mode,
            properties,
            extent,
        }
    }

    /// Flags GPU-resident memory must have in this mode.
    pub fn device_flags(&self) -> MemoryPropertyFlags {
        if self.mode.host_memory() {
            MemoryPropertyFlags::NONE
        } else {
            MemoryPropertyFlags::DEVICE_LOCAL
        }
    }

    /// Plans every pair of the frame loop.
    pub fn plan_all(
        &self,
        scene: &Scene,
        matrix: &mut PeerAccessMatrix,
    ) -> Result<Vec<PairPlan>, VerifierError> {
        partition::device_pairs(self.group.device_count())
            .map(|pair| self.plan_pair(pair, scene, matrix))
            .collect()
    }

    fn plan(
        &self,
        desc: ResourceDesc,
        required: MemoryPropertyFlags,
        mask: DeviceMask,
        dedicated: bool,
        binding: MemoryBinding,
    ) -> Result<ResourcePlan, VerifierError> {
        let requirements = self.driver.memory_requirements(&desc)?;
        let memory_type_index =
            select_memory_type(&self.properties, requirements.memory_type_bits, required)?;
        Ok(ResourcePlan {
            desc,
            requirements,
            memory_type_index,
            device_visibility_mask: mask,
            dedicated,
            binding,
        })
    }

    fn buffer_data(scene: &Scene) -> Vec<(BufferRole, Vec<u8>)> {
        let mut data = vec![
            (BufferRole::Vertex, scene.vertex_bytes().to_vec()),
            (BufferRole::Index, scene.index_bytes().to_vec()),
            (BufferRole::Uniform, scene::color_bytes()),
        ];
        if scene.is_tessellated() {
            data.push((BufferRole::Storage, scene::tess_level_bytes()));
        }
        data
    }

    pub fn plan_pair(
        &self,
        pair: DevicePair,
        scene: &Scene,
        matrix: &mut PeerAccessMatrix,
    ) -> Result<PairPlan, VerifierError> {
        let n = self.group.device_count();
        let strategy = Strategy::from_mode(self.mode);
        let regions = partition::regions(strategy, pair, n, self.extent);
        partition::check_tiling(&regions, self.extent).map_err(|reason| {
            VerifierError::unsupported(format!("cannot partition the render target: {}", reason))
        })?;
        let mask = visibility_mask(self.group, pair);
        let dedicated = self.mode.dedicated();
        let host_mask = DeviceMask::single(pair.first);

        let buffer_binding = if self.mode.peer_fetch() {
            MemoryBinding::DeviceIndices(pair.swapped_indices(n))
        } else {
            MemoryBinding::Local
        };

        let mut buffers = Vec::new();
        let mut pool_end = 0u64;
        let mut pool_type = None;
        for (role, data) in Self::buffer_data(scene) {
            let desc = BufferDesc {
                size: data.len() as u64,
                usage: role.usage(),
            };
            let device = self.plan(
                ResourceDesc::Buffer(desc),
                self.device_flags(),
                mask,
                dedicated,
                buffer_binding.clone(),
            )?;
            if self.mode.peer_fetch() {
                check_peer_fetch(
                    self.driver,
                    self.group,
                    matrix,
                    device.memory_type_index,
                    pair,
                    "peer fetch not supported",
                )?;
            }

            let staging = self.plan(
                ResourceDesc::Buffer(BufferDesc {
                    size: desc.size,
                    usage: BufferUsage::TRANSFER_SRC,
                }),
                HOST_ACCESS,
                host_mask,
                false,
                MemoryBinding::Local,
            )?;
            let staging_offset = pool_end.next_multiple_of(staging.requirements.alignment);
            pool_end = staging_offset + staging.requirements.size;
            pool_type.get_or_insert(staging.memory_type_index);
            buffers.push(StagedBuffer {
                role,
                data,
                device,
                staging,
                staging_offset,
            });
        }

        let staging_pool = match pool_type {
            Some(memory_type_index) if !dedicated => {
                if buffers
                    .iter()
                    .any(|b| b.staging.memory_type_index != memory_type_index)
                {
                    return Err(VerifierError::unsupported(
                        "staging buffers need different memory types",
                    ));
                }
                Some(StagingPool {
                    size: pool_end,
                    memory_type_index,
                    device_mask: host_mask,
                })
            }
            _ => None,
        };

        let usage = ImageUsage::COLOR_ATTACHMENT | ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST;
        let render_desc = ImageDesc {
            extent: self.extent,
            format: Format::Rgba8Unorm,
            usage,
            alias: true,
            split_instance_bind: strategy == Strategy::SplitFrame,
        };
        let render_binding = match strategy {
            Strategy::SplitFrame => {
                MemoryBinding::SplitInstance(partition::split_instance_rects(pair, n, self.extent))
            }
            Strategy::AlternateFrame => MemoryBinding::Local,
        };
        let render_target = self.plan(
            ResourceDesc::Image(render_desc),
            self.device_flags(),
            mask,
            dedicated,
            render_binding,
        )?;
        if strategy == Strategy::SplitFrame && self.mode.peer_fetch() {
            check_peer_fetch(
                self.driver,
                self.group,
                matrix,
                render_target.memory_type_index,
                pair,
                "peer texture reads not supported",
            )?;
        }

        let readback = self.plan(
            ResourceDesc::Buffer(BufferDesc {
                size: render_desc.data_size(),
                usage: BufferUsage::TRANSFER_DST,
            }),
            HOST_ACCESS,
            host_mask,
            false,
            MemoryBinding::Local,
        )?;

        debug!(
            "Planned pair {}/{} from device {}: render target type {}, mask {}, {} buffers",
            pair.first,
            pair.second,
            self.primary.0,
            render_target.memory_type_index,
            mask,
            buffers.len()
        );
        Ok(PairPlan {
            pair,
            strategy,
            buffers,
            staging_pool,
            render_target,
            view_desc: ImageDesc {
                split_instance_bind: false,
                ..render_desc
            },
            readback,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{
        MemoryType, PeerFeatureTable, SoftwareDriver, SoftwareGroup, SoftwarePlatform,
    };
    use crate::group::GroupSelector;
    use crate::scene::RENDER_EXTENT;

    fn setup(platform: SoftwarePlatform, mode: TestMode) -> (SoftwareDriver, DeviceGroup) {
        let mut driver = SoftwareDriver::new(platform);
        let group = DeviceGroup::discover(&driver, GroupSelector::default()).unwrap();
        group
            .open(&mut driver, GroupSelector::default(), mode)
            .unwrap();
        (driver, group)
    }

    fn plan_with_extent(
        driver: &SoftwareDriver,
        group: &DeviceGroup,
        mode: TestMode,
        extent: Extent,
    ) -> Result<Vec<PairPlan>, VerifierError> {
        let mut matrix = PeerAccessMatrix::new();
        let primary = group.device(0).unwrap();
        Planner::new(driver, group, primary, mode, extent).plan_all(&Scene::for_mode(mode), &mut matrix)
    }

    fn plan(
        driver: &SoftwareDriver,
        group: &DeviceGroup,
        mode: TestMode,
    ) -> Result<Vec<PairPlan>, VerifierError> {
        plan_with_extent(driver, group, mode, RENDER_EXTENT)
    }

    #[test]
    fn test_first_fit_memory_type() {
        let props = crate::driver::software::default_memory_properties();
        assert_eq!(
            select_memory_type(&props, 0b111, MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            2
        );
        assert_eq!(select_memory_type(&props, 0b111, MemoryPropertyFlags::NONE).unwrap(), 0);
        assert_eq!(
            select_memory_type(&props, 0b110, MemoryPropertyFlags::HOST_VISIBLE).unwrap(),
            1
        );
        let err = select_memory_type(&props, 0b011, MemoryPropertyFlags::DEVICE_LOCAL).unwrap_err();
        assert!(err.is_skip());
    }

    #[test]
    fn test_no_matching_type_is_skip() {
        let mut platform = SoftwarePlatform::default();
        platform.memory.types = vec![MemoryType {
            property_flags: MemoryPropertyFlags::HOST_VISIBLE,
            heap_index: 1,
        }];
        platform.buffer_type_bits = 0b1;
        platform.image_type_bits = 0b1;
        let (driver, group) = setup(platform, TestMode::SFR);
        let err = plan(&driver, &group, TestMode::SFR).unwrap_err();
        assert!(matches!(err, VerifierError::NoCompatibleMemory { .. }));
        assert!(err.is_skip());
    }

    #[test]
    fn test_visibility_mask_subset_and_broadcast() {
        let (driver, group) = setup(
            SoftwarePlatform {
                groups: vec![SoftwareGroup::new(3, true)],
                ..SoftwarePlatform::default()
            },
            TestMode::SFR,
        );
        let plans = plan(&driver, &group, TestMode::SFR).unwrap();
        assert_eq!(plans.len(), 3);
        assert_eq!(plans[2].render_target.device_visibility_mask, DeviceMask::pair(2, 0));

        let (driver, group) = setup(
            SoftwarePlatform {
                groups: vec![SoftwareGroup::new(3, false)],
                ..SoftwarePlatform::default()
            },
            TestMode::SFR,
        );
        let plans = plan(&driver, &group, TestMode::SFR).unwrap();
        assert!(plans
            .iter()
            .all(|p| p.render_target.device_visibility_mask == DeviceMask::all(3)));
    }

    #[test]
    fn test_host_memory_mode_relaxes_flags() {
        let mode = TestMode::SFR | TestMode::HOST_MEMORY;
        let (driver, group) = setup(SoftwarePlatform::default(), mode);
        let plans = plan(&driver, &group, mode).unwrap();
        assert_eq!(plans[0].render_target.memory_type_index, 0);
        assert_eq!(plans[0].buffers[0].device.memory_type_index, 0);
    }

    #[test]
    fn test_pooled_staging_offsets_are_aligned() {
        let (driver, group) = setup(SoftwarePlatform::default(), TestMode::SFR);
        let plans = plan(&driver, &group, TestMode::SFR).unwrap();
        let plan = &plans[0];
        let pool = plan.staging_pool.unwrap();
        assert_eq!(plan.buffers.len(), 3);
        let mut end = 0;
        for buffer in &plan.buffers {
            assert_eq!(buffer.staging_offset % buffer.staging.requirements.alignment, 0);
            assert!(buffer.staging_offset >= end);
            end = buffer.staging_offset + buffer.staging.requirements.size;
        }
        assert_eq!(pool.size, end);
        assert_eq!(pool.device_mask, DeviceMask::single(0));
    }

    #[test]
    fn test_dedicated_mode_tags_resources() {
        let mode = TestMode::AFR | TestMode::DEDICATED;
        let (driver, group) = setup(SoftwarePlatform::default(), mode);
        let plans = plan(&driver, &group, mode).unwrap();
        assert!(plans[0].staging_pool.is_none());
        assert!(plans[0].render_target.dedicated);
        assert!(plans[0].buffers.iter().all(|b| b.device.dedicated));
        let info = plans[0]
            .render_target
            .allocation_info(ResourceHandle::Image(crate::driver::ImageHandle(9)));
        assert_eq!(info.dedicated, Some(ResourceHandle::Image(crate::driver::ImageHandle(9))));
    }

    #[test]
    fn test_peer_fetch_binding_swaps_indices() {
        let mode = TestMode::AFR | TestMode::DEDICATED | TestMode::PEER_FETCH;
        let (driver, group) = setup(SoftwarePlatform::default(), mode);
        let plans = plan(&driver, &group, mode).unwrap();
        assert_eq!(
            plans[0].buffers[0].device.binding,
            MemoryBinding::DeviceIndices(vec![1, 0])
        );
        assert_eq!(plans[0].render_target.binding, MemoryBinding::Local);
    }

    #[test]
    fn test_peer_fetch_needs_generic_src_both_ways() {
        let mode = TestMode::AFR | TestMode::DEDICATED | TestMode::PEER_FETCH;
        let platform = SoftwarePlatform {
            peer_features: PeerFeatureTable::default().with(
                0,
                1,
                0,
                PeerFeatures::ALL.without(PeerFeatures::GENERIC_SRC),
            ),
            ..SoftwarePlatform::default()
        };
        let (driver, group) = setup(platform, mode);
        let err = plan(&driver, &group, mode).unwrap_err();
        assert!(err.is_skip());
        assert!(err.to_string().contains("peer fetch not supported"));
        assert_eq!(driver.submission_count(), 0);
    }

    #[test]
    fn test_sfr_peer_fetch_checks_render_target() {
        let mode = TestMode::SFR | TestMode::DEDICATED | TestMode::PEER_FETCH;
        let denied = PeerFeatures::ALL.without(PeerFeatures::GENERIC_SRC);
        let mut platform = SoftwarePlatform {
            peer_features: PeerFeatureTable::default()
                .with(0, 0, 1, denied)
                .with(0, 1, 0, denied),
            ..SoftwarePlatform::default()
        };
        // Buffers get a device-local heap of their own with full peer access.
        platform.memory.heaps.push(crate::driver::MemoryHeap {
            size: 64 * 1024 * 1024,
            multi_instance: true,
        });
        platform.memory.types.push(MemoryType {
            property_flags: MemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 2,
        });
        // Staging and readback still find the host-visible type 0.
        platform.buffer_type_bits = 0b1001;
        let (driver, group) = setup(platform, mode);

        let err = plan(&driver, &group, mode).unwrap_err();
        assert!(err.is_skip());
        assert!(err.to_string().contains("peer texture reads not supported"));
    }

    #[test]
    fn test_split_frame_render_target_binding() {
        let (driver, group) = setup(SoftwarePlatform::default(), TestMode::SFR);
        let plans = plan(&driver, &group, TestMode::SFR).unwrap();
        let ResourceDesc::Image(desc) = plans[1].render_target.desc else {
            panic!("render target is not an image");
        };
        assert!(desc.split_instance_bind);
        assert!(!plans[1].view_desc.split_instance_bind);
        match &plans[1].render_target.binding {
            MemoryBinding::SplitInstance(rects) => assert_eq!(rects.len(), 4),
            other => panic!("unexpected binding {:?}", other),
        }
    }

    #[test]
    fn test_target_too_narrow_to_split_is_skip() {
        let (driver, group) = setup(SoftwarePlatform::default(), TestMode::SFR);
        let err = plan_with_extent(&driver, &group, TestMode::SFR, Extent::new(1, 256)).unwrap_err();
        assert!(err.is_skip());
        assert!(err.to_string().contains("region 0 is empty"));

        let (driver, group) = setup(SoftwarePlatform::default(), TestMode::AFR);
        assert!(plan_with_extent(&driver, &group, TestMode::AFR, Extent::new(1, 256)).is_ok());
    }

    #[test]
    fn test_memory_types_come_from_primary_device() {
        let mut driver = SoftwareDriver::new(SoftwarePlatform {
            groups: vec![SoftwareGroup::new(1, true), SoftwareGroup::new(2, true)],
            ..SoftwarePlatform::default()
        });
        let selector = GroupSelector {
            group_index: 1,
            device_index: 1,
        };
        let group = DeviceGroup::discover(&driver, selector).unwrap();
        let primary = group.open(&mut driver, selector, TestMode::AFR).unwrap();
        assert_eq!(primary, PhysicalDeviceHandle(2));

        let planner = Planner::new(&driver, &group, primary, TestMode::AFR, RENDER_EXTENT);
        assert_eq!(planner.properties, driver.memory_properties(primary));
        let mut matrix = PeerAccessMatrix::new();
        let plans = planner
            .plan_all(&Scene::for_mode(TestMode::AFR), &mut matrix)
            .unwrap();
        assert_eq!(plans.len(), 2);
    }

    #[test]
    fn test_readback_is_host_visible() {
        let (driver, group) = setup(SoftwarePlatform::default(), TestMode::AFR);
        let plans = plan(&driver, &group, TestMode::AFR).unwrap();
        assert_eq!(plans[0].readback.memory_type_index, 0);
        assert_eq!(plans[0].readback.device_visibility_mask, DeviceMask::single(0));
        assert_eq!(plans[1].readback.device_visibility_mask, DeviceMask::single(1));
    }
}
