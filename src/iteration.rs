//! Test iteration.
//!
//! One generic function runs any row of the case table: discover and open
//! the group, plan every device pair, then for each pair upload, render,
//! transfer, read back and verify. The first error ends the case; skips
//! are decided before anything is submitted.

use crate::driver::{
    Access, Barrier, BufferHandle, Command, CommandBuffer, ImageDesc, ImageHandle,
    ImageLayout, MemoryBinding, MemoryHandle, Rect, ResourceDesc, ResourceHandle,
};
use crate::error::{DriverError, VerifierError};
use crate::group::{DeviceGroup, PeerAccessMatrix};
use crate::modes::TestCase;
use crate::partition::{self, Strategy};
use crate::planner::{BufferRole, PairPlan, Planner, ResourcePlan};
use crate::scene::{Scene, CLEAR_COLOR, RENDER_EXTENT};
use crate::traits::{DeviceGroupDriver, Outcome, RunConfig};
use crate::transfer::{self, ReadbackTarget, TransferJob};
use crate::verify;
use image::RgbaImage;
use log::{debug, info, warn};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owned {
    Buffer(BufferHandle),
    Image(ImageHandle),
    Memory(MemoryHandle),
}

/// Objects created for one pair, released in reverse creation order.
///
/// Memory owned by a single resource is recorded just before that
/// resource, so the resource goes first.
#[derive(Debug, Default)]
struct ResourceScope {
    objects: Vec<Owned>,
}

impl ResourceScope {
    fn push(&mut self, object: Owned) {
        self.objects.push(object);
    }

    fn push_memory_for(&mut self, owner: Owned, memory: MemoryHandle) {
        let at = self
            .objects
            .iter()
            .rposition(|o| *o == owner)
            .unwrap_or(self.objects.len());
        self.objects.insert(at, Owned::Memory(memory));
    }

    /// Releases everything, reporting the first failure.
    fn release(&mut self, driver: &mut dyn DeviceGroupDriver) -> Result<(), DriverError> {
        let mut first_error = None;
        while let Some(object) = self.objects.pop() {
            let result = match object {
                Owned::Buffer(h) => driver.destroy_buffer(h),
                Owned::Image(h) => driver.destroy_image(h),
                Owned::Memory(h) => driver.free_memory(h),
            };
            if let Err(err) = result {
                warn!("Failed to release {:?}: {}", object, err);
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Creates a buffer with memory of its own.
fn create_buffer_with_memory(
    driver: &mut dyn DeviceGroupDriver,
    scope: &mut ResourceScope,
    plan: &ResourcePlan,
) -> Result<(BufferHandle, MemoryHandle), VerifierError> {
    let ResourceDesc::Buffer(desc) = plan.desc else {
        return Err(DriverError::InvalidParameter("buffer plan holds an image".into()).into());
    };
    let buffer = driver.create_buffer(&desc)?;
    scope.push(Owned::Buffer(buffer));
    let memory = driver.allocate_memory(&plan.allocation_info(ResourceHandle::Buffer(buffer)))?;
    scope.push_memory_for(Owned::Buffer(buffer), memory);
    driver.bind_memory(ResourceHandle::Buffer(buffer), memory, 0, &plan.binding)?;
    Ok((buffer, memory))
}

fn create_view(
    driver: &mut dyn DeviceGroupDriver,
    scope: &mut ResourceScope,
    desc: &ImageDesc,
    memory: MemoryHandle,
) -> Result<ImageHandle, VerifierError> {
    let view = driver.create_image(desc)?;
    scope.push(Owned::Image(view));
    driver.bind_memory(ResourceHandle::Image(view), memory, 0, &MemoryBinding::Local)?;
    Ok(view)
}

/// GPU-resident buffers filled from staging, ready to bind.
struct UploadedBuffers {
    handles: Vec<(BufferRole, BufferHandle)>,
    copies: Vec<(BufferHandle, BufferHandle, u64)>,
}

fn upload_buffers(
    driver: &mut dyn DeviceGroupDriver,
    scope: &mut ResourceScope,
    plan: &PairPlan,
) -> Result<UploadedBuffers, VerifierError> {
    let pool = match plan.staging_pool {
        Some(pool) => {
            let memory = driver.allocate_memory(&pool.allocation_info())?;
            scope.push(Owned::Memory(memory));
            Some(memory)
        }
        None => None,
    };

    let mut uploaded = UploadedBuffers {
        handles: Vec::new(),
        copies: Vec::new(),
    };
    for staged in &plan.buffers {
        let (staging, memory, offset) = match pool {
            Some(memory) => {
                let ResourceDesc::Buffer(desc) = staged.staging.desc else {
                    return Err(
                        DriverError::InvalidParameter("staging plan holds an image".into()).into(),
                    );
                };
                let buffer = driver.create_buffer(&desc)?;
                scope.push(Owned::Buffer(buffer));
                driver.bind_memory(
                    ResourceHandle::Buffer(buffer),
                    memory,
                    staged.staging_offset,
                    &MemoryBinding::Local,
                )?;
                (buffer, memory, staged.staging_offset)
            }
            None => {
                let (buffer, memory) = create_buffer_with_memory(driver, scope, &staged.staging)?;
                (buffer, memory, 0)
            }
        };
        debug!(
            "Staging {} buffer: {} bytes at offset {}",
            staged.role.name(),
            staged.data.len(),
            offset
        );
        driver.write_mapped(memory, offset, &staged.data)?;
        driver.flush_mapped(memory, offset, staged.data.len() as u64)?;

        let (device, _) = create_buffer_with_memory(driver, scope, &staged.device)?;
        uploaded.handles.push((staged.role, device));
        uploaded
            .copies
            .push((staging, device, staged.data.len() as u64));
    }
    Ok(uploaded)
}

/// Render submission: uploads, clear, draw and the source transition.
fn record_render(
    plan: &PairPlan,
    group: &DeviceGroup,
    scene: &Scene,
    buffers: &UploadedBuffers,
    target: ImageHandle,
) -> CommandBuffer {
    let n = group.device_count();
    let pair = plan.pair;
    let mut commands = CommandBuffer::new();

    commands.barrier(Barrier::Memory {
        src: Access::HOST_WRITE,
        dst: Access::TRANSFER_READ,
    });
    for &(src, dst, size) in &buffers.copies {
        commands.copy_buffer(src, dst, size);
    }
    commands
        .barrier(Barrier::Memory {
            src: Access::TRANSFER_WRITE,
            dst: Access::VERTEX_ATTRIBUTE_READ
                | Access::INDEX_READ
                | Access::UNIFORM_READ
                | Access::SHADER_READ,
        })
        .image_barrier(
            target,
            (Access::NONE, ImageLayout::Undefined),
            (Access::COLOR_ATTACHMENT_WRITE, ImageLayout::ColorAttachment),
        );

    let pass_mask = match plan.strategy {
        Strategy::SplitFrame => pair.mask(),
        Strategy::AlternateFrame => group.full_mask(),
    };
    commands
        .push(Command::BeginRenderPass {
            target,
            clear_color: CLEAR_COLOR,
            device_mask: pass_mask,
            device_render_areas: partition::render_areas(plan.strategy, pair, n, RENDER_EXTENT),
        })
        .push(Command::BindPipeline(scene.pipeline()));
    for &(role, buffer) in &buffers.handles {
        commands.push(match role {
            BufferRole::Vertex => Command::BindVertexBuffer(buffer),
            BufferRole::Index => Command::BindIndexBuffer(buffer),
            BufferRole::Uniform => Command::BindUniformBuffer(buffer),
            BufferRole::Storage => Command::BindStorageBuffer(buffer),
        });
    }
    commands
        .set_device_mask(partition::draw_mask(plan.strategy, pair))
        .push(Command::DrawIndexed {
            index_count: scene.index_count(),
        })
        .set_device_mask(pair.mask())
        .push(Command::EndRenderPass);
    transfer::record_source_transition(&mut commands, target);
    commands
}

/// Renders one pair and returns what `first` reads back.
fn capture_pair(
    driver: &mut dyn DeviceGroupDriver,
    group: &DeviceGroup,
    plan: &PairPlan,
    scene: &Scene,
    timeout: Duration,
    scope: &mut ResourceScope,
) -> Result<RgbaImage, VerifierError> {
    let pair = plan.pair;
    let n = group.device_count();

    let buffers = upload_buffers(driver, scope, plan)?;

    let ResourceDesc::Image(render_desc) = plan.render_target.desc else {
        return Err(DriverError::InvalidParameter("render target plan holds a buffer".into()).into());
    };
    let render = driver.create_image(&render_desc)?;
    scope.push(Owned::Image(render));
    let memory =
        driver.allocate_memory(&plan.render_target.allocation_info(ResourceHandle::Image(render)))?;
    scope.push_memory_for(Owned::Image(render), memory);
    driver.bind_memory(ResourceHandle::Image(render), memory, 0, &plan.render_target.binding)?;
    let read_view = create_view(driver, scope, &plan.view_desc, memory)?;

    let (readback_buffer, readback_memory) = create_buffer_with_memory(driver, scope, &plan.readback)?;
    let readback = ReadbackTarget {
        buffer: readback_buffer,
        memory: readback_memory,
        size: plan.view_desc.data_size(),
    };

    let commands = record_render(plan, group, scene, &buffers, render);
    transfer::submit_and_wait(driver, &commands, pair.mask(), timeout)?;

    if let Some(region) = partition::peer_copy_region(plan.strategy, pair, RENDER_EXTENT) {
        let peer = transfer::create_peer_handle(driver, &plan.view_desc, memory, pair, n)?;
        scope.push(Owned::Image(peer));
        let job = TransferJob {
            source: render,
            peer,
            region,
            device: pair.second,
        };
        transfer::copy_to_peer(driver, &job, timeout)?;
    }

    let bytes = transfer::read_back(
        driver,
        read_view,
        Rect::full(RENDER_EXTENT),
        &readback,
        pair.first,
        timeout,
    )?;
    verify::result_image(RENDER_EXTENT, bytes)
}

/// Diff image of a failed comparison, carried to the outcome.
struct Mismatch {
    label: String,
    diff: Option<Box<RgbaImage>>,
}

fn iterate(
    driver: &mut dyn DeviceGroupDriver,
    case: &TestCase,
    config: &RunConfig,
) -> Result<(), VerifierError> {
    let group = DeviceGroup::discover(&*driver, config.selector)?;
    let primary = group.open(driver, config.selector, case.mode)?;

    let scene = Scene::for_mode(case.mode);
    let mut matrix = PeerAccessMatrix::new();
    let plans = Planner::new(&*driver, &group, primary, case.mode, RENDER_EXTENT)
        .plan_all(&scene, &mut matrix)?;
    debug!("{}: planned {} pairs", case.name, plans.len());
    if !matrix.is_empty() {
        debug!("{}: {} peer feature entries queried", case.name, matrix.len());
    }

    for plan in &plans {
        let pair = plan.pair;
        info!("{}: devices {}/{}", case.name, pair.first, pair.second);
        let mut scope = ResourceScope::default();
        let captured = capture_pair(driver, &group, plan, &scene, config.fence_timeout, &mut scope);
        let released = scope.release(driver);
        let image = captured?;
        released?;

        let result = verify::verify(&scene, &image, &config.asset_root)?;
        if !result.passed {
            return Err(VerifierError::VerificationMismatch {
                first: pair.first,
                second: pair.second,
                summary: result.summary(),
                diff: result.diff.map(Box::new),
            });
        }
    }
    Ok(())
}

fn save_artifact(config: &RunConfig, mismatch: Mismatch) -> Option<std::path::PathBuf> {
    let dir = config.artifact_dir.as_ref()?;
    let diff = mismatch.diff?;
    match verify::save_diff(dir, &mismatch.label, &diff) {
        Ok(path) => Some(path),
        Err(err) => {
            warn!("Could not write diff for {}: {}", mismatch.label, err);
            None
        }
    }
}

/// Runs one case to its single outcome.
pub fn run_case(driver: &mut dyn DeviceGroupDriver, case: &TestCase, config: &RunConfig) -> Outcome {
    match iterate(driver, case, config) {
        Ok(()) => Outcome::Pass,
        Err(VerifierError::UnsupportedConfiguration(reason)) => {
            info!("{}: skipped: {}", case.name, reason);
            Outcome::Skip { reason }
        }
        Err(err) if err.is_skip() => {
            info!("{}: skipped: {}", case.name, err);
            Outcome::Skip {
                reason: err.to_string(),
            }
        }
        Err(VerifierError::VerificationMismatch {
            first,
            second,
            summary,
            diff,
        }) => {
            let message = format!(
                "Image comparison failed on devices {}/{}: {}",
                first, second, summary
            );
            warn!("{}: {}", case.name, message);
            let artifact = save_artifact(
                config,
                Mismatch {
                    label: format!("{}_devices{}-{}", case.name, first, second),
                    diff,
                },
            );
            Outcome::Fail { message, artifact }
        }
        Err(err) => {
            warn!("{}: {}", case.name, err);
            Outcome::Fail {
                message: err.to_string(),
                artifact: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{
        FaultInjection, PeerFeatureTable, SoftwareDriver, SoftwareGroup, SoftwarePlatform,
    };
    use crate::group::{DeviceMask, GroupSelector, PeerFeatures};
    use crate::modes::{self, TestMode};
    use crate::partition::{DevicePair, PartitionRegion};
    use tempfile::TempDir;

    fn driver(devices: u32) -> SoftwareDriver {
        SoftwareDriver::new(SoftwarePlatform {
            groups: vec![SoftwareGroup::new(devices, true)],
            ..SoftwarePlatform::default()
        })
    }

    fn config_with_assets() -> (RunConfig, TempDir) {
        let assets = tempfile::tempdir().unwrap();
        verify::write_references(assets.path(), RENDER_EXTENT).unwrap();
        let config = RunConfig {
            asset_root: assets.path().to_path_buf(),
            artifact_dir: Some(assets.path().join("artifacts")),
            ..RunConfig::default()
        };
        (config, assets)
    }

    fn case(name: &str) -> TestCase {
        modes::find_case(name).unwrap()
    }

    #[test]
    fn test_single_device_sfr_triangle_passes() {
        let mut driver = driver(1);
        let outcome = run_case(&mut driver, &case("sfr"), &RunConfig::default());
        assert_eq!(outcome, Outcome::Pass);
        // Render and readback only: no peer copy on a single device.
        assert_eq!(driver.submission_count(), 2);
        assert_eq!(driver.live_objects(), (0, 0, 0));
    }

    #[test]
    fn test_two_device_sfr_host_memory_passes() {
        let pair = DevicePair::new(0, 2);
        let regions = partition::regions(Strategy::SplitFrame, pair, 2, RENDER_EXTENT);
        assert_eq!(
            regions,
            vec![
                PartitionRegion {
                    rect: Rect::new(0, 0, 128, 256),
                    device: 0
                },
                PartitionRegion {
                    rect: Rect::new(128, 0, 128, 256),
                    device: 1
                },
            ]
        );
        assert_eq!(partition::draw_mask(Strategy::SplitFrame, pair), DeviceMask::pair(0, 1));

        let mut driver = driver(2);
        let outcome = run_case(&mut driver, &case("sfr_sys"), &RunConfig::default());
        assert_eq!(outcome, Outcome::Pass);
        // Two pairs of render, peer copy and readback.
        assert_eq!(driver.submission_count(), 6);
    }

    #[test]
    fn test_afr_peer_fetch_without_generic_src_skips() {
        let mut driver = SoftwareDriver::new(SoftwarePlatform {
            peer_features: PeerFeatureTable::uniform(
                PeerFeatures::ALL.without(PeerFeatures::GENERIC_SRC),
            ),
            ..SoftwarePlatform::default()
        });
        let outcome = run_case(&mut driver, &case("afr_dedicated_peer"), &RunConfig::default());
        assert_eq!(
            outcome,
            Outcome::Skip {
                reason: "peer fetch not supported".into()
            }
        );
        assert_eq!(driver.submission_count(), 0);
    }

    #[test]
    fn test_sfr_tessellated_line_fill_uses_reference_png() {
        let (config, _assets) = config_with_assets();
        let mut driver = driver(2);
        assert_eq!(
            run_case(&mut driver, &case("sfr_tessellated_linefill"), &config),
            Outcome::Pass
        );

        // Swap in the filled sphere as the line-fill reference.
        let filled = config.asset_root.join(verify::SPHERE_FILLED_REFERENCE);
        let line = config.asset_root.join(verify::SPHERE_LINE_REFERENCE);
        std::fs::copy(&filled, &line).unwrap();
        let mut driver = self::driver(2);
        match run_case(&mut driver, &case("sfr_tessellated_linefill"), &config) {
            Outcome::Fail { message, artifact } => {
                assert!(message.starts_with("Image comparison failed on devices 0/1"));
                let artifact = artifact.unwrap();
                assert!(artifact.exists());
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_every_case_passes_on_a_healthy_group() {
        let (config, _assets) = config_with_assets();
        for case in modes::all_cases() {
            let mut driver = driver(2);
            let outcome = run_case(&mut driver, case, &config);
            assert_eq!(outcome, Outcome::Pass, "case {}", case.name);
            assert_eq!(driver.live_objects(), (0, 0, 0), "case {}", case.name);
        }
    }

    #[test]
    fn test_three_device_group_wraps_pairs() {
        let mut driver = driver(3);
        for name in ["sfr", "afr_dedicated_peer"] {
            assert_eq!(
                run_case(&mut driver, &case(name), &RunConfig::default()),
                Outcome::Pass,
                "case {}",
                name
            );
        }
    }

    #[test]
    fn test_broadcast_allocation_passes() {
        let mut driver = SoftwareDriver::new(SoftwarePlatform {
            groups: vec![SoftwareGroup::new(3, false)],
            ..SoftwarePlatform::default()
        });
        assert_eq!(
            run_case(&mut driver, &case("sfr_dedicated_peer"), &RunConfig::default()),
            Outcome::Pass
        );
    }

    #[test]
    fn test_capture_matches_reference_exactly() {
        let mut driver = driver(2);
        let mode = TestMode::AFR;
        let group = DeviceGroup::discover(&driver, GroupSelector::default()).unwrap();
        let primary = group.open(&mut driver, GroupSelector::default(), mode).unwrap();
        let scene = Scene::for_mode(mode);
        let mut matrix = PeerAccessMatrix::new();
        let plans = Planner::new(&driver, &group, primary, mode, RENDER_EXTENT)
            .plan_all(&scene, &mut matrix)
            .unwrap();

        let mut scope = ResourceScope::default();
        let image = capture_pair(
            &mut driver,
            &group,
            &plans[0],
            &scene,
            Duration::from_secs(1),
            &mut scope,
        )
        .unwrap();
        scope.release(&mut driver).unwrap();
        assert_eq!(image, verify::render_reference(&scene, RENDER_EXTENT));
    }

    #[test]
    fn test_misrouted_peer_copy_is_a_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            artifact_dir: Some(dir.path().to_path_buf()),
            ..RunConfig::default()
        };
        let mut driver = SoftwareDriver::new(SoftwarePlatform {
            faults: FaultInjection {
                misroute_peer_writes: true,
                ..FaultInjection::default()
            },
            ..SoftwarePlatform::default()
        });
        match run_case(&mut driver, &case("afr"), &config) {
            Outcome::Fail { message, artifact } => {
                assert!(message.contains("devices 0/1"));
                assert!(artifact.unwrap().starts_with(dir.path()));
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(driver.live_objects(), (0, 0, 0));
    }

    #[test]
    fn test_hung_fence_fails_the_case() {
        let mut driver = SoftwareDriver::new(SoftwarePlatform {
            faults: FaultInjection {
                hang_on_submission: Some(1),
                ..FaultInjection::default()
            },
            ..SoftwarePlatform::default()
        });
        let config = RunConfig {
            fence_timeout: Duration::from_millis(50),
            ..RunConfig::default()
        };
        match run_case(&mut driver, &case("sfr"), &config) {
            Outcome::Fail { message, artifact } => {
                assert!(message.contains("timed out"));
                assert!(artifact.is_none());
            }
            other => panic!("expected failure, got {:?}", other),
        }
        // Nothing after the hung submission was attempted.
        assert_eq!(driver.submission_count(), 2);
    }

    #[test]
    fn test_missing_extension_skips() {
        let mut platform = SoftwarePlatform::default();
        platform.capabilities.extensions.dedicated_allocation = false;
        let mut driver = SoftwareDriver::new(platform);
        let outcome = run_case(&mut driver, &case("sfr_dedicated"), &RunConfig::default());
        assert!(outcome.is_skip());
        assert!(run_case(&mut driver, &case("sfr"), &RunConfig::default()).is_pass());
    }

    #[test]
    fn test_unreadable_sphere_reference_fails() {
        let assets = tempfile::tempdir().unwrap();
        let path = assets.path().join(verify::SPHERE_FILLED_REFERENCE);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not a png").unwrap();
        let config = RunConfig {
            asset_root: assets.path().to_path_buf(),
            ..RunConfig::default()
        };
        let mut driver = driver(2);
        let outcome = run_case(&mut driver, &case("afr_tessellated"), &config);
        assert!(outcome.is_fail());
    }

    #[test]
    fn test_every_case_passes_without_reference_files() {
        let assets = tempfile::tempdir().unwrap();
        let config = RunConfig {
            asset_root: assets.path().join("assets"),
            ..RunConfig::default()
        };
        for case in modes::all_cases() {
            let mut driver = driver(2);
            assert_eq!(run_case(&mut driver, case, &config), Outcome::Pass, "case {}", case.name);
        }
    }

    #[test]
    fn test_oversized_group_skips() {
        let mut driver = driver(33);
        let outcome = run_case(&mut driver, &case("afr"), &RunConfig::default());
        assert!(outcome.is_skip());
        assert_eq!(driver.submission_count(), 0);
    }

    #[test]
    fn test_scope_releases_owner_after_its_memory_users() {
        let mut scope = ResourceScope::default();
        scope.push(Owned::Image(ImageHandle(1)));
        scope.push_memory_for(Owned::Image(ImageHandle(1)), MemoryHandle(2));
        scope.push(Owned::Image(ImageHandle(3)));
        assert_eq!(
            scope.objects,
            vec![
                Owned::Memory(MemoryHandle(2)),
                Owned::Image(ImageHandle(1)),
                Owned::Image(ImageHandle(3)),
            ]
        );
    }
}
