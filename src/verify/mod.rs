//! Output verification.
//!
//! Triangle scenes are checked against a CPU-rendered reference with a
//! zero colour threshold and one pixel of positional slack. Tessellated
//! sphere scenes are checked against reference PNGs from the asset root
//! with a budgeted fuzzy comparison; a sphere without a PNG on disk is
//! compared against its CPU rendering instead.

pub mod compare;

pub use compare::{fuzzy_compare, position_tolerant_compare, VerificationResult};

use crate::driver::{Extent, Format, PolygonMode, Rect};
use crate::error::VerifierError;
use crate::raster;
use crate::scene::{Scene, SceneKind, CLEAR_COLOR, DRAW_COLOR, TESS_LEVEL};
use image::error::{ParameterError, ParameterErrorKind};
use image::{ImageError, Rgba, RgbaImage};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};

/// Mean error allowed by the fuzzy comparison.
pub const FUZZY_BUDGET: f64 = 0.001;

/// Neighbourhood a triangle pixel may find its match in.
pub const POSITION_DEVIATION: u32 = 1;

/// Reference of the line-fill sphere, relative to the asset root.
pub const SPHERE_LINE_REFERENCE: &str = "device_group/sphere.png";

/// Reference of the filled sphere, relative to the asset root.
pub const SPHERE_FILLED_REFERENCE: &str = "device_group/spherefilled.png";

/// How a captured image is judged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ComparisonPolicy {
    PositionTolerant { threshold: [u8; 4], deviation: u32 },
    Fuzzy { budget: f64 },
}

impl ComparisonPolicy {
    pub fn for_scene(scene: &Scene) -> Self {
        match scene.kind {
            SceneKind::Triangle => Self::PositionTolerant {
                threshold: [0; 4],
                deviation: POSITION_DEVIATION,
            },
            SceneKind::Sphere { .. } => Self::Fuzzy {
                budget: FUZZY_BUDGET,
            },
        }
    }

    pub fn compare(&self, reference: &RgbaImage, result: &RgbaImage) -> VerificationResult {
        match *self {
            Self::PositionTolerant {
                threshold,
                deviation,
            } => position_tolerant_compare(reference, result, threshold, deviation),
            Self::Fuzzy { budget } => fuzzy_compare(reference, result, budget),
        }
    }
}

/// Reference PNG used for a sphere scene, `None` for the triangle.
pub fn reference_file(scene: &Scene) -> Option<&'static str> {
    match scene.kind {
        SceneKind::Triangle => None,
        SceneKind::Sphere { line_fill: true } => Some(SPHERE_LINE_REFERENCE),
        SceneKind::Sphere { line_fill: false } => Some(SPHERE_FILLED_REFERENCE),
    }
}

/// Rasterizes `scene` on the CPU: clear colour background, draw colour
/// geometry, the same pipeline the device runs.
pub fn render_reference(scene: &Scene, extent: Extent) -> RgbaImage {
    let background = Rgba(Format::Rgba8Unorm.encode(CLEAR_COLOR));
    let foreground = Rgba(Format::Rgba8Unorm.encode(DRAW_COLOR));
    let mut image = RgbaImage::from_pixel(extent.width, extent.height, background);
    let clip = Rect::full(extent);
    let pipeline = scene.pipeline();

    let mut plot = |x: i32, y: i32| image.put_pixel(x as u32, y as u32, foreground);
    for tri in scene.indices.chunks_exact(3) {
        let patch = [
            scene.vertices[tri[0] as usize].position,
            scene.vertices[tri[1] as usize].position,
            scene.vertices[tri[2] as usize].position,
        ];
        if pipeline.tessellated {
            let segments = raster::tess_segments(TESS_LEVEL);
            for triangle in raster::tessellate_sphere_patch(patch, segments) {
                raster::draw_triangle(triangle, pipeline.polygon_mode, extent, clip, &mut plot);
            }
        } else {
            raster::draw_triangle(patch, PolygonMode::Fill, extent, clip, &mut plot);
        }
    }
    image
}

/// Reference for `scene`: rendered for the triangle, loaded for spheres.
///
/// A missing sphere PNG falls back to the CPU rendering; a PNG that is
/// present but unreadable is an error.
pub fn load_reference(
    scene: &Scene,
    extent: Extent,
    asset_root: &Path,
) -> Result<RgbaImage, VerifierError> {
    let Some(file) = reference_file(scene) else {
        return Ok(render_reference(scene, extent));
    };
    let path = asset_root.join(file);
    if !path.is_file() {
        warn!(
            "Reference {} not found, comparing against the CPU rendering",
            path.display()
        );
        return Ok(render_reference(scene, extent));
    }
    debug!("Loading reference {}", path.display());
    Ok(image::open(&path)?.to_rgba8())
}

/// Wraps read-back bytes as an image.
pub fn result_image(extent: Extent, bytes: Vec<u8>) -> Result<RgbaImage, VerifierError> {
    RgbaImage::from_raw(extent.width, extent.height, bytes).ok_or_else(|| {
        VerifierError::Reference(ImageError::Parameter(ParameterError::from_kind(
            ParameterErrorKind::DimensionMismatch,
        )))
    })
}

/// Compares the captured image of `scene` under the scene's policy.
pub fn verify(
    scene: &Scene,
    result: &RgbaImage,
    asset_root: &Path,
) -> Result<VerificationResult, VerifierError> {
    let extent = Extent::new(result.width(), result.height());
    let reference = load_reference(scene, extent, asset_root)?;
    let policy = ComparisonPolicy::for_scene(scene);
    let outcome = policy.compare(&reference, result);
    debug!(
        "Comparison {:?}: passed={} metric={}",
        policy, outcome.passed, outcome.metric
    );
    Ok(outcome)
}

/// Writes the error mask of a failed comparison as `<dir>/<label>.diff.png`.
pub fn save_diff(dir: &Path, label: &str, diff: &RgbaImage) -> Result<PathBuf, VerifierError> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.diff.png", label));
    diff.save(&path)?;
    info!("Wrote diff image {}", path.display());
    Ok(path)
}

/// Renders both sphere references into `asset_root`.
pub fn write_references(asset_root: &Path, extent: Extent) -> Result<Vec<PathBuf>, VerifierError> {
    let mut written = Vec::new();
    for line_fill in [true, false] {
        let scene = Scene::for_mode(if line_fill {
            crate::modes::TestMode::TESSELLATION | crate::modes::TestMode::LINE_FILL
        } else {
            crate::modes::TestMode::TESSELLATION
        });
        let Some(file) = reference_file(&scene) else {
            continue;
        };
        let path = asset_root.join(file);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        render_reference(&scene, extent).save(&path)?;
        info!("Wrote reference {}", path.display());
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modes::TestMode;
    use crate::scene::RENDER_EXTENT;

    #[test]
    fn test_policy_follows_scene() {
        let triangle = Scene::for_mode(TestMode::SFR);
        let sphere = Scene::for_mode(TestMode::SFR | TestMode::TESSELLATION);
        assert_eq!(
            ComparisonPolicy::for_scene(&triangle),
            ComparisonPolicy::PositionTolerant {
                threshold: [0; 4],
                deviation: 1
            }
        );
        assert_eq!(
            ComparisonPolicy::for_scene(&sphere),
            ComparisonPolicy::Fuzzy { budget: 0.001 }
        );
    }

    #[test]
    fn test_reference_file_names() {
        let line = Scene::for_mode(TestMode::AFR | TestMode::TESSELLATION | TestMode::LINE_FILL);
        let filled = Scene::for_mode(TestMode::AFR | TestMode::TESSELLATION);
        assert_eq!(reference_file(&line), Some("device_group/sphere.png"));
        assert_eq!(reference_file(&filled), Some("device_group/spherefilled.png"));
        assert_eq!(reference_file(&Scene::for_mode(TestMode::AFR)), None);
    }

    #[test]
    fn test_reference_triangle() {
        let image = render_reference(&Scene::for_mode(TestMode::SFR), RENDER_EXTENT);
        let yellow = Rgba(Format::Rgba8Unorm.encode(DRAW_COLOR));
        let blue = Rgba(Format::Rgba8Unorm.encode(CLEAR_COLOR));
        assert_eq!(*image.get_pixel(128, 128), yellow);
        assert_eq!(*image.get_pixel(2, 2), blue);
        assert_eq!(*image.get_pixel(250, 250), blue);
    }

    #[test]
    fn test_missing_sphere_reference_renders_on_cpu() {
        let dir = tempfile::tempdir().unwrap();
        let scene = Scene::for_mode(TestMode::SFR | TestMode::TESSELLATION);
        let extent = Extent::new(32, 32);
        let reference = load_reference(&scene, extent, dir.path()).unwrap();
        assert_eq!(reference, render_reference(&scene, extent));
        assert!(verify(&scene, &reference, dir.path()).unwrap().passed);
    }

    #[test]
    fn test_unreadable_sphere_reference_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SPHERE_FILLED_REFERENCE);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not a png").unwrap();
        let scene = Scene::for_mode(TestMode::SFR | TestMode::TESSELLATION);
        let err = verify(&scene, &RgbaImage::new(8, 8), dir.path()).unwrap_err();
        assert!(!err.is_skip());
        assert!(matches!(err, VerifierError::Reference(_)));
    }

    #[test]
    fn test_written_references_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_references(dir.path(), Extent::new(32, 32)).unwrap();
        assert_eq!(paths.len(), 2);

        let scene = Scene::for_mode(TestMode::SFR | TestMode::TESSELLATION | TestMode::LINE_FILL);
        let reference = load_reference(&scene, Extent::new(32, 32), dir.path()).unwrap();
        assert_eq!(reference, render_reference(&scene, Extent::new(32, 32)));
        assert!(verify(&scene, &reference, dir.path()).unwrap().passed);
    }

    #[test]
    fn test_result_image_size_checked() {
        assert!(result_image(Extent::new(2, 2), vec![0; 16]).is_ok());
        assert!(result_image(Extent::new(2, 2), vec![0; 12]).is_err());
    }

    #[test]
    fn test_save_diff() {
        let dir = tempfile::tempdir().unwrap();
        let diff = RgbaImage::from_pixel(4, 4, Rgba([255, 0, 0, 255]));
        let path = save_diff(&dir.path().join("artifacts"), "sfr_pair0", &diff).unwrap();
        assert!(path.ends_with("sfr_pair0.diff.png"));
        assert!(path.exists());
    }
}
