//! Image comparison policies.
//!
//! Both comparisons look at the images in both directions and produce a
//! green/red error mask: green where a pixel found a match, red where it
//! did not.

use image::{Rgba, RgbaImage};

const OK: Rgba<u8> = Rgba([0, 255, 0, 255]);
const ERROR: Rgba<u8> = Rgba([255, 0, 0, 255]);

/// What a comparison measured.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Metric {
    /// Pixels without a match in their neighbourhood.
    OutsideTolerance(u64),
    /// Larger of the two directional mean errors.
    FuzzyError(f64),
    SizeMismatch,
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutsideTolerance(count) => write!(f, "{} pixels outside tolerance", count),
            Self::FuzzyError(error) => write!(f, "fuzzy error {:.6}", error),
            Self::SizeMismatch => write!(f, "image sizes differ"),
        }
    }
}

/// Outcome of one comparison.
#[derive(Debug, Clone)]
pub struct VerificationResult {
    pub passed: bool,
    pub metric: Metric,
    /// Error mask, present when the comparison failed.
    pub diff: Option<RgbaImage>,
}

impl VerificationResult {
    fn size_mismatch(reference: &RgbaImage, result: &RgbaImage) -> Self {
        log::warn!(
            "Image size mismatch: reference {}x{}, result {}x{}",
            reference.width(),
            reference.height(),
            result.width(),
            result.height()
        );
        Self {
            passed: false,
            metric: Metric::SizeMismatch,
            diff: None,
        }
    }

    /// Human-readable summary for failure messages.
    pub fn summary(&self) -> String {
        self.metric.to_string()
    }
}

fn within(a: &Rgba<u8>, b: &Rgba<u8>, threshold: [u8; 4]) -> bool {
    (0..4).all(|ch| a.0[ch].abs_diff(b.0[ch]) <= threshold[ch])
}

/// True if some pixel of `other` within `deviation` of `(x, y)` matches
/// `pixel` within `threshold`. Neighbours outside the image do not count.
fn has_match(
    pixel: &Rgba<u8>,
    other: &RgbaImage,
    x: u32,
    y: u32,
    deviation: u32,
    threshold: [u8; 4],
) -> bool {
    let x0 = x.saturating_sub(deviation);
    let y0 = y.saturating_sub(deviation);
    let x1 = (x + deviation).min(other.width() - 1);
    let y1 = (y + deviation).min(other.height() - 1);
    (y0..=y1).any(|ny| (x0..=x1).any(|nx| within(pixel, other.get_pixel(nx, ny), threshold)))
}

/// Per-channel threshold compare that lets a pixel find its match within
/// `deviation` pixels.
///
/// A result pixel must match some reference pixel in its neighbourhood and
/// a reference pixel must match some result pixel in its neighbourhood.
pub fn position_tolerant_compare(
    reference: &RgbaImage,
    result: &RgbaImage,
    threshold: [u8; 4],
    deviation: u32,
) -> VerificationResult {
    if reference.dimensions() != result.dimensions() || reference.width() == 0 || reference.height() == 0 {
        return VerificationResult::size_mismatch(reference, result);
    }

    let mut mask = RgbaImage::from_pixel(reference.width(), reference.height(), OK);
    let mut failures = 0u64;
    for (x, y, pixel) in result.enumerate_pixels() {
        let forward = has_match(pixel, reference, x, y, deviation, threshold);
        let backward = has_match(reference.get_pixel(x, y), result, x, y, deviation, threshold);
        if !(forward && backward) {
            failures += 1;
            mask.put_pixel(x, y, ERROR);
        }
    }

    let passed = failures == 0;
    VerificationResult {
        passed,
        metric: Metric::OutsideTolerance(failures),
        diff: (!passed).then_some(mask),
    }
}

/// Squared colour distance normalised to `[0, 1]`.
fn distance(a: &Rgba<u8>, b: &Rgba<u8>) -> f64 {
    let sum: f64 = (0..4)
        .map(|ch| {
            let d = (a.0[ch] as f64 - b.0[ch] as f64) / 255.0;
            d * d
        })
        .sum();
    sum / 4.0
}

/// Error of every pixel of `from` against the best 3x3 neighbour in `to`.
fn neighbourhood_errors(from: &RgbaImage, to: &RgbaImage) -> Vec<f64> {
    from.enumerate_pixels()
        .map(|(x, y, pixel)| {
            let x0 = x.saturating_sub(1);
            let y0 = y.saturating_sub(1);
            let x1 = (x + 1).min(to.width() - 1);
            let y1 = (y + 1).min(to.height() - 1);
            let mut best = f64::MAX;
            for ny in y0..=y1 {
                for nx in x0..=x1 {
                    best = best.min(distance(pixel, to.get_pixel(nx, ny)));
                }
            }
            best
        })
        .collect()
}

/// Budgeted comparison for scenes whose edges legitimately differ.
///
/// Every pixel is scored against its best neighbour in the other image;
/// the metric is the larger of the two directional means and must not
/// exceed `budget`.
pub fn fuzzy_compare(reference: &RgbaImage, result: &RgbaImage, budget: f64) -> VerificationResult {
    if reference.dimensions() != result.dimensions() || reference.width() == 0 || reference.height() == 0 {
        return VerificationResult::size_mismatch(reference, result);
    }

    let forward = neighbourhood_errors(result, reference);
    let backward = neighbourhood_errors(reference, result);
    let count = forward.len() as f64;
    let metric = (forward.iter().sum::<f64>() / count).max(backward.iter().sum::<f64>() / count);
    let passed = metric <= budget;

    let diff = (!passed).then(|| {
        let width = reference.width();
        RgbaImage::from_fn(width, reference.height(), |x, y| {
            let i = (y * width + x) as usize;
            if forward[i].max(backward[i]) > 0.0 {
                ERROR
            } else {
                OK
            }
        })
    });
    VerificationResult {
        passed,
        metric: Metric::FuzzyError(metric),
        diff,
    }
}
