//! crackdiff-pipeline: Pure image co-registration and change-highlighting
//! pipeline (sans-IO).
//!
//! Aligns a current photograph of a crack site onto a baseline photograph
//! and paints the regions that changed:
//! bound -> grayscale -> features -> match -> homography -> warp ->
//! diff -> highlight.
//!
//! This crate has **no I/O dependencies** -- it operates on in-memory
//! images and byte slices and returns structured data. Fetching,
//! threading and orchestration live in `crackdiff-io`.

pub mod align;
pub mod blur;
pub mod cancel;
pub mod diagnostics;
pub mod diff;
pub mod downsample;
pub mod features;
pub mod grayscale;
pub mod highlight;
pub mod homography;
pub mod pipeline;
pub mod types;
pub mod worker;

pub use cancel::CancelFlag;
pub use diagnostics::{PipelineDiagnostics, StageDiagnostics, StageMetrics};
pub use downsample::DownsampleFilter;
pub use features::{FeatureMatcher, FeatureMatcherKind, KeypointSet, MatchPair};
pub use homography::Homography;
pub use pipeline::Pipeline;
pub use types::{
    CompareConfig, CompareOutcome, CompareReport, Dimensions, FallbackReason, GrayImage,
    PipelineError, Point, Rect, RgbaImage,
};
pub use worker::{Phase, WorkerReply, WorkerRequest};

/// Compare two decoded images.
///
/// The output is the baseline, cropped to the region the aligned current
/// image covers, with changed pixels painted in `config.highlight_color`.
///
/// # Pipeline steps
///
/// 1. Bound both images to `config.max_dimension`
/// 2. Grayscale (BT.601 luma)
/// 3. Keypoint detection (pluggable strategy)
/// 4. Ratio-test matching
/// 5. RANSAC homography, current -> baseline
/// 6. Warp into the baseline frame, or resize when there is no homography
/// 7. Content-masked, denoised difference
/// 8. Highlight
///
/// # Errors
///
/// Returns [`PipelineError::InvalidConfig`] for an unusable config and
/// [`PipelineError::InvalidDimensions`] for empty images. Failing to
/// align is not an error; see [`CompareReport::used_fallback`].
pub fn compare(
    baseline: RgbaImage,
    current: RgbaImage,
    config: &CompareConfig,
) -> Result<CompareOutcome, PipelineError> {
    worker::run(baseline, current, config.clone(), &CancelFlag::new(), |_| {})
}

/// Decode two encoded images (PNG, JPEG, BMP, WebP) and compare them.
///
/// # Errors
///
/// Returns [`PipelineError::EmptyInput`] or [`PipelineError::ImageDecode`]
/// if either input cannot be decoded, plus everything [`compare`] returns.
pub fn compare_bytes(
    baseline: &[u8],
    current: &[u8],
    config: &CompareConfig,
) -> Result<CompareOutcome, PipelineError> {
    let baseline = grayscale::decode(baseline)?;
    let current = grayscale::decode(current)?;
    compare(baseline, current, config)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use image::Rgba;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    /// Random overlapping flat rectangles on a dark ground: plenty of
    /// distinctive corners.
    fn blocks(w: u32, h: u32, seed: u64) -> RgbaImage {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut img = RgbaImage::from_pixel(w, h, Rgba([40, 40, 40, 255]));
        for _ in 0..70 {
            let x0 = rng.gen_range(0..w);
            let y0 = rng.gen_range(0..h);
            let rw = rng.gen_range(8..40);
            let rh = rng.gen_range(8..40);
            let v = rng.gen_range(60..=250u8);
            for y in y0..(y0 + rh).min(h) {
                for x in x0..(x0 + rw).min(w) {
                    img.put_pixel(x, y, Rgba([v, v, v, 255]));
                }
            }
        }
        img
    }

    fn noise(w: u32, h: u32, seed: u64) -> RgbaImage {
        let mut rng = StdRng::seed_from_u64(seed);
        RgbaImage::from_fn(w, h, |_, _| {
            let v: u8 = rng.r#gen();
            Rgba([v, v, v, 255])
        })
    }

    fn crop(img: &RgbaImage, x: u32, y: u32, w: u32, h: u32) -> RgbaImage {
        image::imageops::crop_imm(img, x, y, w, h).to_image()
    }

    #[test]
    fn unrelated_noise_falls_back() {
        let outcome = compare(noise(240, 200, 1), noise(240, 200, 2), &CompareConfig::default()).unwrap();
        assert!(outcome.report.used_fallback);
        assert!(outcome.report.homography.is_none());
        assert!(outcome.report.fallback_reason.is_some());
    }

    #[test]
    fn shifted_view_is_aligned() {
        let canvas = blocks(320, 320, 42);
        let baseline = crop(&canvas, 0, 0, 300, 300);
        let current = crop(&canvas, 7, 4, 300, 300);

        let outcome = compare(baseline, current, &CompareConfig::default()).unwrap();
        let report = &outcome.report;
        assert!(!report.used_fallback, "{:?}", report.fallback_reason);
        let h = report.homography.unwrap();
        let mapped = h.apply(Point::new(150.0, 150.0)).unwrap();
        assert!((mapped.x - 157.0).abs() < 0.5, "x = {}", mapped.x);
        assert!((mapped.y - 154.0).abs() < 0.5, "y = {}", mapped.y);
        assert!(report.inlier_count >= 6);
        // Only interpolation seams along the warp border may differ.
        assert!(report.changed_pixels < report.crop.area() / 20);
        assert_eq!(
            outcome.image.dimensions(),
            (report.crop.width, report.crop.height)
        );
    }

    #[test]
    fn new_damage_is_highlighted() {
        let canvas = blocks(320, 320, 42);
        let baseline = crop(&canvas, 0, 0, 300, 300);
        let mut current = crop(&canvas, 7, 4, 300, 300);
        for y in 120..180 {
            for x in 100..160 {
                let v = current.get_pixel(x, y).0[0];
                let w = if v < 128 { v + 120 } else { v - 120 };
                current.put_pixel(x, y, Rgba([w, w, w, 255]));
            }
        }

        let outcome = compare(baseline, current, &CompareConfig::default()).unwrap();
        let report = &outcome.report;
        assert!(!report.used_fallback, "{:?}", report.fallback_reason);
        assert!(report.changed_pixels > 2000, "{}", report.changed_pixels);

        // Square center (130, 150) in current coordinates sits at
        // (137, 154) in the baseline frame.
        let x = 137 - report.crop.x;
        let y = 154 - report.crop.y;
        assert_eq!(
            outcome.image.get_pixel(x, y).0,
            CompareConfig::DEFAULT_HIGHLIGHT_COLOR
        );
    }

    #[test]
    fn identical_images_have_no_change() {
        let img = blocks(200, 160, 5);
        let outcome = compare(img.clone(), img, &CompareConfig::default()).unwrap();
        assert_eq!(outcome.report.changed_pixels, 0);
    }

    #[test]
    fn compare_bytes_rejects_empty_input() {
        let result = compare_bytes(&[], &[], &CompareConfig::default());
        assert!(matches!(result, Err(PipelineError::EmptyInput)));
    }

    #[test]
    fn report_serializes() {
        let img = RgbaImage::from_pixel(20, 20, Rgba([100, 100, 100, 255]));
        let outcome = compare(img.clone(), img, &CompareConfig::default()).unwrap();
        let json = serde_json::to_value(&outcome.report).unwrap();
        assert_eq!(json["used_fallback"], serde_json::json!(true));
        assert!(json["diagnostics"]["total_duration"].is_number());
    }
}
