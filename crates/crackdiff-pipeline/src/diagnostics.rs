//! Pipeline diagnostics: timing, counts, and other metrics for each stage.
//!
//! Every comparison collects diagnostics alongside its result so a
//! surprising highlight (or a fallback) can be explained after the fact:
//! how many keypoints each image produced, how many survived matching,
//! how much consensus the homography had, and how the change mask was
//! filtered.
//!
//! Timestamps are captured via the `web-time` crate, which uses
//! `performance.now()` on WASM and `std::time::Instant` on native.
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::features::FeatureMatcherKind;
use crate::types::Rect;

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Diagnostics collected from a single comparison.
///
/// Feature detection, matching and estimation are skipped when matching
/// is disabled or an image has no features; their fields are `None` then.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDiagnostics {
    /// Size bounding of both inputs.
    pub preprocess: StageDiagnostics,
    /// Keypoint detection on both images.
    pub feature_detection: Option<StageDiagnostics>,
    /// Descriptor matching and ratio test.
    pub matching: Option<StageDiagnostics>,
    /// Robust homography fit.
    pub estimation: Option<StageDiagnostics>,
    /// Warp or resize into the baseline frame.
    pub alignment: StageDiagnostics,
    /// Change mask computation.
    pub diff: StageDiagnostics,
    /// Highlight painting.
    pub highlight: StageDiagnostics,
    /// Total wall-clock duration of the comparison (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Summary across all stages.
    pub summary: PipelineSummary,
}

/// Diagnostics for a single pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Wall-clock duration of this stage (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stage-specific metrics.
    pub metrics: StageMetrics,
}

/// Stage-specific metrics that vary by pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Input bounding metrics.
    Preprocess {
        /// Baseline width after bounding.
        baseline_width: u32,
        /// Baseline height after bounding.
        baseline_height: u32,
        /// Current width after bounding.
        current_width: u32,
        /// Current height after bounding.
        current_height: u32,
        /// Whether the baseline was downsampled.
        baseline_downsampled: bool,
        /// Whether the current image was downsampled.
        current_downsampled: bool,
    },
    /// Keypoint detection metrics.
    FeatureDetection {
        /// Strategy used.
        matcher: FeatureMatcherKind,
        /// Keypoints found in the baseline.
        baseline_keypoints: usize,
        /// Keypoints found in the current image.
        current_keypoints: usize,
    },
    /// Matching metrics.
    Matching {
        /// Ratio-test threshold used.
        ratio: f32,
        /// Matches that survived the ratio test.
        match_count: usize,
    },
    /// Homography estimation metrics.
    Estimation {
        /// Whether a homography was accepted.
        accepted: bool,
        /// Inliers supporting the accepted homography (0 if rejected).
        inlier_count: usize,
        /// RANSAC iterations run (0 if estimation was not attempted).
        iterations: u32,
    },
    /// Alignment metrics.
    Alignment {
        /// Aligned image width.
        width: u32,
        /// Aligned image height.
        height: u32,
        /// Whether the resize fallback was used.
        used_fallback: bool,
    },
    /// Change mask metrics.
    Diff {
        /// Comparison crop.
        crop: Rect,
        /// Pixels over threshold before closing and area filtering.
        raw_changed_pixels: u64,
        /// Pixels in the final mask.
        changed_pixels: u64,
        /// Regions kept by the area filter.
        regions_kept: usize,
        /// Regions dropped by the area filter.
        regions_dropped: usize,
    },
    /// Highlight metrics.
    Highlight {
        /// Output width.
        width: u32,
        /// Output height.
        height: u32,
        /// Pixels painted.
        painted_pixels: u64,
    },
}

/// High-level summary for the whole comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    /// Baseline width after bounding.
    pub image_width: u32,
    /// Baseline height after bounding.
    pub image_height: u32,
    /// Matches that survived the ratio test.
    pub match_count: usize,
    /// Homography inliers.
    pub inlier_count: usize,
    /// Whether the resize fallback was used.
    pub used_fallback: bool,
    /// Pixels painted in the output.
    pub changed_pixels: u64,
}

impl PipelineDiagnostics {
    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Comparison Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Baseline: {}x{}  |  Total duration: {:.3}ms",
            self.summary.image_width,
            self.summary.image_height,
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<24} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);
        let stages = [
            ("Preprocess", Some(&self.preprocess)),
            ("Feature Detection", self.feature_detection.as_ref()),
            ("Matching", self.matching.as_ref()),
            ("Estimation", self.estimation.as_ref()),
            ("Alignment", Some(&self.alignment)),
            ("Diff", Some(&self.diff)),
            ("Highlight", Some(&self.highlight)),
        ];

        for (name, diag) in stages {
            let Some(diag) = diag else {
                lines.push(format!("{name:<24} {:>10} {:>10}  skipped", "-", "-"));
                continue;
            };
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let details = format_metrics(&diag.metrics);
            lines.push(format!("{name:<24} {ms:>8.3}ms {pct:>9.1}%  {details}"));
        }

        lines.push(String::new());
        lines.push(format!(
            "Matches: {}  |  Inliers: {}  |  Fallback: {}  |  Changed pixels: {}",
            self.summary.match_count,
            self.summary.inlier_count,
            if self.summary.used_fallback { "yes" } else { "no" },
            self.summary.changed_pixels,
        ));

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Format stage metrics into a compact detail string.
fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Preprocess {
            baseline_width,
            baseline_height,
            current_width,
            current_height,
            baseline_downsampled,
            current_downsampled,
        } => {
            let mark = |d: bool| if d { " (downsampled)" } else { "" };
            format!(
                "baseline {baseline_width}x{baseline_height}{}, current {current_width}x{current_height}{}",
                mark(*baseline_downsampled),
                mark(*current_downsampled),
            )
        }
        StageMetrics::FeatureDetection {
            matcher,
            baseline_keypoints,
            current_keypoints,
        } => format!("{matcher}: baseline={baseline_keypoints} current={current_keypoints}"),
        StageMetrics::Matching { ratio, match_count } => {
            format!("ratio={ratio:.2} matches={match_count}")
        }
        StageMetrics::Estimation {
            accepted,
            inlier_count,
            iterations,
        } => {
            let verdict = if *accepted { "accepted" } else { "rejected" };
            format!("{verdict} inliers={inlier_count} iterations={iterations}")
        }
        StageMetrics::Alignment {
            width,
            height,
            used_fallback,
        } => {
            let how = if *used_fallback { "resize" } else { "warp" };
            format!("{how} -> {width}x{height}")
        }
        StageMetrics::Diff {
            crop,
            raw_changed_pixels,
            changed_pixels,
            regions_kept,
            regions_dropped,
        } => {
            #[allow(clippy::cast_precision_loss)]
            let density = if crop.area() > 0 {
                *changed_pixels as f64 / crop.area() as f64 * 100.0
            } else {
                0.0
            };
            format!(
                "crop {}x{}+{}+{} raw={raw_changed_pixels} changed={changed_pixels} ({density:.1}%) regions={regions_kept} dropped={regions_dropped}",
                crop.width, crop.height, crop.x, crop.y,
            )
        }
        StageMetrics::Highlight {
            width,
            height,
            painted_pixels,
        } => format!("{width}x{height} painted={painted_pixels}"),
    }
}
