//! Shared types for the crackdiff comparison pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::diagnostics::PipelineDiagnostics;
use crate::downsample::DownsampleFilter;
use crate::features::FeatureMatcherKind;
use crate::homography::Homography;

/// Re-export `GrayImage` so downstream crates can reference
/// intermediate raster data without depending on `image` directly.
pub use image::GrayImage;

/// Re-export `RgbaImage` so downstream crates can reference decoded
/// and highlighted images without depending on `image` directly.
pub use image::RgbaImage;

/// A 2D point in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal position (pixels from left edge).
    pub x: f64,
    /// Vertical position (pixels from top edge).
    pub y: f64,
}

impl Point {
    /// Create a new point.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Squared Euclidean distance to another point.
    #[must_use]
    pub fn distance_squared(self, other: Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx.mul_add(dx, dy * dy)
    }

    /// Euclidean distance to another point.
    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        self.distance_squared(other).sqrt()
    }
}

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Dimensions of an image buffer.
    #[must_use]
    pub fn of<P: image::Pixel>(image: &image::ImageBuffer<P, Vec<P::Subpixel>>) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
        }
    }

    /// Total pixel count.
    #[must_use]
    pub const fn pixel_count(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Axis-aligned rectangle in pixel coordinates.
///
/// Used for the comparison crop: the bounding box of the region of the
/// aligned image that actually carries content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    /// Left edge (inclusive).
    pub x: u32,
    /// Top edge (inclusive).
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Rect {
    /// A rectangle covering an entire image of the given dimensions.
    #[must_use]
    pub const fn full(dimensions: Dimensions) -> Self {
        Self {
            x: 0,
            y: 0,
            width: dimensions.width,
            height: dimensions.height,
        }
    }

    /// Dimensions of the rectangle.
    #[must_use]
    pub const fn dimensions(self) -> Dimensions {
        Dimensions {
            width: self.width,
            height: self.height,
        }
    }

    /// Area in pixels.
    #[must_use]
    pub const fn area(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Configuration for the comparison pipeline.
///
/// Every threshold is tunable; the defaults are the values the dashboard
/// settled on for crack photographs (diff threshold 50, blob area 800,
/// ratio 0.75).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompareConfig {
    /// Longest image side after preprocessing. Larger inputs are
    /// downsampled to this bound before any feature work.
    pub max_dimension: u32,

    /// Resampling filter used by the preprocessor.
    pub downsample_filter: DownsampleFilter,

    /// Which detector/matcher strategy to use.
    pub feature_matcher: FeatureMatcherKind,

    /// Upper bound on keypoints kept per image, strongest first.
    pub max_keypoints: usize,

    /// FAST intensity threshold for corner detection.
    pub fast_threshold: u8,

    /// Number of pyramid levels searched for keypoints.
    pub pyramid_levels: u8,

    /// Scale factor between consecutive pyramid levels.
    pub pyramid_scale: f32,

    /// Lowe ratio: a match is kept only if `best < ratio * second_best`.
    pub match_ratio: f32,

    /// Minimum number of ratio-filtered matches before a homography
    /// is attempted at all.
    pub min_matches: usize,

    /// RANSAC inlier threshold (reprojection error in pixels).
    pub ransac_threshold: f64,

    /// RANSAC iteration cap.
    pub ransac_iterations: u32,

    /// Seed for the RANSAC sampler.
    pub ransac_seed: u64,

    /// Aligned-image luma above this value counts as "has content".
    pub content_threshold: u8,

    /// Blurred difference at or above this value counts as changed.
    pub diff_threshold: u8,

    /// Number of 5×5 closing passes applied to the raw change mask.
    pub close_iterations: u8,

    /// Connected change regions smaller than this many pixels are dropped.
    pub min_blob_area: u32,

    /// RGBA color painted over changed pixels.
    pub highlight_color: [u8; 4],
}

impl CompareConfig {
    /// Default longest side after preprocessing.
    pub const DEFAULT_MAX_DIMENSION: u32 = 1200;
    /// Default preprocessing filter.
    pub const DEFAULT_DOWNSAMPLE_FILTER: DownsampleFilter = DownsampleFilter::Lanczos3;
    /// Default keypoint budget per image.
    pub const DEFAULT_MAX_KEYPOINTS: usize = 500;
    /// Default FAST threshold.
    pub const DEFAULT_FAST_THRESHOLD: u8 = 20;
    /// Default pyramid depth.
    pub const DEFAULT_PYRAMID_LEVELS: u8 = 8;
    /// Default pyramid scale factor.
    pub const DEFAULT_PYRAMID_SCALE: f32 = 1.2;
    /// Default ratio-test threshold.
    pub const DEFAULT_MATCH_RATIO: f32 = 0.75;
    /// Default minimum match count for homography estimation.
    pub const DEFAULT_MIN_MATCHES: usize = 10;
    /// Default RANSAC reprojection threshold in pixels.
    pub const DEFAULT_RANSAC_THRESHOLD: f64 = 3.0;
    /// Default RANSAC iteration cap.
    pub const DEFAULT_RANSAC_ITERATIONS: u32 = 2000;
    /// Default RANSAC seed.
    pub const DEFAULT_RANSAC_SEED: u64 = 0x00c0_ffee;
    /// Default content threshold.
    pub const DEFAULT_CONTENT_THRESHOLD: u8 = 1;
    /// Default diff threshold.
    pub const DEFAULT_DIFF_THRESHOLD: u8 = 50;
    /// Default closing passes.
    pub const DEFAULT_CLOSE_ITERATIONS: u8 = 1;
    /// Default minimum blob area in pixels.
    pub const DEFAULT_MIN_BLOB_AREA: u32 = 800;
    /// Default highlight color (opaque red).
    pub const DEFAULT_HIGHLIGHT_COLOR: [u8; 4] = [255, 0, 0, 255];

    /// Check the configuration for values the pipeline cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] naming the first
    /// offending field.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let fail = |msg: &str| Err(PipelineError::InvalidConfig(msg.to_string()));
        if self.max_dimension == 0 {
            return fail("max_dimension must be positive");
        }
        if self.max_keypoints == 0 {
            return fail("max_keypoints must be positive");
        }
        if self.pyramid_levels == 0 {
            return fail("pyramid_levels must be at least 1");
        }
        if !self.pyramid_scale.is_finite() || self.pyramid_scale <= 1.0 {
            return fail("pyramid_scale must be greater than 1.0");
        }
        if !(self.match_ratio > 0.0 && self.match_ratio <= 1.0) {
            return fail("match_ratio must be in (0, 1]");
        }
        if self.min_matches < crate::homography::MIN_CORRESPONDENCES {
            return fail("min_matches must be at least 4");
        }
        if !self.ransac_threshold.is_finite() || self.ransac_threshold <= 0.0 {
            return fail("ransac_threshold must be positive");
        }
        if self.ransac_iterations == 0 {
            return fail("ransac_iterations must be positive");
        }
        if self.diff_threshold == 0 {
            return fail("diff_threshold must be at least 1");
        }
        Ok(())
    }
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            max_dimension: Self::DEFAULT_MAX_DIMENSION,
            downsample_filter: Self::DEFAULT_DOWNSAMPLE_FILTER,
            feature_matcher: FeatureMatcherKind::default(),
            max_keypoints: Self::DEFAULT_MAX_KEYPOINTS,
            fast_threshold: Self::DEFAULT_FAST_THRESHOLD,
            pyramid_levels: Self::DEFAULT_PYRAMID_LEVELS,
            pyramid_scale: Self::DEFAULT_PYRAMID_SCALE,
            match_ratio: Self::DEFAULT_MATCH_RATIO,
            min_matches: Self::DEFAULT_MIN_MATCHES,
            ransac_threshold: Self::DEFAULT_RANSAC_THRESHOLD,
            ransac_iterations: Self::DEFAULT_RANSAC_ITERATIONS,
            ransac_seed: Self::DEFAULT_RANSAC_SEED,
            content_threshold: Self::DEFAULT_CONTENT_THRESHOLD,
            diff_threshold: Self::DEFAULT_DIFF_THRESHOLD,
            close_iterations: Self::DEFAULT_CLOSE_ITERATIONS,
            min_blob_area: Self::DEFAULT_MIN_BLOB_AREA,
            highlight_color: Self::DEFAULT_HIGHLIGHT_COLOR,
        }
    }
}

/// Why the aligner used the plain-resize fallback instead of a warp.
///
/// None of these are errors: the comparison still completes, but the
/// caller should present the result with a caveat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FallbackReason {
    /// Feature matching is disabled in the configuration.
    MatchingDisabled,
    /// One of the images produced no keypoints or descriptors.
    InsufficientFeatures {
        /// Keypoints found in the baseline image.
        baseline: usize,
        /// Keypoints found in the current image.
        current: usize,
    },
    /// Ratio-filtered matches fell below the configured floor.
    TooFewMatches {
        /// Matches that survived the ratio test.
        found: usize,
        /// Configured minimum.
        required: usize,
    },
    /// The estimator produced no usable transform.
    DegenerateHomography,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MatchingDisabled => f.write_str("feature matching disabled"),
            Self::InsufficientFeatures { baseline, current } => write!(
                f,
                "insufficient features (baseline {baseline}, current {current})"
            ),
            Self::TooFewMatches { found, required } => {
                write!(f, "too few matches ({found} of {required} required)")
            }
            Self::DegenerateHomography => f.write_str("degenerate homography"),
        }
    }
}

/// Everything the pipeline learned about a comparison, minus the image.
///
/// Kept separate from the pixels so it can cross a worker boundary as a
/// small JSON string while the raster travels as a raw buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareReport {
    /// Whether the current image was merely resized (no geometric
    /// correction).
    pub used_fallback: bool,
    /// Why the fallback was used, when it was.
    pub fallback_reason: Option<FallbackReason>,
    /// The estimated transform (current → baseline), when one was found.
    pub homography: Option<Homography>,
    /// Matches that survived the ratio test.
    pub match_count: usize,
    /// RANSAC inliers supporting the homography.
    pub inlier_count: usize,
    /// Comparison crop within the baseline frame.
    pub crop: Rect,
    /// Pixels painted with the highlight color.
    pub changed_pixels: u64,
    /// Per-stage timing and metrics.
    pub diagnostics: PipelineDiagnostics,
}

/// Result of a full comparison: the highlighted image plus its report.
///
/// The image has the crop dimensions, which are not necessarily the
/// input dimensions.
#[derive(Debug, Clone)]
pub struct CompareOutcome {
    /// Cropped baseline with changed pixels painted.
    pub image: RgbaImage,
    /// Metadata about how the image was produced.
    pub report: CompareReport,
}

/// Errors that can occur during pipeline processing.
///
/// Uses custom `Serialize`/`Deserialize` because `image::ImageError`
/// does not implement serde traits. The `ImageDecode` variant is
/// serialized as its `Display` string.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Failed to decode an input image.
    #[error("failed to decode image: {0}")]
    ImageDecode(#[from] image::ImageError),

    /// The input image bytes were empty.
    #[error("input image data is empty")]
    EmptyInput,

    /// An image has a zero dimension or a buffer that does not match
    /// its dimensions.
    #[error("invalid image dimensions {width}x{height}")]
    InvalidDimensions {
        /// Reported width.
        width: u32,
        /// Reported height.
        height: u32,
    },

    /// Pipeline configuration is invalid.
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    /// A worker request could not be interpreted.
    #[error("invalid worker request: {0}")]
    InvalidRequest(String),

    /// The comparison was stopped through its cancel flag.
    #[error("comparison cancelled")]
    Cancelled,

    /// One of the keypoint sets was empty, so matching was not attempted.
    #[error("insufficient features (baseline {baseline}, current {current})")]
    InsufficientFeatures {
        /// Keypoints in the baseline set.
        baseline: usize,
        /// Keypoints in the current set.
        current: usize,
    },
}

impl PipelineError {
    /// Whether the pipeline absorbs this condition into the resize
    /// fallback rather than failing the comparison.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::InsufficientFeatures { .. })
    }
}

/// Serde-compatible proxy for `PipelineError`.
///
/// `image::ImageError` does not implement serde, so the `ImageDecode`
/// variant stores its `Display` string instead.
#[derive(Serialize, Deserialize)]
enum PipelineErrorProxy {
    ImageDecode(String),
    EmptyInput,
    InvalidDimensions { width: u32, height: u32 },
    InvalidConfig(String),
    InvalidRequest(String),
    Cancelled,
    InsufficientFeatures { baseline: usize, current: usize },
}

impl Serialize for PipelineError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let proxy = match self {
            Self::ImageDecode(e) => PipelineErrorProxy::ImageDecode(e.to_string()),
            Self::EmptyInput => PipelineErrorProxy::EmptyInput,
            Self::InvalidDimensions { width, height } => PipelineErrorProxy::InvalidDimensions {
                width: *width,
                height: *height,
            },
            Self::InvalidConfig(s) => PipelineErrorProxy::InvalidConfig(s.clone()),
            Self::InvalidRequest(s) => PipelineErrorProxy::InvalidRequest(s.clone()),
            Self::Cancelled => PipelineErrorProxy::Cancelled,
            Self::InsufficientFeatures { baseline, current } => {
                PipelineErrorProxy::InsufficientFeatures {
                    baseline: *baseline,
                    current: *current,
                }
            }
        };
        proxy.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PipelineError {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let proxy = PipelineErrorProxy::deserialize(deserializer)?;
        Ok(match proxy {
            // The typed image::ImageError cannot be reconstructed; keep
            // the message.
            PipelineErrorProxy::ImageDecode(msg) => {
                Self::InvalidRequest(format!("image decode error: {msg}"))
            }
            PipelineErrorProxy::EmptyInput => Self::EmptyInput,
            PipelineErrorProxy::InvalidDimensions { width, height } => {
                Self::InvalidDimensions { width, height }
            }
            PipelineErrorProxy::InvalidConfig(s) => Self::InvalidConfig(s),
            PipelineErrorProxy::InvalidRequest(s) => Self::InvalidRequest(s),
            PipelineErrorProxy::Cancelled => Self::Cancelled,
            PipelineErrorProxy::InsufficientFeatures { baseline, current } => {
                Self::InsufficientFeatures { baseline, current }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn point_distance() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(3.0, 4.0);
        assert!((a.distance(b) - 5.0).abs() < f64::EPSILON);
        assert!((a.distance_squared(b) - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rect_full_covers_dimensions() {
        let rect = Rect::full(Dimensions {
            width: 30,
            height: 20,
        });
        assert_eq!(rect.x, 0);
        assert_eq!(rect.y, 0);
        assert_eq!(rect.area(), 600);
    }

    #[test]
    fn config_defaults_match_dashboard_values() {
        let config = CompareConfig::default();
        assert_eq!(config.max_dimension, 1200);
        assert_eq!(config.diff_threshold, 50);
        assert_eq!(config.min_blob_area, 800);
        assert!((config.match_ratio - 0.75).abs() < f32::EPSILON);
        assert!((config.ransac_threshold - 3.0).abs() < f64::EPSILON);
        assert_eq!(config.highlight_color, [255, 0, 0, 255]);
        assert_eq!(config.feature_matcher, FeatureMatcherKind::Orb);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_low_match_floor() {
        let config = CompareConfig {
            min_matches: 3,
            ..CompareConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(ref s)) if s.contains("min_matches")
        ));
    }

    #[test]
    fn validate_rejects_ratio_out_of_range() {
        let config = CompareConfig {
            match_ratio: 1.5,
            ..CompareConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_config_json_fills_defaults() {
        let config: CompareConfig = serde_json::from_str(r#"{"diff_threshold": 40}"#).unwrap();
        assert_eq!(config.diff_threshold, 40);
        assert_eq!(config.min_blob_area, CompareConfig::DEFAULT_MIN_BLOB_AREA);
    }

    #[test]
    fn fallback_reason_display() {
        let reason = FallbackReason::TooFewMatches {
            found: 3,
            required: 10,
        };
        assert_eq!(reason.to_string(), "too few matches (3 of 10 required)");
    }

    #[test]
    fn insufficient_features_is_recoverable() {
        let err = PipelineError::InsufficientFeatures {
            baseline: 0,
            current: 12,
        };
        assert!(err.is_recoverable());
        assert!(!PipelineError::EmptyInput.is_recoverable());
    }

    #[test]
    fn error_display() {
        let err = PipelineError::InvalidDimensions {
            width: 0,
            height: 10,
        };
        assert_eq!(err.to_string(), "invalid image dimensions 0x10");
    }

    #[test]
    fn pipeline_error_serde_keeps_variant() {
        let err = PipelineError::InsufficientFeatures {
            baseline: 4,
            current: 0,
        };
        let json = serde_json::to_string(&err).unwrap();
        let back: PipelineError = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            back,
            PipelineError::InsufficientFeatures {
                baseline: 4,
                current: 0
            }
        ));
    }

    #[test]
    fn decode_error_deserializes_with_message() {
        let err = image::load_from_memory(&[0xFF, 0x00]).unwrap_err();
        let json = serde_json::to_string(&PipelineError::ImageDecode(err)).unwrap();
        let back: PipelineError = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, PipelineError::InvalidRequest(ref s) if s.starts_with("image decode error")));
    }
}
