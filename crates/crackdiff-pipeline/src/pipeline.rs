//! Incremental pipeline: advance stage-by-stage, inspecting each
//! intermediate result before continuing.
//!
//! ```rust
//! # use crackdiff_pipeline::{CompareConfig, Pipeline, PipelineError, RgbaImage};
//! # fn run(baseline: RgbaImage, current: RgbaImage) -> Result<(), PipelineError> {
//! let outcome = Pipeline::new(baseline, current, CompareConfig::default())
//!     .preprocess()?
//!     .detect_features()
//!     .match_features()
//!     .estimate()
//!     .align()
//!     .diff()?
//!     .highlight()?
//!     .into_outcome();
//! # Ok(())
//! # }
//! ```
//!
//! Each stage method consumes `self` and returns the next pipeline state
//! (or `Result` for fallible stages), carrying what later stages still
//! need. The caller can inspect the current stage's output via accessor
//! methods at any point.
//!
//! Failing to find features, matches or a usable homography is not an
//! error: those stages record a [`FallbackReason`] and the alignment stage
//! resizes instead of warping.

use web_time::Instant;

use crate::cancel::CancelFlag;
use crate::diagnostics::{PipelineDiagnostics, PipelineSummary, StageDiagnostics, StageMetrics};
use crate::diff::ChangeMask;
use crate::features::{FeatureMatcher, FeatureMatcherKind, KeypointSet, MatchPair};
use crate::homography::{Correspondence, Homography, RansacParams};
use crate::types::{
    CompareConfig, CompareOutcome, CompareReport, Dimensions, FallbackReason, GrayImage,
    PipelineError, Rect, RgbaImage,
};

/// Stage diagnostics gathered so far.
#[derive(Debug, Clone)]
struct Trace {
    started: Instant,
    cancel: CancelFlag,
    preprocess: Option<StageDiagnostics>,
    feature_detection: Option<StageDiagnostics>,
    matching: Option<StageDiagnostics>,
    estimation: Option<StageDiagnostics>,
    alignment: Option<StageDiagnostics>,
    diff: Option<StageDiagnostics>,
}

impl Trace {
    fn new(cancel: CancelFlag) -> Self {
        Self {
            started: Instant::now(),
            cancel,
            preprocess: None,
            feature_detection: None,
            matching: None,
            estimation: None,
            alignment: None,
            diff: None,
        }
    }
}

fn stage(start: Instant, metrics: StageMetrics) -> Option<StageDiagnostics> {
    Some(StageDiagnostics {
        duration: start.elapsed(),
        metrics,
    })
}

/// Placeholder for a mandatory stage that somehow recorded nothing.
fn missing(metrics: StageMetrics) -> StageDiagnostics {
    StageDiagnostics {
        duration: std::time::Duration::ZERO,
        metrics,
    }
}

// ───────────────────────── Stage 0: Pending ──────────────────────────

/// Pipeline state before any processing has occurred.
///
/// Call [`preprocess`](Self::preprocess) to advance.
#[must_use = "pipeline stages are consumed by advancing — call .preprocess() to continue"]
pub struct Pending {
    config: CompareConfig,
    cancel: Option<CancelFlag>,
    baseline: RgbaImage,
    current: RgbaImage,
}

impl Pending {
    /// The configuration this comparison will use.
    #[must_use]
    pub const fn config(&self) -> &CompareConfig {
        &self.config
    }

    /// Let `cancel` cut feature detection and estimation short.
    ///
    /// A cancelled pipeline still advances, but with truncated keypoint
    /// sets or no homography; check the flag between stages to stop.
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Validate the config and bound both images to
    /// `config.max_dimension`, advancing to [`Preprocessed`].
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] for an unusable config and
    /// [`PipelineError::InvalidDimensions`] if either image is empty.
    pub fn preprocess(self) -> Result<Preprocessed, PipelineError> {
        self.config.validate()?;
        let mut trace = Trace::new(self.cancel.unwrap_or_default());
        let start = Instant::now();

        let max = self.config.max_dimension;
        let filter = self.config.downsample_filter;
        let (baseline, baseline_downsampled) = crate::downsample::bound(self.baseline, max, filter)?;
        let (current, current_downsampled) = crate::downsample::bound(self.current, max, filter)?;
        let gray_baseline = crate::grayscale::luma(&baseline);
        let gray_current = crate::grayscale::luma(&current);

        trace.preprocess = stage(
            start,
            StageMetrics::Preprocess {
                baseline_width: baseline.width(),
                baseline_height: baseline.height(),
                current_width: current.width(),
                current_height: current.height(),
                baseline_downsampled,
                current_downsampled,
            },
        );
        Ok(Preprocessed {
            config: self.config,
            trace,
            baseline,
            current,
            gray_baseline,
            gray_current,
        })
    }
}

// ──────────────────────── Stage 1: Preprocessed ──────────────────────

/// Both images bounded and converted to luma.
#[must_use = "pipeline stages are consumed by advancing — call .detect_features() to continue"]
pub struct Preprocessed {
    config: CompareConfig,
    trace: Trace,
    baseline: RgbaImage,
    current: RgbaImage,
    gray_baseline: GrayImage,
    gray_current: GrayImage,
}

impl Preprocessed {
    /// The bounded baseline image.
    #[must_use]
    pub const fn baseline(&self) -> &RgbaImage {
        &self.baseline
    }

    /// The bounded current image.
    #[must_use]
    pub const fn current(&self) -> &RgbaImage {
        &self.current
    }

    /// Luma of the bounded baseline.
    #[must_use]
    pub const fn gray_baseline(&self) -> &GrayImage {
        &self.gray_baseline
    }

    /// Luma of the bounded current image.
    #[must_use]
    pub const fn gray_current(&self) -> &GrayImage {
        &self.gray_current
    }

    /// Detect keypoints in both images with the configured strategy.
    ///
    /// With [`FeatureMatcherKind::Disabled`] nothing is detected and no
    /// diagnostics are recorded for this stage.
    pub fn detect_features(self) -> FeaturesDetected {
        let mut trace = self.trace;
        let matcher = self.config.feature_matcher;
        let (baseline_keypoints, current_keypoints) = if matcher == FeatureMatcherKind::Disabled {
            (KeypointSet::empty(), KeypointSet::empty())
        } else {
            let start = Instant::now();
            let b = matcher.detect(&self.gray_baseline, &self.config, &trace.cancel);
            let c = matcher.detect(&self.gray_current, &self.config, &trace.cancel);
            trace.feature_detection = stage(
                start,
                StageMetrics::FeatureDetection {
                    matcher,
                    baseline_keypoints: b.len(),
                    current_keypoints: c.len(),
                },
            );
            tracing::debug!(
                %matcher,
                baseline = b.len(),
                current = c.len(),
                "keypoints detected"
            );
            (b, c)
        };
        FeaturesDetected {
            config: self.config,
            trace,
            baseline: self.baseline,
            current: self.current,
            baseline_keypoints,
            current_keypoints,
        }
    }
}

// ─────────────────────── Stage 2: FeaturesDetected ───────────────────

/// Keypoints and descriptors for both images.
#[must_use = "pipeline stages are consumed by advancing — call .match_features() to continue"]
pub struct FeaturesDetected {
    config: CompareConfig,
    trace: Trace,
    baseline: RgbaImage,
    current: RgbaImage,
    baseline_keypoints: KeypointSet,
    current_keypoints: KeypointSet,
}

impl FeaturesDetected {
    /// Keypoints found in the baseline.
    #[must_use]
    pub const fn baseline_keypoints(&self) -> &KeypointSet {
        &self.baseline_keypoints
    }

    /// Keypoints found in the current image.
    #[must_use]
    pub const fn current_keypoints(&self) -> &KeypointSet {
        &self.current_keypoints
    }

    /// Match current descriptors against baseline descriptors.
    pub fn match_features(self) -> Matched {
        let mut trace = self.trace;
        let matcher = self.config.feature_matcher;
        let (matches, fallback) = if matcher == FeatureMatcherKind::Disabled {
            (Vec::new(), Some(FallbackReason::MatchingDisabled))
        } else {
            let start = Instant::now();
            let result = matcher.match_sets(
                &self.current_keypoints,
                &self.baseline_keypoints,
                self.config.match_ratio,
            );
            match result {
                Ok(matches) => {
                    trace.matching = stage(
                        start,
                        StageMetrics::Matching {
                            ratio: self.config.match_ratio,
                            match_count: matches.len(),
                        },
                    );
                    (matches, None)
                }
                Err(PipelineError::InsufficientFeatures { baseline, current }) => {
                    tracing::warn!(baseline, current, "not enough features to match");
                    (
                        Vec::new(),
                        Some(FallbackReason::InsufficientFeatures { baseline, current }),
                    )
                }
                Err(e) => {
                    tracing::warn!(error = %e, "matching failed");
                    (Vec::new(), Some(FallbackReason::DegenerateHomography))
                }
            }
        };
        Matched {
            config: self.config,
            trace,
            baseline: self.baseline,
            current: self.current,
            baseline_keypoints: self.baseline_keypoints,
            current_keypoints: self.current_keypoints,
            matches,
            fallback,
        }
    }
}

// ───────────────────────── Stage 3: Matched ──────────────────────────

/// Ratio-filtered matches between the two keypoint sets.
#[must_use = "pipeline stages are consumed by advancing — call .estimate() to continue"]
pub struct Matched {
    config: CompareConfig,
    trace: Trace,
    baseline: RgbaImage,
    current: RgbaImage,
    baseline_keypoints: KeypointSet,
    current_keypoints: KeypointSet,
    matches: Vec<MatchPair>,
    fallback: Option<FallbackReason>,
}

impl Matched {
    /// Matches that survived the ratio test.
    #[must_use]
    pub fn matches(&self) -> &[MatchPair] {
        &self.matches
    }

    /// Why no matching was possible, if it was not.
    #[must_use]
    pub const fn fallback_reason(&self) -> Option<&FallbackReason> {
        self.fallback.as_ref()
    }

    /// Point correspondences (current → baseline) for the matches.
    #[must_use]
    pub fn correspondences(&self) -> Vec<Correspondence> {
        let current = self.current_keypoints.keypoints();
        let baseline = self.baseline_keypoints.keypoints();
        self.matches
            .iter()
            .filter_map(|m| {
                Some(Correspondence::new(
                    current.get(m.query)?.point(),
                    baseline.get(m.train)?.point(),
                ))
            })
            .collect()
    }

    /// Fit a homography to the matches, unless matching already failed.
    pub fn estimate(self) -> Estimated {
        let correspondences = self.correspondences();
        let mut trace = self.trace;
        let match_count = self.matches.len();
        let (homography, inlier_count, fallback) = if let Some(reason) = self.fallback.clone() {
            (None, 0, Some(reason))
        } else {
            let start = Instant::now();
            let params = RansacParams {
                min_matches: self.config.min_matches,
                threshold: self.config.ransac_threshold,
                iterations: self.config.ransac_iterations,
                seed: self.config.ransac_seed,
            };
            let result = crate::homography::estimate(&correspondences, &params, &trace.cancel);
            let (homography, inliers, iterations, fallback) = match result {
                Ok(estimate) => (
                    Some(estimate.homography),
                    estimate.inliers.len(),
                    estimate.iterations,
                    None,
                ),
                Err(reason) => {
                    tracing::warn!(%reason, matches = match_count, "no usable homography");
                    (None, 0, 0, Some(reason))
                }
            };
            trace.estimation = stage(
                start,
                StageMetrics::Estimation {
                    accepted: homography.is_some(),
                    inlier_count: inliers,
                    iterations,
                },
            );
            (homography, inliers, fallback)
        };
        Estimated {
            trace,
            config: self.config,
            baseline: self.baseline,
            current: self.current,
            homography,
            match_count,
            inlier_count,
            fallback,
        }
    }
}

// ──────────────────────── Stage 4: Estimated ─────────────────────────

/// A homography, or the reason there is none.
#[must_use = "pipeline stages are consumed by advancing — call .align() to continue"]
pub struct Estimated {
    config: CompareConfig,
    trace: Trace,
    baseline: RgbaImage,
    current: RgbaImage,
    homography: Option<Homography>,
    match_count: usize,
    inlier_count: usize,
    fallback: Option<FallbackReason>,
}

impl Estimated {
    /// The accepted homography (current → baseline), if any.
    #[must_use]
    pub const fn homography(&self) -> Option<&Homography> {
        self.homography.as_ref()
    }

    /// Why there is no homography, if there is none.
    #[must_use]
    pub const fn fallback_reason(&self) -> Option<&FallbackReason> {
        self.fallback.as_ref()
    }

    /// Inliers supporting the homography.
    #[must_use]
    pub const fn inlier_count(&self) -> usize {
        self.inlier_count
    }

    /// Warp (or resize) the current image into the baseline frame.
    pub fn align(self) -> Aligned {
        let mut trace = self.trace;
        let start = Instant::now();
        let target = Dimensions::of(&self.baseline);
        let (aligned, used_fallback) =
            crate::align::align(&self.current, self.homography.as_ref(), target);
        trace.alignment = stage(
            start,
            StageMetrics::Alignment {
                width: aligned.width(),
                height: aligned.height(),
                used_fallback,
            },
        );
        Aligned {
            config: self.config,
            trace,
            baseline: self.baseline,
            aligned,
            used_fallback,
            homography: self.homography,
            match_count: self.match_count,
            inlier_count: self.inlier_count,
            fallback: self.fallback,
        }
    }
}

// ───────────────────────── Stage 5: Aligned ──────────────────────────

/// The current image in the baseline frame.
#[must_use = "pipeline stages are consumed by advancing — call .diff() to continue"]
pub struct Aligned {
    config: CompareConfig,
    trace: Trace,
    baseline: RgbaImage,
    aligned: RgbaImage,
    used_fallback: bool,
    homography: Option<Homography>,
    match_count: usize,
    inlier_count: usize,
    fallback: Option<FallbackReason>,
}

impl Aligned {
    /// The aligned current image.
    #[must_use]
    pub const fn aligned(&self) -> &RgbaImage {
        &self.aligned
    }

    /// Whether the resize fallback was used.
    #[must_use]
    pub const fn used_fallback(&self) -> bool {
        self.used_fallback
    }

    /// Compute the change mask.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidDimensions`] if the aligned image
    /// does not match the baseline, which alignment never produces.
    pub fn diff(self) -> Result<Diffed, PipelineError> {
        let mut trace = self.trace;
        let start = Instant::now();
        let change = crate::diff::diff(&self.baseline, &self.aligned, self.used_fallback, &self.config)?;
        trace.diff = stage(
            start,
            StageMetrics::Diff {
                crop: change.crop,
                raw_changed_pixels: change.raw_changed_pixels,
                changed_pixels: change.changed_pixels,
                regions_kept: change.regions_kept,
                regions_dropped: change.regions_dropped,
            },
        );
        Ok(Diffed {
            config: self.config,
            trace,
            baseline: self.baseline,
            change,
            used_fallback: self.used_fallback,
            homography: self.homography,
            match_count: self.match_count,
            inlier_count: self.inlier_count,
            fallback: self.fallback,
        })
    }
}

// ───────────────────────── Stage 6: Diffed ───────────────────────────

/// The binary change mask and comparison crop.
#[must_use = "pipeline stages are consumed by advancing — call .highlight() to continue"]
pub struct Diffed {
    config: CompareConfig,
    trace: Trace,
    baseline: RgbaImage,
    change: ChangeMask,
    used_fallback: bool,
    homography: Option<Homography>,
    match_count: usize,
    inlier_count: usize,
    fallback: Option<FallbackReason>,
}

impl Diffed {
    /// The change mask with its crop and statistics.
    #[must_use]
    pub const fn change(&self) -> &ChangeMask {
        &self.change
    }

    /// Paint the change onto the cropped baseline.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidDimensions`] if the mask does not
    /// match its crop, which the diff stage never produces.
    pub fn highlight(self) -> Result<Highlighted, PipelineError> {
        let start = Instant::now();
        let image = crate::highlight::highlight(
            &self.baseline,
            self.change.crop,
            &self.change.mask,
            self.config.highlight_color,
        )?;
        let highlight = StageDiagnostics {
            duration: start.elapsed(),
            metrics: StageMetrics::Highlight {
                width: image.width(),
                height: image.height(),
                painted_pixels: self.change.changed_pixels,
            },
        };

        let trace = self.trace;
        let baseline_dims = Dimensions::of(&self.baseline);
        let diagnostics = PipelineDiagnostics {
            preprocess: trace.preprocess.unwrap_or_else(|| {
                missing(StageMetrics::Preprocess {
                    baseline_width: baseline_dims.width,
                    baseline_height: baseline_dims.height,
                    current_width: 0,
                    current_height: 0,
                    baseline_downsampled: false,
                    current_downsampled: false,
                })
            }),
            feature_detection: trace.feature_detection,
            matching: trace.matching,
            estimation: trace.estimation,
            alignment: trace.alignment.unwrap_or_else(|| {
                missing(StageMetrics::Alignment {
                    width: baseline_dims.width,
                    height: baseline_dims.height,
                    used_fallback: self.used_fallback,
                })
            }),
            diff: trace.diff.unwrap_or_else(|| {
                missing(StageMetrics::Diff {
                    crop: self.change.crop,
                    raw_changed_pixels: self.change.raw_changed_pixels,
                    changed_pixels: self.change.changed_pixels,
                    regions_kept: self.change.regions_kept,
                    regions_dropped: self.change.regions_dropped,
                })
            }),
            highlight,
            total_duration: trace.started.elapsed(),
            summary: PipelineSummary {
                image_width: baseline_dims.width,
                image_height: baseline_dims.height,
                match_count: self.match_count,
                inlier_count: self.inlier_count,
                used_fallback: self.used_fallback,
                changed_pixels: self.change.changed_pixels,
            },
        };

        tracing::info!(
            used_fallback = self.used_fallback,
            changed_pixels = self.change.changed_pixels,
            matches = self.match_count,
            inliers = self.inlier_count,
            "comparison finished"
        );

        Ok(Highlighted {
            image,
            report: CompareReport {
                used_fallback: self.used_fallback,
                fallback_reason: self.fallback,
                homography: self.homography,
                match_count: self.match_count,
                inlier_count: self.inlier_count,
                crop: self.change.crop,
                changed_pixels: self.change.changed_pixels,
                diagnostics,
            },
        })
    }
}

// ──────────────────────── Stage 7: Highlighted ───────────────────────

/// Final stage: the highlighted crop and its report.
#[must_use = "call .into_outcome() to take the result"]
pub struct Highlighted {
    image: RgbaImage,
    report: CompareReport,
}

impl Highlighted {
    /// The highlighted image.
    #[must_use]
    pub const fn image(&self) -> &RgbaImage {
        &self.image
    }

    /// The comparison crop.
    #[must_use]
    pub const fn crop(&self) -> Rect {
        self.report.crop
    }

    /// The report accompanying the image.
    #[must_use]
    pub const fn report(&self) -> &CompareReport {
        &self.report
    }

    /// Consume the pipeline and return the outcome.
    #[must_use]
    pub fn into_outcome(self) -> CompareOutcome {
        CompareOutcome {
            image: self.image,
            report: self.report,
        }
    }
}

// ───────────────────── Pipeline entry point ──────────────────────────

/// Incremental comparison pipeline.
///
/// Created via [`Pipeline::new`], which stores the images and config
/// without doing any processing. Each stage method consumes the current
/// state and returns the next, making it a compile-time error to skip
/// stages or call them out of order.
pub struct Pipeline;

impl Pipeline {
    /// Create a new pipeline from the baseline and current images.
    #[allow(clippy::new_ret_no_self)]
    pub const fn new(baseline: RgbaImage, current: RgbaImage, config: CompareConfig) -> Pending {
        Pending {
            config,
            cancel: None,
            baseline,
            current,
        }
    }
}
