//! Message protocol between a comparison's orchestrator and the
//! execution context that runs the heavy stages.
//!
//! Both the native worker thread in `crackdiff-io` and the WASM web
//! worker call [`handle_request`]; only the transport differs. A request
//! carries the two decoded images by value, so sending it moves the pixel
//! buffers rather than copying them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cancel::CancelFlag;
use crate::pipeline::Pipeline;
use crate::types::{CompareConfig, CompareOutcome, PipelineError, RgbaImage};

/// Coarse progress reported while a request runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Preprocessing, feature detection, matching and estimation.
    Matching,
    /// Warping or resizing the current image.
    Aligning,
    /// Change mask and highlight.
    Diffing,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Self; 3] = [Self::Matching, Self::Aligning, Self::Diffing];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Matching => f.write_str("Matching"),
            Self::Aligning => f.write_str("Aligning"),
            Self::Diffing => f.write_str("Diffing"),
        }
    }
}

/// A unit of work for a worker.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    /// Caller-assigned id, echoed in every reply.
    pub id: u64,
    /// The reference image; defines the output frame.
    pub baseline: RgbaImage,
    /// The image to align onto the baseline.
    pub current: RgbaImage,
    /// Tuning for this comparison.
    pub config: CompareConfig,
    /// Raised by the orchestrator to stop the request early.
    pub cancel: CancelFlag,
}

/// A message from the worker back to the orchestrator.
///
/// Any number of `Progress` messages precede exactly one of `Done` or
/// `Failed`.
#[derive(Debug)]
pub enum WorkerReply {
    /// The request entered a new phase.
    Progress {
        /// The request id.
        id: u64,
        /// The phase just entered.
        phase: Phase,
    },
    /// The comparison finished.
    Done {
        /// The request id.
        id: u64,
        /// Highlighted image and report.
        outcome: Box<CompareOutcome>,
    },
    /// The comparison could not be completed.
    Failed {
        /// The request id.
        id: u64,
        /// What went wrong.
        error: PipelineError,
    },
}

impl WorkerReply {
    /// The id of the request this reply belongs to.
    #[must_use]
    pub const fn id(&self) -> u64 {
        match self {
            Self::Progress { id, .. } | Self::Done { id, .. } | Self::Failed { id, .. } => *id,
        }
    }

    /// Whether this is the last reply for its request.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }
}

/// Run every stage for `request`, calling `progress` as each phase starts.
///
/// `cancel` is checked between stages; detection and estimation also
/// poll it internally.
///
/// # Errors
///
/// Returns the first [`PipelineError`] any stage produces, or
/// [`PipelineError::Cancelled`] once `cancel` is raised. Missing
/// features or matches are not errors; they yield a fallback outcome.
pub fn run(
    baseline: RgbaImage,
    current: RgbaImage,
    config: CompareConfig,
    cancel: &CancelFlag,
    mut progress: impl FnMut(Phase),
) -> Result<CompareOutcome, PipelineError> {
    cancel.check()?;
    progress(Phase::Matching);
    let preprocessed = Pipeline::new(baseline, current, config)
        .with_cancel(cancel.clone())
        .preprocess()?;
    cancel.check()?;
    let detected = preprocessed.detect_features();
    cancel.check()?;
    let estimated = detected.match_features().estimate();
    cancel.check()?;

    progress(Phase::Aligning);
    let aligned = estimated.align();
    cancel.check()?;

    progress(Phase::Diffing);
    let diffed = aligned.diff()?;
    cancel.check()?;
    Ok(diffed.highlight()?.into_outcome())
}

/// Handle one request, emitting every reply through `send`.
///
/// The last reply sent is always terminal.
pub fn handle_request(request: WorkerRequest, mut send: impl FnMut(WorkerReply)) {
    let WorkerRequest {
        id,
        baseline,
        current,
        config,
        cancel,
    } = request;
    tracing::debug!(
        id,
        baseline = ?baseline.dimensions(),
        current = ?current.dimensions(),
        "worker request received"
    );
    let result = run(baseline, current, config, &cancel, |phase| {
        send(WorkerReply::Progress { id, phase });
    });
    match result {
        Ok(outcome) => send(WorkerReply::Done {
            id,
            outcome: Box::new(outcome),
        }),
        Err(error) => {
            if matches!(error, PipelineError::Cancelled) {
                tracing::debug!(id, "worker request cancelled");
            } else {
                tracing::warn!(id, %error, "worker request failed");
            }
            send(WorkerReply::Failed { id, error });
        }
    }
}

/// Rebuild an RGBA image from a raw row-major buffer, as received over a
/// transport that carries plain bytes.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidDimensions`] if either dimension is
/// zero or `pixels.len() != width * height * 4`.
pub fn image_from_raw(width: u32, height: u32, pixels: Vec<u8>) -> Result<RgbaImage, PipelineError> {
    let expected = u64::from(width) * u64::from(height) * 4;
    if width == 0 || height == 0 || u64::try_from(pixels.len()).ok() != Some(expected) {
        return Err(PipelineError::InvalidDimensions { width, height });
    }
    RgbaImage::from_raw(width, height, pixels)
        .ok_or(PipelineError::InvalidDimensions { width, height })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use image::Rgba;

    use super::*;
    use crate::features::FeatureMatcherKind;

    fn request(id: u64, baseline: RgbaImage, current: RgbaImage) -> WorkerRequest {
        WorkerRequest {
            id,
            baseline,
            current,
            config: CompareConfig {
                feature_matcher: FeatureMatcherKind::Disabled,
                ..CompareConfig::default()
            },
            cancel: CancelFlag::new(),
        }
    }

    #[test]
    fn replies_in_phase_order_then_done() {
        let img = RgbaImage::from_pixel(32, 24, Rgba([80, 80, 80, 255]));
        let mut replies = Vec::new();
        handle_request(request(7, img.clone(), img), |r| replies.push(r));

        assert_eq!(replies.len(), 4);
        let phases: Vec<Phase> = replies
            .iter()
            .filter_map(|r| match r {
                WorkerReply::Progress { phase, .. } => Some(*phase),
                _ => None,
            })
            .collect();
        assert_eq!(phases, Phase::ALL);
        assert!(replies.iter().all(|r| r.id() == 7));
        assert!(replies.last().unwrap().is_terminal());
        assert!(matches!(replies.last(), Some(WorkerReply::Done { .. })));
    }

    #[test]
    fn empty_image_fails_after_first_phase() {
        let mut replies = Vec::new();
        handle_request(
            request(3, RgbaImage::new(0, 0), RgbaImage::new(4, 4)),
            |r| replies.push(r),
        );
        assert_eq!(replies.len(), 2);
        assert!(matches!(
            replies[1],
            WorkerReply::Failed {
                id: 3,
                error: PipelineError::InvalidDimensions { .. }
            }
        ));
    }

    #[test]
    fn cancelled_request_fails_without_progress() {
        let img = RgbaImage::from_pixel(32, 24, Rgba([80, 80, 80, 255]));
        let req = request(5, img.clone(), img);
        req.cancel.cancel();
        let mut replies = Vec::new();
        handle_request(req, |r| replies.push(r));
        assert_eq!(replies.len(), 1);
        assert!(matches!(
            replies[0],
            WorkerReply::Failed {
                id: 5,
                error: PipelineError::Cancelled
            }
        ));
    }

    #[test]
    fn cancelling_mid_run_stops_before_the_next_phase() {
        let img = RgbaImage::from_pixel(32, 24, Rgba([80, 80, 80, 255]));
        let cancel = CancelFlag::new();
        let mut phases = Vec::new();
        let result = run(
            img.clone(),
            img,
            CompareConfig::default(),
            &cancel,
            |phase| {
                phases.push(phase);
                cancel.cancel();
            },
        );
        assert!(matches!(result, Err(PipelineError::Cancelled)));
        assert_eq!(phases, [Phase::Matching]);
    }

    #[test]
    fn raw_buffer_round_trip() {
        let img = image_from_raw(2, 1, vec![1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(img.get_pixel(1, 0).0, [5, 6, 7, 8]);
    }

    #[test]
    fn raw_buffer_length_mismatch_is_rejected() {
        assert!(matches!(
            image_from_raw(2, 2, vec![0; 15]),
            Err(PipelineError::InvalidDimensions {
                width: 2,
                height: 2
            })
        ));
        assert!(image_from_raw(0, 2, Vec::new()).is_err());
    }

    #[test]
    fn phase_display() {
        assert_eq!(Phase::Aligning.to_string(), "Aligning");
    }
}
