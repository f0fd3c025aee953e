//! Keypoint detection, description and matching.
//!
//! This module defines the [`FeatureMatcher`] trait for pluggable
//! detector/descriptor/matcher combinations and the [`FeatureMatcherKind`]
//! enum for selecting one at runtime.
//!
//! # Strategy pattern
//!
//! Every strategy produces a [`KeypointSet`] per image and pairs two sets
//! with an exact k=2 nearest-neighbor search followed by a distance ratio
//! test. Only the descriptor (and therefore the distance metric) differs:
//!
//! - [`Orb`](FeatureMatcherKind::Orb): rotated BRIEF bits, Hamming distance.
//! - [`Patch`](FeatureMatcherKind::Patch): oriented normalized intensity
//!   patches, L2 distance.
//! - [`Disabled`](FeatureMatcherKind::Disabled): no features at all; the
//!   comparison goes straight to the resize fallback.

pub mod orb;
pub mod patch;

use std::fmt;

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelFlag;
use crate::types::{CompareConfig, PipelineError, Point};

/// A detected keypoint in base-image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    /// Horizontal position in the full-resolution grayscale image.
    pub x: f32,
    /// Vertical position in the full-resolution grayscale image.
    pub y: f32,
    /// Harris corner response; larger is stronger.
    pub response: f32,
    /// Dominant orientation in radians.
    pub angle: f32,
    /// Pyramid level the keypoint was found on.
    pub octave: u8,
}

impl Keypoint {
    /// Position as a double-precision point for geometric fitting.
    #[must_use]
    pub fn point(&self) -> Point {
        Point::new(f64::from(self.x), f64::from(self.y))
    }
}

/// 256-bit binary descriptor.
pub type BinaryDescriptor = [u8; 32];

/// Descriptors for every keypoint in a set, all of one kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Descriptors {
    /// Binary descriptors compared with Hamming distance.
    Binary(Vec<BinaryDescriptor>),
    /// Floating-point descriptors compared with Euclidean distance.
    Float(Vec<Vec<f32>>),
}

impl Descriptors {
    /// Number of descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Binary(d) => d.len(),
            Self::Float(d) => d.len(),
        }
    }

    /// Whether there are no descriptors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keypoints for one image with their descriptors, index-aligned.
///
/// Immutable once built; the constructors guarantee that `keypoints()[i]`
/// is described by descriptor `i`.
#[derive(Debug, Clone, PartialEq)]
pub struct KeypointSet {
    keypoints: Vec<Keypoint>,
    descriptors: Descriptors,
}

impl KeypointSet {
    /// A set with no keypoints.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            keypoints: Vec::new(),
            descriptors: Descriptors::Binary(Vec::new()),
        }
    }

    /// Build a binary-descriptor set from keypoint/descriptor pairs.
    #[must_use]
    pub fn binary(features: Vec<(Keypoint, BinaryDescriptor)>) -> Self {
        let (keypoints, descriptors) = features.into_iter().unzip();
        Self {
            keypoints,
            descriptors: Descriptors::Binary(descriptors),
        }
    }

    /// Build a float-descriptor set from keypoint/descriptor pairs.
    #[must_use]
    pub fn float(features: Vec<(Keypoint, Vec<f32>)>) -> Self {
        let (keypoints, descriptors) = features.into_iter().unzip();
        Self {
            keypoints,
            descriptors: Descriptors::Float(descriptors),
        }
    }

    /// The keypoints, strongest first.
    #[must_use]
    pub fn keypoints(&self) -> &[Keypoint] {
        &self.keypoints
    }

    /// The descriptors, index-aligned with [`keypoints`](Self::keypoints).
    #[must_use]
    pub const fn descriptors(&self) -> &Descriptors {
        &self.descriptors
    }

    /// Number of keypoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    /// Whether the set has no keypoints.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// A ratio-test survivor: `query` indexes the current image's set and
/// `train` indexes the baseline set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchPair {
    /// Index into the current image's keypoints.
    pub query: usize,
    /// Index into the baseline image's keypoints.
    pub train: usize,
    /// Distance to the nearest baseline descriptor.
    pub best: f32,
    /// Distance to the second-nearest baseline descriptor.
    pub second_best: f32,
}

/// Selects which detector/matcher strategy to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureMatcherKind {
    /// FAST + Harris on a pyramid, rotated BRIEF, Hamming matching.
    #[default]
    Orb,
    /// Same keypoints as ORB, oriented normalized patches, L2 matching.
    Patch,
    /// No alignment: compare the resized current image directly.
    Disabled,
}

impl fmt::Display for FeatureMatcherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Orb => f.write_str("ORB"),
            Self::Patch => f.write_str("Patch"),
            Self::Disabled => f.write_str("Disabled"),
        }
    }
}

/// Trait for detector/matcher strategies.
pub trait FeatureMatcher {
    /// Detect and describe up to `config.max_keypoints` keypoints,
    /// strongest first. A raised `cancel` may cut detection short.
    fn detect(&self, gray: &GrayImage, config: &CompareConfig, cancel: &CancelFlag)
        -> KeypointSet;

    /// Match the current image's set against the baseline set.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InsufficientFeatures`] if either set is
    /// empty, in which case no search is attempted.
    fn match_sets(
        &self,
        current: &KeypointSet,
        baseline: &KeypointSet,
        ratio: f32,
    ) -> Result<Vec<MatchPair>, PipelineError> {
        if current.is_empty() || baseline.is_empty() {
            return Err(PipelineError::InsufficientFeatures {
                baseline: baseline.len(),
                current: current.len(),
            });
        }
        Ok(ratio_match(current.descriptors(), baseline.descriptors(), ratio))
    }
}

impl FeatureMatcher for FeatureMatcherKind {
    fn detect(
        &self,
        gray: &GrayImage,
        config: &CompareConfig,
        cancel: &CancelFlag,
    ) -> KeypointSet {
        match *self {
            Self::Orb => orb::detect(gray, config, cancel),
            Self::Patch => patch::detect(gray, config, cancel),
            Self::Disabled => KeypointSet::empty(),
        }
    }
}

/// Hamming distance between two binary descriptors.
#[must_use]
pub fn hamming(a: &BinaryDescriptor, b: &BinaryDescriptor) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Euclidean distance between two float descriptors.
#[must_use]
pub fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Exact k=2 brute-force search with Lowe's ratio test.
///
/// For every query descriptor, finds the two nearest train descriptors
/// and keeps the pair only if `best < ratio * second_best`. Queries with
/// fewer than two candidates are discarded, as are sets whose descriptor
/// kinds differ.
#[must_use = "returns the ratio-filtered matches"]
pub fn ratio_match(query: &Descriptors, train: &Descriptors, ratio: f32) -> Vec<MatchPair> {
    match (query, train) {
        (Descriptors::Binary(q), Descriptors::Binary(t)) => {
            #[allow(clippy::cast_precision_loss)]
            knn2_ratio(q, t, ratio, |a, b| hamming(a, b) as f32)
        }
        (Descriptors::Float(q), Descriptors::Float(t)) => {
            knn2_ratio(q, t, ratio, |a, b| euclidean(a, b))
        }
        _ => Vec::new(),
    }
}

fn knn2_ratio<D>(
    query: &[D],
    train: &[D],
    ratio: f32,
    distance: impl Fn(&D, &D) -> f32,
) -> Vec<MatchPair> {
    if train.len() < 2 {
        return Vec::new();
    }

    query
        .iter()
        .enumerate()
        .filter_map(|(qi, q)| {
            let mut best = (usize::MAX, f32::INFINITY);
            let mut second = f32::INFINITY;
            for (ti, t) in train.iter().enumerate() {
                let d = distance(q, t);
                if d < best.1 {
                    second = best.1;
                    best = (ti, d);
                } else if d < second {
                    second = d;
                }
            }
            (best.1 < ratio * second).then_some(MatchPair {
                query: qi,
                train: best.0,
                best: best.1,
                second_best: second,
            })
        })
        .collect()
}
