//! Oriented normalized intensity patches.
//!
//! Uses the same pyramid keypoints as [`orb`](super::orb) but describes
//! each one with an 8×8 grid of intensities sampled in the keypoint's
//! rotated frame, shifted to zero mean and scaled to unit length. The
//! float descriptors are matched with Euclidean distance, which is more
//! forgiving of lighting changes between visits than binary tests.

use image::GrayImage;

use super::orb::{OrientedCorner, detect_levels};
use super::{Keypoint, KeypointSet};
use crate::cancel::CancelFlag;
use crate::types::CompareConfig;

/// Samples per side of the descriptor grid.
pub const GRID: usize = 8;

/// Distance between neighboring grid samples, in level pixels.
const SPACING: f32 = 3.0;

/// Detect keypoints and describe them with oriented patches.
#[must_use = "returns the detected keypoints"]
pub fn detect(gray: &GrayImage, config: &CompareConfig, cancel: &CancelFlag) -> KeypointSet {
    let mut features: Vec<(Keypoint, Vec<f32>)> = detect_levels(gray, config, cancel)
        .iter()
        .flat_map(|level| {
            level
                .corners
                .iter()
                .map(|c| (level.keypoint(c), describe(&level.smoothed, c)))
        })
        .collect();

    features.sort_by(|a, b| b.0.response.total_cmp(&a.0.response));
    features.truncate(config.max_keypoints);
    tracing::debug!(keypoints = features.len(), "patch detection finished");
    KeypointSet::float(features)
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss
)]
fn describe(smoothed: &GrayImage, corner: &OrientedCorner) -> Vec<f32> {
    let (sin, cos) = corner.angle.sin_cos();
    let (w, h) = (smoothed.width() as i32, smoothed.height() as i32);
    let half = (GRID as f32 - 1.0) / 2.0;

    let mut values = Vec::with_capacity(GRID * GRID);
    for gy in 0..GRID {
        for gx in 0..GRID {
            let u = (gx as f32 - half) * SPACING;
            let v = (gy as f32 - half) * SPACING;
            let sx = (corner.x as f32 + u.mul_add(cos, -(v * sin))).round() as i32;
            let sy = (corner.y as f32 + u.mul_add(sin, v * cos)).round() as i32;
            let pixel = smoothed.get_pixel(
                sx.clamp(0, w - 1).unsigned_abs(),
                sy.clamp(0, h - 1).unsigned_abs(),
            );
            values.push(f32::from(pixel.0[0]));
        }
    }
    normalize(&mut values);
    values
}

/// Shift to zero mean and scale to unit length. Flat patches become all
/// zeros.
#[allow(clippy::cast_precision_loss)]
fn normalize(values: &mut [f32]) {
    let mean = values.iter().sum::<f32>() / values.len() as f32;
    for v in values.iter_mut() {
        *v -= mean;
    }
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in values.iter_mut() {
            *v /= norm;
        }
    }
}
