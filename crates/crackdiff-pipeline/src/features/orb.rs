//! Oriented FAST and rotated BRIEF.
//!
//! Keypoints are FAST-9 corners found on every level of a scale pyramid,
//! thinned by non-maximum suppression, ranked by Harris response and
//! given an orientation from the intensity centroid of a circular patch.
//! Each keypoint is described by 256 pairwise intensity comparisons on a
//! smoothed copy of its level, with the sampling pattern rotated to the
//! keypoint's orientation so the descriptor tolerates camera roll.
//!
//! The sampling pattern and its 30 pre-rotated variants are generated
//! once per process from a fixed seed (see [`warm_tables`]).

use std::f32::consts::TAU;
use std::sync::OnceLock;

use image::GrayImage;
use image::imageops::FilterType;
use imageproc::corners::{Corner, corners_fast9};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{BinaryDescriptor, Keypoint, KeypointSet};
use crate::blur::gaussian_blur;
use crate::cancel::CancelFlag;
use crate::types::CompareConfig;

/// Radius of the circular patch used for orientation.
pub const PATCH_RADIUS: i32 = 15;

/// Keypoints closer than this to a level's border are discarded, leaving
/// room for the orientation patch and the Harris window.
pub const EDGE_THRESHOLD: u32 = 19;

/// Number of discrete orientations the sampling pattern is rotated to.
pub const ANGLE_BINS: usize = 30;

/// Number of binary tests (bits) per descriptor.
const TESTS: usize = 256;

/// Sampling offsets stay within this many pixels of the keypoint before
/// rotation.
const PATTERN_EXTENT: i32 = 13;

const PATTERN_SEED: u64 = 0x0b12_1ef0;
const HARRIS_K: f32 = 0.04;
const HARRIS_HALF_WINDOW: i32 = 3;
const NMS_RADIUS: u32 = 3;
const DESCRIPTOR_SIGMA: f32 = 2.0;

/// One binary test: compare the pixel at `(dx1, dy1)` against `(dx2, dy2)`.
type TestPair = [i8; 4];

struct SamplingTables {
    rotated: Vec<[TestPair; TESTS]>,
}

static TABLES: OnceLock<SamplingTables> = OnceLock::new();

impl SamplingTables {
    fn build() -> Self {
        let base = base_pattern();
        let rotated = (0..ANGLE_BINS)
            .map(|bin| {
                #[allow(clippy::cast_precision_loss)]
                let theta = bin as f32 * TAU / ANGLE_BINS as f32;
                let (sin, cos) = theta.sin_cos();
                let mut table = [[0i8; 4]; TESTS];
                for (dst, src) in table.iter_mut().zip(&base) {
                    let (x1, y1) = rotate(src[0], src[1], sin, cos);
                    let (x2, y2) = rotate(src[2], src[3], sin, cos);
                    *dst = [x1, y1, x2, y2];
                }
                table
            })
            .collect();
        tracing::debug!(bins = ANGLE_BINS, tests = TESTS, "built BRIEF sampling tables");
        Self { rotated }
    }
}

fn tables() -> &'static SamplingTables {
    TABLES.get_or_init(SamplingTables::build)
}

/// Build the descriptor sampling tables if they have not been built yet.
///
/// Returns the number of rotated patterns available. Calling this ahead
/// of the first comparison moves the one-time cost out of the hot path.
pub fn warm_tables() -> usize {
    tables().rotated.len()
}

#[allow(clippy::cast_possible_truncation)]
fn rotate(dx: i8, dy: i8, sin: f32, cos: f32) -> (i8, i8) {
    let (x, y) = (f32::from(dx), f32::from(dy));
    // |offset| <= 13 * sqrt(2), always within i8.
    (
        x.mul_add(cos, -(y * sin)).round() as i8,
        x.mul_add(sin, y * cos).round() as i8,
    )
}

/// Draw the 256 test pairs from an isotropic Gaussian around the
/// keypoint, rejecting samples outside the patch and degenerate pairs.
fn base_pattern() -> [TestPair; TESTS] {
    let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
    #[allow(clippy::cast_precision_loss)]
    let sigma = (2 * PATCH_RADIUS + 1) as f32 / 5.0;
    let mut sample = || loop {
        // Box-Muller; 1 - u keeps the logarithm finite.
        let u1: f32 = 1.0 - rng.r#gen::<f32>();
        let u2: f32 = rng.r#gen::<f32>();
        let z = (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos();
        #[allow(clippy::cast_possible_truncation)]
        let v = (z * sigma).round() as i32;
        if v.abs() <= PATTERN_EXTENT {
            return i8::try_from(v).unwrap_or(0);
        }
    };

    let mut pattern = [[0i8; 4]; TESTS];
    for pair in &mut pattern {
        loop {
            let candidate = [sample(), sample(), sample(), sample()];
            if candidate[..2] != candidate[2..] {
                *pair = candidate;
                break;
            }
        }
    }
    pattern
}

/// Keypoints found on one pyramid level, in that level's coordinates.
pub(crate) struct Level {
    /// Blurred copy of the level image used for descriptor sampling.
    pub smoothed: GrayImage,
    /// Factor mapping level coordinates back to the base image.
    pub scale: f32,
    /// Pyramid index.
    pub octave: u8,
    /// Oriented corners on this level.
    pub corners: Vec<OrientedCorner>,
}

/// A corner on a pyramid level with its Harris response and angle.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OrientedCorner {
    pub x: u32,
    pub y: u32,
    pub response: f32,
    pub angle: f32,
}

impl Level {
    /// The corner expressed in base-image coordinates.
    pub fn keypoint(&self, corner: &OrientedCorner) -> Keypoint {
        #[allow(clippy::cast_precision_loss)]
        Keypoint {
            x: corner.x as f32 * self.scale,
            y: corner.y as f32 * self.scale,
            response: corner.response,
            angle: corner.angle,
            octave: self.octave,
        }
    }
}

/// Detect ORB keypoints and binary descriptors.
///
/// Stops adding pyramid levels once `cancel` is raised.
#[must_use = "returns the detected keypoints"]
pub fn detect(gray: &GrayImage, config: &CompareConfig, cancel: &CancelFlag) -> KeypointSet {
    let tables = tables();
    let mut features: Vec<(Keypoint, BinaryDescriptor)> = detect_levels(gray, config, cancel)
        .iter()
        .flat_map(|level| {
            level
                .corners
                .iter()
                .map(|c| (level.keypoint(c), describe(&level.smoothed, c, tables)))
        })
        .collect();

    features.sort_by(|a, b| b.0.response.total_cmp(&a.0.response));
    features.truncate(config.max_keypoints);
    tracing::debug!(keypoints = features.len(), "ORB detection finished");
    KeypointSet::binary(features)
}

/// Build the pyramid and find oriented corners on every level.
///
/// The keypoint budget is split across levels in proportion to
/// `1 / scale^level`, so coarse levels contribute fewer points. Levels
/// not yet processed when `cancel` is raised are skipped.
pub(crate) fn detect_levels(
    gray: &GrayImage,
    config: &CompareConfig,
    cancel: &CancelFlag,
) -> Vec<Level> {
    let levels = pyramid(gray, config.pyramid_levels, config.pyramid_scale);
    let quotas = level_quotas(config.max_keypoints, levels.len(), config.pyramid_scale);

    levels
        .into_iter()
        .zip(quotas)
        .zip(0u8..)
        .take_while(|_| !cancel.is_cancelled())
        .map(|(((image, scale), quota), octave)| {
            let corners = oriented_corners(&image, config.fast_threshold, quota);
            Level {
                smoothed: gaussian_blur(&image, DESCRIPTOR_SIGMA),
                scale,
                octave,
                corners,
            }
        })
        .collect()
}

/// Level images paired with their base-image scale factor.
///
/// Each level is resized from the base image directly. Levels too small
/// to hold a single keypoint away from the border are not produced.
fn pyramid(gray: &GrayImage, levels: u8, scale: f32) -> Vec<(GrayImage, f32)> {
    let min_side = 2 * EDGE_THRESHOLD + 1;
    let mut out = Vec::with_capacity(usize::from(levels));
    if gray.width() < min_side || gray.height() < min_side {
        return out;
    }
    out.push((gray.clone(), 1.0));

    let mut factor = 1.0f32;
    for _ in 1..levels {
        factor *= scale;
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let (w, h) = (
            (gray.width() as f32 / factor).round() as u32,
            (gray.height() as f32 / factor).round() as u32,
        );
        if w < min_side || h < min_side {
            break;
        }
        let level = image::imageops::resize(gray, w, h, FilterType::Triangle);
        #[allow(clippy::cast_precision_loss)]
        let actual = gray.width() as f32 / w as f32;
        out.push((level, actual));
    }
    out
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap
)]
fn level_quotas(total: usize, levels: usize, scale: f32) -> Vec<usize> {
    let factor = 1.0 / scale;
    let denom: f32 = (0..levels).map(|i| factor.powi(i as i32)).sum();
    (0..levels)
        .map(|i| (total as f32 * factor.powi(i as i32) / denom).ceil() as usize)
        .collect()
}

/// FAST-9 corners away from the border, locally maximal, ranked by
/// Harris response and capped at `quota`, each with its orientation.
fn oriented_corners(image: &GrayImage, threshold: u8, quota: usize) -> Vec<OrientedCorner> {
    let (w, h) = image.dimensions();
    let inside = |c: &Corner| {
        c.x >= EDGE_THRESHOLD
            && c.y >= EDGE_THRESHOLD
            && c.x < w - EDGE_THRESHOLD
            && c.y < h - EDGE_THRESHOLD
    };
    let candidates: Vec<Corner> = corners_fast9(image, threshold)
        .into_iter()
        .filter(inside)
        .collect();
    let suppressed = imageproc::suppress::local_maxima(&candidates, NMS_RADIUS);

    let mut ranked: Vec<OrientedCorner> = suppressed
        .into_iter()
        .map(|c| OrientedCorner {
            x: c.x,
            y: c.y,
            response: harris_response(image, c.x, c.y),
            angle: 0.0,
        })
        .collect();
    ranked.sort_by(|a, b| b.response.total_cmp(&a.response));
    ranked.truncate(quota);
    for corner in &mut ranked {
        corner.angle = intensity_centroid_angle(image, corner.x, corner.y);
    }
    ranked
}

/// Harris corner measure over a 7×7 window of Sobel gradients.
#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn harris_response(image: &GrayImage, x: u32, y: u32) -> f32 {
    let px = |dx: i32, dy: i32| -> f32 {
        f32::from(image.get_pixel((x as i32 + dx) as u32, (y as i32 + dy) as u32).0[0])
    };
    let (mut sxx, mut syy, mut sxy) = (0.0f32, 0.0f32, 0.0f32);
    for dy in -HARRIS_HALF_WINDOW..=HARRIS_HALF_WINDOW {
        for dx in -HARRIS_HALF_WINDOW..=HARRIS_HALF_WINDOW {
            let gx = (px(dx + 1, dy - 1) + 2.0 * px(dx + 1, dy) + px(dx + 1, dy + 1))
                - (px(dx - 1, dy - 1) + 2.0 * px(dx - 1, dy) + px(dx - 1, dy + 1));
            let gy = (px(dx - 1, dy + 1) + 2.0 * px(dx, dy + 1) + px(dx + 1, dy + 1))
                - (px(dx - 1, dy - 1) + 2.0 * px(dx, dy - 1) + px(dx + 1, dy - 1));
            sxx += gx * gx;
            syy += gy * gy;
            sxy += gx * gy;
        }
    }
    let det = sxx.mul_add(syy, -(sxy * sxy));
    let trace = sxx + syy;
    HARRIS_K.mul_add(-(trace * trace), det)
}

/// Orientation from the intensity centroid of a circular patch.
#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn intensity_centroid_angle(image: &GrayImage, x: u32, y: u32) -> f32 {
    let (mut m01, mut m10) = (0.0f32, 0.0f32);
    for dy in -PATCH_RADIUS..=PATCH_RADIUS {
        for dx in -PATCH_RADIUS..=PATCH_RADIUS {
            if dx * dx + dy * dy > PATCH_RADIUS * PATCH_RADIUS {
                continue;
            }
            let v = f32::from(image.get_pixel((x as i32 + dx) as u32, (y as i32 + dy) as u32).0[0]);
            m10 += v * dx as f32;
            m01 += v * dy as f32;
        }
    }
    m01.atan2(m10)
}

/// Index of the pre-rotated pattern closest to `angle`.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub(crate) fn angle_bin(angle: f32) -> usize {
    let step = TAU / ANGLE_BINS as f32;
    let bin = (angle.rem_euclid(TAU) / step).round() as usize;
    bin % ANGLE_BINS
}

#[allow(clippy::cast_possible_wrap)]
fn describe(smoothed: &GrayImage, corner: &OrientedCorner, tables: &SamplingTables) -> BinaryDescriptor {
    let pattern = &tables.rotated[angle_bin(corner.angle)];
    let (w, h) = (smoothed.width() as i32, smoothed.height() as i32);
    let sample = |dx: i8, dy: i8| -> u8 {
        let sx = (corner.x as i32 + i32::from(dx)).clamp(0, w - 1);
        let sy = (corner.y as i32 + i32::from(dy)).clamp(0, h - 1);
        smoothed
            .get_pixel(sx.unsigned_abs(), sy.unsigned_abs())
            .0[0]
    };

    let mut descriptor = [0u8; 32];
    for (byte, tests) in descriptor.iter_mut().zip(pattern.chunks(8)) {
        for (bit, test) in tests.iter().enumerate() {
            if sample(test[0], test[1]) < sample(test[2], test[3]) {
                *byte |= 1 << bit;
            }
        }
    }
    descriptor
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::features::{Descriptors, hamming};

    fn binary(set: &KeypointSet) -> &[BinaryDescriptor] {
        match set.descriptors() {
            Descriptors::Binary(d) => d,
            Descriptors::Float(_) => &[],
        }
    }

    /// Overlapping flat rectangles of distinct intensities: plenty of
    /// well-separated corners.
    fn blocks(w: u32, h: u32, seed: u64) -> GrayImage {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut img = GrayImage::from_pixel(w, h, image::Luma([40]));
        for _ in 0..60 {
            let x0 = rng.gen_range(0..w);
            let y0 = rng.gen_range(0..h);
            let rw = rng.gen_range(8..40);
            let rh = rng.gen_range(8..40);
            let v = rng.gen_range(60..=250u8);
            for y in y0..(y0 + rh).min(h) {
                for x in x0..(x0 + rw).min(w) {
                    img.put_pixel(x, y, image::Luma([v]));
                }
            }
        }
        img
    }

    #[test]
    fn tables_are_built_once_with_all_bins() {
        assert_eq!(warm_tables(), ANGLE_BINS);
        let first: *const SamplingTables = tables();
        let second: *const SamplingTables = tables();
        assert_eq!(first, second);
    }

    #[test]
    fn pattern_stays_inside_patch() {
        for pair in &base_pattern() {
            for v in pair {
                assert!(i32::from(*v).abs() <= PATTERN_EXTENT);
            }
            assert_ne!(pair[..2], pair[2..]);
        }
    }

    #[test]
    fn pattern_is_deterministic() {
        assert_eq!(base_pattern(), base_pattern());
    }

    #[test]
    fn zero_rotation_matches_base_pattern() {
        assert_eq!(tables().rotated[0], base_pattern());
    }

    #[test]
    fn angle_bin_wraps() {
        assert_eq!(angle_bin(0.0), 0);
        assert_eq!(angle_bin(TAU), 0);
        assert_eq!(angle_bin(-0.001), 0);
        let step = TAU / 30.0;
        assert_eq!(angle_bin(step * 7.0), 7);
        assert_eq!(angle_bin(step * 7.4), 7);
    }

    #[test]
    fn quotas_cover_budget_and_decrease() {
        let quotas = level_quotas(500, 8, 1.2);
        assert_eq!(quotas.len(), 8);
        assert!(quotas.iter().sum::<usize>() >= 500);
        assert!(quotas.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn pyramid_stops_at_minimum_size() {
        let img = GrayImage::new(120, 100);
        let levels = pyramid(&img, 8, 1.2);
        assert!(!levels.is_empty());
        for (level, _) in &levels {
            assert!(level.width() > 2 * EDGE_THRESHOLD);
            assert!(level.height() > 2 * EDGE_THRESHOLD);
        }
        assert!(levels.len() < 8);
    }

    #[test]
    fn tiny_image_has_no_keypoints() {
        let set = detect(&GrayImage::new(20, 20), &CompareConfig::default(), &CancelFlag::new());
        assert!(set.is_empty());
    }

    #[test]
    fn flat_image_has_no_keypoints() {
        let img = GrayImage::from_pixel(200, 200, image::Luma([128]));
        assert!(detect(&img, &CompareConfig::default(), &CancelFlag::new()).is_empty());
    }

    #[test]
    fn textured_image_respects_budget() {
        let config = CompareConfig {
            max_keypoints: 40,
            ..CompareConfig::default()
        };
        let set = detect(&blocks(300, 300, 7), &config, &CancelFlag::new());
        assert!(!set.is_empty());
        assert!(set.len() <= 40);
        let responses: Vec<f32> = set.keypoints().iter().map(|k| k.response).collect();
        assert!(responses.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn raised_cancel_flag_skips_every_level() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        assert!(detect(&blocks(300, 300, 7), &CompareConfig::default(), &cancel).is_empty());
    }

    #[test]
    fn detection_is_deterministic() {
        let img = blocks(240, 200, 3);
        let config = CompareConfig::default();
        let cancel = CancelFlag::new();
        assert_eq!(detect(&img, &config, &cancel), detect(&img, &config, &cancel));
    }

    #[test]
    fn translated_image_reproduces_descriptors() {
        let canvas = blocks(320, 320, 11);
        let a = image::imageops::crop_imm(&canvas, 0, 0, 300, 300).to_image();
        let b = image::imageops::crop_imm(&canvas, 8, 8, 300, 300).to_image();
        let config = CompareConfig::default();
        let sa = detect(&a, &config, &CancelFlag::new());
        let sb = detect(&b, &config, &CancelFlag::new());
        let (da, db) = (binary(&sa), binary(&sb));
        assert_eq!(da.len(), sa.len());
        assert_eq!(db.len(), sb.len());

        // Level-0 keypoints well inside both crops appear in both sets
        // with identical descriptors.
        let mut exact = 0;
        for (ka, desc_a) in sa.keypoints().iter().zip(da) {
            if ka.octave != 0 || ka.x < 40.0 || ka.y < 40.0 || ka.x > 260.0 || ka.y > 260.0 {
                continue;
            }
            let found = sb.keypoints().iter().zip(db).any(|(kb, desc_b)| {
                kb.octave == 0
                    && (kb.x + 8.0 - ka.x).abs() < 0.5
                    && (kb.y + 8.0 - ka.y).abs() < 0.5
                    && hamming(desc_a, desc_b) == 0
            });
            if found {
                exact += 1;
            }
        }
        assert!(exact > 0, "no keypoint survived an integer translation");
    }
}
