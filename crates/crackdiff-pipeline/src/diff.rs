//! Noise-robust change detection between two aligned images.
//!
//! The aligned current image only covers part of the baseline frame after
//! a warp, so the comparison is restricted to the bounding box of the
//! region that actually received content. Inside that box the absolute
//! luma difference is smoothed, thresholded, closed to merge fragments,
//! and stripped of connected regions too small to be a crack. When the
//! images were warped (not merely resized) the result is also clipped to
//! the content region so warp borders never read as change.

use image::{GrayImage, Luma, RgbaImage};
use imageproc::contours::{BorderType, Contour, find_contours};
use imageproc::distance_transform::Norm;
use imageproc::region_labelling::{Connectivity, connected_components};

use crate::blur::binomial_blur_5x5;
use crate::grayscale::luma;
use crate::types::{CompareConfig, Dimensions, PipelineError, Rect};

/// Value of a set pixel in every binary mask produced here.
pub const ON: u8 = 255;

/// Output of [`diff`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeMask {
    /// Binary mask (0 / 255) with the crop dimensions.
    pub mask: GrayImage,
    /// Comparison region within the baseline frame.
    pub crop: Rect,
    /// Set pixels in `mask`.
    pub changed_pixels: u64,
    /// Pixels over the threshold before closing and filtering.
    pub raw_changed_pixels: u64,
    /// Connected regions that survived the area filter.
    pub regions_kept: usize,
    /// Connected regions dropped for being too small.
    pub regions_dropped: usize,
}

/// Compute the change mask between `baseline` and `aligned`.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidDimensions`] if the two images differ
/// in size or are empty.
#[must_use = "returns the change mask"]
pub fn diff(
    baseline: &RgbaImage,
    aligned: &RgbaImage,
    used_fallback: bool,
    config: &CompareConfig,
) -> Result<ChangeMask, PipelineError> {
    let dims = Dimensions::of(baseline);
    if dims != Dimensions::of(aligned) || dims.width == 0 || dims.height == 0 {
        return Err(PipelineError::InvalidDimensions {
            width: aligned.width(),
            height: aligned.height(),
        });
    }

    let gray_baseline = luma(baseline);
    let gray_aligned = luma(aligned);
    let content = threshold_above(&gray_aligned, config.content_threshold);
    let crop = content_bounds(&content).unwrap_or_else(|| Rect::full(dims));

    let gray_baseline = crop_gray(&gray_baseline, crop);
    let gray_aligned = crop_gray(&gray_aligned, crop);
    let content = crop_gray(&content, crop);

    let difference = absolute_difference(&gray_baseline, &gray_aligned);
    let blurred = binomial_blur_5x5(&difference);
    let raw = threshold_at_least(&blurred, config.diff_threshold);
    let raw_changed_pixels = count_on(&raw);

    let mut closed = raw;
    for _ in 0..config.close_iterations {
        closed = imageproc::morphology::close(&closed, Norm::LInf, 2);
    }

    let (mut mask, regions_kept, regions_dropped) = remove_small_regions(&closed, config.min_blob_area);

    if !used_fallback {
        for (m, c) in mask.pixels_mut().zip(content.pixels()) {
            if c.0[0] != ON {
                m.0[0] = 0;
            }
        }
    }

    let changed_pixels = count_on(&mask);
    tracing::debug!(
        ?crop,
        raw_changed_pixels,
        changed_pixels,
        regions_kept,
        regions_dropped,
        "diff finished"
    );
    Ok(ChangeMask {
        mask,
        crop,
        changed_pixels,
        raw_changed_pixels,
        regions_kept,
        regions_dropped,
    })
}

fn threshold_above(image: &GrayImage, threshold: u8) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        Luma([if image.get_pixel(x, y).0[0] > threshold { ON } else { 0 }])
    })
}

fn threshold_at_least(image: &GrayImage, threshold: u8) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        Luma([if image.get_pixel(x, y).0[0] >= threshold { ON } else { 0 }])
    })
}

fn absolute_difference(a: &GrayImage, b: &GrayImage) -> GrayImage {
    GrayImage::from_fn(a.width(), a.height(), |x, y| {
        Luma([a.get_pixel(x, y).0[0].abs_diff(b.get_pixel(x, y).0[0])])
    })
}

fn crop_gray(image: &GrayImage, rect: Rect) -> GrayImage {
    image::imageops::crop_imm(image, rect.x, rect.y, rect.width, rect.height).to_image()
}

fn count_on(mask: &GrayImage) -> u64 {
    mask.pixels().filter(|p| p.0[0] == ON).count() as u64
}

/// Bounding rectangle of the largest outer contour in a binary mask, or
/// `None` when the mask is empty.
///
/// Contours are compared by enclosed polygon area, then by length, so a
/// single pixel or a one-pixel-wide line still yields a rectangle.
#[must_use]
pub fn content_bounds(mask: &GrayImage) -> Option<Rect> {
    let contours: Vec<Contour<u32>> = find_contours(mask);
    let largest = contours
        .iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .filter(|c| !c.points.is_empty())
        .max_by(|a, b| {
            polygon_area(a)
                .total_cmp(&polygon_area(b))
                .then(a.points.len().cmp(&b.points.len()))
        })?;

    let min_x = largest.points.iter().map(|p| p.x).min()?;
    let max_x = largest.points.iter().map(|p| p.x).max()?;
    let min_y = largest.points.iter().map(|p| p.y).min()?;
    let max_y = largest.points.iter().map(|p| p.y).max()?;
    Some(Rect {
        x: min_x,
        y: min_y,
        width: max_x - min_x + 1,
        height: max_y - min_y + 1,
    })
}

/// Shoelace area of a contour's point polygon.
fn polygon_area(contour: &Contour<u32>) -> f64 {
    let points = &contour.points;
    if points.len() < 3 {
        return 0.0;
    }
    let twice: f64 = points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| {
            f64::from(a.x).mul_add(f64::from(b.y), -(f64::from(b.x) * f64::from(a.y)))
        })
        .sum();
    twice.abs() / 2.0
}

/// Clear 8-connected regions smaller than `min_area` pixels.
///
/// Returns the filtered mask with the number of regions kept and dropped.
fn remove_small_regions(mask: &GrayImage, min_area: u32) -> (GrayImage, usize, usize) {
    let labels = connected_components(mask, Connectivity::Eight, Luma([0u8]));
    let label_count = labels.pixels().map(|p| p.0[0]).max().unwrap_or(0) as usize;
    let mut areas = vec![0u32; label_count + 1];
    for p in labels.pixels() {
        areas[p.0[0] as usize] += 1;
    }

    let keep: Vec<bool> = areas
        .iter()
        .enumerate()
        .map(|(label, &area)| label != 0 && area >= min_area)
        .collect();
    let kept = keep.iter().filter(|&&k| k).count();
    let dropped = label_count - kept;

    let filtered = GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        Luma([if keep[labels.get_pixel(x, y).0[0] as usize] { ON } else { 0 }])
    });
    (filtered, kept, dropped)
}
