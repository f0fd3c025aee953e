//! Image decoding and grayscale conversion.
//!
//! Decoding accepts raw image bytes (PNG, JPEG, BMP, WebP) and produces a
//! uniform RGBA buffer. Grayscale conversion uses the BT.601 luma weights
//! `0.299*R + 0.587*G + 0.114*B` in fixed-point integer arithmetic, so a
//! neutral gray pixel maps to exactly its own value and difference
//! thresholds behave predictably.

use image::{GrayImage, Luma, RgbaImage};

use crate::types::PipelineError;

/// Decode raw image bytes into an RGBA buffer.
///
/// # Errors
///
/// Returns [`PipelineError::EmptyInput`] if `bytes` is empty.
/// Returns [`PipelineError::ImageDecode`] if the image format is
/// unrecognized or the data is corrupt.
/// Returns [`PipelineError::InvalidDimensions`] if the decoded image
/// has a zero dimension.
#[must_use = "returns the decoded image"]
pub fn decode(bytes: &[u8]) -> Result<RgbaImage, PipelineError> {
    if bytes.is_empty() {
        return Err(PipelineError::EmptyInput);
    }

    let img = image::load_from_memory(bytes)?.to_rgba8();
    if img.width() == 0 || img.height() == 0 {
        return Err(PipelineError::InvalidDimensions {
            width: img.width(),
            height: img.height(),
        });
    }
    Ok(img)
}

/// BT.601 luma of a single RGB triple, rounded to nearest.
#[must_use]
pub fn luma_of(r: u8, g: u8, b: u8) -> u8 {
    let sum = 299 * u32::from(r) + 587 * u32::from(g) + 114 * u32::from(b);
    // sum <= 255_000, so the rounded quotient always fits in a u8.
    u8::try_from((sum + 500) / 1000).unwrap_or(u8::MAX)
}

/// Convert an RGBA image to single-channel BT.601 luma.
///
/// Alpha is ignored: a transparent black pixel (the warp border) maps
/// to luma 0 just like an opaque black one.
#[must_use = "returns the grayscale image"]
pub fn luma(image: &RgbaImage) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b, _] = image.get_pixel(x, y).0;
        Luma([luma_of(r, g, b)])
    })
}
