//! Bounding input images to a maximum working dimension.
//!
//! Phone photos of crack sites routinely exceed 4000 px on the long side.
//! Every later stage (keypoint detection, warping, differencing) scales
//! with pixel count, so both inputs are shrunk until the longest axis is
//! at most `max_dimension` before anything else happens.
//!
//! The operation is idempotent: an image already within the bound is
//! returned unchanged, and a downsampled image has its long side exactly
//! at the bound.

use std::fmt;

use image::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::types::PipelineError;

/// Resampling filter used when downsampling.
///
/// Ordered from fastest/lowest-quality to slowest/highest-quality,
/// with a `None` variant to skip downsampling entirely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownsampleFilter {
    /// Disabled: skip downsampling regardless of image size.
    None,
    /// Nearest-neighbor: fastest, blocky artifacts.
    Nearest,
    /// Bilinear interpolation: fast, decent quality.
    Triangle,
    /// Bicubic (Catmull-Rom): moderate speed, good quality.
    CatmullRom,
    /// Gaussian: moderate speed, smooth output.
    Gaussian,
    /// Lanczos with 3 lobes: slowest, sharpest/best for photos.
    #[default]
    Lanczos3,
}

impl DownsampleFilter {
    /// Convert to the `image` crate's `FilterType`.
    ///
    /// Returns `Option::None` for [`DownsampleFilter::None`] since
    /// there is no corresponding resampling filter.
    pub(crate) const fn to_image_filter(self) -> Option<image::imageops::FilterType> {
        match self {
            Self::None => Option::None,
            Self::Nearest => Some(image::imageops::FilterType::Nearest),
            Self::Triangle => Some(image::imageops::FilterType::Triangle),
            Self::CatmullRom => Some(image::imageops::FilterType::CatmullRom),
            Self::Gaussian => Some(image::imageops::FilterType::Gaussian),
            Self::Lanczos3 => Some(image::imageops::FilterType::Lanczos3),
        }
    }
}

impl fmt::Display for DownsampleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Nearest => f.write_str("Nearest"),
            Self::Triangle => f.write_str("Triangle"),
            Self::CatmullRom => f.write_str("CatmullRom"),
            Self::Gaussian => f.write_str("Gaussian"),
            Self::Lanczos3 => f.write_str("Lanczos3"),
        }
    }
}

/// Shrink `image` so its longest axis is at most `max_dimension` pixels.
///
/// Takes ownership so an image that is already small enough passes
/// through without a copy. Returns the (possibly unchanged) image and
/// whether downsampling was actually applied.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidDimensions`] if either side of the
/// input is zero.
#[must_use = "returns the bounded image"]
pub fn bound(
    image: RgbaImage,
    max_dimension: u32,
    filter: DownsampleFilter,
) -> Result<(RgbaImage, bool), PipelineError> {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return Err(PipelineError::InvalidDimensions {
            width: w,
            height: h,
        });
    }

    let Some(image_filter) = filter.to_image_filter() else {
        return Ok((image, false));
    };

    if w.max(h) <= max_dimension {
        return Ok((image, false));
    }

    let resized = image::imageops::resize(
        &image,
        scaled(w, w.max(h), max_dimension),
        scaled(h, w.max(h), max_dimension),
        image_filter,
    );
    tracing::debug!(
        from_width = w,
        from_height = h,
        to_width = resized.width(),
        to_height = resized.height(),
        "downsampled input"
    );
    Ok((resized, true))
}

/// Scale one side proportionally so `long` maps to `target`, rounding to
/// nearest and never collapsing to zero.
fn scaled(side: u32, long: u32, target: u32) -> u32 {
    let num = u64::from(side) * u64::from(target) + u64::from(long) / 2;
    u32::try_from(num / u64::from(long)).unwrap_or(target).max(1)
}
