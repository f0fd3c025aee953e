//! Paint detected change onto the baseline crop.

use image::{GrayImage, Rgba, RgbaImage};

use crate::diff::ON;
use crate::types::{PipelineError, Rect};

/// Crop `baseline` to `crop` and paint every set pixel of `mask` with
/// `color`.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidDimensions`] when `mask` does not have
/// the crop dimensions or the crop does not fit inside `baseline`.
#[must_use = "returns the highlighted image"]
pub fn highlight(
    baseline: &RgbaImage,
    crop: Rect,
    mask: &GrayImage,
    color: [u8; 4],
) -> Result<RgbaImage, PipelineError> {
    let fits = u64::from(crop.x) + u64::from(crop.width) <= u64::from(baseline.width())
        && u64::from(crop.y) + u64::from(crop.height) <= u64::from(baseline.height());
    if !fits || mask.dimensions() != (crop.width, crop.height) {
        return Err(PipelineError::InvalidDimensions {
            width: mask.width(),
            height: mask.height(),
        });
    }

    let mut out =
        image::imageops::crop_imm(baseline, crop.x, crop.y, crop.width, crop.height).to_image();
    for (pixel, m) in out.pixels_mut().zip(mask.pixels()) {
        if m.0[0] == ON {
            *pixel = Rgba(color);
        }
    }
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use image::Luma;

    use super::*;

    const RED: [u8; 4] = [255, 0, 0, 255];

    #[test]
    fn paints_only_masked_pixels() {
        let baseline = RgbaImage::from_pixel(10, 10, Rgba([9, 9, 9, 255]));
        let mut mask = GrayImage::new(10, 10);
        mask.put_pixel(3, 4, Luma([ON]));
        let out = highlight(&baseline, Rect::full(crate::types::Dimensions::of(&baseline)), &mask, RED).unwrap();
        assert_eq!(out.get_pixel(3, 4).0, RED);
        assert_eq!(out.get_pixel(4, 4).0, [9, 9, 9, 255]);
    }

    #[test]
    fn output_has_crop_dimensions() {
        let baseline = RgbaImage::from_fn(20, 20, |x, y| {
            Rgba([u8::try_from(x).unwrap(), u8::try_from(y).unwrap(), 0, 255])
        });
        let crop = Rect {
            x: 5,
            y: 6,
            width: 8,
            height: 4,
        };
        let out = highlight(&baseline, crop, &GrayImage::new(8, 4), RED).unwrap();
        assert_eq!(out.dimensions(), (8, 4));
        assert_eq!(out.get_pixel(0, 0).0, [5, 6, 0, 255]);
    }

    #[test]
    fn mask_size_mismatch_is_rejected() {
        let baseline = RgbaImage::new(10, 10);
        let crop = Rect {
            x: 0,
            y: 0,
            width: 5,
            height: 5,
        };
        assert!(highlight(&baseline, crop, &GrayImage::new(6, 5), RED).is_err());
    }

    #[test]
    fn crop_outside_baseline_is_rejected() {
        let baseline = RgbaImage::new(10, 10);
        let crop = Rect {
            x: 8,
            y: 0,
            width: 5,
            height: 5,
        };
        assert!(highlight(&baseline, crop, &GrayImage::new(5, 5), RED).is_err());
    }
}
