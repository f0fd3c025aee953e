//! Bring the current image into the baseline frame.
//!
//! With a homography the current image is warped (bicubic interpolation)
//! onto a canvas the size of the baseline. An output pixel is covered when
//! its pre-image lies within half a pixel of the source frame, so an
//! identity warp reproduces every pixel. Uncovered pixels stay transparent
//! black, which the diff stage later treats as "no content". Without one the current image is simply resized to the
//! baseline dimensions, and the comparison proceeds with no geometric
//! correction at all.

use image::imageops::FilterType;
use image::{Rgba, RgbaImage};
use imageproc::geometric_transformations::{Interpolation, Projection, warp_into_with};

use crate::homography::Homography;
use crate::types::Dimensions;

/// Fill for pixels outside the warped image.
pub const BORDER: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Replicated rim around the source. `imageproc`'s bicubic sampler rejects
/// any tap window touching the last few columns, so edge samples read from
/// the rim instead.
const MARGIN: u32 = 3;

/// Align `current` to a `target`-sized canvas.
///
/// Returns the aligned image and whether the resize fallback was used.
#[must_use = "returns the aligned image"]
pub fn align(
    current: &RgbaImage,
    homography: Option<&Homography>,
    target: Dimensions,
) -> (RgbaImage, bool) {
    if let Some(h) = homography {
        if let Some(projection) = to_projection(h) {
            return (warp(current, projection, target), false);
        }
        tracing::warn!(?h, "homography not representable as a projection, resizing instead");
    }
    (resize_to(current, target), true)
}

/// Bicubic warp of `current` through `projection` onto a `target` canvas.
#[allow(clippy::cast_precision_loss)]
fn warp(current: &RgbaImage, projection: Projection, target: Dimensions) -> RgbaImage {
    let (width, height) = current.dimensions();
    let padded = replicate_rim(current, MARGIN);
    let inverse = projection.invert();
    let (max_x, max_y) = (width as f32 - 0.5, height as f32 - 0.5);
    let offset = MARGIN as f32;
    let mut out = RgbaImage::new(target.width, target.height);
    warp_into_with(
        &padded,
        |x, y| {
            let (sx, sy) = inverse * (x, y);
            if sx >= -0.5 && sx < max_x && sy >= -0.5 && sy < max_y {
                (sx + offset, sy + offset)
            } else {
                // NaN makes the sampler return the border fill.
                (f32::NAN, f32::NAN)
            }
        },
        Interpolation::Bicubic,
        BORDER,
        &mut out,
    );
    out
}

/// Copy of `image` with `rim` extra pixels on every side, each repeating
/// the nearest edge pixel.
fn replicate_rim(image: &RgbaImage, rim: u32) -> RgbaImage {
    let (width, height) = image.dimensions();
    RgbaImage::from_fn(width + 2 * rim, height + 2 * rim, |x, y| {
        let sx = x.saturating_sub(rim).min(width.saturating_sub(1));
        let sy = y.saturating_sub(rim).min(height.saturating_sub(1));
        *image.get_pixel(sx, sy)
    })
}

/// Resize to exactly `target`, without copying when already that size.
fn resize_to(image: &RgbaImage, target: Dimensions) -> RgbaImage {
    if image.dimensions() == (target.width, target.height) {
        return image.clone();
    }
    image::imageops::resize(image, target.width, target.height, FilterType::Triangle)
}

/// Convert to `imageproc`'s single-precision projection.
///
/// `warp_into` treats the projection as mapping input (current image)
/// coordinates to output (baseline) coordinates.
#[allow(clippy::cast_possible_truncation)]
fn to_projection(h: &Homography) -> Option<Projection> {
    let m = h.to_row_major().map(|v| v as f32);
    if m.iter().any(|v| !v.is_finite()) {
        return None;
    }
    Projection::from_matrix(m)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn gradient(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_fn(w, h, |x, y| {
            Rgba([
                u8::try_from(x % 256).unwrap(),
                u8::try_from(y % 256).unwrap(),
                100,
                255,
            ])
        })
    }

    #[test]
    fn no_homography_resizes_with_fallback() {
        let (out, used_fallback) = align(
            &gradient(40, 30),
            None,
            Dimensions {
                width: 80,
                height: 60,
            },
        );
        assert!(used_fallback);
        assert_eq!(out.dimensions(), (80, 60));
    }

    #[test]
    fn fallback_same_size_is_unchanged() {
        let img = gradient(20, 10);
        let (out, used_fallback) = align(
            &img,
            None,
            Dimensions {
                width: 20,
                height: 10,
            },
        );
        assert!(used_fallback);
        assert_eq!(out, img);
    }

    #[test]
    fn identity_warp_preserves_every_pixel() {
        let img = gradient(30, 30);
        let (out, used_fallback) = align(
            &img,
            Some(&Homography::identity()),
            Dimensions {
                width: 30,
                height: 30,
            },
        );
        assert!(!used_fallback);
        assert_eq!(out, img);
    }

    #[test]
    fn flat_image_survives_identity_up_to_the_edges() {
        let img = RgbaImage::from_pixel(30, 30, Rgba([90, 140, 60, 255]));
        let (out, _) = align(
            &img,
            Some(&Homography::identity()),
            Dimensions {
                width: 30,
                height: 30,
            },
        );
        let blank = out.pixels().filter(|p| **p == BORDER).count();
        assert_eq!(blank, 0);
    }

    #[test]
    fn subpixel_shift_keeps_the_far_edge_covered() {
        let img = RgbaImage::from_pixel(30, 30, Rgba([90, 140, 60, 255]));
        let (out, _) = align(
            &img,
            Some(&Homography::translation(0.3, 0.0)),
            Dimensions {
                width: 30,
                height: 30,
            },
        );
        // Pre-image of column 29 is 28.7, still inside the frame.
        assert_eq!(out.get_pixel(29, 15).0, [90, 140, 60, 255]);
        // Pre-image of column 0 is -0.3, within half a pixel of column 0.
        assert_eq!(out.get_pixel(0, 15).0, [90, 140, 60, 255]);
    }

    #[test]
    fn replicated_rim_repeats_edge_pixels() {
        let img = gradient(4, 3);
        let padded = replicate_rim(&img, 2);
        assert_eq!(padded.dimensions(), (8, 7));
        assert_eq!(padded.get_pixel(0, 0), img.get_pixel(0, 0));
        assert_eq!(padded.get_pixel(7, 6), img.get_pixel(3, 2));
        assert_eq!(padded.get_pixel(3, 4), img.get_pixel(1, 2));
    }

    #[test]
    fn translation_leaves_transparent_border() {
        let img = RgbaImage::from_pixel(40, 40, Rgba([200, 200, 200, 255]));
        let (out, used_fallback) = align(
            &img,
            Some(&Homography::translation(10.0, 0.0)),
            Dimensions {
                width: 40,
                height: 40,
            },
        );
        assert!(!used_fallback);
        // Nothing maps onto the left strip.
        assert_eq!(*out.get_pixel(3, 20), BORDER);
        // Well inside the shifted image the color is untouched.
        assert_eq!(out.get_pixel(25, 20).0, [200, 200, 200, 255]);
    }

    #[test]
    fn warp_output_has_target_dimensions() {
        let (out, _) = align(
            &gradient(50, 20),
            Some(&Homography::translation(1.0, 1.0)),
            Dimensions {
                width: 64,
                height: 48,
            },
        );
        assert_eq!(out.dimensions(), (64, 48));
    }
}
