//! Smoothing filters.
//!
//! [`gaussian_blur`] wraps [`imageproc::filter::gaussian_blur_f32`] and is
//! used to suppress pixel noise before sampling binary descriptors.
//!
//! [`binomial_blur_5x5`] is the fixed 5×5 kernel applied to the absolute
//! difference image. It uses the separable binomial weights `1 4 6 4 1`
//! (a Gaussian with sigma ≈ 1.1), replicates border pixels and rounds
//! in integer arithmetic, so a flat region of value `v` blurs to exactly
//! `v`. The diff threshold depends on that exactness.

use image::{GrayImage, Luma};

/// Apply Gaussian blur to a grayscale image.
///
/// Higher `sigma` values produce more smoothing. Non-positive sigma values
/// (zero or negative) return the image unchanged, since `imageproc`'s
/// underlying function panics on `sigma <= 0.0`.
#[must_use = "returns the blurred image"]
pub fn gaussian_blur(image: &GrayImage, sigma: f32) -> GrayImage {
    if sigma <= 0.0 {
        return image.clone();
    }

    imageproc::filter::gaussian_blur_f32(image, sigma)
}

const BINOMIAL: [u32; 5] = [1, 4, 6, 4, 1];

/// Blur with a 5×5 binomial kernel, replicate border, rounded to nearest.
#[must_use = "returns the blurred image"]
pub fn binomial_blur_5x5(image: &GrayImage) -> GrayImage {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return image.clone();
    }

    let clamp = |v: i64, max: u32| -> u32 {
        u32::try_from(v.clamp(0, i64::from(max) - 1)).unwrap_or(0)
    };

    // Horizontal pass keeps full precision (max 255 * 16).
    let mut horizontal = vec![0u32; (w as usize) * (h as usize)];
    for y in 0..h {
        for x in 0..w {
            let mut sum = 0;
            for (offset, weight) in (-2..=2).zip(BINOMIAL) {
                let sx = clamp(i64::from(x) + offset, w);
                sum += weight * u32::from(image.get_pixel(sx, y).0[0]);
            }
            horizontal[(y * w + x) as usize] = sum;
        }
    }

    GrayImage::from_fn(w, h, |x, y| {
        let mut sum = 0;
        for (offset, weight) in (-2..=2).zip(BINOMIAL) {
            let sy = clamp(i64::from(y) + offset, h);
            sum += weight * horizontal[(sy * w + x) as usize];
        }
        Luma([u8::try_from((sum + 128) / 256).unwrap_or(u8::MAX)])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Create a test image with a sharp black-to-white boundary at x=5.
    fn sharp_edge_image() -> GrayImage {
        GrayImage::from_fn(10, 10, |x, _y| {
            if x < 5 {
                image::Luma([0])
            } else {
                image::Luma([255])
            }
        })
    }

    #[test]
    fn zero_sigma_returns_identical_image() {
        let img = sharp_edge_image();
        assert_eq!(img, gaussian_blur(&img, 0.0));
    }

    #[test]
    fn negative_sigma_returns_identical_image() {
        let img = sharp_edge_image();
        assert_eq!(img, gaussian_blur(&img, -1.0));
    }

    #[test]
    fn gaussian_smooths_sharp_edge() {
        let blurred = gaussian_blur(&sharp_edge_image(), 2.0);
        assert!(blurred.get_pixel(4, 5).0[0] > 0);
        assert!(blurred.get_pixel(5, 5).0[0] < 255);
    }

    #[test]
    fn binomial_preserves_flat_regions_exactly() {
        for v in [0u8, 1, 49, 50, 51, 255] {
            let img = GrayImage::from_pixel(9, 7, Luma([v]));
            let blurred = binomial_blur_5x5(&img);
            assert!(blurred.pixels().all(|p| p.0[0] == v), "value {v} drifted");
        }
    }

    #[test]
    fn binomial_spreads_single_spike() {
        let mut img = GrayImage::new(11, 11);
        img.put_pixel(5, 5, Luma([255]));
        let blurred = binomial_blur_5x5(&img);
        // Center weight is 36/256 of the spike.
        assert_eq!(blurred.get_pixel(5, 5).0[0], 36);
        // Corner of the 5×5 support gets 1/256 of 255, which rounds to 1.
        assert_eq!(blurred.get_pixel(3, 3).0[0], 1);
        assert_eq!(blurred.get_pixel(2, 2).0[0], 0);
    }

    #[test]
    fn binomial_replicates_border() {
        // Taps past the left edge read column 0 again.
        let img = GrayImage::from_fn(8, 8, |x, _| Luma([if x == 0 { 160 } else { 0 }]));
        let blurred = binomial_blur_5x5(&img);
        // Weights hitting column 0 from x=0: 1 + 4 + 6 = 11 of 16.
        assert_eq!(blurred.get_pixel(0, 4).0[0], 110);
    }

    #[test]
    fn binomial_output_dimensions_preserved() {
        let blurred = binomial_blur_5x5(&GrayImage::new(17, 3));
        assert_eq!(blurred.dimensions(), (17, 3));
    }
}
