//! Raster image encoding.
//!
//! Results leave the pipeline as RGBA buffers; callers that store or
//! display them want PNG, which is lossless and so keeps the highlight
//! color exact.

use std::path::Path;

use crackdiff_pipeline::{GrayImage, RgbaImage};
use image::ImageEncoder;

/// Errors that can occur while encoding or writing a raster.
#[derive(Debug, thiserror::Error)]
pub enum RasterError {
    /// PNG encoding failed.
    #[error("PNG encoding failed: {0}")]
    PngEncode(String),

    /// Writing the encoded file failed.
    #[error("failed to write {path}: {message}")]
    Write {
        /// Destination path.
        path: String,
        /// The I/O error message.
        message: String,
    },
}

impl From<image::ImageError> for RasterError {
    fn from(err: image::ImageError) -> Self {
        Self::PngEncode(err.to_string())
    }
}

/// Encode an `RgbaImage` as PNG bytes.
///
/// # Errors
///
/// Returns [`RasterError::PngEncode`] if PNG encoding fails.
pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>, RasterError> {
    let mut png_bytes = Vec::new();
    let encoder = image::codecs::png::PngEncoder::new(&mut png_bytes);
    encoder.write_image(
        image.as_raw(),
        image.width(),
        image.height(),
        image::ExtendedColorType::Rgba8,
    )?;
    Ok(png_bytes)
}

/// Encode a single-channel mask as PNG bytes.
///
/// # Errors
///
/// Returns [`RasterError::PngEncode`] if PNG encoding fails.
pub fn encode_mask_png(mask: &GrayImage) -> Result<Vec<u8>, RasterError> {
    let mut png_bytes = Vec::new();
    let encoder = image::codecs::png::PngEncoder::new(&mut png_bytes);
    encoder.write_image(
        mask.as_raw(),
        mask.width(),
        mask.height(),
        image::ExtendedColorType::L8,
    )?;
    Ok(png_bytes)
}

/// Encode `image` as PNG and write it to `path`.
///
/// # Errors
///
/// Returns [`RasterError::PngEncode`] if encoding fails and
/// [`RasterError::Write`] if the file cannot be written.
pub fn write_png(image: &RgbaImage, path: &Path) -> Result<(), RasterError> {
    let bytes = encode_png(image)?;
    std::fs::write(path, bytes).map_err(|e| RasterError::Write {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use image::{Luma, Rgba};

    use super::*;

    #[test]
    fn png_round_trip_is_lossless() {
        let img = RgbaImage::from_fn(7, 5, |x, y| {
            Rgba([255, 0, u8::try_from(x * 30).unwrap(), u8::try_from(y * 50).unwrap()])
        });
        let bytes = encode_png(&img).unwrap();
        assert_eq!(&bytes[1..4], b"PNG");
        let decoded = image::load_from_memory(&bytes).unwrap().to_rgba8();
        assert_eq!(decoded, img);
    }

    #[test]
    fn mask_encodes_as_gray() {
        let mut mask = GrayImage::new(3, 3);
        mask.put_pixel(1, 1, Luma([255]));
        let bytes = encode_mask_png(&mask).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap().to_luma8();
        assert_eq!(decoded, mask);
    }

    #[test]
    fn write_to_missing_directory_fails() {
        let img = RgbaImage::new(1, 1);
        let err = write_png(&img, Path::new("/nonexistent-dir/out.png")).unwrap_err();
        assert!(matches!(err, RasterError::Write { .. }));
    }
}
