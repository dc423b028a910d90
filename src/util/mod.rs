//! Image conversion and output directory helpers.

use image::{DynamicImage, GrayImage, ImageBuffer, Luma};
use std::fs;
use std::path::Path;

/// Single-channel floating point image used throughout the tracker.
pub type GrayImageF32 = ImageBuffer<Luma<f32>, Vec<f32>>;

#[derive(thiserror::Error, Debug)]
pub enum UtilError {
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
}

/// Ensure the output directory exists
pub fn ensure_output_dir(dir: impl AsRef<Path>) -> Result<(), UtilError> {
    let dir = dir.as_ref();
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|e| {
            UtilError::InvalidParams(format!("Failed to create output directory {}: {e}", dir.display()))
        })?;
    }
    Ok(())
}

pub fn gray_to_f32(image: &GrayImage) -> GrayImageF32 {
    ImageBuffer::from_fn(image.width(), image.height(), |x, y| {
        Luma([image.get_pixel(x, y)[0] as f32])
    })
}

/// Converts any decoded image to intensities in `[0, 255]`.
pub fn dynamic_to_f32(image: &DynamicImage) -> GrayImageF32 {
    gray_to_f32(&image.to_luma8())
}

/// Load an image from disk as float intensities.
pub fn load_gray_image(path: impl AsRef<Path>) -> Result<GrayImageF32, UtilError> {
    let image = image::open(path.as_ref())?;
    Ok(dynamic_to_f32(&image))
}

/// Save a float image as 8-bit grayscale, stretching its range to `[0, 255]`.
pub fn save_gray_image(image: &GrayImageF32, path: impl AsRef<Path>) -> Result<(), UtilError> {
    let (lo, hi) = image
        .pixels()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));
    if !(lo.is_finite() && hi.is_finite()) {
        return Err(UtilError::InvalidParams("Image has no finite pixels".to_string()));
    }
    let scale = if hi > lo { 255.0 / (hi - lo) } else { 0.0 };
    let out: GrayImage = ImageBuffer::from_fn(image.width(), image.height(), |x, y| {
        Luma([((image.get_pixel(x, y)[0] - lo) * scale).round().clamp(0.0, 255.0) as u8])
    });
    out.save(path.as_ref())?;
    Ok(())
}
