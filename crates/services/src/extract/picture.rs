//! Image attachments: downscale, re-encode as PNG, base64.

use ::image::imageops::FilterType;
use ::image::{DynamicImage, ImageOutputFormat};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::io::Cursor;
use std::path::Path;

use super::ExtractError;

/// Longest side of a general image attachment
pub const IMAGE_MAX_SIZE: u32 = 640;
/// Longest side of a model profile picture
pub const PROFILE_PICTURE_MAX_SIZE: u32 = 128;

/// Scale `(width, height)` so the longer side equals `max_size`, keeping the
/// aspect ratio. The shorter side is rounded to the nearest pixel, minimum 1.
pub fn resize_dimensions(width: u32, height: u32, max_size: u32) -> (u32, u32) {
    let scale = |short: u32, long: u32| -> u32 {
        let scaled = (max_size as f64 / long.max(1) as f64) * short as f64;
        (scaled.round() as u32).max(1)
    };

    if width > height {
        (max_size, scale(height, width))
    } else {
        (scale(width, height), max_size)
    }
}

/// Resize an in-memory image and return it as base64-encoded PNG.
pub fn encode_dynamic_image(img: &DynamicImage, max_size: u32) -> Result<String, ExtractError> {
    let (width, height) = resize_dimensions(img.width(), img.height(), max_size);
    let resized = img.resize_exact(width, height, FilterType::Lanczos3);

    let mut png = Cursor::new(Vec::new());
    resized.write_to(&mut png, ImageOutputFormat::Png)?;
    Ok(STANDARD.encode(png.into_inner()))
}

/// Decode the image at `path` and return it resized as base64 PNG.
pub fn encode_image(path: &Path, max_size: u32) -> Result<String, ExtractError> {
    let img = ::image::open(path)?;
    encode_dynamic_image(&img, max_size)
}
