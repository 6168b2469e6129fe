use image::RgbImage;
use std::path::{Path, PathBuf};

use crate::core::errors::{DetectionError, PipelineError, PipelineResult};

/// Decode an uploaded image into RGB
///
/// Zero-sized images are rejected here so later stages can assume pixels.
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, DetectionError> {
    let rgb = image::load_from_memory(bytes)?.to_rgb8();
    ensure_nonempty(rgb)
}

/// Decode an image file into RGB
pub fn open_rgb(path: &Path) -> Result<RgbImage, DetectionError> {
    let rgb = image::ImageReader::open(path)
        .map_err(image::ImageError::IoError)?
        .with_guessed_format()
        .map_err(image::ImageError::IoError)?
        .decode()?
        .to_rgb8();
    ensure_nonempty(rgb)
}

fn ensure_nonempty(rgb: RgbImage) -> Result<RgbImage, DetectionError> {
    if rgb.width() == 0 || rgb.height() == 0 {
        return Err(DetectionError::EmptyImage {
            width: rgb.width(),
            height: rgb.height(),
        });
    }
    Ok(rgb)
}

/// Decode bytes on the blocking pool; decoding large photos is CPU-heavy
pub async fn decode_rgb_async(bytes: Vec<u8>) -> PipelineResult<RgbImage> {
    tokio::task::spawn_blocking(move || decode_rgb(&bytes))
        .await
        .map_err(|e| PipelineError::TaskJoinFailed(e.to_string()))?
        .map_err(PipelineError::from)
}

/// Decode a file on the blocking pool
pub async fn open_rgb_async(path: PathBuf) -> PipelineResult<RgbImage> {
    tokio::task::spawn_blocking(move || open_rgb(&path))
        .await
        .map_err(|e| PipelineError::TaskJoinFailed(e.to_string()))?
        .map_err(PipelineError::from)
}
