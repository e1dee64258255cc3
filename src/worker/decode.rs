//! Image materialization: read → decode → downscale → PNG.

use std::io::Cursor;
use std::path::Path;
use std::time::Instant;

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use log::{debug, warn};

use crate::error::CacheError;
use crate::tables::FallbackAssets;

/// Decode the image at `path`, shrink it to fit `max_size` if it is larger,
/// and encode it as PNG.
pub fn encode_image(path: &Path, max_size: Option<(u32, u32)>) -> Result<Vec<u8>, CacheError> {
    let decode_err = |reason: String| CacheError::Decode {
        path: path.to_path_buf(),
        reason,
    };
    let start = Instant::now();
    let raw = std::fs::read(path).map_err(|e| decode_err(e.to_string()))?;
    let img = image::load_from_memory(&raw).map_err(|e| decode_err(e.to_string()))?;
    let img = fit_within(img, max_size);

    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png)
        .map_err(|e| decode_err(format!("PNG encoding failed: {e}")))?;
    let bytes = out.into_inner();
    debug!(
        "decode: {} -> {}x{} ({} bytes) in {:.1}ms",
        path.display(),
        img.width(),
        img.height(),
        bytes.len(),
        start.elapsed().as_secs_f64() * 1000.0
    );
    Ok(bytes)
}

fn fit_within(img: DynamicImage, max_size: Option<(u32, u32)>) -> DynamicImage {
    match max_size {
        Some((w, h)) if img.width() > w || img.height() > h => img.resize(w, h, FilterType::Triangle),
        _ => img,
    }
}

/// Encodes sources, substituting the missing-image placeholder on failure.
///
/// The encoded placeholder is kept after first use; it is requested for every
/// broken entry and never changes.
pub(crate) struct Decoder {
    max_size: Option<(u32, u32)>,
    placeholder: Option<Vec<u8>>,
}

impl Decoder {
    pub(crate) fn new(max_size: Option<(u32, u32)>) -> Self {
        Self {
            max_size,
            placeholder: None,
        }
    }

    pub(crate) fn encode_or_fallback(
        &mut self,
        path: &Path,
        assets: &dyn FallbackAssets,
    ) -> Result<Vec<u8>, CacheError> {
        match encode_image(path, self.max_size) {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                warn!("{e}; substituting placeholder");
                self.placeholder(assets)
            }
        }
    }

    fn placeholder(&mut self, assets: &dyn FallbackAssets) -> Result<Vec<u8>, CacheError> {
        if let Some(bytes) = &self.placeholder {
            return Ok(bytes.clone());
        }
        let bytes = encode_image(assets.missing_image(), self.max_size)?;
        self.placeholder = Some(bytes.clone());
        Ok(bytes)
    }
}
