/// Frame scaling and JPEG compression.
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};

use crate::errors::{PilotError, PilotResult};
use crate::perception::types::Screenshot;

/// Device size assumed for the synthetic frame produced on capture failure.
pub const FALLBACK_WIDTH: u32 = 1080;
pub const FALLBACK_HEIGHT: u32 = 2400;

#[derive(Debug, Clone, Copy)]
pub struct EncodeSettings {
    pub max_width: u32,
    pub max_height: u32,
    pub jpeg_quality: u8,
}

/// Largest size within `max_w`×`max_h` that keeps the aspect ratio.
/// Frames already inside the bounds are returned unchanged, never upscaled.
pub fn compute_scaled_size(width: u32, height: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    if width == 0 || height == 0 || (width <= max_w && height <= max_h) {
        return (width, height);
    }
    let ratio = (max_w as f64 / width as f64).min(max_h as f64 / height as f64);
    let w = ((width as f64 * ratio).round() as u32).clamp(1, max_w.max(1));
    let h = ((height as f64 * ratio).round() as u32).clamp(1, max_h.max(1));
    (w, h)
}

pub fn encode_jpeg(img: &DynamicImage, quality: u8) -> PilotResult<Vec<u8>> {
    let mut out = Vec::new();
    img.to_rgb8()
        .write_with_encoder(JpegEncoder::new_with_quality(&mut out, quality))
        .map_err(|e| PilotError::Perception(format!("jpeg encode: {e}")))?;
    Ok(out)
}

/// Decode a raw frame (PNG or any format `image` recognises), scale it into
/// bounds and compress it.
pub fn process_frame(raw: &[u8], settings: &EncodeSettings) -> PilotResult<Screenshot> {
    let img = image::load_from_memory(raw)
        .map_err(|e| PilotError::Perception(format!("frame decode: {e}")))?;
    let (ow, oh) = (img.width(), img.height());
    let (w, h) = compute_scaled_size(ow, oh, settings.max_width, settings.max_height);

    let scaled = if (w, h) == (ow, oh) {
        img
    } else {
        img.resize_exact(w, h, FilterType::Triangle)
    };

    let image_bytes = encode_jpeg(&scaled, settings.jpeg_quality)?;
    tracing::debug!(
        original = %format!("{ow}x{oh}"),
        scaled = %format!("{w}x{h}"),
        bytes = image_bytes.len(),
        "frame encoded"
    );

    Ok(Screenshot {
        image_bytes,
        width: w,
        height: h,
        original_width: ow,
        original_height: oh,
        is_sensitive: false,
    })
}

/// Black stand-in frame marked sensitive.
pub fn synthetic_frame(settings: &EncodeSettings) -> Screenshot {
    let (w, h) = compute_scaled_size(
        FALLBACK_WIDTH,
        FALLBACK_HEIGHT,
        settings.max_width,
        settings.max_height,
    );
    let black = DynamicImage::ImageRgb8(RgbImage::new(w, h));
    let image_bytes = encode_jpeg(&black, settings.jpeg_quality).unwrap_or_else(|e| {
        tracing::error!(error = %e, "could not encode synthetic frame");
        Vec::new()
    });
    Screenshot {
        image_bytes,
        width: w,
        height: h,
        original_width: FALLBACK_WIDTH,
        original_height: FALLBACK_HEIGHT,
        is_sensitive: true,
    }
}
