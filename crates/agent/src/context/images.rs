//! Image selection for the context window.
//!
//! Newest images win. Each is first shrunk to the per-image cap, then
//! admitted while the count and total-bytes budgets allow; an image that
//! does not fit is skipped and older ones are still considered.

use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use parley_core::FetchedImage;
use std::collections::HashMap;
use tracing::{debug, warn};

/// JPEG qualities tried at full size before scaling down.
const QUALITY_STEPS: [u8; 4] = [85, 70, 55, 40];
const SCALE_QUALITY: u8 = 70;
const SCALE_FACTOR: f32 = 0.75;
const MAX_SCALE_STEPS: usize = 6;

#[derive(Debug, Clone, Copy)]
pub struct ImageBudget {
    pub max_images: usize,
    pub max_total_bytes: usize,
    pub max_image_bytes: usize,
}

/// Pick images for the given messages (oldest first), keyed by message id.
pub fn select_images(
    message_order: &[&str],
    images: &[FetchedImage],
    budget: &ImageBudget,
) -> HashMap<String, Vec<FetchedImage>> {
    let mut by_message: HashMap<&str, Vec<&FetchedImage>> = HashMap::new();
    for img in images {
        by_message.entry(img.message_id.as_str()).or_default().push(img);
    }

    let mut selected: HashMap<String, Vec<FetchedImage>> = HashMap::new();
    let mut count = 0;
    let mut total = 0;

    'messages: for id in message_order.iter().rev() {
        let Some(candidates) = by_message.get(id) else {
            continue;
        };
        for img in candidates {
            if count >= budget.max_images {
                break 'messages;
            }
            let Some(fitted) = fit_image(img, budget.max_image_bytes) else {
                debug!(message_id = %img.message_id, "Image could not be shrunk to fit, skipping");
                continue;
            };
            if total + fitted.data.len() > budget.max_total_bytes {
                continue;
            }
            total += fitted.data.len();
            count += 1;
            selected.entry(id.to_string()).or_default().push(fitted);
        }
    }

    selected
}

/// Shrink an image to at most `max_bytes`, re-encoding as JPEG.
///
/// Images already under the cap pass through untouched. Returns `None` when
/// the image cannot be decoded or cannot be made small enough.
pub fn fit_image(img: &FetchedImage, max_bytes: usize) -> Option<FetchedImage> {
    if img.data.len() <= max_bytes {
        return Some(img.clone());
    }

    let decoded = match image::load_from_memory(&img.data) {
        Ok(d) => DynamicImage::ImageRgb8(d.to_rgb8()),
        Err(e) => {
            warn!(message_id = %img.message_id, error = %e, "Failed to decode image");
            return None;
        }
    };

    let as_jpeg = |data: Vec<u8>| FetchedImage {
        message_id: img.message_id.clone(),
        media_type: "image/jpeg".into(),
        data,
    };

    for quality in QUALITY_STEPS {
        let data = encode_jpeg(&decoded, quality)?;
        if data.len() <= max_bytes {
            return Some(as_jpeg(data));
        }
    }

    let (mut width, mut height) = (decoded.width(), decoded.height());
    for _ in 0..MAX_SCALE_STEPS {
        width = ((width as f32 * SCALE_FACTOR) as u32).max(1);
        height = ((height as f32 * SCALE_FACTOR) as u32).max(1);
        let scaled = decoded.thumbnail_exact(width, height);
        let data = encode_jpeg(&scaled, SCALE_QUALITY)?;
        if data.len() <= max_bytes {
            return Some(as_jpeg(data));
        }
    }

    None
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    match img.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, quality)) {
        Ok(()) => Some(buf),
        Err(e) => {
            warn!(error = %e, "JPEG encoding failed");
            None
        }
    }
}
