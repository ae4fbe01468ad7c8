//! Image inputs for multimodal prompts.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use llama_server_types::{DecodedImage, GenerationState, ImageAttachment};
use log::warn;
use serde_json::Value;

/// Converts the different image sources of a request into decoded images
/// and encodes them for the `/completion` multimodal payload.
pub trait ImageConverter: fmt::Debug + Send + Sync {
    fn attachments_to_images(&self, attachments: &[ImageAttachment]) -> Vec<DecodedImage>;
    fn messages_to_images(&self, messages: &[Value]) -> Vec<DecodedImage>;
    fn encode_base64(&self, image: &DecodedImage) -> String;
}

/// Default converter: attachments and chat `image_url` parts are base64 or
/// `data:` URLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Base64Images;

impl ImageConverter for Base64Images {
    fn attachments_to_images(&self, attachments: &[ImageAttachment]) -> Vec<DecodedImage> {
        attachments
            .iter()
            .filter_map(|a| decode_image_data(&a.data))
            .collect()
    }

    fn messages_to_images(&self, messages: &[Value]) -> Vec<DecodedImage> {
        let mut images = Vec::new();
        for message in messages {
            let Some(parts) = message.get("content").and_then(Value::as_array) else {
                continue;
            };
            for part in parts {
                if part.get("type").and_then(Value::as_str) != Some("image_url") {
                    continue;
                }
                // Either {"image_url": {"url": ...}} or {"image_url": "..."}
                let url = part
                    .get("image_url")
                    .and_then(|u| u.get("url").or(Some(u)))
                    .and_then(Value::as_str);
                if let Some(image) = url.and_then(decode_image_data) {
                    images.push(image);
                }
            }
        }
        images
    }

    fn encode_base64(&self, image: &DecodedImage) -> String {
        STANDARD.encode(&image.bytes)
    }
}

/// Decode raw base64 or a `data:<mime>;base64,<payload>` URL.
fn decode_image_data(data: &str) -> Option<DecodedImage> {
    let payload = if data.starts_with("data:") {
        data.split_once(',').map(|(_, p)| p)?
    } else {
        data
    };

    match STANDARD.decode(payload.trim()) {
        Ok(bytes) if !bytes.is_empty() => Some(DecodedImage::new(bytes)),
        Ok(_) => None,
        Err(e) => {
            warn!("[MEDIA] Skipping undecodable image: {e}");
            None
        }
    }
}

/// Collect images for a request from the first non-empty source: UI
/// attachments, then chat history, then pre-decoded raw images.
pub fn collect_images(
    state: &GenerationState,
    converter: &dyn ImageConverter,
) -> Vec<DecodedImage> {
    if !state.image_attachments.is_empty() {
        return converter.attachments_to_images(&state.image_attachments);
    }
    if let Some(history) = state.history.as_ref().filter(|h| !h.messages.is_empty()) {
        return converter.messages_to_images(&history.messages);
    }
    state.raw_images.clone()
}
