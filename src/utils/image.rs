//! Helpers for base64 image payloads.

use crate::core::io::Storage;
use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Decodes a payload, accepting a `data:<mime>;base64,` prefix.
pub fn decode_payload(payload: &str) -> Result<Vec<u8>> {
    let data = match payload.split_once(";base64,") {
        Some((head, data)) if head.starts_with("data:") => data,
        _ => payload,
    };
    STANDARD
        .decode(data.trim())
        .context("Image payload is not valid base64")
}

pub fn encode_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Best-effort content type from magic bytes.
pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(PNG_MAGIC) {
        Some("image/png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else if bytes.starts_with(b"GIF8") {
        Some("image/gif")
    } else {
        None
    }
}

pub fn export_file_name(image_id: &str, timestamp_ms: i64) -> String {
    format!("character-{}-{}.png", image_id, timestamp_ms)
}

/// Writes the payload to `folder` and returns the path written.
pub async fn export_png(storage: &dyn Storage, folder: &str, image_id: &str, payload: &str) -> Result<String> {
    let bytes = decode_payload(payload)?;
    match sniff_mime(&bytes) {
        Some("image/png") => {}
        Some(other) => log::warn!("Exporting {} data with a .png name", other),
        None => return Err(anyhow!("Payload for image {} is not a recognised image", image_id)),
    }
    let name = export_file_name(image_id, chrono::Utc::now().timestamp_millis());
    let path = if folder.is_empty() {
        name
    } else {
        format!("{}/{}", folder.trim_end_matches('/'), name)
    };
    storage.write(&path, &bytes).await?;
    log::info!("Exported image {} to {}", image_id, path);
    Ok(path)
}
