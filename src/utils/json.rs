use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// Removes a Markdown code fence around a model reply, with or without a
/// language tag. Text outside the first fence is discarded.
pub fn strip_code_blocks(s: &str) -> &str {
    let s = s.trim();
    let Some(start) = s.find("```") else {
        return s;
    };
    let body = &s[start + 3..];
    // Skip the language tag on the opening fence line.
    let body = match body.find('\n') {
        Some(newline) if !body[..newline].trim().contains(char::is_whitespace) => &body[newline + 1..],
        _ => body.trim_start_matches("json"),
    };
    match body.rfind("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

/// Parses a model reply into `T`, tolerating code fences.
pub fn parse_model_json<T: DeserializeOwned>(reply: &str) -> Result<T> {
    let clean = strip_code_blocks(reply);
    serde_json::from_str(clean).with_context(|| format!("Failed to parse model JSON: {}", clean))
}
