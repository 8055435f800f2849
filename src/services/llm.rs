use crate::core::config::{ApiKeys, GeminiConfig};
use crate::core::error::ForgeError;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;

#[cfg(target_arch = "wasm32")]
pub trait LlmBounds {}
#[cfg(target_arch = "wasm32")]
impl<T> LlmBounds for T {}

#[cfg(not(target_arch = "wasm32"))]
pub trait LlmBounds: Send + Sync {}
#[cfg(not(target_arch = "wasm32"))]
impl<T: Send + Sync> LlmBounds for T {}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestPart {
    Text(String),
    InlineImage { mime_type: String, data: String },
}

/// One `generateContent` call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub model: String,
    pub parts: Vec<RequestPart>,
    /// JSON schema for a structured reply.
    pub response_schema: Option<Value>,
    /// Ask for image output alongside text.
    pub wants_image: bool,
}

impl GenerateRequest {
    pub fn text(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            parts: vec![RequestPart::Text(prompt.into())],
            response_schema: None,
            wants_image: false,
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.response_schema = Some(schema);
        self
    }

    pub fn image(model: impl Into<String>, parts: Vec<RequestPart>) -> Self {
        Self {
            model: model.into(),
            parts,
            response_schema: None,
            wants_image: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateReply {
    pub text: String,
    /// Base64 image payloads in reply order.
    pub images: Vec<String>,
    pub finish_reason: Option<String>,
}

impl GenerateReply {
    pub fn first_image(self) -> Result<String> {
        let reason = self.finish_reason.clone();
        self.images.into_iter().next().ok_or_else(|| match reason.as_deref() {
            Some("SAFETY") | Some("PROHIBITED_CONTENT") | Some("IMAGE_SAFETY") => anyhow::Error::new(
                ForgeError::content_rejected("Image generation was blocked for safety reasons"),
            ),
            _ => anyhow!("The AI did not return an image. Please try a different prompt."),
        })
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait LlmClient: LlmBounds + Debug {
    async fn generate(&self, keys: &ApiKeys, request: GenerateRequest) -> Result<GenerateReply>;

    async fn chat(&self, keys: &ApiKeys, model: &str, prompt: &str) -> Result<String> {
        let reply = self.generate(keys, GenerateRequest::text(model, prompt)).await?;
        Ok(reply.text)
    }
}

// --- Gemini ---

#[derive(Debug)]
pub struct GeminiClient {
    base_url: String,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(config: &GeminiConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, model: &str) -> Result<url::Url> {
        url::Url::parse(&format!("{}/models/{}:generateContent", self.base_url, model))
            .with_context(|| format!("Invalid Gemini endpoint for model {}", model))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<GeminiInlineData>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

#[derive(Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_modalities: Option<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    prompt_feedback: Option<GeminiPromptFeedback>,
    error: Option<GeminiError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    block_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPartResponse {
    text: Option<String>,
    inline_data: Option<GeminiInlineData>,
}

#[derive(Deserialize, Debug)]
struct GeminiError {
    message: String,
    status: Option<String>,
}

fn build_request(request: GenerateRequest) -> GeminiRequest {
    let parts = request
        .parts
        .into_iter()
        .map(|part| match part {
            RequestPart::Text(text) => GeminiPart {
                text: Some(text),
                inline_data: None,
            },
            RequestPart::InlineImage { mime_type, data } => GeminiPart {
                text: None,
                inline_data: Some(GeminiInlineData { mime_type, data }),
            },
        })
        .collect();

    let generation_config = if request.wants_image {
        Some(GeminiGenerationConfig {
            response_modalities: Some(vec!["IMAGE".to_string(), "TEXT".to_string()]),
            ..Default::default()
        })
    } else {
        request.response_schema.map(|schema| GeminiGenerationConfig {
            response_mime_type: Some("application/json".to_string()),
            response_schema: Some(schema),
            ..Default::default()
        })
    };

    GeminiRequest {
        contents: vec![GeminiContent {
            role: "user".to_string(),
            parts,
        }],
        generation_config,
    }
}

/// Turns a response body into a reply, surfacing API errors and safety blocks.
fn parse_response(response_text: &str) -> Result<GenerateReply> {
    let result: GeminiResponse = serde_json::from_str(response_text)
        .map_err(|e| anyhow!("Failed to parse Gemini response: {}. Body: {}", e, response_text))?;

    if let Some(err) = result.error {
        if err.status.as_deref() == Some("RESOURCE_EXHAUSTED") {
            return Err(ForgeError::rate_limited(err.message).into());
        }
        return Err(anyhow!("Gemini API returned error: {}", err.message));
    }

    if let Some(reason) = result.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(ForgeError::content_rejected(format!("prompt blocked: {}", reason)).into());
    }

    let Some(first) = result.candidates.and_then(|c| c.into_iter().next()) else {
        return Err(anyhow!("Gemini response format unexpected or empty. Body: {}", response_text));
    };

    let mut reply = GenerateReply {
        finish_reason: first.finish_reason,
        ..Default::default()
    };
    for part in first.content.map(|c| c.parts).unwrap_or_default() {
        if let Some(text) = part.text {
            reply.text.push_str(&text);
        }
        if let Some(inline) = part.inline_data {
            reply.images.push(inline.data);
        }
    }

    if reply.text.is_empty() && reply.images.is_empty() {
        let reason = reply.finish_reason.as_deref().unwrap_or("UNKNOWN");
        if reason == "SAFETY" {
            return Err(ForgeError::content_rejected("response blocked for SAFETY").into());
        }
        return Err(anyhow!("Gemini response empty. Finish reason: {}", reason));
    }
    Ok(reply)
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl LlmClient for GeminiClient {
    async fn generate(&self, keys: &ApiKeys, request: GenerateRequest) -> Result<GenerateReply> {
        let api_key = keys.gemini()?;
        let url = self.endpoint(&request.model)?;
        log::debug!("Gemini request to {} ({} parts)", request.model, request.parts.len());

        let resp = self
            .client
            .post(url)
            .header("x-goog-api-key", api_key)
            .json(&build_request(request))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            if status.as_u16() == 429 {
                return Err(ForgeError::rate_limited(format!("429: {}", error_text)).into());
            }
            return Err(anyhow!("Gemini API error ({}): {}", status, error_text));
        }

        let response_text = resp.text().await?;
        parse_response(&response_text)
    }
}
