use super::{AudioClip, SpeechSynthesizer};
use crate::core::config::{ApiKeys, ElevenLabsConfig};
use crate::core::error::ForgeError;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::future::{select, Either};
use futures_util::StreamExt;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::pin::pin;
use tokio_util::sync::CancellationToken;

const FREE_TIER_BLOCKED: &str = "ElevenLabs Free Tier usage was blocked due to potential VPN/proxy use or other \
     limitations. Please check your ElevenLabs account or consider a paid plan.";

#[derive(Debug)]
pub struct ElevenLabsClient {
    config: ElevenLabsConfig,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: VoiceSettings,
}

#[derive(Serialize)]
struct VoiceSettings {
    stability: f32,
    similarity_boost: f32,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    detail: Option<ErrorDetail>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorDetail {
    Structured { message: Option<String> },
    Plain(String),
}

/// Extracts `detail.message` from an error body, else the status text.
fn error_message(body: &str, status_text: &str) -> String {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    match parsed.detail {
        Some(ErrorDetail::Structured { message: Some(message) }) => message,
        Some(ErrorDetail::Plain(message)) => message,
        _ => status_text.to_string(),
    }
}

fn classify_failure(status: u16, message: String) -> anyhow::Error {
    if message.contains("Unusual activity detected") || message.contains("Free Tier usage disabled") {
        return anyhow::Error::new(ForgeError::external(FREE_TIER_BLOCKED));
    }
    if status == 429 {
        return anyhow::Error::new(ForgeError::rate_limited(message));
    }
    anyhow!("ElevenLabs API Error: {}", message)
}

impl ElevenLabsClient {
    pub fn new(config: ElevenLabsConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, voice_id: &str) -> Result<url::Url> {
        let base = format!("{}/", self.config.base_url.trim_end_matches('/'));
        url::Url::parse(&base)
            .and_then(|base| base.join(&format!("text-to-speech/{}", voice_id)))
            .with_context(|| format!("Invalid ElevenLabs endpoint for voice {}", voice_id))
    }

    async fn fetch(&self, api_key: &str, text: &str, voice_id: &str, cancel: &CancellationToken) -> Result<AudioClip> {
        let body = SpeechRequest {
            text,
            model_id: &self.config.model_id,
            voice_settings: VoiceSettings {
                stability: self.config.stability,
                similarity_boost: self.config.similarity_boost,
            },
        };
        let send = self
            .client
            .post(self.endpoint(voice_id)?)
            .header("Accept", "audio/mpeg")
            .header("xi-api-key", api_key)
            .json(&body)
            .send();

        let resp = match select(pin!(cancel.cancelled()), pin!(send)).await {
            Either::Left(_) => return Err(ForgeError::Cancelled.into()),
            Either::Right((resp, _)) => resp.context("Failed to reach ElevenLabs")?,
        };

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = error_message(&text, status.canonical_reason().unwrap_or("Unknown error occurred"));
            return Err(classify_failure(status.as_u16(), message));
        }

        let mime_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("audio/mpeg")
            .to_string();

        let mut bytes = Vec::new();
        let mut stream = pin!(resp.bytes_stream());
        loop {
            let next = match select(pin!(cancel.cancelled()), stream.next()).await {
                Either::Left(_) => return Err(ForgeError::Cancelled.into()),
                Either::Right((next, _)) => next,
            };
            match next {
                Some(chunk) => bytes.extend_from_slice(&chunk.context("Audio stream error")?),
                None => break,
            }
        }
        Ok(AudioClip { bytes, mime_type })
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl SpeechSynthesizer for ElevenLabsClient {
    async fn synthesize(
        &self,
        keys: &ApiKeys,
        text: &str,
        voice_id: &str,
        cancel: CancellationToken,
    ) -> Result<AudioClip> {
        let api_key = keys.elevenlabs()?;
        if cancel.is_cancelled() {
            return Err(ForgeError::Cancelled.into());
        }
        debug!("Synthesizing {} chars with voice {}", text.len(), voice_id);
        match self.fetch(api_key, text, voice_id, &cancel).await {
            Ok(clip) => {
                debug!("Received {} bytes of {}", clip.len(), clip.mime_type);
                Ok(clip)
            }
            Err(e) if matches!(e.downcast_ref::<ForgeError>(), Some(ForgeError::Cancelled)) => {
                info!("Speech generation request was cancelled");
                Err(e)
            }
            Err(e) => Err(e.context("Failed to generate speech")),
        }
    }
}
