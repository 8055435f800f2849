use crate::core::error::{ForgeError, Service};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const CONFIG_FILE: &str = "config.yml";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub gemini: GeminiConfig,

    #[serde(default)]
    pub elevenlabs: ElevenLabsConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    /// Storage prefix the session keys are written under.
    #[serde(default = "default_session_folder")]
    pub session_folder: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gemini: GeminiConfig::default(),
            elevenlabs: ElevenLabsConfig::default(),
            generation: GenerationConfig::default(),
            session_folder: default_session_folder(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeminiConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_text_model")]
    pub text_model: String,
    #[serde(default = "default_image_model")]
    pub image_model: String,
    #[serde(default = "default_gemini_url")]
    pub base_url: String,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            text_model: default_text_model(),
            image_model: default_image_model(),
            base_url: default_gemini_url(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ElevenLabsConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_tts_model")]
    pub model_id: String,
    #[serde(default = "default_stability")]
    pub stability: f32,
    #[serde(default = "default_similarity_boost")]
    pub similarity_boost: f32,
    #[serde(default = "default_elevenlabs_url")]
    pub base_url: String,
}

impl Default for ElevenLabsConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model_id: default_tts_model(),
            stability: default_stability(),
            similarity_boost: default_similarity_boost(),
            base_url: default_elevenlabs_url(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_images_per_request")]
    pub images_per_request: usize,
    /// Pause between sequential image requests.
    #[serde(default = "default_request_spacing_ms")]
    pub request_spacing_ms: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            images_per_request: default_images_per_request(),
            request_spacing_ms: default_request_spacing_ms(),
        }
    }
}

fn default_session_folder() -> String {
    "session".to_string()
}
fn default_text_model() -> String {
    "gemini-2.5-flash".to_string()
}
fn default_image_model() -> String {
    "gemini-2.5-flash-image-preview".to_string()
}
fn default_gemini_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}
fn default_tts_model() -> String {
    "eleven_monolingual_v1".to_string()
}
fn default_stability() -> f32 {
    0.5
}
fn default_similarity_boost() -> f32 {
    0.75
}
fn default_elevenlabs_url() -> String {
    "https://api.elevenlabs.io/v1".to_string()
}
fn default_images_per_request() -> usize {
    2
}
fn default_request_spacing_ms() -> u64 {
    250
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl Config {
    /// Reads `config.yml` when present, otherwise starts from defaults.
    /// API keys from the environment take precedence over the file.
    pub fn load() -> Result<Self> {
        let path = Path::new(CONFIG_FILE);
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).context("Failed to read config.yml")?;
            Self::from_yaml(&content)?
        } else {
            log::info!("config.yml not found, using defaults");
            Config::default()
        };
        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml_ng::from_str(content).context("Failed to parse config.yml")
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        std::fs::write(CONFIG_FILE, content).context("Failed to write config.yml")?;
        Ok(())
    }

    /// `GEMINI_API_KEY` wins over `API_KEY`; both win over the file.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = non_empty(lookup("GEMINI_API_KEY")).or_else(|| non_empty(lookup("API_KEY"))) {
            self.gemini.api_key = Some(key);
        }
        if let Some(key) = non_empty(lookup("ELEVENLABS_API_KEY")) {
            self.elevenlabs.api_key = Some(key);
        }
    }

    pub fn api_keys(&self) -> ApiKeys {
        ApiKeys {
            gemini: non_empty(self.gemini.api_key.clone()),
            elevenlabs: non_empty(self.elevenlabs.api_key.clone()),
        }
    }
}

/// Credentials handed to the service clients on every call.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ApiKeys {
    pub gemini: Option<String>,
    pub elevenlabs: Option<String>,
}

impl std::fmt::Debug for ApiKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeys")
            .field("gemini", &self.gemini.as_ref().map(|_| "***"))
            .field("elevenlabs", &self.elevenlabs.as_ref().map(|_| "***"))
            .finish()
    }
}

impl ApiKeys {
    pub fn gemini(&self) -> Result<&str, ForgeError> {
        self.gemini
            .as_deref()
            .ok_or_else(|| ForgeError::missing_credential(Service::Gemini))
    }

    pub fn elevenlabs(&self) -> Result<&str, ForgeError> {
        self.elevenlabs
            .as_deref()
            .ok_or_else(|| ForgeError::missing_credential(Service::ElevenLabs))
    }
}
