use crate::core::config::{ApiKeys, Config};
use anyhow::Result;
use async_trait::async_trait;
use log::info;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub mod elevenlabs;

/// Voice archetypes the text model chooses from, with their ElevenLabs ids.
pub const VOICE_MAP: [(&str, &str); 7] = [
    ("Young Adult Female", "21m00Tcm4TlvDq8ikWAM"),
    ("Young Adult Male", "ErXwobaYiN019P7URALa"),
    ("Middle-Aged Female", "EXAVITQu4vr4xnSDxMaL"),
    ("Middle-Aged Male", "pNInz6obpgDQGcFmaJgB"),
    ("Old Female", "ThT5KcBeYPX3keUQqHPh"),
    ("Old Male", "2EiwWnXFnvU5JabPnv8n"),
    ("Child Female", "jBpfuIE2acCO8z3wKNLl"),
];

pub fn voice_archetypes() -> Vec<&'static str> {
    VOICE_MAP.iter().map(|(name, _)| *name).collect()
}

pub fn voice_id_for(archetype: &str) -> Option<&'static str> {
    VOICE_MAP
        .iter()
        .find(|(name, _)| *name == archetype)
        .map(|(_, id)| *id)
}

/// Synthesized speech, held in memory until the context is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl AudioClip {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(target_arch = "wasm32")]
pub trait TtsBounds {}
#[cfg(target_arch = "wasm32")]
impl<T> TtsBounds for T {}

#[cfg(not(target_arch = "wasm32"))]
pub trait TtsBounds: Send + Sync {}
#[cfg(not(target_arch = "wasm32"))]
impl<T: Send + Sync> TtsBounds for T {}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait SpeechSynthesizer: TtsBounds {
    /// Returns `ForgeError::Cancelled` promptly once `cancel` fires.
    async fn synthesize(
        &self,
        keys: &ApiKeys,
        text: &str,
        voice_id: &str,
        cancel: CancellationToken,
    ) -> Result<AudioClip>;
}

pub fn create_synthesizer(config: &Config) -> Arc<dyn SpeechSynthesizer> {
    info!("Initializing ElevenLabs synthesizer ({})", config.elevenlabs.model_id);
    Arc::new(elevenlabs::ElevenLabsClient::new(config.elevenlabs.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_archetype_has_a_voice() {
        let names = voice_archetypes();
        assert_eq!(names.len(), 7);
        assert_eq!(names[0], "Young Adult Female");
        for name in names {
            assert!(voice_id_for(name).is_some());
        }
        assert_eq!(voice_id_for("Middle-Aged Male"), Some("pNInz6obpgDQGcFmaJgB"));
        assert_eq!(voice_id_for("Deep Male"), None);
    }
}
