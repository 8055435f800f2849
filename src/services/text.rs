//! Structured text generation on top of [`LlmClient`].
//!
//! Structured replies are requested with a response schema, parsed into
//! typed wire structs and then validated, so a reply with the wrong shape
//! surfaces as [`ValidationError`] rather than as a network failure.

use crate::core::config::ApiKeys;
use crate::core::error::ValidationError;
use crate::core::state::{ArtStyle, Dossier, HistoryRecord};
use crate::services::llm::{GenerateRequest, LlmBounds, LlmClient};
use crate::utils::json::parse_model_json;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::warn;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub const MAX_SCENE_SUGGESTIONS: usize = 3;

/// Concept for a companion, rival or nemesis of an existing character.
#[derive(Debug, Clone, PartialEq)]
pub struct FoilConcept {
    pub character_description: String,
    pub scene_description: String,
    pub dossier: Dossier,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait TextGenerator: LlmBounds {
    async fn generate_dossier(&self, keys: &ApiKeys, character: &str, style: ArtStyle) -> Result<Dossier>;

    async fn generate_origin_story(&self, keys: &ApiKeys, character: &str, dossier: &Dossier) -> Result<String>;

    async fn generate_foil(&self, keys: &ApiKeys, original: &HistoryRecord) -> Result<FoilConcept>;

    /// Picks one of `candidates`; falls back to the first on an unmatched reply.
    async fn select_voice_archetype(&self, keys: &ApiKeys, dossier: &Dossier, candidates: &[&str]) -> Result<String>;

    async fn suggest_scenes(
        &self,
        keys: &ApiKeys,
        character: &str,
        style: ArtStyle,
        current_scene: Option<&str>,
    ) -> Result<Vec<String>>;
}

#[derive(Deserialize, Debug)]
struct DossierWire {
    #[serde(default)]
    callsign: String,
    #[serde(default)]
    background: String,
    #[serde(default)]
    abilities: Vec<String>,
    #[serde(default)]
    weaknesses: Vec<String>,
    #[serde(default)]
    quote: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct FoilWire {
    #[serde(default, alias = "character_description")]
    character_desc: String,
    #[serde(default)]
    scene: String,
    dossier: Option<DossierWire>,
}

#[derive(Deserialize, Debug)]
struct SuggestionsWire {
    #[serde(default)]
    suggestions: Vec<String>,
}

fn require_text(field: &str, value: String) -> Result<String, ValidationError> {
    let value = value.trim().to_string();
    if value.is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }
    Ok(value)
}

fn require_list(field: &str, values: Vec<String>) -> Result<Vec<String>, ValidationError> {
    let values: Vec<String> = values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    if values.is_empty() {
        return Err(ValidationError::new(field, "must contain at least one entry"));
    }
    Ok(values)
}

fn validate_wire(wire: DossierWire) -> Result<Dossier, ValidationError> {
    Ok(Dossier {
        callsign: require_text("callsign", wire.callsign)?,
        background: require_text("background", wire.background)?,
        abilities: require_list("abilities", wire.abilities)?,
        weaknesses: require_list("weaknesses", wire.weaknesses)?,
        quote: require_text("quote", wire.quote)?,
        origin_story: None,
        voice_archetype: None,
        voice_id: None,
    })
}

/// Validates a dossier reply. Every field is required and non-empty.
pub fn validate_dossier(reply: &str) -> Result<Dossier, ValidationError> {
    let wire: DossierWire = parse_model_json(reply).map_err(|e| ValidationError::new("dossier", format!("{:#}", e)))?;
    validate_wire(wire)
}

fn validate_foil(reply: &str) -> Result<FoilConcept, ValidationError> {
    let wire: FoilWire = parse_model_json(reply).map_err(|e| ValidationError::new("foil", format!("{:#}", e)))?;
    let dossier = wire
        .dossier
        .ok_or_else(|| ValidationError::new("dossier", "missing"))?;
    Ok(FoilConcept {
        character_description: require_text("characterDesc", wire.character_desc)?,
        scene_description: require_text("scene", wire.scene)?,
        dossier: validate_wire(dossier)?,
    })
}

fn validate_suggestions(reply: &str) -> Result<Vec<String>, ValidationError> {
    let wire: SuggestionsWire =
        parse_model_json(reply).map_err(|e| ValidationError::new("suggestions", format!("{:#}", e)))?;
    let mut suggestions = require_list("suggestions", wire.suggestions)?;
    suggestions.truncate(MAX_SCENE_SUGGESTIONS);
    Ok(suggestions)
}

/// Matches a free-text voice reply against the candidates.
pub fn match_voice_archetype(reply: &str, candidates: &[&str]) -> Option<String> {
    let cleaned: String = reply.chars().filter(|c| *c != '.' && *c != ',').collect();
    let cleaned = cleaned.trim().trim_matches('"').trim();
    candidates
        .iter()
        .find(|candidate| candidate.eq_ignore_ascii_case(cleaned))
        .map(|candidate| candidate.to_string())
}

fn dossier_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "callsign": { "type": "STRING", "description": "A cool code name or callsign for the character." },
            "background": { "type": "STRING", "description": "A brief, one or two sentence background story." },
            "abilities": { "type": "ARRAY", "items": { "type": "STRING" }, "description": "A list of 3 to 4 key skills or powers." },
            "weaknesses": { "type": "ARRAY", "items": { "type": "STRING" }, "description": "A list of 1 to 2 weaknesses or flaws." },
            "quote": { "type": "STRING", "description": "A short, memorable quote from the character." }
        },
        "required": ["callsign", "background", "abilities", "weaknesses", "quote"]
    })
}

fn foil_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "characterDesc": { "type": "STRING", "description": "A detailed description of the new foil character." },
            "scene": { "type": "STRING", "description": "A scene, outfit or action for the foil character." },
            "dossier": dossier_schema()
        },
        "required": ["characterDesc", "scene", "dossier"]
    })
}

fn suggestions_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "suggestions": {
                "type": "ARRAY",
                "items": { "type": "STRING", "description": "A single scene/outfit/action suggestion." }
            }
        },
        "required": ["suggestions"]
    })
}

#[derive(Debug)]
pub struct GeminiTextGenerator {
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl GeminiTextGenerator {
    pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
        }
    }

    async fn structured(&self, keys: &ApiKeys, prompt: String, schema: Value) -> Result<String> {
        let request = GenerateRequest::text(&self.model, prompt).with_schema(schema);
        Ok(self.llm.generate(keys, request).await?.text)
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl TextGenerator for GeminiTextGenerator {
    async fn generate_dossier(&self, keys: &ApiKeys, character: &str, style: ArtStyle) -> Result<Dossier> {
        let prompt = format!(
            "Based on this character description: \"{}\" within a \"{}\" world, generate a classified dossier file. \
             The dossier should contain a callsign, a short background, a list of 3-4 key abilities, \
             a list of 1-2 weaknesses, and a memorable quote.",
            character,
            style.label()
        );
        let reply = self
            .structured(keys, prompt, dossier_schema())
            .await
            .context("Failed to generate character dossier")?;
        Ok(validate_dossier(&reply)?)
    }

    async fn generate_origin_story(&self, keys: &ApiKeys, character: &str, dossier: &Dossier) -> Result<String> {
        let prompt = format!(
            "Write a compelling, single-paragraph origin story for the following character.\n\
             - Character Description: {}\n\
             - Callsign: {}\n\
             - Background Summary: {}\n\
             - Key Abilities: {}\n\
             - Weaknesses: {}\n\
             - Quote: \"{}\"\n\
             The origin story should be concise, evocative, and expand upon these details.",
            character,
            dossier.callsign,
            dossier.background,
            dossier.abilities.join(", "),
            dossier.weaknesses.join(", "),
            dossier.quote
        );
        let story = self
            .llm
            .chat(keys, &self.model, &prompt)
            .await
            .context("Failed to generate origin story")?;
        Ok(require_text("origin_story", story)?)
    }

    async fn generate_foil(&self, keys: &ApiKeys, original: &HistoryRecord) -> Result<FoilConcept> {
        let dossier_json = match original.ready_dossier() {
            Some(dossier) => serde_json::to_string_pretty(dossier)?,
            None => "null".to_string(),
        };
        let prompt = format!(
            "Based on the provided original character, create a \"foil\" character for them. \
             A foil can be a companion, a rival, or a nemesis. The foil character must be distinct \
             but thematically connected to the original.\n\
             Original Character Details:\n\
             - Description: {}\n\
             - Scene: {}\n\
             - Art Style: {}\n\
             - Dossier: {}\n\
             Generate a new character description, a scene they would be in, and a full dossier for this foil character.",
            original.prompt.character_description,
            original.prompt.scene_description,
            original.prompt.art_style.label(),
            dossier_json
        );
        let reply = self
            .structured(keys, prompt, foil_schema())
            .await
            .context("Failed to generate foil character")?;
        Ok(validate_foil(&reply)?)
    }

    async fn select_voice_archetype(&self, keys: &ApiKeys, dossier: &Dossier, candidates: &[&str]) -> Result<String> {
        let Some(fallback) = candidates.first() else {
            return Err(anyhow::Error::new(ValidationError::new("candidates", "must not be empty")));
        };
        let prompt = format!(
            "Analyze the following character dossier and choose the most fitting voice archetype from the provided list.\n\
             Respond with ONLY the name of the chosen archetype.\n\n\
             Character Dossier:\n\
             - Callsign: {}\n\
             - Background: {}\n\
             - Abilities: {}\n\
             - Quote: \"{}\"\n\n\
             Available Voice Archetypes:\n{}\n\n\
             Chosen Archetype:",
            dossier.callsign,
            dossier.background,
            dossier.abilities.join(", "),
            dossier.quote,
            candidates.join("\n")
        );
        let reply = self
            .llm
            .chat(keys, &self.model, &prompt)
            .await
            .context("Failed to select a voice")?;
        Ok(match match_voice_archetype(&reply, candidates) {
            Some(archetype) => archetype,
            None => {
                warn!("Unexpected voice archetype {:?}, falling back to {}", reply.trim(), fallback);
                fallback.to_string()
            }
        })
    }

    async fn suggest_scenes(
        &self,
        keys: &ApiKeys,
        character: &str,
        style: ArtStyle,
        current_scene: Option<&str>,
    ) -> Result<Vec<String>> {
        let prompt = match current_scene.map(str::trim).filter(|s| !s.is_empty()) {
            Some(scene) => format!(
                "A user is creating a character.\n\
                 - Character Description: \"{}\"\n\
                 - Art Style: \"{}\"\n\
                 - Their current idea for a scene/outfit/action is: \"{}\"\n\
                 Based on all this information, generate 3 short, creative, and distinct suggestions that build upon \
                 or offer cool alternatives to their current idea. The suggestions should be concise and inspiring.",
                character,
                style.label(),
                scene
            ),
            None => format!(
                "Based on this character description: \"{}\" and the art style \"{}\", generate 3 short, creative, \
                 and distinct suggestions for a scene, outfit, or action. The suggestions should be concise and inspiring.",
                character,
                style.label()
            ),
        };
        let reply = self
            .structured(keys, prompt, suggestions_schema())
            .await
            .context("Failed to get scene suggestions")?;
        Ok(validate_suggestions(&reply)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{ErrorKind, ForgeError};
    use crate::core::state::{PromptSpec, RecordStatus};
    use crate::services::llm::tests::MockLlm;
    use chrono::Utc;

    const DOSSIER_JSON: &str = r#"{
        "callsign": "Nightjar",
        "background": "A scout raised on the rooftops.",
        "abilities": ["Stealth", "Grappling"],
        "weaknesses": ["Vertigo"],
        "quote": "Eyes up."
    }"#;

    fn keys() -> ApiKeys {
        ApiKeys {
            gemini: Some("test".to_string()),
            elevenlabs: None,
        }
    }

    fn generator(mock: Arc<MockLlm>) -> GeminiTextGenerator {
        GeminiTextGenerator::new(mock, "gemini-2.5-flash")
    }

    fn sample_dossier() -> Dossier {
        validate_dossier(DOSSIER_JSON).unwrap()
    }

    #[test]
    fn test_validate_dossier_rejects_empty_fields() {
        let err = validate_dossier(r#"{"callsign": "", "background": "b", "abilities": ["a"], "weaknesses": ["w"], "quote": "q"}"#)
            .unwrap_err();
        assert_eq!(err.field, "callsign");

        let err = validate_dossier(r#"{"callsign": "c", "background": "b", "abilities": [" "], "weaknesses": ["w"], "quote": "q"}"#)
            .unwrap_err();
        assert_eq!(err.field, "abilities");

        let err = validate_dossier("not json at all").unwrap_err();
        assert_eq!(err.field, "dossier");
    }

    #[test]
    fn test_voice_matching() {
        let candidates = ["Young Adult Female", "Old Male"];
        assert_eq!(match_voice_archetype("Old Male.", &candidates).as_deref(), Some("Old Male"));
        assert_eq!(match_voice_archetype(" \"old male\"\n", &candidates).as_deref(), Some("Old Male"));
        assert_eq!(match_voice_archetype("Deep Robot", &candidates), None);
    }

    #[tokio::test]
    async fn test_generate_dossier_sends_schema() {
        let mock = Arc::new(MockLlm::with_texts(&[DOSSIER_JSON]));
        let dossier = generator(mock.clone())
            .generate_dossier(&keys(), "rooftop scout", ArtStyle::Cyberpunk)
            .await
            .unwrap();
        assert_eq!(dossier.callsign, "Nightjar");
        assert!(dossier.origin_story.is_none());

        let requests = mock.requests.lock().unwrap();
        assert!(requests[0].response_schema.is_some());
        assert!(!requests[0].wants_image);
    }

    #[tokio::test]
    async fn test_invalid_dossier_is_invalid_response() {
        let mock = Arc::new(MockLlm::with_texts(&[r#"{"callsign": "X"}"#]));
        let err = generator(mock)
            .generate_dossier(&keys(), "x", ArtStyle::Anime)
            .await
            .unwrap_err();
        assert_eq!(ForgeError::classify(&err).kind(), ErrorKind::InvalidResponse);
    }

    #[tokio::test]
    async fn test_voice_selection_falls_back_to_first() {
        let mock = Arc::new(MockLlm::with_texts(&["Gravelly Pirate", "Old Male."]));
        let text = generator(mock);
        let candidates = ["Young Adult Female", "Old Male"];

        let chosen = text
            .select_voice_archetype(&keys(), &sample_dossier(), &candidates)
            .await
            .unwrap();
        assert_eq!(chosen, "Young Adult Female");

        let chosen = text
            .select_voice_archetype(&keys(), &sample_dossier(), &candidates)
            .await
            .unwrap();
        assert_eq!(chosen, "Old Male");
    }

    #[tokio::test]
    async fn test_suggest_scenes_caps_at_three() {
        let mock = Arc::new(MockLlm::with_texts(&[
            r#"```json
{"suggestions": ["a", "b", "c", "d"]}
```"#,
        ]));
        let scenes = generator(mock.clone())
            .suggest_scenes(&keys(), "knight", ArtStyle::Fantasy, Some("  "))
            .await
            .unwrap();
        assert_eq!(scenes, vec!["a", "b", "c"]);

        let requests = mock.requests.lock().unwrap();
        let crate::services::llm::RequestPart::Text(prompt) = &requests[0].parts[0] else {
            panic!("expected a text part");
        };
        assert!(!prompt.contains("current idea"));
    }

    #[tokio::test]
    async fn test_generate_foil() {
        let foil_json = format!(
            r#"{{"characterDesc": "a rival courier", "scene": "racing across rooftops", "dossier": {}}}"#,
            DOSSIER_JSON
        );
        let mock = Arc::new(MockLlm::with_texts(&[foil_json.as_str()]));
        let original = HistoryRecord {
            id: "hist-1".to_string(),
            prompt: PromptSpec::new("rooftop scout", "at dusk", ArtStyle::Anime),
            created_at: Utc::now(),
            status: RecordStatus::Complete,
            images: vec![],
            dossier: Some(crate::core::state::DossierState::Ready(sample_dossier())),
        };
        let foil = generator(mock).generate_foil(&keys(), &original).await.unwrap();
        assert_eq!(foil.character_description, "a rival courier");
        assert_eq!(foil.dossier.callsign, "Nightjar");
    }

    #[tokio::test]
    async fn test_upstream_error_keeps_context() {
        let mock = Arc::new(MockLlm::default());
        mock.push_error("HTTP 429 RESOURCE_EXHAUSTED");
        let err = generator(mock)
            .generate_origin_story(&keys(), "x", &sample_dossier())
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).starts_with("Failed to generate origin story"));
        assert_eq!(ForgeError::classify(&err).kind(), ErrorKind::RateLimited);
    }
}
