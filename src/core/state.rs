use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Base64-encoded image bytes as returned by the image service.
pub type ImagePayload = String;
pub type RecordId = String;
pub type ImageId = String;
pub type MessageId = String;

/// Opaque, time-ordered, unique id.
pub fn new_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::now_v7())
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtStyle {
    Cartoonish,
    Anime,
    Realistic,
    Steampunk,
    Cyberpunk,
    Fantasy,
    Custom,
}

impl ArtStyle {
    pub const ALL: [ArtStyle; 7] = [
        ArtStyle::Cartoonish,
        ArtStyle::Anime,
        ArtStyle::Realistic,
        ArtStyle::Steampunk,
        ArtStyle::Cyberpunk,
        ArtStyle::Fantasy,
        ArtStyle::Custom,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            ArtStyle::Cartoonish => "Cartoonish",
            ArtStyle::Anime => "Anime",
            ArtStyle::Realistic => "Realistic",
            ArtStyle::Steampunk => "Steampunk",
            ArtStyle::Cyberpunk => "Cyberpunk",
            ArtStyle::Fantasy => "Fantasy",
            ArtStyle::Custom => "Custom",
        }
    }

    /// Case-insensitive lookup by [`ArtStyle::label`].
    pub fn from_label(label: &str) -> Option<ArtStyle> {
        let label = label.trim();
        Self::ALL.into_iter().find(|s| s.label().eq_ignore_ascii_case(label))
    }

    /// Descriptive hint appended to image prompts.
    pub fn prompt_hint(&self) -> &'static str {
        match self {
            ArtStyle::Anime => "vibrant, clean-lined Japanese anime style",
            ArtStyle::Realistic => "photorealistic style, detailed textures",
            ArtStyle::Cartoonish => "playful, exaggerated cartoon style, bold outlines",
            ArtStyle::Steampunk => {
                "Victorian-era science fiction, gears, brass, steam-powered machinery aesthetic"
            }
            ArtStyle::Cyberpunk => "futuristic, neon-lit, dystopian, high-tech low-life aesthetic",
            ArtStyle::Fantasy => {
                "high fantasy, magical elements, medieval, epic style with intricate details"
            }
            ArtStyle::Custom => "the style implied by the description",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UploadedImage {
    pub b64: String,
    pub mime_type: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PromptSpec {
    #[serde(default)]
    pub title: Option<String>,
    pub character_description: String,
    pub scene_description: String,
    pub art_style: ArtStyle,
    #[serde(default)]
    pub reference_image: Option<UploadedImage>,
}

impl PromptSpec {
    pub fn new(
        character_description: impl Into<String>,
        scene_description: impl Into<String>,
        art_style: ArtStyle,
    ) -> Self {
        Self {
            title: None,
            character_description: character_description.into(),
            scene_description: scene_description.into(),
            art_style,
            reference_image: None,
        }
    }

    /// Title shown for the record, falling back to the scene.
    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.scene_description)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ImageOrigin {
    #[default]
    Generator,
    Editor,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ImageAsset {
    pub id: ImageId,
    /// Version 0 is the original; never empty.
    pub version_chain: Vec<ImagePayload>,
    pub character_description: String,
    pub scene_description: String,
    pub art_style: ArtStyle,
    #[serde(default)]
    pub reference_image: Option<UploadedImage>,
    #[serde(default)]
    pub origin: ImageOrigin,
}

impl ImageAsset {
    pub fn from_prompt(payload: ImagePayload, prompt: &PromptSpec) -> Self {
        Self {
            id: new_id("img"),
            version_chain: vec![payload],
            character_description: prompt.character_description.clone(),
            scene_description: prompt.scene_description.clone(),
            art_style: prompt.art_style,
            reference_image: prompt.reference_image.clone(),
            origin: ImageOrigin::Generator,
        }
    }

    pub fn current(&self) -> &str {
        self.version_chain
            .last()
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn original(&self) -> &str {
        self.version_chain
            .first()
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn version_count(&self) -> usize {
        self.version_chain.len()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "state", content = "text", rename_all = "snake_case")]
pub enum OriginStory {
    Generating,
    Written(String),
}

impl OriginStory {
    pub fn text(&self) -> Option<&str> {
        match self {
            OriginStory::Written(text) => Some(text),
            OriginStory::Generating => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Dossier {
    pub callsign: String,
    pub background: String,
    pub abilities: Vec<String>,
    pub weaknesses: Vec<String>,
    pub quote: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_story: Option<OriginStory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_archetype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
}

impl Dossier {
    pub fn written_origin_story(&self) -> Option<&str> {
        self.origin_story.as_ref().and_then(OriginStory::text)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "state", content = "dossier", rename_all = "snake_case")]
pub enum DossierState {
    Generating,
    Ready(Dossier),
}

impl DossierState {
    pub fn ready(&self) -> Option<&Dossier> {
        match self {
            DossierState::Ready(dossier) => Some(dossier),
            DossierState::Generating => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Generating,
    Complete,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HistoryRecord {
    pub id: RecordId,
    pub prompt: PromptSpec,
    pub created_at: DateTime<Utc>,
    pub status: RecordStatus,
    #[serde(default)]
    pub images: Vec<ImageAsset>,
    #[serde(default)]
    pub dossier: Option<DossierState>,
}

impl HistoryRecord {
    pub fn ready_dossier(&self) -> Option<&Dossier> {
        self.dossier.as_ref().and_then(DossierState::ready)
    }

    pub fn is_generating(&self) -> bool {
        self.status == RecordStatus::Generating
    }
}
