use crate::core::config::{ApiKeys, GenerationConfig};
use crate::core::state::{ImageAsset, ImagePayload, PromptSpec};
use crate::services::llm::{GenerateRequest, LlmBounds, LlmClient, RequestPart};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use std::sync::Arc;
use std::time::Duration;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait ImageGenerator: LlmBounds {
    /// One batch of images for `prompt`, requested one after another.
    async fn generate(&self, keys: &ApiKeys, prompt: &PromptSpec) -> Result<Vec<ImagePayload>>;

    async fn refine(
        &self,
        keys: &ApiKeys,
        base: &str,
        instruction: &str,
        context: &ImageAsset,
    ) -> Result<ImagePayload>;

    async fn edit(&self, keys: &ApiKeys, base: &str, instruction: &str, mime_type: &str) -> Result<ImagePayload>;
}

#[derive(Debug)]
pub struct GeminiImageGenerator {
    llm: Arc<dyn LlmClient>,
    model: String,
    images_per_request: usize,
    spacing: Duration,
}

impl GeminiImageGenerator {
    pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>, generation: &GenerationConfig) -> Self {
        Self {
            llm,
            model: model.into(),
            images_per_request: generation.images_per_request.max(1),
            spacing: Duration::from_millis(generation.request_spacing_ms),
        }
    }

    async fn request_image(&self, keys: &ApiKeys, parts: Vec<RequestPart>) -> Result<ImagePayload> {
        let reply = self
            .llm
            .generate(keys, GenerateRequest::image(&self.model, parts))
            .await?;
        reply.first_image()
    }

    async fn pause(&self) {
        if self.spacing.is_zero() {
            return;
        }
        #[cfg(not(target_arch = "wasm32"))]
        tokio::time::sleep(self.spacing).await;
        #[cfg(target_arch = "wasm32")]
        debug!("No timer on wasm32, skipping {:?} spacing", self.spacing);
    }
}

fn generation_prompt(prompt: &PromptSpec) -> String {
    let style = prompt.art_style.prompt_hint();
    if prompt.reference_image.is_some() {
        format!(
            "Using the provided image as a strong visual reference, generate a new image. Maintain the core \
             identity, pose, and style of the reference, but apply these specific modifications:\n\
             - Context: {}\n\
             - Modifications (Scene/Outfit/Action): {}\n\
             - Desired Art Style: {}\n\
             - Important: The output must be a clean image with no text, watermarks, or borders.",
            prompt.character_description, prompt.scene_description, style
        )
    } else {
        format!(
            "Generate an image based on the following details.\n\
             - Character Description: {}\n\
             - Scene/Action: {}\n\
             - Art Style: {}\n\
             - Important: The image must be clean, with no text, watermarks, or borders. \
             The character is the main subject. The aspect ratio should be 4:3.",
            prompt.character_description, prompt.scene_description, style
        )
    }
}

fn edit_prompt(instruction: &str, subject: &str) -> String {
    format!(
        "Using the provided image as a direct visual base, apply the following modification: \"{}\". \
         Maintain the original {} and art style as much as possible. \
         The output must be a clean image with no text, watermarks, or borders.",
        instruction, subject
    )
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl ImageGenerator for GeminiImageGenerator {
    async fn generate(&self, keys: &ApiKeys, prompt: &PromptSpec) -> Result<Vec<ImagePayload>> {
        let mut parts = Vec::with_capacity(2);
        if let Some(reference) = &prompt.reference_image {
            parts.push(RequestPart::InlineImage {
                mime_type: reference.mime_type.clone(),
                data: reference.b64.clone(),
            });
        }
        parts.push(RequestPart::Text(generation_prompt(prompt)));

        let mut images = Vec::with_capacity(self.images_per_request);
        for index in 0..self.images_per_request {
            if index > 0 {
                self.pause().await;
            }
            let image = self
                .request_image(keys, parts.clone())
                .await
                .context("Failed to generate character image")?;
            debug!("Generated image {}/{}", index + 1, self.images_per_request);
            images.push(image);
        }
        Ok(images)
    }

    async fn refine(
        &self,
        keys: &ApiKeys,
        base: &str,
        instruction: &str,
        context: &ImageAsset,
    ) -> Result<ImagePayload> {
        debug!("Refining image {} ({} versions)", context.id, context.version_count());
        let parts = vec![
            RequestPart::InlineImage {
                mime_type: "image/png".to_string(),
                data: base.to_string(),
            },
            RequestPart::Text(edit_prompt(instruction, "character")),
        ];
        self.request_image(keys, parts).await.context("Failed to refine image")
    }

    async fn edit(&self, keys: &ApiKeys, base: &str, instruction: &str, mime_type: &str) -> Result<ImagePayload> {
        let parts = vec![
            RequestPart::InlineImage {
                mime_type: mime_type.to_string(),
                data: base.to_string(),
            },
            RequestPart::Text(format!(
                "{} Follow the instruction even where it departs from the original.",
                edit_prompt(instruction, "subject")
            )),
        ];
        self.request_image(keys, parts).await.context("Failed to edit image")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{ErrorKind, ForgeError};
    use crate::core::state::{ArtStyle, UploadedImage};
    use crate::services::llm::tests::MockLlm;

    fn keys() -> ApiKeys {
        ApiKeys {
            gemini: Some("test".to_string()),
            elevenlabs: None,
        }
    }

    fn generator(mock: Arc<MockLlm>) -> GeminiImageGenerator {
        let generation = GenerationConfig {
            images_per_request: 2,
            request_spacing_ms: 0,
        };
        GeminiImageGenerator::new(mock, "gemini-2.5-flash-image-preview", &generation)
    }

    #[tokio::test]
    async fn test_generate_requests_sequential_batch() {
        let mock = Arc::new(MockLlm::default());
        mock.push_image("A");
        mock.push_image("B");
        let prompt = PromptSpec::new("knight", "at dawn", ArtStyle::Fantasy);

        let images = generator(mock.clone()).generate(&keys(), &prompt).await.unwrap();
        assert_eq!(images, vec!["A", "B"]);
        assert_eq!(mock.request_count(), 2);
        assert!(mock.requests.lock().unwrap().iter().all(|r| r.wants_image));
    }

    #[tokio::test]
    async fn test_reference_image_is_sent_first() {
        let mock = Arc::new(MockLlm::default());
        mock.push_image("A");
        mock.push_image("B");
        let mut prompt = PromptSpec::new("knight", "in a cape", ArtStyle::Anime);
        prompt.reference_image = Some(UploadedImage {
            b64: "REF".to_string(),
            mime_type: "image/jpeg".to_string(),
        });

        generator(mock.clone()).generate(&keys(), &prompt).await.unwrap();
        let requests = mock.requests.lock().unwrap();
        assert_eq!(
            requests[0].parts[0],
            RequestPart::InlineImage {
                mime_type: "image/jpeg".to_string(),
                data: "REF".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_second_call_failure_fails_batch() {
        let mock = Arc::new(MockLlm::default());
        mock.push_image("A");
        mock.push_error("429 RESOURCE_EXHAUSTED");
        let prompt = PromptSpec::new("knight", "at dawn", ArtStyle::Fantasy);

        let err = generator(mock).generate(&keys(), &prompt).await.unwrap_err();
        assert_eq!(ForgeError::classify(&err).kind(), ErrorKind::RateLimited);
    }

    #[tokio::test]
    async fn test_edit_uses_given_mime_type() {
        let mock = Arc::new(MockLlm::default());
        mock.push_image("EDITED");
        let out = generator(mock.clone())
            .edit(&keys(), "BASE", "make it night", "image/webp")
            .await
            .unwrap();
        assert_eq!(out, "EDITED");
        let requests = mock.requests.lock().unwrap();
        let RequestPart::InlineImage { mime_type, .. } = &requests[0].parts[0] else {
            panic!("expected the base image first");
        };
        assert_eq!(mime_type, "image/webp");
    }
}
