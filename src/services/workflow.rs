//! Runs every user action through the task supervisor and applies the result,
//! or the rollback, to the history store and the transcripts.

use crate::core::config::{ApiKeys, Config};
use crate::core::conversation::PendingTurn;
use crate::core::editor::ConversationalEditor;
use crate::core::error::ForgeError;
use crate::core::history::HistoryStore;
use crate::core::io::Storage;
use crate::core::refinement::RefinementSession;
use crate::core::session::{PersistHook, RestoredSession};
use crate::core::state::{
    ArtStyle, HistoryRecord, ImageAsset, ImageOrigin, ImagePayload, OriginStory, PromptSpec, RecordId,
    UploadedImage,
};
use crate::core::supervisor::{TaskGuard, TaskKind, TaskSupervisor};
use crate::services::image::{GeminiImageGenerator, ImageGenerator};
use crate::services::llm::{GeminiClient, LlmClient};
use crate::services::text::{GeminiTextGenerator, TextGenerator};
use crate::services::tts::{self, AudioClip, SpeechSynthesizer};
use log::{info, warn};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Task target for the free-standing conversational editor.
pub const EDITOR_TARGET: &str = "editor";
/// Task target for prompt-composition helpers that have no record yet.
pub const COMPOSER_TARGET: &str = "composer";

const FOIL_PLACEHOLDER_DESCRIPTION: &str = "Generating foil character concept...";
const FOIL_PLACEHOLDER_SCENE: &str = "Compiling narrative connections...";

/// The external collaborators.
#[derive(Clone)]
pub struct Services {
    pub images: Arc<dyn ImageGenerator>,
    pub text: Arc<dyn TextGenerator>,
    pub speech: Arc<dyn SpeechSynthesizer>,
}

impl Services {
    pub fn from_config(config: &Config) -> Self {
        let llm: Arc<dyn LlmClient> = Arc::new(GeminiClient::new(&config.gemini));
        Self {
            images: Arc::new(GeminiImageGenerator::new(
                llm.clone(),
                &config.gemini.image_model,
                &config.generation,
            )),
            text: Arc::new(GeminiTextGenerator::new(llm, &config.gemini.text_model)),
            speech: tts::create_synthesizer(config),
        }
    }
}

#[derive(Debug)]
pub struct GenerationOutcome {
    pub record_id: RecordId,
    /// Set when the images landed but the dossier did not.
    pub dossier_error: Option<ForgeError>,
}

pub struct ForgeWorkflow {
    store: Mutex<HistoryStore>,
    editor: Mutex<ConversationalEditor>,
    supervisor: TaskSupervisor,
    keys: Mutex<ApiKeys>,
    services: Services,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A record begun for a generation. Dropped without [`Speculative::keep`]
/// (failure, or the future itself dropped), the record is removed.
struct Speculative<'a> {
    store: &'a Mutex<HistoryStore>,
    record_id: RecordId,
    armed: bool,
}

impl<'a> Speculative<'a> {
    fn new(store: &'a Mutex<HistoryStore>, record_id: RecordId) -> Self {
        Self {
            store,
            record_id,
            armed: true,
        }
    }

    fn keep(mut self) -> RecordId {
        self.armed = false;
        std::mem::take(&mut self.record_id)
    }
}

impl Drop for Speculative<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock(self.store).fail_generation(&self.record_id);
        }
    }
}

impl ForgeWorkflow {
    pub fn new(services: Services, keys: ApiKeys) -> Self {
        Self {
            store: Mutex::new(HistoryStore::new()),
            editor: Mutex::new(ConversationalEditor::new()),
            supervisor: TaskSupervisor::new(),
            keys: Mutex::new(keys),
            services,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(Services::from_config(config), config.api_keys())
    }

    /// Rehydrates the store and editor, wiring both to `hook`.
    pub fn with_session(mut self, restored: RestoredSession, hook: Option<Arc<dyn PersistHook>>) -> Self {
        info!(
            "Restoring {} records and {} editor messages",
            restored.history.len(),
            restored.editor_transcript.len()
        );
        let mut store = HistoryStore::from_records(restored.history);
        let mut editor = ConversationalEditor::restore(restored.editor_image, restored.editor_transcript);
        if let Some(hook) = hook {
            store = store.with_hook(hook.clone());
            editor = editor.with_hook(hook);
        }
        self.store = Mutex::new(store);
        self.editor = Mutex::new(editor);
        self
    }

    fn store(&self) -> MutexGuard<'_, HistoryStore> {
        lock(&self.store)
    }

    fn editor(&self) -> MutexGuard<'_, ConversationalEditor> {
        lock(&self.editor)
    }

    fn keys(&self) -> ApiKeys {
        lock(&self.keys).clone()
    }

    pub fn set_api_keys(&self, keys: ApiKeys) {
        info!(
            "API keys updated (gemini: {}, elevenlabs: {})",
            keys.gemini.is_some(),
            keys.elevenlabs.is_some()
        );
        *lock(&self.keys) = keys;
    }

    pub fn api_keys(&self) -> ApiKeys {
        self.keys()
    }

    pub fn supervisor(&self) -> &TaskSupervisor {
        &self.supervisor
    }

    pub fn with_store<R>(&self, f: impl FnOnce(&HistoryStore) -> R) -> R {
        f(&self.store())
    }

    pub fn with_editor<R>(&self, f: impl FnOnce(&ConversationalEditor) -> R) -> R {
        f(&self.editor())
    }

    pub fn records(&self) -> Vec<HistoryRecord> {
        self.store().to_snapshot()
    }

    fn record(&self, record_id: &str) -> Result<HistoryRecord, ForgeError> {
        self.store()
            .get(record_id)
            .cloned()
            .ok_or_else(|| ForgeError::contract(format!("unknown record {}", record_id)))
    }

    // --- Generation ---

    pub async fn generate(&self, prompt: PromptSpec, with_dossier: bool) -> Result<GenerationOutcome, ForgeError> {
        if prompt.character_description.trim().is_empty() {
            return Err(ForgeError::contract("a character description is required"));
        }
        let keys = self.keys();
        let record_id = self.store().begin_generation(prompt.clone());
        let pending = Speculative::new(&self.store, record_id.clone());

        let payloads = self
            .supervisor
            .run(&record_id, TaskKind::GenerateBatch, || {
                self.services.images.generate(&keys, &prompt)
            })
            .await?;

        let images = payloads
            .into_iter()
            .map(|payload| ImageAsset::from_prompt(payload, &prompt))
            .collect();
        let completed = self.store().complete_generation(&record_id, images, with_dossier);
        completed?;
        let record_id = pending.keep();
        info!("Generation {} complete", record_id);

        let dossier_error = if with_dossier {
            let task = self.supervisor.start(&record_id, TaskKind::GenerateDossier);
            self.run_dossier(task, &record_id, &prompt.character_description, prompt.art_style)
                .await
                .err()
        } else {
            None
        };
        Ok(GenerationOutcome {
            record_id,
            dossier_error,
        })
    }

    async fn run_dossier(
        &self,
        task: TaskGuard<'_>,
        record_id: &str,
        character: &str,
        style: ArtStyle,
    ) -> Result<(), ForgeError> {
        let keys = self.keys();
        let result = task
            .run(|| self.services.text.generate_dossier(&keys, character, style))
            .await;
        match result {
            Ok(dossier) => {
                self.store().resolve_dossier(record_id, Some(dossier));
                Ok(())
            }
            Err(e) => {
                self.store().resolve_dossier(record_id, None);
                Err(e)
            }
        }
    }

    /// Retries a dossier for a record that has none.
    pub async fn generate_dossier(&self, record_id: &str) -> Result<(), ForgeError> {
        let record = self.record(record_id)?;
        let mut task = self.supervisor.try_start(record_id, TaskKind::GenerateDossier)?;
        self.store().begin_dossier(record_id).map_err(|e| task.fail(e))?;
        self.run_dossier(task, record_id, &record.prompt.character_description, record.prompt.art_style)
            .await
    }

    /// Appends another batch to an existing record. Nothing changes on failure.
    pub async fn generate_variations(&self, record_id: &str) -> Result<usize, ForgeError> {
        let record = self.record(record_id)?;
        if record.is_generating() {
            return Err(ForgeError::contract(format!("record {} is still generating", record_id)));
        }
        let keys = self.keys();
        let prompt = record.prompt;
        let payloads = self
            .supervisor
            .run_exclusive(record_id, TaskKind::GenerateVariations, || {
                self.services.images.generate(&keys, &prompt)
            })
            .await?;

        let count = payloads.len();
        let images = payloads
            .into_iter()
            .map(|payload| ImageAsset::from_prompt(payload, &prompt))
            .collect();
        self.store().append_variations(record_id, images);
        Ok(count)
    }

    /// Foil concept, then its images, as one task on the original. Any
    /// failure, or dropping the call, removes the speculative foil record.
    pub async fn generate_foil(&self, original_id: &str) -> Result<RecordId, ForgeError> {
        let original = self.record(original_id)?;
        if original.ready_dossier().is_none() {
            return Err(ForgeError::contract(
                "Cannot generate a foil character without a complete dossier on the original.",
            ));
        }
        let style = original.prompt.art_style;
        let mut placeholder = PromptSpec::new(FOIL_PLACEHOLDER_DESCRIPTION, FOIL_PLACEHOLDER_SCENE, style);
        placeholder.title = Some(format!("FOIL: {}", original.prompt.display_title()));
        let task = self.supervisor.try_start(original_id, TaskKind::GenerateFoil)?;
        let foil_id = self.store().begin_foil(placeholder);
        let pending = Speculative::new(&self.store, foil_id.clone());

        // The concept stays out of the store until its images exist.
        let keys = self.keys();
        let (keys_ref, original_ref) = (&keys, &original);
        let result = task
            .run(move || async move {
                let concept = self.services.text.generate_foil(keys_ref, original_ref).await?;
                let prompt = PromptSpec::new(
                    concept.character_description.clone(),
                    concept.scene_description.clone(),
                    style,
                );
                let payloads = self.services.images.generate(keys_ref, &prompt).await?;
                let images: Vec<ImageAsset> = payloads
                    .into_iter()
                    .map(|payload| ImageAsset::from_prompt(payload, &prompt))
                    .collect();
                Ok::<_, anyhow::Error>((concept, images))
            })
            .await;

        match result {
            Ok((concept, images)) => {
                let completed = self.store().complete_foil(
                    &foil_id,
                    concept.character_description,
                    concept.scene_description,
                    concept.dossier,
                    images,
                );
                completed?;
                info!("Foil {} created for {}", foil_id, original_id);
                Ok(pending.keep())
            }
            Err(e) => {
                warn!("Failed to generate foil: {}", e);
                Err(e)
            }
        }
    }

    pub async fn generate_origin_story(&self, record_id: &str) -> Result<String, ForgeError> {
        let record = self.record(record_id)?;
        let dossier = record
            .ready_dossier()
            .cloned()
            .ok_or_else(|| ForgeError::contract(format!("record {} has no dossier", record_id)))?;
        if dossier.origin_story == Some(OriginStory::Generating) {
            return Err(ForgeError::contract(format!("origin story for {} already in progress", record_id)));
        }

        let task = self.supervisor.try_start(record_id, TaskKind::GenerateOriginStory)?;
        self.store().set_origin_story(record_id, Some(OriginStory::Generating));
        let keys = self.keys();
        let character = record.prompt.character_description;
        let result = task
            .run(|| self.services.text.generate_origin_story(&keys, &character, &dossier))
            .await;
        match result {
            Ok(story) => {
                self.store()
                    .set_origin_story(record_id, Some(OriginStory::Written(story.clone())));
                Ok(story)
            }
            Err(e) => {
                self.store().set_origin_story(record_id, None);
                Err(e)
            }
        }
    }

    /// Speaks the origin story, choosing and caching a voice first if needed.
    ///
    /// Not busy-checked: a newer request cancels the older one through its
    /// token, and the supervisor lets the newest run own the status.
    pub async fn narrate_origin_story(&self, record_id: &str, cancel: CancellationToken) -> Result<AudioClip, ForgeError> {
        let keys = self.keys();
        keys.elevenlabs()?;
        let record = self.record(record_id)?;
        let dossier = record
            .ready_dossier()
            .cloned()
            .ok_or_else(|| ForgeError::contract(format!("record {} has no dossier", record_id)))?;
        let story = dossier
            .written_origin_story()
            .map(str::to_string)
            .ok_or_else(|| ForgeError::contract(format!("record {} has no origin story to narrate", record_id)))?;

        let voice_id = match dossier.voice_id.clone() {
            Some(voice_id) => voice_id,
            None => {
                let candidates = tts::voice_archetypes();
                let archetype = self
                    .supervisor
                    .run(record_id, TaskKind::SelectVoice, || {
                        self.services
                            .text
                            .select_voice_archetype(&keys, &dossier, &candidates)
                    })
                    .await?;
                let voice_id = tts::voice_id_for(&archetype)
                    .unwrap_or(tts::VOICE_MAP[0].1)
                    .to_string();
                self.store().set_voice(record_id, archetype, voice_id.clone());
                voice_id
            }
        };

        self.supervisor
            .run(record_id, TaskKind::SynthesizeSpeech, || {
                self.services.speech.synthesize(&keys, &story, &voice_id, cancel.clone())
            })
            .await
    }

    pub async fn suggest_scenes(
        &self,
        character: &str,
        style: ArtStyle,
        current_scene: Option<&str>,
    ) -> Result<Vec<String>, ForgeError> {
        if character.trim().is_empty() {
            return Err(ForgeError::contract("a character description is required for suggestions"));
        }
        let keys = self.keys();
        self.supervisor
            .run_exclusive(COMPOSER_TARGET, TaskKind::SuggestScenes, || {
                self.services
                    .text
                    .suggest_scenes(&keys, character, style, current_scene)
            })
            .await
    }

    // --- Records and images ---

    pub fn update_title(&self, record_id: &str, title: &str) {
        self.store().update_title(record_id, title.trim());
    }

    pub fn undo_version(&self, image_id: &str) -> Result<bool, ForgeError> {
        self.store().undo_version(image_id)
    }

    pub fn open_refinement(&self, image_id: &str) -> Result<RefinementSession, ForgeError> {
        let store = self.store();
        let (_, image) = store
            .find_image(image_id)
            .ok_or_else(|| ForgeError::contract(format!("unknown image {}", image_id)))?;
        RefinementSession::open(image)
    }

    /// Applies `instruction` to the session's selected version.
    pub async fn refine(&self, session: &mut RefinementSession, instruction: &str) -> Result<(), ForgeError> {
        if instruction.trim().is_empty() {
            return Err(ForgeError::contract("empty refinement instruction"));
        }
        let image_id = session.image_id().clone();
        let task = self.supervisor.try_start(&image_id, TaskKind::RefineImage)?;
        let turn = session.submit(instruction.trim());
        let context = session.image().clone();
        let keys = self.keys();
        let result = task
            .run(|| {
                self.services
                    .images
                    .refine(&keys, &turn.input_image, &turn.prompt, &context)
            })
            .await;
        match result {
            Ok(payload) => {
                session.resolve_success(&turn, payload);
                Ok(())
            }
            Err(e) => {
                session.resolve_failure(&e);
                Err(e)
            }
        }
    }

    pub fn commit_refinement(&self, session: RefinementSession) -> Result<(), ForgeError> {
        session.commit(&mut self.store())
    }

    /// Writes the current version of an image as a PNG under `folder`.
    pub async fn export_image(&self, storage: &dyn Storage, folder: &str, image_id: &str) -> anyhow::Result<String> {
        let payload = {
            let store = self.store();
            let (_, image) = store
                .find_image(image_id)
                .ok_or_else(|| ForgeError::contract(format!("unknown image {}", image_id)))?;
            image.current().to_string()
        };
        crate::utils::image::export_png(storage, folder, image_id, &payload).await
    }

    // --- Conversational editor ---

    pub fn load_editor_image(&self, image: UploadedImage) -> Result<(), ForgeError> {
        if !image.mime_type.starts_with("image/") {
            return Err(ForgeError::contract(format!("unsupported upload type {}", image.mime_type)));
        }
        self.editor().load_base_image(image);
        Ok(())
    }

    /// Loads a generated image into the editor as its base.
    pub fn send_to_editor(&self, image_id: &str) -> Result<(), ForgeError> {
        let payload = {
            let store = self.store();
            let (_, image) = store
                .find_image(image_id)
                .ok_or_else(|| ForgeError::contract(format!("unknown image {}", image_id)))?;
            image.current().to_string()
        };
        self.editor().load_base_image(UploadedImage {
            b64: payload,
            mime_type: "image/png".to_string(),
        });
        Ok(())
    }

    pub async fn editor_send(&self, text: &str) -> Result<ImagePayload, ForgeError> {
        let mut task = self.supervisor.try_start(EDITOR_TARGET, TaskKind::ConversationalEdit)?;
        let turn = self.editor().send(text).map_err(|e| task.fail(e))?;
        self.run_editor_turn(task, turn).await
    }

    pub async fn editor_quick_action(&self, label: &str) -> Result<ImagePayload, ForgeError> {
        let mut task = self.supervisor.try_start(EDITOR_TARGET, TaskKind::ConversationalEdit)?;
        let turn = self.editor().quick_action(label).map_err(|e| task.fail(e))?;
        self.run_editor_turn(task, turn).await
    }

    /// Rewrites an earlier instruction and reruns it from that point.
    pub async fn editor_edit(&self, message_id: &str, new_text: &str) -> Result<ImagePayload, ForgeError> {
        let mut task = self.supervisor.try_start(EDITOR_TARGET, TaskKind::ConversationalEdit)?;
        let turn = self.editor().edit(message_id, new_text).map_err(|e| task.fail(e))?;
        self.run_editor_turn(task, turn).await
    }

    pub fn editor_start_over(&self) {
        self.editor().start_over();
    }

    async fn run_editor_turn(&self, task: TaskGuard<'_>, turn: PendingTurn) -> Result<ImagePayload, ForgeError> {
        let mime_type = self.editor().mime_type().unwrap_or("image/png").to_string();
        let keys = self.keys();
        let outcome = task
            .run(|| {
                self.services
                    .images
                    .edit(&keys, &turn.input_image, &turn.prompt, &mime_type)
            })
            .await;
        self.editor().resolve(&turn, outcome.clone());
        outcome
    }

    /// Saves an editor result into history as a record of its own.
    pub fn save_editor_result(&self, description: &str) -> Result<RecordId, ForgeError> {
        let payload = self
            .editor()
            .current_image()
            .map(str::to_string)
            .ok_or_else(|| ForgeError::contract("no editor image to save"))?;
        let prompt = PromptSpec::new(description, "Conversational edit", ArtStyle::Custom);
        let mut image = ImageAsset::from_prompt(payload, &prompt);
        image.origin = ImageOrigin::Editor;
        let mut store = self.store();
        let record_id = store.begin_generation(prompt);
        store.complete_generation(&record_id, vec![image], false)?;
        Ok(record_id)
    }
}
