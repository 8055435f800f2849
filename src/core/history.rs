//! Ordered collection of generation records, newest first.
//!
//! Every mutation is synchronous and either fully applies or leaves the store
//! untouched. Committed mutations are forwarded to the persist hook.

use crate::core::error::ForgeError;
use crate::core::session::{persist_json, PersistHook, HISTORY_KEY};
use crate::core::state::{
    new_id, Dossier, DossierState, HistoryRecord, ImageAsset, ImagePayload, OriginStory,
    PromptSpec, RecordId, RecordStatus,
};
use chrono::Utc;
use log::debug;
use std::sync::Arc;

#[derive(Default)]
pub struct HistoryStore {
    records: Vec<HistoryRecord>,
    hook: Option<Arc<dyn PersistHook>>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded from an already-sanitized snapshot.
    pub fn from_records(records: Vec<HistoryRecord>) -> Self {
        Self {
            records,
            hook: None,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn PersistHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    fn persist(&self) {
        persist_json(self.hook.as_deref(), HISTORY_KEY, &self.records);
    }

    // --- Reads ---

    pub fn records(&self) -> &[HistoryRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn latest(&self) -> Option<&HistoryRecord> {
        self.records.first()
    }

    pub fn get(&self, record_id: &str) -> Option<&HistoryRecord> {
        self.records.iter().find(|r| r.id == record_id)
    }

    /// Returns the owning record and the image.
    pub fn find_image(&self, image_id: &str) -> Option<(&HistoryRecord, &ImageAsset)> {
        self.records.iter().find_map(|record| {
            record
                .images
                .iter()
                .find(|img| img.id == image_id)
                .map(|img| (record, img))
        })
    }

    pub fn to_snapshot(&self) -> Vec<HistoryRecord> {
        self.records.clone()
    }

    fn get_mut(&mut self, record_id: &str) -> Option<&mut HistoryRecord> {
        self.records.iter_mut().find(|r| r.id == record_id)
    }

    fn image_mut(&mut self, image_id: &str) -> Option<&mut ImageAsset> {
        self.records
            .iter_mut()
            .flat_map(|r| r.images.iter_mut())
            .find(|img| img.id == image_id)
    }

    fn ready_dossier_mut(&mut self, record_id: &str) -> Option<&mut Dossier> {
        match self.get_mut(record_id)?.dossier.as_mut()? {
            DossierState::Ready(dossier) => Some(dossier),
            DossierState::Generating => None,
        }
    }

    // --- Generation lifecycle ---

    fn insert_front(&mut self, prefix: &str, prompt: PromptSpec, dossier: Option<DossierState>) -> RecordId {
        let record = HistoryRecord {
            id: new_id(prefix),
            prompt,
            created_at: Utc::now(),
            status: RecordStatus::Generating,
            images: Vec::new(),
            dossier,
        };
        let id = record.id.clone();
        self.records.insert(0, record);
        self.persist();
        id
    }

    pub fn begin_generation(&mut self, prompt: PromptSpec) -> RecordId {
        self.insert_front("hist", prompt, None)
    }

    /// Speculative foil record: generating, with its dossier pending too.
    pub fn begin_foil(&mut self, prompt: PromptSpec) -> RecordId {
        self.insert_front("hist-foil", prompt, Some(DossierState::Generating))
    }

    pub fn complete_generation(
        &mut self,
        record_id: &str,
        images: Vec<ImageAsset>,
        dossier_requested: bool,
    ) -> Result<(), ForgeError> {
        let record = self
            .get_mut(record_id)
            .ok_or_else(|| ForgeError::contract(format!("complete_generation: unknown record {}", record_id)))?;
        record.status = RecordStatus::Complete;
        record.images = images;
        if dossier_requested {
            record.dossier = Some(DossierState::Generating);
        }
        self.persist();
        Ok(())
    }

    /// Completes a foil record in one step: concept, dossier and images land
    /// together so the record never shows a dossier while generating.
    pub fn complete_foil(
        &mut self,
        record_id: &str,
        character_description: String,
        scene_description: String,
        dossier: Dossier,
        images: Vec<ImageAsset>,
    ) -> Result<(), ForgeError> {
        let record = self
            .get_mut(record_id)
            .ok_or_else(|| ForgeError::contract(format!("complete_foil: unknown record {}", record_id)))?;
        record.prompt.character_description = character_description;
        record.prompt.scene_description = scene_description;
        record.status = RecordStatus::Complete;
        record.images = images;
        record.dossier = Some(DossierState::Ready(dossier));
        self.persist();
        Ok(())
    }

    /// Removes the record entirely. Idempotent.
    pub fn fail_generation(&mut self, record_id: &str) {
        let before = self.records.len();
        self.records.retain(|r| r.id != record_id);
        if self.records.len() != before {
            debug!("Rolled back record {}", record_id);
            self.persist();
        }
    }

    pub fn append_variations(&mut self, record_id: &str, images: Vec<ImageAsset>) {
        match self.get_mut(record_id) {
            Some(record) => {
                record.images.extend(images);
                self.persist();
            }
            None => debug!("append_variations: record {} is gone", record_id),
        }
    }

    pub fn update_title(&mut self, record_id: &str, title: impl Into<String>) {
        if let Some(record) = self.get_mut(record_id) {
            record.prompt.title = Some(title.into());
            self.persist();
        }
    }

    // --- Dossier fields ---

    pub fn begin_dossier(&mut self, record_id: &str) -> Result<(), ForgeError> {
        let record = self
            .get_mut(record_id)
            .ok_or_else(|| ForgeError::contract(format!("begin_dossier: unknown record {}", record_id)))?;
        if record.status != RecordStatus::Complete {
            return Err(ForgeError::contract(format!(
                "begin_dossier: record {} is still generating",
                record_id
            )));
        }
        record.dossier = Some(DossierState::Generating);
        self.persist();
        Ok(())
    }

    /// Sets the dossier, or clears it when generation failed.
    pub fn resolve_dossier(&mut self, record_id: &str, dossier: Option<Dossier>) {
        if let Some(record) = self.get_mut(record_id) {
            record.dossier = dossier.map(DossierState::Ready);
            self.persist();
        }
    }

    /// Only applies to a ready dossier. Entering `Generating` is allowed from
    /// any ready state; other values are field updates.
    pub fn set_origin_story(&mut self, record_id: &str, story: Option<OriginStory>) {
        match self.ready_dossier_mut(record_id) {
            Some(dossier) => {
                dossier.origin_story = story;
                self.persist();
            }
            None => debug!("set_origin_story: no ready dossier on {}", record_id),
        }
    }

    pub fn set_voice(&mut self, record_id: &str, archetype: impl Into<String>, voice_id: impl Into<String>) {
        match self.ready_dossier_mut(record_id) {
            Some(dossier) => {
                dossier.voice_archetype = Some(archetype.into());
                dossier.voice_id = Some(voice_id.into());
                self.persist();
            }
            None => debug!("set_voice: no ready dossier on {}", record_id),
        }
    }

    // --- Version chains ---

    pub fn append_version(&mut self, image_id: &str, payload: ImagePayload) -> Result<(), ForgeError> {
        let image = self
            .image_mut(image_id)
            .ok_or_else(|| ForgeError::contract(format!("append_version: unknown image {}", image_id)))?;
        image.version_chain.push(payload);
        self.persist();
        Ok(())
    }

    /// Pops the latest version. Returns `false` when only the original is left.
    pub fn undo_version(&mut self, image_id: &str) -> Result<bool, ForgeError> {
        let image = self
            .image_mut(image_id)
            .ok_or_else(|| ForgeError::contract(format!("undo_version: unknown image {}", image_id)))?;
        if image.version_chain.len() <= 1 {
            return Ok(false);
        }
        image.version_chain.pop();
        self.persist();
        Ok(true)
    }

    /// Atomically replaces a chain with a committed refinement branch.
    pub fn replace_chain(&mut self, image_id: &str, chain: Vec<ImagePayload>) -> Result<(), ForgeError> {
        if chain.is_empty() {
            return Err(ForgeError::contract(format!(
                "replace_chain: empty chain for image {}",
                image_id
            )));
        }
        let image = self
            .image_mut(image_id)
            .ok_or_else(|| ForgeError::contract(format!("replace_chain: unknown image {}", image_id)))?;
        if image.version_chain != chain {
            image.version_chain = chain;
            self.persist();
        } else {
            debug!("replace_chain: image {} unchanged", image_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use crate::core::session::tests::RecordingHook;
    use crate::core::session::PersistOp;
    use crate::core::state::ArtStyle;

    fn scout_prompt() -> PromptSpec {
        PromptSpec::new("android scout", "on a rooftop", ArtStyle::Anime)
    }

    fn images(prompt: &PromptSpec, payloads: &[&str]) -> Vec<ImageAsset> {
        payloads
            .iter()
            .map(|p| ImageAsset::from_prompt(p.to_string(), prompt))
            .collect()
    }

    fn dossier() -> Dossier {
        Dossier {
            callsign: "Kestrel".to_string(),
            background: "Recon unit".to_string(),
            abilities: vec!["Flight".to_string(), "Optics".to_string()],
            weaknesses: vec!["EMP".to_string()],
            quote: "Altitude is an answer.".to_string(),
            origin_story: None,
            voice_archetype: None,
            voice_id: None,
        }
    }

    fn assert_invariants(store: &HistoryStore) {
        for record in store.records() {
            if record.status == RecordStatus::Generating {
                assert!(record.images.is_empty());
                assert!(matches!(record.dossier, None | Some(DossierState::Generating)));
            }
            for image in &record.images {
                assert!(!image.version_chain.is_empty());
            }
        }
    }

    /// Scenario A.
    fn completed_store() -> (HistoryStore, RecordId) {
        let mut store = HistoryStore::new();
        let prompt = scout_prompt();
        let id = store.begin_generation(prompt.clone());
        assert_invariants(&store);
        store
            .complete_generation(&id, images(&prompt, &["imgA", "imgB"]), false)
            .unwrap();
        (store, id)
    }

    #[test]
    fn test_scenario_a_complete_generation() {
        let (store, id) = completed_store();
        let first = store.latest().unwrap();
        assert_eq!(first.id, id);
        assert_eq!(first.status, RecordStatus::Complete);
        assert_eq!(first.images.len(), 2);
        assert_eq!(first.dossier, None);
        assert_invariants(&store);
    }

    #[test]
    fn test_scenario_b_variations_append_in_order() {
        let (mut store, id) = completed_store();
        let original: Vec<ImageAsset> = store.get(&id).unwrap().images.clone();
        let prompt = scout_prompt();
        store.append_variations(&id, images(&prompt, &["imgC", "imgD"]));

        let record = store.get(&id).unwrap();
        assert_eq!(record.images.len(), 4);
        assert_eq!(&record.images[..2], &original[..]);
    }

    #[test]
    fn test_scenario_c_failed_dossier_keeps_record() {
        let mut store = HistoryStore::new();
        let prompt = scout_prompt();
        let id = store.begin_generation(prompt.clone());
        store
            .complete_generation(&id, images(&prompt, &["imgA", "imgB"]), true)
            .unwrap();
        assert_eq!(store.get(&id).unwrap().dossier, Some(DossierState::Generating));

        store.resolve_dossier(&id, None);
        let record = store.get(&id).unwrap();
        assert_eq!(record.dossier, None);
        assert_eq!(record.status, RecordStatus::Complete);
        assert_eq!(record.images.len(), 2);
    }

    #[test]
    fn test_scenario_d_refine_three_times_then_undo() {
        let (mut store, id) = completed_store();
        let img_a = store.get(&id).unwrap().images[0].id.clone();
        for payload in ["r1", "r2", "r3"] {
            store.append_version(&img_a, payload.to_string()).unwrap();
        }
        assert!(store.undo_version(&img_a).unwrap());

        let (_, image) = store.find_image(&img_a).unwrap();
        assert_eq!(image.version_chain, vec!["imgA", "r1", "r2"]);
    }

    #[test]
    fn test_undo_on_original_is_noop() {
        let (mut store, id) = completed_store();
        let img = store.get(&id).unwrap().images[1].id.clone();
        let before = store.to_snapshot();
        assert!(!store.undo_version(&img).unwrap());
        assert!(!store.undo_version(&img).unwrap());
        assert_eq!(store.to_snapshot(), before);
    }

    #[test]
    fn test_unknown_ids_are_contract_violations() {
        let (mut store, _) = completed_store();
        let err = store.undo_version("img-missing").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContractViolation);
        let err = store.append_version("img-missing", "x".to_string()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContractViolation);
        let err = store.complete_generation("hist-missing", vec![], false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContractViolation);
    }

    #[test]
    fn test_fail_generation_is_idempotent() {
        let mut store = HistoryStore::new();
        let id = store.begin_generation(scout_prompt());
        store.fail_generation(&id);
        store.fail_generation(&id);
        assert!(store.is_empty());
        // Variations for a vanished record are ignored.
        store.append_variations(&id, images(&scout_prompt(), &["x"]));
        assert!(store.is_empty());
    }

    #[test]
    fn test_newest_first_and_variations_do_not_reorder() {
        let mut store = HistoryStore::new();
        let prompt = scout_prompt();
        let older = store.begin_generation(prompt.clone());
        let newer = store.begin_generation(prompt.clone());
        store.complete_generation(&older, images(&prompt, &["a"]), false).unwrap();
        store.complete_generation(&newer, images(&prompt, &["b"]), false).unwrap();
        store.append_variations(&older, images(&prompt, &["c"]));

        let ids: Vec<&str> = store.records().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![newer.as_str(), older.as_str()]);
    }

    #[test]
    fn test_origin_story_and_voice_require_ready_dossier() {
        let mut store = HistoryStore::new();
        let prompt = scout_prompt();
        let id = store.begin_generation(prompt.clone());
        store.complete_generation(&id, images(&prompt, &["a"]), true).unwrap();

        // Dossier still generating: ignored.
        store.set_origin_story(&id, Some(OriginStory::Generating));
        store.set_voice(&id, "Old Male", "voice-1");
        assert_eq!(store.get(&id).unwrap().dossier, Some(DossierState::Generating));

        store.resolve_dossier(&id, Some(dossier()));
        store.set_origin_story(&id, Some(OriginStory::Generating));
        assert_eq!(
            store.get(&id).unwrap().ready_dossier().unwrap().origin_story,
            Some(OriginStory::Generating)
        );
        store.set_origin_story(&id, None);
        store.set_voice(&id, "Old Male", "voice-1");

        let d = store.get(&id).unwrap().ready_dossier().unwrap();
        assert_eq!(d.origin_story, None);
        assert_eq!(d.voice_id.as_deref(), Some("voice-1"));
    }

    #[test]
    fn test_foil_lifecycle() {
        let mut store = HistoryStore::new();
        let prompt = PromptSpec {
            title: Some("FOIL: Recon".to_string()),
            ..PromptSpec::new("Generating foil character concept...", "...", ArtStyle::Anime)
        };
        let id = store.begin_foil(prompt);
        assert_invariants(&store);

        let concept_prompt = PromptSpec::new("rival drone", "in a hangar", ArtStyle::Anime);
        store
            .complete_foil(
                &id,
                "rival drone".to_string(),
                "in a hangar".to_string(),
                dossier(),
                images(&concept_prompt, &["f1", "f2"]),
            )
            .unwrap();
        assert_invariants(&store);

        let record = store.get(&id).unwrap();
        assert_eq!(record.prompt.character_description, "rival drone");
        assert_eq!(record.images[0].character_description, "rival drone");
        assert_eq!(record.prompt.title.as_deref(), Some("FOIL: Recon"));
        assert_eq!(record.status, RecordStatus::Complete);
        assert!(record.ready_dossier().is_some());
    }

    #[test]
    fn test_failed_foil_leaves_no_trace() {
        let mut store = HistoryStore::new();
        let id = store.begin_foil(PromptSpec::new("Generating foil character concept...", "...", ArtStyle::Anime));
        assert_invariants(&store);
        store.fail_generation(&id);
        assert_invariants(&store);
        assert!(store.is_empty());
        let err = store
            .complete_foil(&id, "late".to_string(), "late".to_string(), dossier(), vec![])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContractViolation);
        assert!(store.is_empty());
    }

    #[test]
    fn test_replace_chain_rejects_empty() {
        let (mut store, id) = completed_store();
        let img = store.get(&id).unwrap().images[0].id.clone();
        let err = store.replace_chain(&img, vec![]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContractViolation);

        store
            .replace_chain(&img, vec!["imgA".to_string(), "v2".to_string()])
            .unwrap();
        assert_eq!(store.find_image(&img).unwrap().1.current(), "v2");
    }

    #[test]
    fn test_every_mutation_is_persisted() {
        let hook = RecordingHook::default();
        let mut store = HistoryStore::new().with_hook(Arc::new(hook.clone()));
        let prompt = scout_prompt();
        let id = store.begin_generation(prompt.clone());
        assert_eq!(hook.count(), 1);
        store.complete_generation(&id, images(&prompt, &["a"]), false).unwrap();
        store.update_title(&id, "Recon");
        assert_eq!(hook.count(), 3);

        match hook.last().unwrap() {
            PersistOp::Write { key, content } => {
                assert_eq!(key, HISTORY_KEY);
                let records: Vec<HistoryRecord> = serde_json::from_slice(&content).unwrap();
                assert_eq!(records[0].prompt.title.as_deref(), Some("Recon"));
            }
            other => panic!("unexpected op {:?}", other),
        }

        // No-ops do not persist.
        let img = store.get(&id).unwrap().images[0].id.clone();
        store.undo_version(&img).unwrap();
        store.fail_generation("hist-missing");
        assert_eq!(hook.count(), 3);
    }
}
