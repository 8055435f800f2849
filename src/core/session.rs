//! Session persistence: the hook the store and editor call on every committed
//! mutation, the writer that drains it into a [`Storage`], and rehydration.

use crate::core::conversation::ChatMessage;
use crate::core::io::Storage;
use crate::core::state::{DossierState, HistoryRecord, OriginStory, UploadedImage};
use anyhow::{Context, Result};
use log::{debug, warn};
use tokio::sync::mpsc;

pub const HISTORY_KEY: &str = "character-gen-history";
pub const EDITOR_IMAGE_KEY: &str = "chat-base-image";
pub const EDITOR_HISTORY_KEY: &str = "chat-history";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOp {
    Write { key: &'static str, content: Vec<u8> },
    Remove { key: &'static str },
}

pub trait PersistHook: Send + Sync {
    fn persist(&self, op: PersistOp);
}

/// Serializes `value` and hands it to the hook. Serialization failures are
/// logged; the in-memory state stays authoritative.
pub(crate) fn persist_json<T: serde::Serialize>(
    hook: Option<&dyn PersistHook>,
    key: &'static str,
    value: &T,
) {
    let Some(hook) = hook else { return };
    match serde_json::to_vec(value) {
        Ok(content) => hook.persist(PersistOp::Write { key, content }),
        Err(e) => warn!("Failed to serialize {} for persistence: {}", key, e),
    }
}

/// Hook that forwards snapshots to a [`SessionWriter`] over a channel.
pub struct SessionPersister {
    tx: mpsc::UnboundedSender<PersistOp>,
}

impl PersistHook for SessionPersister {
    fn persist(&self, op: PersistOp) {
        if self.tx.send(op).is_err() {
            debug!("Session writer is gone, dropping snapshot");
        }
    }
}

pub struct SessionWriter {
    rx: mpsc::UnboundedReceiver<PersistOp>,
    storage: std::sync::Arc<dyn Storage>,
    prefix: String,
}

/// Creates a connected persister/writer pair. Keys are stored under `prefix`.
pub fn session_channel(
    storage: std::sync::Arc<dyn Storage>,
    prefix: &str,
) -> (SessionPersister, SessionWriter) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        SessionPersister { tx },
        SessionWriter {
            rx,
            storage,
            prefix: prefix.to_string(),
        },
    )
}

pub fn storage_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}/{}.json", prefix.trim_end_matches('/'), key)
    }
}

impl SessionWriter {
    /// Applies queued operations until every persister has been dropped.
    pub async fn run(mut self) {
        while let Some(op) = self.rx.recv().await {
            if let Err(e) = self.apply(op).await {
                warn!("Failed to save session: {:#}", e);
            }
        }
    }

    /// Applies whatever is queued right now without waiting for more.
    pub async fn flush(&mut self) -> Result<()> {
        while let Ok(op) = self.rx.try_recv() {
            self.apply(op).await?;
        }
        Ok(())
    }

    async fn apply(&self, op: PersistOp) -> Result<()> {
        match op {
            PersistOp::Write { key, content } => {
                let path = storage_path(&self.prefix, key);
                self.storage
                    .write(&path, &content)
                    .await
                    .with_context(|| format!("Failed to write {}", path))
            }
            PersistOp::Remove { key } => {
                let path = storage_path(&self.prefix, key);
                self.storage
                    .delete(&path)
                    .await
                    .with_context(|| format!("Failed to delete {}", path))
            }
        }
    }
}

/// Drops records that were mid-generation and resets in-flight dossier and
/// origin-story fields, since those operations cannot resume after a reload.
/// Images with an empty version chain are dropped, and so is a record left
/// with no images.
pub fn sanitize_history(records: Vec<HistoryRecord>) -> Vec<HistoryRecord> {
    records
        .into_iter()
        .filter(|record| !record.is_generating())
        .filter_map(|mut record| {
            let before = record.images.len();
            record.images.retain(|image| !image.version_chain.is_empty());
            if record.images.len() != before {
                warn!(
                    "Dropped {} image(s) without versions from record {}",
                    before - record.images.len(),
                    record.id
                );
            }
            if record.images.is_empty() {
                warn!("Dropped record {} with no usable images", record.id);
                return None;
            }
            Some(record)
        })
        .map(|mut record| {
            match record.dossier.take() {
                Some(DossierState::Generating) | None => {}
                Some(DossierState::Ready(mut dossier)) => {
                    if dossier.origin_story == Some(OriginStory::Generating) {
                        dossier.origin_story = None;
                    }
                    record.dossier = Some(DossierState::Ready(dossier));
                }
            }
            record
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct RestoredSession {
    pub history: Vec<HistoryRecord>,
    pub editor_image: Option<UploadedImage>,
    pub editor_transcript: Vec<ChatMessage>,
}

async fn read_json<T: serde::de::DeserializeOwned>(
    storage: &dyn Storage,
    path: &str,
) -> Result<Option<T>> {
    if !storage.exists(path).await? {
        return Ok(None);
    }
    let bytes = storage.read(path).await?;
    let value = serde_json::from_slice(&bytes).with_context(|| format!("Failed to parse {}", path))?;
    Ok(Some(value))
}

/// Loads the persisted session. A corrupt entry is logged and treated as
/// absent so one bad key does not lose the others.
pub async fn load_session(storage: &dyn Storage, prefix: &str) -> RestoredSession {
    let mut session = RestoredSession::default();

    match read_json::<Vec<HistoryRecord>>(storage, &storage_path(prefix, HISTORY_KEY)).await {
        Ok(Some(history)) => session.history = sanitize_history(history),
        Ok(None) => {}
        Err(e) => warn!("Failed to load history from session storage: {:#}", e),
    }
    match read_json::<UploadedImage>(storage, &storage_path(prefix, EDITOR_IMAGE_KEY)).await {
        Ok(image) => session.editor_image = image,
        Err(e) => warn!("Failed to load chat base image: {:#}", e),
    }
    match read_json::<Vec<ChatMessage>>(storage, &storage_path(prefix, EDITOR_HISTORY_KEY)).await {
        Ok(Some(messages)) => session.editor_transcript = messages,
        Ok(None) => {}
        Err(e) => warn!("Failed to load chat history: {:#}", e),
    }

    session
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::io::MemoryStorage;
    use crate::core::state::{ArtStyle, Dossier, ImageAsset, PromptSpec, RecordStatus};
    use chrono::Utc;
    use std::sync::{Arc, Mutex};

    /// Collects every operation for inspection.
    #[derive(Default, Clone)]
    pub(crate) struct RecordingHook {
        pub ops: Arc<Mutex<Vec<PersistOp>>>,
    }

    impl PersistHook for RecordingHook {
        fn persist(&self, op: PersistOp) {
            self.ops.lock().unwrap().push(op);
        }
    }

    impl RecordingHook {
        pub(crate) fn count(&self) -> usize {
            self.ops.lock().unwrap().len()
        }

        pub(crate) fn last(&self) -> Option<PersistOp> {
            self.ops.lock().unwrap().last().cloned()
        }
    }

    fn dossier(origin: Option<OriginStory>) -> Dossier {
        Dossier {
            callsign: "Wraith".to_string(),
            background: "Ex-courier".to_string(),
            abilities: vec!["Parkour".to_string()],
            weaknesses: vec!["Pride".to_string()],
            quote: "Late is never.".to_string(),
            origin_story: origin,
            voice_archetype: None,
            voice_id: None,
        }
    }

    fn record(status: RecordStatus, dossier: Option<DossierState>) -> HistoryRecord {
        let prompt = PromptSpec::new("courier", "in the rain", ArtStyle::Cyberpunk);
        let images = if status == RecordStatus::Complete {
            vec![ImageAsset::from_prompt("AAAA".to_string(), &prompt)]
        } else {
            vec![]
        };
        HistoryRecord {
            id: crate::core::state::new_id("hist"),
            prompt,
            created_at: Utc::now(),
            status,
            images,
            dossier,
        }
    }

    #[test]
    fn test_sanitize_drops_generating_records_and_fields() {
        let records = vec![
            record(RecordStatus::Generating, None),
            record(RecordStatus::Complete, Some(DossierState::Generating)),
            record(
                RecordStatus::Complete,
                Some(DossierState::Ready(dossier(Some(OriginStory::Generating)))),
            ),
            record(
                RecordStatus::Complete,
                Some(DossierState::Ready(dossier(Some(OriginStory::Written(
                    "Once".to_string(),
                ))))),
            ),
        ];

        let sanitized = sanitize_history(records);
        assert_eq!(sanitized.len(), 3);
        assert!(sanitized.iter().all(|r| !r.is_generating()));
        assert_eq!(sanitized[0].dossier, None);
        assert_eq!(sanitized[1].ready_dossier().unwrap().origin_story, None);
        assert_eq!(
            sanitized[2].ready_dossier().unwrap().written_origin_story(),
            Some("Once")
        );
    }

    #[tokio::test]
    async fn test_round_trip_through_storage_is_sanitized() -> Result<()> {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let (persister, mut writer) = session_channel(storage.clone(), "session");

        let records = vec![
            record(RecordStatus::Generating, None),
            record(
                RecordStatus::Complete,
                Some(DossierState::Ready(dossier(Some(OriginStory::Generating)))),
            ),
        ];
        persist_json(Some(&persister as &dyn PersistHook), HISTORY_KEY, &records);
        writer.flush().await?;

        let restored = load_session(storage.as_ref(), "session").await;
        assert_eq!(restored.history.len(), 1);
        assert!(restored.history.iter().all(|r| !r.is_generating()));
        assert!(restored
            .history
            .iter()
            .filter_map(|r| r.dossier.as_ref())
            .all(|d| match d {
                DossierState::Generating => false,
                DossierState::Ready(d) => d.origin_story != Some(OriginStory::Generating),
            }));
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_version_chains_are_dropped_on_load() -> Result<()> {
        let mut broken = record(RecordStatus::Complete, None);
        broken.images[0].version_chain.clear();
        let mut partly = record(RecordStatus::Complete, None);
        let mut empty_image = partly.images[0].clone();
        empty_image.id = "img-empty".to_string();
        empty_image.version_chain.clear();
        partly.images.push(empty_image);

        let storage = MemoryStorage::new();
        storage
            .write(HISTORY_KEY, &serde_json::to_vec(&vec![broken, partly.clone()])?)
            .await?;
        let restored = load_session(&storage, "").await;

        assert_eq!(restored.history.len(), 1);
        assert_eq!(restored.history[0].id, partly.id);
        assert_eq!(restored.history[0].images.len(), 1);
        assert!(restored
            .history
            .iter()
            .flat_map(|r| &r.images)
            .all(|image| !image.version_chain.is_empty()));
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_op_deletes_key() -> Result<()> {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let (persister, mut writer) = session_channel(storage.clone(), "");
        persister.persist(PersistOp::Write {
            key: EDITOR_HISTORY_KEY,
            content: b"[]".to_vec(),
        });
        writer.flush().await?;
        assert!(storage.exists(EDITOR_HISTORY_KEY).await?);

        persister.persist(PersistOp::Remove {
            key: EDITOR_HISTORY_KEY,
        });
        writer.flush().await?;
        assert!(!storage.exists(EDITOR_HISTORY_KEY).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_history_is_ignored() -> Result<()> {
        let storage = MemoryStorage::new();
        storage.write(HISTORY_KEY, b"{not json").await?;
        let restored = load_session(&storage, "").await;
        assert!(restored.history.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_writer_run_stops_when_persister_dropped() -> Result<()> {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let (persister, writer) = session_channel(storage.clone(), "s");
        let image = UploadedImage {
            b64: "Zm9v".to_string(),
            mime_type: "image/png".to_string(),
        };
        persist_json(Some(&persister as &dyn PersistHook), EDITOR_IMAGE_KEY, &image);
        drop(persister);
        writer.run().await;

        let restored = load_session(storage.as_ref(), "s").await;
        assert_eq!(restored.editor_image.unwrap().mime_type, "image/png");
        Ok(())
    }
}
