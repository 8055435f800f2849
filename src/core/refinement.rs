//! Refinement of a single image on a private branch of its version chain.
//!
//! The session owns a copy of the chain until [`RefinementSession::commit`]
//! writes it back; dropping the session discards every change.

use crate::core::conversation::{ChatMessage, PendingTurn, Transcript};
use crate::core::error::ForgeError;
use crate::core::history::HistoryStore;
use crate::core::state::{ImageAsset, ImageId, ImagePayload, MessageId};

#[derive(Debug, Clone)]
pub struct RefinementSession {
    image: ImageAsset,
    branch: Vec<ImagePayload>,
    selected: usize,
    transcript: Transcript,
    /// Branch index the outstanding turn was submitted against.
    pending_base: Option<(MessageId, usize)>,
}

impl RefinementSession {
    /// Opens on the latest version. An image without versions cannot be refined.
    pub fn open(image: &ImageAsset) -> Result<Self, ForgeError> {
        if image.version_chain.is_empty() {
            return Err(ForgeError::contract(format!("image {} has no versions", image.id)));
        }
        let branch = image.version_chain.clone();
        let selected = branch.len() - 1;
        let mut transcript = Transcript::new();
        transcript.push_notice(ChatMessage::system(
            "Refinement session started. Select a version or describe your changes for the current image.",
        ));
        Ok(Self {
            image: image.clone(),
            branch,
            selected,
            transcript,
            pending_base: None,
        })
    }

    pub fn image_id(&self) -> &ImageId {
        &self.image.id
    }

    pub fn image(&self) -> &ImageAsset {
        &self.image
    }

    pub fn branch(&self) -> &[ImagePayload] {
        &self.branch
    }

    pub fn selected_index(&self) -> usize {
        self.selected
    }

    pub fn selected_version(&self) -> &str {
        self.branch
            .get(self.selected)
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn select_version(&mut self, index: usize) -> Result<(), ForgeError> {
        if index >= self.branch.len() {
            return Err(ForgeError::contract(format!(
                "version {} out of range for image {} ({} versions)",
                index,
                self.image.id,
                self.branch.len()
            )));
        }
        self.selected = index;
        self.transcript
            .push_notice(ChatMessage::system(format!("Context switched to version {}.", index + 1)));
        Ok(())
    }

    /// Records the instruction against the selected version.
    pub fn submit(&mut self, instruction: impl Into<String>) -> PendingTurn {
        let base = self.selected_version().to_string();
        let turn = self.transcript.append_user_message(instruction, base);
        self.pending_base = Some((turn.message_id.clone(), self.selected));
        turn
    }

    /// Applies a successful refinement: everything after the version the turn
    /// was based on is dropped and the new payload becomes the latest.
    pub fn resolve_success(&mut self, turn: &PendingTurn, payload: ImagePayload) {
        let base_index = match self.pending_base.take() {
            Some((id, index)) if id == turn.message_id && index < self.branch.len() => index,
            _ => self
                .branch
                .iter()
                .rposition(|v| *v == turn.input_image)
                .unwrap_or(self.selected),
        };
        self.branch.truncate(base_index + 1);
        self.branch.push(payload.clone());
        self.selected = self.branch.len() - 1;

        self.transcript
            .append_ai_result(format!("Applied change: \"{}\"", turn.prompt), Some(payload));
        if let Some(message) = self.transcript.last_mut() {
            message.before_image = Some(turn.input_image.clone());
        }
    }

    pub fn resolve_failure(&mut self, err: &ForgeError) {
        self.pending_base = None;
        self.transcript.append_ai_error(err);
    }

    pub fn has_changes(&self) -> bool {
        self.branch != self.image.version_chain
    }

    /// "Save & Close": replaces the owning asset's chain atomically.
    pub fn commit(self, store: &mut HistoryStore) -> Result<(), ForgeError> {
        store.replace_chain(&self.image.id, self.branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::conversation::ChatRole;
    use crate::core::error::ErrorKind;
    use crate::core::state::{ArtStyle, PromptSpec};

    fn store_with_image(chain: &[&str]) -> (HistoryStore, ImageAsset) {
        let mut store = HistoryStore::new();
        let prompt = PromptSpec::new("knight", "at dawn", ArtStyle::Fantasy);
        let id = store.begin_generation(prompt.clone());
        let mut image = ImageAsset::from_prompt(chain[0].to_string(), &prompt);
        image.version_chain = chain.iter().map(|s| s.to_string()).collect();
        store.complete_generation(&id, vec![image.clone()], false).unwrap();
        (store, image)
    }

    #[test]
    fn test_session_starts_on_latest_version() {
        let (_, image) = store_with_image(&["v0", "v1"]);
        let session = RefinementSession::open(&image).unwrap();
        assert_eq!(session.selected_index(), 1);
        assert_eq!(session.selected_version(), "v1");
        assert_eq!(session.transcript().messages()[0].role, ChatRole::System);
        assert!(!session.has_changes());
    }

    #[test]
    fn test_refining_older_version_branches() {
        let (_, image) = store_with_image(&["v0", "v1", "v2"]);
        let mut session = RefinementSession::open(&image).unwrap();
        session.select_version(0).unwrap();

        let turn = session.submit("add a cape");
        assert_eq!(turn.input_image, "v0");
        session.resolve_success(&turn, "v0-cape".to_string());

        assert_eq!(session.branch(), &["v0", "v0-cape"]);
        assert_eq!(session.selected_version(), "v0-cape");
        let last = session.transcript().messages().last().unwrap();
        assert_eq!(last.before_image.as_deref(), Some("v0"));
        assert_eq!(last.result_image.as_deref(), Some("v0-cape"));
    }

    #[test]
    fn test_branches_from_selected_duplicate_version() {
        let (_, image) = store_with_image(&["v0", "v0", "v1"]);
        let mut session = RefinementSession::open(&image).unwrap();
        session.select_version(0).unwrap();

        let turn = session.submit("add a hood");
        session.resolve_success(&turn, "v0-hood".to_string());

        assert_eq!(session.branch(), &["v0", "v0-hood"]);
        assert_eq!(session.selected_index(), 1);
    }

    #[test]
    fn test_store_untouched_until_commit() {
        let (mut store, image) = store_with_image(&["v0"]);
        let mut session = RefinementSession::open(&image).unwrap();
        let turn = session.submit("sharper");
        session.resolve_success(&turn, "v1".to_string());

        // Interleaved undo on the stored chain cannot corrupt the branch.
        assert!(!store.undo_version(&image.id).unwrap());
        assert_eq!(store.find_image(&image.id).unwrap().1.version_chain, vec!["v0"]);

        session.commit(&mut store).unwrap();
        assert_eq!(store.find_image(&image.id).unwrap().1.version_chain, vec!["v0", "v1"]);
    }

    #[test]
    fn test_discarded_session_leaves_store() {
        let (store, image) = store_with_image(&["v0"]);
        {
            let mut session = RefinementSession::open(&image).unwrap();
            let turn = session.submit("sharper");
            session.resolve_success(&turn, "v1".to_string());
        }
        assert_eq!(store.find_image(&image.id).unwrap().1.version_count(), 1);
    }

    #[test]
    fn test_failure_keeps_branch() {
        let (_, image) = store_with_image(&["v0"]);
        let mut session = RefinementSession::open(&image).unwrap();
        session.submit("sharper");
        session.resolve_failure(&ForgeError::content_rejected("SAFETY"));
        assert_eq!(session.branch(), &["v0"]);
        assert!(session.transcript().messages().last().unwrap().is_error());
    }

    #[test]
    fn test_select_out_of_range() {
        let (_, image) = store_with_image(&["v0"]);
        let mut session = RefinementSession::open(&image).unwrap();
        let err = session.select_version(3).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContractViolation);
        assert_eq!(session.selected_index(), 0);
    }

    #[test]
    fn test_open_rejects_image_without_versions() {
        let prompt = PromptSpec::new("knight", "at dawn", ArtStyle::Fantasy);
        let mut image = ImageAsset::from_prompt("v0".to_string(), &prompt);
        image.version_chain.clear();
        let err = RefinementSession::open(&image).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContractViolation);
    }
}
