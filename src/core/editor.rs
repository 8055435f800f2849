//! Free-standing conversational editor: one uploaded base image and the
//! transcript of edits applied to it.

use crate::core::conversation::{ChatMessage, PendingTurn, Transcript};
use crate::core::error::ForgeError;
use crate::core::session::{
    persist_json, PersistHook, PersistOp, EDITOR_HISTORY_KEY, EDITOR_IMAGE_KEY,
};
use crate::core::state::{ImagePayload, UploadedImage};
use log::debug;
use std::sync::Arc;

pub const QUICK_ACTIONS: [&str; 4] = [
    "Crop the image to a 1:1 square",
    "Increase the brightness and contrast",
    "Make the background blurry",
    "Convert to black and white",
];

const GREETING: &str = "Image loaded. How would you like to edit it?";

#[derive(Default)]
pub struct ConversationalEditor {
    base_image: Option<UploadedImage>,
    transcript: Transcript,
    hook: Option<Arc<dyn PersistHook>>,
}

impl ConversationalEditor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(base_image: Option<UploadedImage>, messages: Vec<ChatMessage>) -> Self {
        // A transcript without its base image cannot be continued.
        let transcript = if base_image.is_some() {
            Transcript::from_messages(messages)
        } else {
            Transcript::new()
        };
        Self {
            base_image,
            transcript,
            hook: None,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn PersistHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    fn persist(&self) {
        let Some(hook) = self.hook.as_deref() else { return };
        match &self.base_image {
            Some(image) => persist_json(Some(hook), EDITOR_IMAGE_KEY, image),
            None => hook.persist(PersistOp::Remove { key: EDITOR_IMAGE_KEY }),
        }
        if self.transcript.is_empty() {
            hook.persist(PersistOp::Remove { key: EDITOR_HISTORY_KEY });
        } else {
            persist_json(Some(hook), EDITOR_HISTORY_KEY, &self.transcript.messages());
        }
    }

    pub fn base_image(&self) -> Option<&UploadedImage> {
        self.base_image.as_ref()
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Image the next instruction would be applied to.
    pub fn current_image(&self) -> Option<&str> {
        let base = self.base_image.as_ref().map(|img| img.b64.as_str());
        self.transcript.latest_image(base)
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.base_image.as_ref().map(|img| img.mime_type.as_str())
    }

    /// Starts a new session on `image`, greeting with the quick actions.
    pub fn load_base_image(&mut self, image: UploadedImage) {
        self.base_image = Some(image);
        self.transcript.clear();
        self.transcript
            .push_notice(ChatMessage::ai(GREETING).with_actions(&QUICK_ACTIONS));
        self.persist();
    }

    pub fn start_over(&mut self) {
        self.base_image = None;
        self.transcript.clear();
        self.persist();
    }

    fn base_b64(&self) -> Result<String, ForgeError> {
        self.base_image
            .as_ref()
            .map(|img| img.b64.clone())
            .ok_or_else(|| ForgeError::contract("no base image loaded in the editor"))
    }

    pub fn send(&mut self, text: &str) -> Result<PendingTurn, ForgeError> {
        if text.trim().is_empty() {
            return Err(ForgeError::contract("empty editor message"));
        }
        let base = self.base_b64()?;
        let turn = self.transcript.submit(text, &base);
        self.persist();
        Ok(turn)
    }

    pub fn quick_action(&mut self, label: &str) -> Result<PendingTurn, ForgeError> {
        let base = self.base_b64()?;
        let turn = self.transcript.quick_action(label, &base);
        self.persist();
        Ok(turn)
    }

    pub fn edit(&mut self, message_id: &str, new_text: &str) -> Result<PendingTurn, ForgeError> {
        self.base_b64()?;
        let turn = self.transcript.edit_user_message(message_id, new_text)?;
        self.persist();
        Ok(turn)
    }

    /// Appends the outcome of `turn` as the AI reply. Returns `false` when the
    /// turn was discarded meanwhile (start over, edit) and the outcome dropped.
    pub fn resolve(&mut self, turn: &PendingTurn, outcome: Result<ImagePayload, ForgeError>) -> bool {
        if self.transcript.position(&turn.message_id).is_none() {
            debug!("Dropping editor result for discarded message {}", turn.message_id);
            return false;
        }
        match outcome {
            Ok(payload) => self.transcript.append_ai_result(
                format!("Here's the result for: \"{}\"", turn.prompt),
                Some(payload),
            ),
            Err(err) => self.transcript.append_ai_error(&err),
        }
        self.persist();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::conversation::TranscriptPhase;
    use crate::core::error::ErrorKind;
    use crate::core::session::tests::RecordingHook;

    fn png(b64: &str) -> UploadedImage {
        UploadedImage {
            b64: b64.to_string(),
            mime_type: "image/png".to_string(),
        }
    }

    #[test]
    fn test_load_greets_with_quick_actions() {
        let mut editor = ConversationalEditor::new();
        editor.load_base_image(png("BASE"));
        let greeting = &editor.transcript().messages()[0];
        assert_eq!(greeting.actions.len(), QUICK_ACTIONS.len());
        assert_eq!(editor.current_image(), Some("BASE"));
        assert_eq!(editor.transcript().phase(), TranscriptPhase::AwaitingInput);
    }

    #[test]
    fn test_send_without_image_is_rejected() {
        let mut editor = ConversationalEditor::new();
        let err = editor.send("brighter").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContractViolation);
        assert!(editor.transcript().is_empty());
    }

    #[test]
    fn test_chain_of_edits_uses_latest_result() {
        let mut editor = ConversationalEditor::new();
        editor.load_base_image(png("BASE"));

        let turn = editor.send("brighter").unwrap();
        assert_eq!(turn.input_image, "BASE");
        editor.resolve(&turn, Ok("V1".to_string()));

        let turn = editor.quick_action(QUICK_ACTIONS[3]).unwrap();
        assert_eq!(turn.input_image, "V1");
        editor.resolve(&turn, Err(ForgeError::rate_limited("429")));
        assert_eq!(editor.current_image(), Some("V1"));
        assert_eq!(editor.transcript().phase(), TranscriptPhase::Erred);
    }

    #[test]
    fn test_edit_resubmits_from_original_context() {
        let mut editor = ConversationalEditor::new();
        editor.load_base_image(png("BASE"));
        let first = editor.send("brighter").unwrap();
        editor.resolve(&first, Ok("V1".to_string()));
        let second = editor.send("blur").unwrap();
        editor.resolve(&second, Ok("V2".to_string()));

        let turn = editor.edit(&first.message_id, "darker").unwrap();
        assert_eq!(turn.input_image, "BASE");
        // greeting + edited user message
        assert_eq!(editor.transcript().len(), 2);
        assert_eq!(editor.current_image(), Some("BASE"));
    }

    #[test]
    fn test_persists_and_clears_keys() {
        let hook = RecordingHook::default();
        let mut editor = ConversationalEditor::new().with_hook(Arc::new(hook.clone()));
        editor.load_base_image(png("BASE"));
        {
            let ops = hook.ops.lock().unwrap();
            assert!(ops.iter().any(|op| matches!(op, PersistOp::Write { key, .. } if *key == EDITOR_IMAGE_KEY)));
            assert!(ops.iter().any(|op| matches!(op, PersistOp::Write { key, .. } if *key == EDITOR_HISTORY_KEY)));
        }

        editor.start_over();
        let ops = hook.ops.lock().unwrap();
        let tail: Vec<&PersistOp> = ops.iter().rev().take(2).collect();
        assert!(tail.contains(&&PersistOp::Remove { key: EDITOR_IMAGE_KEY }));
        assert!(tail.contains(&&PersistOp::Remove { key: EDITOR_HISTORY_KEY }));
    }

    #[test]
    fn test_result_for_discarded_turn_is_dropped() {
        let mut editor = ConversationalEditor::new();
        editor.load_base_image(png("BASE"));
        let turn = editor.send("brighter").unwrap();
        editor.start_over();
        editor.load_base_image(png("OTHER"));

        assert!(!editor.resolve(&turn, Ok("V1".to_string())));
        assert_eq!(editor.transcript().len(), 1);
        assert_eq!(editor.current_image(), Some("OTHER"));
    }

    #[test]
    fn test_restore_without_image_drops_transcript() {
        let editor = ConversationalEditor::restore(None, vec![ChatMessage::ai("orphan")]);
        assert!(editor.transcript().is_empty());

        let editor = ConversationalEditor::restore(Some(png("BASE")), vec![ChatMessage::ai("hi")]);
        assert_eq!(editor.transcript().len(), 1);
    }
}
