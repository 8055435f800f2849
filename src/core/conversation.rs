//! Chat transcripts that drive iterative image edits.

use crate::core::error::ForgeError;
use crate::core::state::{new_id, ImagePayload, MessageId};
use serde::{Deserialize, Serialize};

pub const ERROR_PREFIX: &str = "[ERROR]";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Ai,
    System,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChatMessage {
    pub id: MessageId,
    pub role: ChatRole,
    pub text: String,
    /// Image the AI produced for this turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_image: Option<ImagePayload>,
    /// Image the user's prompt was applied to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_image: Option<ImagePayload>,
    /// Version a refinement started from, for before/after comparison.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_image: Option<ImagePayload>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
}

impl ChatMessage {
    fn new(role: ChatRole, text: impl Into<String>) -> Self {
        let prefix = match role {
            ChatRole::User => "msg",
            ChatRole::Ai => "msg-ai",
            ChatRole::System => "sys",
        };
        Self {
            id: new_id(prefix),
            role,
            text: text.into(),
            result_image: None,
            input_image: None,
            before_image: None,
            actions: Vec::new(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(ChatRole::System, text)
    }

    pub fn ai(text: impl Into<String>) -> Self {
        Self::new(ChatRole::Ai, text)
    }

    pub fn with_actions(mut self, actions: &[&str]) -> Self {
        self.actions = actions.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn is_error(&self) -> bool {
        self.role == ChatRole::Ai && self.result_image.is_none() && self.text.starts_with(ERROR_PREFIX)
    }
}

/// Most recent AI-produced image, else the base image.
pub fn latest_ai_image<'a>(messages: &'a [ChatMessage], fallback: Option<&'a str>) -> Option<&'a str> {
    messages
        .iter()
        .rev()
        .filter(|m| m.role == ChatRole::Ai)
        .find_map(|m| m.result_image.as_deref())
        .or(fallback)
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TranscriptPhase {
    #[default]
    Empty,
    AwaitingInput,
    Submitting,
    Erred,
}

/// A user turn that has been recorded and now needs an external call.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTurn {
    pub message_id: MessageId,
    pub prompt: String,
    pub input_image: ImagePayload,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Transcript {
    messages: Vec<ChatMessage>,
    #[serde(skip)]
    phase: TranscriptPhase,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a transcript from persisted messages.
    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        let phase = if messages.is_empty() {
            TranscriptPhase::Empty
        } else {
            TranscriptPhase::AwaitingInput
        };
        Self { messages, phase }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn phase(&self) -> TranscriptPhase {
        self.phase
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn position(&self, message_id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == message_id)
    }

    /// Adds a non-user message (greeting, context switch notice).
    pub fn push_notice(&mut self, message: ChatMessage) {
        self.messages.push(message);
        if self.phase == TranscriptPhase::Empty {
            self.phase = TranscriptPhase::AwaitingInput;
        }
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.phase = TranscriptPhase::Empty;
    }

    pub fn latest_image<'a>(&'a self, base_image: Option<&'a str>) -> Option<&'a str> {
        latest_ai_image(&self.messages, base_image)
    }

    pub fn append_user_message(
        &mut self,
        text: impl Into<String>,
        input_image: ImagePayload,
    ) -> PendingTurn {
        let mut message = ChatMessage::new(ChatRole::User, text);
        message.input_image = Some(input_image.clone());
        let turn = PendingTurn {
            message_id: message.id.clone(),
            prompt: message.text.clone(),
            input_image,
        };
        self.messages.push(message);
        self.phase = TranscriptPhase::Submitting;
        turn
    }

    /// Appends a user message whose input is the latest AI image, else `base_image`.
    pub fn submit(&mut self, text: impl Into<String>, base_image: &str) -> PendingTurn {
        let input = self.latest_image(Some(base_image)).unwrap_or(base_image).to_string();
        self.append_user_message(text, input)
    }

    pub fn quick_action(&mut self, label: &str, base_image: &str) -> PendingTurn {
        self.submit(label, base_image)
    }

    /// Records the AI turn. `None` marks an error turn.
    pub fn append_ai_result(&mut self, text: impl Into<String>, result_image: Option<ImagePayload>) {
        let mut message = ChatMessage::new(ChatRole::Ai, text);
        self.phase = if result_image.is_some() {
            TranscriptPhase::AwaitingInput
        } else {
            TranscriptPhase::Erred
        };
        message.result_image = result_image;
        self.messages.push(message);
    }

    /// Error turn carrying the user-facing message.
    pub fn append_ai_error(&mut self, err: &ForgeError) {
        self.append_ai_result(format!("{} {}", ERROR_PREFIX, err.user_message()), None);
    }

    pub(crate) fn last_mut(&mut self) -> Option<&mut ChatMessage> {
        self.messages.last_mut()
    }

    /// Replaces a user message and discards everything after it.
    ///
    /// The transcript is left untouched when `message_id` is not a user
    /// message carrying an input image.
    pub fn edit_user_message(
        &mut self,
        message_id: &str,
        new_text: impl Into<String>,
    ) -> Result<PendingTurn, ForgeError> {
        let index = self
            .position(message_id)
            .ok_or_else(|| ForgeError::contract(format!("unknown message {}", message_id)))?;
        let original = &self.messages[index];
        if original.role != ChatRole::User {
            return Err(ForgeError::contract(format!(
                "message {} is not a user message",
                message_id
            )));
        }
        let input_image = original.input_image.clone().ok_or_else(|| {
            ForgeError::contract(format!("message {} has no input image", message_id))
        })?;

        self.messages.truncate(index);
        Ok(self.append_user_message(new_text, input_image))
    }
}
