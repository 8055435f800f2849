//! One narration at a time: switching context (another record, closing the
//! dossier view) cancels the in-flight synthesis and releases the clip.

use crate::core::error::ForgeError;
use crate::services::tts::AudioClip;
use log::debug;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NarrationState {
    Idle,
    Loading,
    Ready,
    Failed(String),
}

/// Handle for one synthesis request.
#[derive(Debug, Clone)]
pub struct NarrationTicket {
    id: u64,
    pub token: CancellationToken,
}

#[derive(Debug, Default)]
pub struct NarrationController {
    context: Option<String>,
    in_flight: Option<NarrationTicket>,
    issued: u64,
    clip: Option<AudioClip>,
    error: Option<String>,
}

impl NarrationController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn clip(&self) -> Option<&AudioClip> {
        self.clip.as_ref()
    }

    pub fn state(&self) -> NarrationState {
        if self.in_flight.is_some() {
            NarrationState::Loading
        } else if self.clip.is_some() {
            NarrationState::Ready
        } else if let Some(error) = &self.error {
            NarrationState::Failed(error.clone())
        } else {
            NarrationState::Idle
        }
    }

    fn cancel_in_flight(&mut self) {
        if let Some(ticket) = self.in_flight.take() {
            debug!("Cancelling narration {} for {:?}", ticket.id, self.context);
            ticket.token.cancel();
        }
    }

    /// Starts a synthesis for `context_id`. Any earlier request is cancelled
    /// and a clip belonging to another context is released.
    pub fn begin(&mut self, context_id: &str) -> NarrationTicket {
        self.cancel_in_flight();
        if self.context.as_deref() != Some(context_id) {
            self.clip = None;
        }
        self.context = Some(context_id.to_string());
        self.error = None;
        self.issued += 1;
        let ticket = NarrationTicket {
            id: self.issued,
            token: CancellationToken::new(),
        };
        self.in_flight = Some(ticket.clone());
        ticket
    }

    /// Moves to another context, or to none.
    pub fn switch_context(&mut self, context_id: Option<&str>) {
        if self.context.as_deref() == context_id {
            return;
        }
        self.cancel_in_flight();
        self.clip = None;
        self.error = None;
        self.context = context_id.map(str::to_string);
    }

    /// Stores the outcome of `ticket`'s request. Outcomes of superseded or
    /// cancelled requests are dropped. A cancelled current request still
    /// releases the in-flight slot. Returns whether the outcome was kept.
    pub fn finish(&mut self, ticket: &NarrationTicket, outcome: Result<AudioClip, ForgeError>) -> bool {
        let cancelled = match self.in_flight.take() {
            Some(current) if current.id == ticket.id => current.token.is_cancelled(),
            other => {
                self.in_flight = other;
                debug!("Dropping stale narration result {}", ticket.id);
                return false;
            }
        };
        match outcome {
            _ if cancelled => {
                debug!("Narration {} was cancelled", ticket.id);
                false
            }
            Ok(clip) => {
                self.clip = Some(clip);
                true
            }
            Err(ForgeError::Cancelled) => false,
            Err(e) => {
                self.error = Some(e.user_message());
                true
            }
        }
    }

    pub fn stop(&mut self) {
        self.cancel_in_flight();
    }
}

impl Drop for NarrationController {
    fn drop(&mut self) {
        self.cancel_in_flight();
    }
}
