//! Error taxonomy shared by the state core and the workflow layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// External service a credential belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Service {
    Gemini,
    ElevenLabs,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Service::Gemini => write!(f, "Gemini"),
            Service::ElevenLabs => write!(f, "ElevenLabs"),
        }
    }
}

/// A model reply that parsed but did not have the expected shape.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("invalid `{field}`: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForgeError {
    /// Quota exhausted on the remote side. Retry the same action later.
    #[error("API rate limit exceeded. Please wait a moment before trying again. ({message})")]
    RateLimited { message: String },

    /// Declined by the remote content policy. Needs a different prompt.
    #[error("Request was blocked for safety reasons. Please adjust your prompt. ({message})")]
    ContentRejected { message: String },

    /// Any other collaborator failure, raw message passed through.
    #[error("{message}")]
    ExternalFailure { message: String },

    #[error("Unexpected response format: {0}")]
    InvalidResponse(ValidationError),

    #[error("{service} API key is not configured. Please set a valid API key to continue.")]
    MissingCredential { service: Service },

    #[error("Request was cancelled")]
    Cancelled,

    /// Programmer error: unknown id, editing a non-user message, and so on.
    #[error("Contract violation: {0}")]
    ContractViolation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    RateLimited,
    ContentRejected,
    ExternalFailure,
    InvalidResponse,
    MissingCredential,
    Cancelled,
    ContractViolation,
}

impl ForgeError {
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited {
            message: message.into(),
        }
    }

    pub fn content_rejected(message: impl Into<String>) -> Self {
        Self::ContentRejected {
            message: message.into(),
        }
    }

    pub fn external(message: impl Into<String>) -> Self {
        Self::ExternalFailure {
            message: message.into(),
        }
    }

    pub fn missing_credential(service: Service) -> Self {
        Self::MissingCredential { service }
    }

    /// Builds a contract violation and logs it; these are defects, not user errors.
    pub fn contract(message: impl Into<String>) -> Self {
        let message = message.into();
        log::error!("contract violation: {}", message);
        Self::ContractViolation(message)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::ContentRejected { .. } => ErrorKind::ContentRejected,
            Self::ExternalFailure { .. } => ErrorKind::ExternalFailure,
            Self::InvalidResponse(_) => ErrorKind::InvalidResponse,
            Self::MissingCredential { .. } => ErrorKind::MissingCredential,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::ContractViolation(_) => ErrorKind::ContractViolation,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::ExternalFailure { .. } | Self::InvalidResponse(_)
        )
    }

    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Self::ContractViolation(_) | Self::Cancelled)
    }

    /// Single line suitable for an error banner.
    pub fn user_message(&self) -> String {
        match self {
            Self::RateLimited { .. } => {
                "API rate limit exceeded. Please wait a moment before trying again.".to_string()
            }
            Self::ContentRejected { .. } => {
                "Generation was blocked for safety reasons. Please adjust your prompt.".to_string()
            }
            Self::ContractViolation(_) => "An internal error occurred.".to_string(),
            other => other.to_string(),
        }
    }

    /// Maps any collaborator error onto the taxonomy.
    ///
    /// Typed errors raised by the service clients are recovered by downcast;
    /// everything else is classified from its message.
    pub fn classify(err: &anyhow::Error) -> Self {
        if let Some(forge) = err.downcast_ref::<ForgeError>() {
            return forge.clone();
        }
        if let Some(validation) = err.downcast_ref::<ValidationError>() {
            return Self::InvalidResponse(validation.clone());
        }

        let message = format!("{:#}", err);
        let lower = message.to_lowercase();
        if message.contains("429") || message.contains("RESOURCE_EXHAUSTED") {
            Self::rate_limited(message)
        } else if lower.contains("safety") {
            Self::content_rejected(message)
        } else {
            Self::external(message)
        }
    }
}
