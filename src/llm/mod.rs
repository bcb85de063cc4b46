pub mod openai;

use crate::db::models::Role;
use serde::{Deserialize, Serialize};

pub use openai::OpenAiClient;

/// Longest slice of an error body kept when the API rejects a request.
pub const ERROR_BODY_EXCERPT_CHARS: usize = 200;

/// Reply used when the API answers 2xx but without a usable choice.
pub const NO_RESPONSE_FALLBACK: &str = "No se pudo obtener una respuesta del asistente.";

/// One turn of the conversation as sent to the completion API.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    /// Connection failure or timeout; no status was received.
    #[error("HTTP error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The API answered with a non-success status.
    #[error("API error: {status} - {body}")]
    Api { status: u16, body: String },
}

impl CompletionError {
    pub fn api(status: u16, body: &str) -> Self {
        CompletionError::Api {
            status,
            body: body.chars().take(ERROR_BODY_EXCERPT_CHARS).collect(),
        }
    }

    /// Text shown to the user in place of a reply, for failures that keep the
    /// conversation going. Transport failures have none.
    pub fn as_reply(&self) -> Option<String> {
        match self {
            CompletionError::Api { status, body } => {
                Some(format!("Error en la API ({}): {}", status, body))
            }
            CompletionError::Transport(_) => None,
        }
    }
}
