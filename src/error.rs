//! Error taxonomy (§7) communicated back to clients.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, Clone, Serialize)]
#[serde(tag = "code", content = "message", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatError {
    #[error("missing or invalid credential")]
    Unauthorized,
    #[error("operation requires membership or role the user lacks")]
    Forbidden,
    #[error("{0}")]
    InvalidMessage(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("{0}")]
    Internal(String),
}

impl ChatError {
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Unauthorized => "UNAUTHORIZED",
            ChatError::Forbidden => "FORBIDDEN",
            ChatError::InvalidMessage(_) => "INVALID_MESSAGE",
            ChatError::NotFound(_) => "NOT_FOUND",
            ChatError::Conflict(_) => "CONFLICT",
            ChatError::RateLimited { .. } => "RATE_LIMITED",
            ChatError::Internal(_) => "INTERNAL",
        }
    }

    /// Render as the `error` server event payload (§6).
    pub fn to_event(&self) -> crate::models::ServerEvent {
        crate::models::ServerEvent::Error {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

impl From<rusqlite::Error> for ChatError {
    fn from(e: rusqlite::Error) -> Self {
        ChatError::Internal(e.to_string())
    }
}
