//! Core error taxonomy shared by every subsystem.
//!
//! Meanings follow the propagation policy: object-store failures
//! surface untouched, network failures close the connection without
//! reaching channel posters, trust failures are silent at the
//! verification site, pairing failures close with a generic reason
//! (`InvalidToken` never distinguishes unknown from expired).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("pairing token invalid or expired")]
    InvalidToken,

    #[error("protocol error: expected {expected}, got {got}")]
    Protocol { expected: String, got: String },
}

impl CoreError {
    /// Stable machine-readable tag, independent of the human message.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::Storage(_) => "STORAGE",
            CoreError::Invalid(_) => "INVALID",
            CoreError::Permission(_) => "PERMISSION",
            CoreError::Timeout(_) => "TIMEOUT",
            CoreError::ConnectionClosed => "CONNECTION_CLOSED",
            CoreError::InvalidToken => "INVALID_TOKEN",
            CoreError::Protocol { .. } => "PROTOCOL",
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
