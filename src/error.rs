//! Error types for shelfsync.
//!
//! `SyncError` is the crate-level error returned by storage, cache, and
//! orchestration code. `OperationError` describes why a single queued
//! operation did not reach the server, and decides whether it is retried.

use thiserror::Error;

use crate::api::ApiError;

/// Crate-level error.
#[derive(Error, Debug)]
pub enum SyncError {
    /// `SQLite` failure, with context.
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration could not be read or written.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A referenced record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The record exists but its current state does not allow the request.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A stored or incoming payload has the wrong shape.
    #[error("Invalid payload: {0}")]
    Payload(String),

    /// JSON (de)serialization failure.
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The server surface returned an error.
    #[error("Server error: {0}")]
    Api(#[from] ApiError),
}

/// Why one queued operation failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// No handler is registered for the operation type.
    #[error("no handler registered for {0}")]
    NoHandler(String),

    /// The stored payload could not be decoded.
    #[error("payload corrupt: {0}")]
    PayloadCorrupt(String),

    /// The server refused the mutation.
    #[error("rejected by server: {0}")]
    Rejected(String),

    /// The request never got a response.
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with a transient failure.
    #[error("server error: {0}")]
    Server(String),
}

impl OperationError {
    /// Terminal failures are never retried automatically.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::NoHandler(_) | Self::PayloadCorrupt(_) | Self::Rejected(_)
        )
    }
}

impl From<ApiError> for OperationError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Network(msg) => Self::Network(msg),
            ApiError::Server { status, message } => Self::Server(format!("{status}: {message}")),
            ApiError::Rejected(msg) => Self::Rejected(msg),
            ApiError::NotFound(what) => Self::Rejected(format!("{what} no longer exists")),
        }
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}
