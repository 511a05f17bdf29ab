//! Error types for the sync engine.

use thiserror::Error;

/// Failure reported by a remote store.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct RemoteError {
    /// Store-defined error code (e.g. "permission-denied", "unavailable").
    pub code: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Main error type for engine operations.
///
/// Runtime failures are delivered through the cache's error slot; only
/// `InvalidOptions` is ever returned synchronously.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("Remote read failed: {0}")]
    RemoteRead(RemoteError),

    #[error("Listener failed: {0}")]
    Listener(RemoteError),

    #[error("Named query not found: {0}")]
    NamedQueryNotFound(String),

    #[error("Invalid query options: {0}")]
    InvalidOptions(String),
}

impl SyncError {
    /// The underlying store error, if any.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            SyncError::RemoteRead(e) | SyncError::Listener(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;
