//! Error types for the sync engine.

use fieldsync_protocol::{ConflictId, OperationId, ProtocolError};
use fieldsync_storage::StorageError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in the engine.
///
/// Version conflicts are not errors: they are a normal outcome recorded
/// on the queue and published in the snapshot.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Durable write or read failed.
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    /// Encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] ProtocolError),

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The server failed without deciding on the request.
    #[error("server error: {0}")]
    ServerError(String),

    /// The server answered in a way that contradicts the request.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A remote call did not finish within the request timeout.
    #[error("operation timed out")]
    Timeout,

    /// The device is offline.
    #[error("device is offline")]
    NotConnected,

    /// The pass was cancelled between operations.
    #[error("sync cancelled")]
    Cancelled,

    /// The caller supplied an operation that cannot be queued.
    #[error("invalid operation: {0}")]
    InvalidInput(String),

    /// No live operation with this id.
    #[error("unknown operation {0}")]
    UnknownOperation(OperationId),

    /// No pending conflict with this id.
    #[error("unknown conflict {0}")]
    UnknownConflict(ConflictId),

    /// The requested resolution cannot be applied to this conflict.
    #[error("invalid resolution: {0}")]
    InvalidResolution(String),

    /// An operation was asked to move between incompatible states.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Another process holds the data directory.
    #[error("data directory is locked by another process: {}", .0.display())]
    DirectoryLocked(PathBuf),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout | SyncError::NotConnected | SyncError::ServerError(_) => true,
            _ => false,
        }
    }

    /// Returns true for local persistence failures.
    pub fn is_storage(&self) -> bool {
        matches!(self, SyncError::Storage(_))
    }
}
