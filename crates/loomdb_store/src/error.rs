//! Error types for the backing store.

use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in backing store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error from a durable implementation.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The commit could not be applied atomically.
    #[error("commit failed: {message}")]
    CommitFailed {
        /// Description of the failure.
        message: String,
    },

    /// A read was requested at a snapshot the store has never produced.
    #[error("unknown snapshot: requested {requested}, latest committed is {committed}")]
    UnknownSnapshot {
        /// The snapshot that was requested.
        requested: u64,
        /// The latest snapshot the store has committed.
        committed: u64,
    },

    /// The store rejected an operation in its current state.
    #[error("invalid store operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl StoreError {
    /// Creates a commit failure error.
    pub fn commit_failed(message: impl Into<String>) -> Self {
        Self::CommitFailed {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }
}
