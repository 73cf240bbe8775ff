//! Error types for the coherence engine.

use loomdb_store::StoreError;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur in engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Backing store error. Fatal to the in-flight transaction, which is
    /// rolled back; subsequent transactions are unaffected.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// An extension hook reported an invariant violation. The whole
    /// transaction is rolled back; no partial extension state persists.
    #[error("extension '{extension}' vetoed the transaction: {reason}")]
    ExtensionVeto {
        /// Name of the vetoing extension.
        extension: String,
        /// Description of the violated invariant.
        reason: String,
    },

    /// A second read-write transaction was opened while one is active on
    /// the same connection. Programming error, reported immediately.
    #[error("concurrency violation: {message}")]
    ConcurrencyViolation {
        /// Description of the violation.
        message: String,
    },

    /// A changeset applied during drain was not contiguous with the
    /// connection's local snapshot. The pending queue is corrupt; the
    /// connection is poisoned and must be discarded and recreated.
    #[error("stale cache: expected changeset for snapshot {expected}, got {actual}")]
    StaleCache {
        /// The snapshot the connection expected next.
        expected: u64,
        /// The snapshot the queued changeset carried.
        actual: u64,
    },

    /// The connection was poisoned by an earlier `StaleCache` failure.
    #[error("connection is poisoned and must be recreated")]
    ConnectionPoisoned,

    /// The database has been closed.
    #[error("database is closed")]
    DatabaseClosed,

    /// Extension registration or lookup failed.
    #[error("extension not found: {name}")]
    ExtensionNotFound {
        /// The extension name.
        name: String,
    },

    /// An extension failed to decode its private table contents.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl EngineError {
    /// Creates an extension veto error.
    pub fn veto(extension: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ExtensionVeto {
            extension: extension.into(),
            reason: reason.into(),
        }
    }

    /// Creates a concurrency violation error.
    pub fn concurrency_violation(message: impl Into<String>) -> Self {
        Self::ConcurrencyViolation {
            message: message.into(),
        }
    }

    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
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
