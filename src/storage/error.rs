//! Storage-specific error types.

use thiserror::Error;

/// Errors that can occur in the storage layer.
///
/// `NotFound` is a distinguished outcome, not a failure: callers treat a
/// missing or expired key as "never written" and must match on it explicitly.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Key is absent or its TTL has expired.
    #[error("key not found")]
    NotFound,

    /// Underlying engine failure.
    #[error("engine error: {0}")]
    Engine(#[from] sled::Error),

    /// Stored value envelope could not be decoded.
    #[error("corrupt value for key {0}")]
    Corrupt(String),

    /// Operation attempted on a finished transaction.
    #[error("transaction already closed")]
    TxnClosed,
}

impl StorageError {
    /// True when this is the distinguished not-found outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}
