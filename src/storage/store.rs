//! The transactional storage contract.

use std::time::Duration;

use crate::storage::StorageError;

/// A key/value pair returned by prefix scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Full key, including any namespace prefix.
    pub key: Vec<u8>,
    /// Decoded value payload.
    pub value: Vec<u8>,
}

/// Ordered byte-key/byte-value store producing transactions.
///
/// Implementations must support concurrent transactions from independent job
/// runs; writes become visible to other transactions only on commit.
pub trait Store: Send + Sync {
    /// Open a new transaction.
    fn begin(&self) -> Result<Box<dyn Txn>, StorageError>;
}

/// A single storage transaction.
///
/// Reads observe the transaction's own pending writes. `commit` applies all
/// pending writes atomically; dropping or [`Txn::discard`]ing the transaction
/// applies nothing.
pub trait Txn: Send {
    /// Get the value for the given key.
    ///
    /// Returns [`StorageError::NotFound`] for absent or TTL-expired keys.
    fn get(&mut self, key: &[u8]) -> Result<Vec<u8>, StorageError>;

    /// Get all live entries under the given key prefix, in key order.
    fn get_tree(&mut self, prefix: &[u8]) -> Result<Vec<Entry>, StorageError>;

    /// Set the value for the given key, without expiry.
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    /// Set the value for the given key with a time-to-live.
    fn set_with_ttl(&mut self, key: &[u8], value: &[u8], ttl: Duration)
        -> Result<(), StorageError>;

    /// Delete the given key.
    fn delete(&mut self, key: &[u8]) -> Result<(), StorageError>;

    /// Delete all keys under the given prefix.
    fn delete_tree(&mut self, prefix: &[u8]) -> Result<(), StorageError>;

    /// Atomically apply all pending writes.
    fn commit(self: Box<Self>) -> Result<(), StorageError>;

    /// Drop all pending writes.
    fn discard(self: Box<Self>);
}
