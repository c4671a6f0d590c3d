//! Sled-backed engine adapter.
//!
//! Values are stored inside an envelope carrying an 8-byte big-endian expiry
//! in unix milliseconds (zero means no expiry), followed by the payload. An
//! expired entry is reported as [`StorageError::NotFound`], exactly like a
//! missing one.
//!
//! Transactions buffer writes in an ordered write-set and apply them on
//! commit as a single atomic `sled::Batch` followed by a flush. Reads observe
//! the transaction's own pending writes before falling through to the tree.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;

use crate::storage::{Entry, StorageError, Store, Txn};

const ENVELOPE_HEADER: usize = 8;

/// Ordered key-value store backed by a sled database.
#[derive(Debug, Clone)]
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Open a temporary store, discarded on drop. Intended for tests.
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }
}

impl Store for SledStore {
    fn begin(&self) -> Result<Box<dyn Txn>, StorageError> {
        Ok(Box::new(SledTxn {
            db: self.db.clone(),
            writes: BTreeMap::new(),
        }))
    }
}

enum Write {
    Put { value: Vec<u8>, expires_at: i64 },
    Delete,
}

struct SledTxn {
    db: sled::Db,
    writes: BTreeMap<Vec<u8>, Write>,
}

impl SledTxn {
    /// Decode an envelope, returning `None` when the entry has expired.
    fn decode(key: &[u8], raw: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        if raw.len() < ENVELOPE_HEADER {
            return Err(StorageError::Corrupt(String::from_utf8_lossy(key).into()));
        }
        let mut header = [0u8; ENVELOPE_HEADER];
        header.copy_from_slice(&raw[..ENVELOPE_HEADER]);
        let expires_at = i64::from_be_bytes(header);
        if expires_at != 0 && expires_at <= Utc::now().timestamp_millis() {
            return Ok(None);
        }
        Ok(Some(raw[ENVELOPE_HEADER..].to_vec()))
    }

    fn encode(value: &[u8], expires_at: i64) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENVELOPE_HEADER + value.len());
        out.extend_from_slice(&expires_at.to_be_bytes());
        out.extend_from_slice(value);
        out
    }

    /// Merged live view of all entries under `prefix`: tree state overlaid
    /// with this transaction's pending writes.
    fn merged_tree(&self, prefix: &[u8]) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, StorageError> {
        let mut merged = BTreeMap::new();

        for item in self.db.scan_prefix(prefix) {
            let (key, raw) = item?;
            if let Some(value) = Self::decode(&key, &raw)? {
                merged.insert(key.to_vec(), value);
            }
        }

        for (key, write) in self.writes.range(prefix.to_vec()..) {
            if !key.starts_with(prefix) {
                break;
            }
            match write {
                Write::Put { value, expires_at } => {
                    if *expires_at == 0 || *expires_at > Utc::now().timestamp_millis() {
                        merged.insert(key.clone(), value.clone());
                    } else {
                        merged.remove(key);
                    }
                }
                Write::Delete => {
                    merged.remove(key);
                }
            }
        }

        Ok(merged)
    }
}

impl Txn for SledTxn {
    fn get(&mut self, key: &[u8]) -> Result<Vec<u8>, StorageError> {
        if let Some(write) = self.writes.get(key) {
            return match write {
                Write::Put { value, expires_at } => {
                    if *expires_at != 0 && *expires_at <= Utc::now().timestamp_millis() {
                        Err(StorageError::NotFound)
                    } else {
                        Ok(value.clone())
                    }
                }
                Write::Delete => Err(StorageError::NotFound),
            };
        }

        match self.db.get(key)? {
            Some(raw) => Self::decode(key, &raw)?.ok_or(StorageError::NotFound),
            None => Err(StorageError::NotFound),
        }
    }

    fn get_tree(&mut self, prefix: &[u8]) -> Result<Vec<Entry>, StorageError> {
        Ok(self
            .merged_tree(prefix)?
            .into_iter()
            .map(|(key, value)| Entry { key, value })
            .collect())
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.writes.insert(
            key.to_vec(),
            Write::Put {
                value: value.to_vec(),
                expires_at: 0,
            },
        );
        Ok(())
    }

    fn set_with_ttl(
        &mut self,
        key: &[u8],
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), StorageError> {
        let expires_at = Utc::now().timestamp_millis() + ttl.as_millis() as i64;
        self.writes.insert(
            key.to_vec(),
            Write::Put {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StorageError> {
        self.writes.insert(key.to_vec(), Write::Delete);
        Ok(())
    }

    fn delete_tree(&mut self, prefix: &[u8]) -> Result<(), StorageError> {
        for key in self.merged_tree(prefix)?.into_keys() {
            self.writes.insert(key, Write::Delete);
        }
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let mut batch = sled::Batch::default();
        for (key, write) in self.writes {
            match write {
                Write::Put { value, expires_at } => {
                    batch.insert(key, Self::encode(&value, expires_at));
                }
                Write::Delete => batch.remove(key),
            }
        }
        self.db.apply_batch(batch)?;
        self.db.flush()?;
        Ok(())
    }

    fn discard(self: Box<Self>) {}
}
