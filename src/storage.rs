//! Storage Layer
//!
//! Ordered byte-key/byte-value transactional persistence with per-key TTL and
//! prefix iteration. All stateful parts of the runtime (session timestamps,
//! delta snapshots, join caches) go through this contract.
//!
//! # Components
//!
//! - [`Store`] / [`Txn`]: the transactional storage contract
//! - [`SledStore`]: the sled-backed engine adapter
//! - [`Entry`]: a key/value pair returned by prefix scans

mod error;
mod sleddb;
mod store;

pub use error::StorageError;
pub use sleddb::SledStore;
pub use store::{Entry, Store, Txn};
