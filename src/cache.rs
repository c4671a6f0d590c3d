//! Join cache: TTL-bound snapshots of a collector's last successful output.
//!
//! Cache batches are persisted under `cache/<collector>/<host>/` with a
//! `last_timestamp` sentinel marking batch validity. A missing or expired
//! sentinel means the target collector is re-run end-to-end as an isolated
//! child run; its output batch is persisted in a dedicated short-lived write
//! transaction, outside the calling run's own transaction and delta state.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::collector::Collector;
use crate::event::{self, Event};
use crate::registry::{Registry, RegistryError};
use crate::session::{Session, SessionError};
use crate::storage::StorageError;

const CACHE_PREFIX: &str = "cache";
const KEY_LAST_TIMESTAMP: &str = "last_timestamp";

/// Errors aborting join-cache warm-up. All of these abort the calling run.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Join target is not registered.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Storage failure other than not-found.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Child session could not be created.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Event could not be serialized for persistence.
    #[error("serializing cache event: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A join was configured without index key fields.
    #[error("empty key fields for caching {0}")]
    EmptyKeyFields(String),
}

/// Get the cached index for `name`, re-running the collector when the cache
/// is missing or expired.
///
/// The returned index maps each configured key-field value to the raw cached
/// event, for O(1) join lookups.
pub(crate) async fn get(
    registry: &Arc<Registry>,
    session: &Arc<Session>,
    ttl: Duration,
    name: &str,
    key_fields: &[String],
) -> Result<HashMap<String, Event>, CacheError> {
    let collector = registry.get(name)?;
    let host = &session.node().hostname;
    let sentinel = format!("{CACHE_PREFIX}/{name}/{host}/{KEY_LAST_TIMESTAMP}").into_bytes();
    let prefix = format!("{CACHE_PREFIX}/{name}/{host}/").into_bytes();

    let mut txn = session.store().begin()?;
    let entries = match txn.get(&sentinel) {
        Ok(_) => {
            let entries = txn.get_tree(&prefix)?;
            txn.discard();
            entries
        }
        Err(StorageError::NotFound) => {
            txn.discard();
            tracing::debug!(collector = %name, host = %host,
                "join cache missing or expired, running target collector");
            return run(
                registry, session, collector, key_fields, ttl, &sentinel, &prefix,
            )
            .await;
        }
        Err(e) => {
            txn.discard();
            return Err(e.into());
        }
    };

    // Rebuild the in-memory index from the persisted batch. Per-entry
    // extraction failures are skipped, not fatal.
    let mut index = HashMap::new();
    for entry in entries {
        if entry.key.ends_with(KEY_LAST_TIMESTAMP.as_bytes()) {
            continue;
        }
        let event: Event = match serde_json::from_slice(&entry.value) {
            Ok(ev) => ev,
            Err(e) => {
                tracing::warn!(collector = %name, host = %host, error = %e,
                    "skipping undecodable cached event");
                continue;
            }
        };
        for field in key_fields {
            if let Some(key) = event::get_string(&event, field) {
                index.insert(key, event.clone());
            }
        }
    }
    Ok(index)
}

/// Run the target collector as an isolated child run and persist its output
/// batch TTL-bound, returning the freshly built index.
fn run<'a>(
    registry: &'a Arc<Registry>,
    session: &'a Arc<Session>,
    collector: Arc<Collector>,
    key_fields: &'a [String],
    ttl: Duration,
    sentinel: &'a [u8],
    prefix: &'a [u8],
) -> Pin<Box<dyn Future<Output = Result<HashMap<String, Event>, CacheError>> + Send + 'a>> {
    // Boxed to break the recursive opaque-future cycle through
    // `Collector::start` so the spawned child run can be proven `Send`.
    Box::pin(async move {
        if key_fields.is_empty() {
            return Err(CacheError::EmptyKeyFields(collector.name().to_string()));
        }

        let child = Arc::new(session.child(collector.name())?);
        let (tx, mut rx) = mpsc::channel::<Event>(1);

        let producer = {
            let collector = Arc::clone(&collector);
            let registry = Arc::clone(registry);
            tokio::spawn(async move {
                collector.start(&registry, &child, tx).await;
            })
        };

        let mut batch = session.store().begin()?;
        batch.set_with_ttl(sentinel, Utc::now().to_rfc3339().as_bytes(), ttl)?;

        let mut index = HashMap::new();
        while let Some(event) = rx.recv().await {
            for (i, field) in key_fields.iter().enumerate() {
                let Some(key) = event::get_string(&event, field) else {
                    continue;
                };
                // The first key field names the persisted entry.
                if i == 0 {
                    let store_key = [prefix, key.as_bytes()].concat();
                    batch.set_with_ttl(&store_key, &serde_json::to_vec(&event)?, ttl)?;
                }
                index.insert(key, event.clone());
            }
        }

        // The child run commits or discards its own state inside the pipeline;
        // the batch is valid either way, an empty one caches "no output".
        let _ = producer.await;
        batch.commit()?;
        Ok(index)
    })
}
