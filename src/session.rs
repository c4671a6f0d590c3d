//! Per-run session: the binding of one collector invocation to one node,
//! one storage transaction, a deadline, and a shared warm cache.
//!
//! A session is single-use. It is created per scheduled or ad-hoc invocation
//! and destroyed at run end: [`Session::commit`] persists the current run
//! time as the new last-run time and commits the transaction, exactly once
//! and only on success; [`Session::cancel`] discards everything and is
//! idempotent. Child sessions created for join warm-up share the warm cache
//! by reference but own their own transaction, so a child's delta state is
//! fully isolated from the parent's.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::event::{Event, FIELD_HOST, FIELD_METRIC, FIELD_TIMESTAMP};
use crate::node::Node;
use crate::storage::{Entry, StorageError, Store, Txn};

const KEY_LAST_TIMESTAMP: &[u8] = b"last_timestamp";

/// Shared join-cache handle: collector name → (key value → cached event).
///
/// Owned by the top-level run; children borrow the same handle so a cache
/// warmed for one join is visible to every sibling within the run.
pub type WarmCache = Arc<Mutex<HashMap<String, HashMap<String, Event>>>>;

/// Session lifecycle and storage errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Underlying storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Operation on a session whose transaction is already finished.
    #[error("session already closed")]
    Closed,

    /// Persisted last-run timestamp could not be decoded.
    #[error("invalid persisted timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Per-execution run context.
pub struct Session {
    name: String,
    node: Arc<Node>,
    store: Arc<dyn Store>,
    txn: Mutex<Option<Box<dyn Txn>>>,
    prefix: Vec<u8>,
    timeout: Duration,
    deadline: Instant,
    cancel: CancellationToken,
    last_run_time: DateTime<Utc>,
    current_run_time: DateTime<Utc>,
    cache: WarmCache,
}

impl Session {
    /// Create a session for one collector run.
    ///
    /// Opens a transaction, loads the last successful run timestamp for
    /// `(name, host)` (missing means epoch zero, not an error), fixes the
    /// current run time, and derives a cancellable scope bounded by
    /// `timeout` under `parent`.
    pub fn new(
        name: impl Into<String>,
        node: Arc<Node>,
        store: Arc<dyn Store>,
        timeout: Duration,
        parent: &CancellationToken,
    ) -> Result<Self, SessionError> {
        let name = name.into();
        let prefix = format!("session/{}/{}/", name, node.hostname).into_bytes();
        let mut txn = store.begin()?;

        let last_run_time = Self::load_last_time(txn.as_mut(), &prefix)?;

        Ok(Self {
            name,
            node,
            store,
            txn: Mutex::new(Some(txn)),
            prefix,
            timeout,
            deadline: Instant::now() + timeout,
            cancel: parent.child_token(),
            last_run_time,
            current_run_time: Utc::now(),
            cache: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Create a child session for `name` within this session's scope.
    ///
    /// The child opens its own transaction but shares this session's warm
    /// cache by reference and derives its cancellation from this session.
    pub fn child(&self, name: &str) -> Result<Session, SessionError> {
        let mut child = Session::new(
            name,
            Arc::clone(&self.node),
            Arc::clone(&self.store),
            self.timeout,
            &self.cancel,
        )?;
        child.cache = Arc::clone(&self.cache);
        Ok(child)
    }

    fn load_last_time(
        txn: &mut dyn Txn,
        prefix: &[u8],
    ) -> Result<DateTime<Utc>, SessionError> {
        let key = [prefix, KEY_LAST_TIMESTAMP].concat();
        match txn.get(&key) {
            Ok(raw) => {
                let text = String::from_utf8(raw)
                    .map_err(|e| SessionError::InvalidTimestamp(e.to_string()))?;
                DateTime::parse_from_rfc3339(&text)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| SessionError::InvalidTimestamp(e.to_string()))
            }
            Err(StorageError::NotFound) => Ok(DateTime::<Utc>::UNIX_EPOCH),
            Err(e) => Err(e.into()),
        }
    }

    // --- Session-scoped storage, keyed under session/<name>/<host>/ ---

    /// Get the value for the given session-scoped key.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.raw_get(&[self.prefix.as_slice(), key].concat())
    }

    /// Get all session-scoped entries under the given prefix.
    pub fn get_tree(&self, prefix: &[u8]) -> Result<Vec<Entry>, SessionError> {
        self.raw_get_tree(&[self.prefix.as_slice(), prefix].concat())
    }

    /// Set the value for the given session-scoped key.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<(), SessionError> {
        let key = [self.prefix.as_slice(), key].concat();
        self.with_txn(|txn| txn.set(&key, value))
    }

    /// Set a session-scoped key with a time-to-live.
    pub fn set_with_ttl(
        &self,
        key: &[u8],
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), SessionError> {
        let key = [self.prefix.as_slice(), key].concat();
        self.with_txn(|txn| txn.set_with_ttl(&key, value, ttl))
    }

    /// Delete the given session-scoped key.
    pub fn delete(&self, key: &[u8]) -> Result<(), SessionError> {
        let key = [self.prefix.as_slice(), key].concat();
        self.with_txn(|txn| txn.delete(&key))
    }

    /// Delete all session-scoped keys under the given prefix.
    pub fn delete_tree(&self, prefix: &[u8]) -> Result<(), SessionError> {
        let key = [self.prefix.as_slice(), prefix].concat();
        self.with_txn(|txn| txn.delete_tree(&key))
    }

    // --- Unscoped storage for the delta/ and cache/ namespaces ---

    pub(crate) fn raw_get(&self, key: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.with_txn(|txn| txn.get(key))
    }

    pub(crate) fn raw_get_tree(&self, prefix: &[u8]) -> Result<Vec<Entry>, SessionError> {
        self.with_txn(|txn| txn.get_tree(prefix))
    }

    pub(crate) fn raw_set_with_ttl(
        &self,
        key: &[u8],
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), SessionError> {
        self.with_txn(|txn| txn.set_with_ttl(key, value, ttl))
    }

    fn with_txn<T>(
        &self,
        op: impl FnOnce(&mut dyn Txn) -> Result<T, StorageError>,
    ) -> Result<T, SessionError> {
        let mut guard = self.txn.lock().unwrap_or_else(|e| e.into_inner());
        let txn = guard.as_mut().ok_or(SessionError::Closed)?;
        Ok(op(txn.as_mut())?)
    }

    // --- Lifecycle ---

    /// Persist the current run time as the new last successful run time and
    /// commit the transaction. Must be called exactly once, only on success.
    pub fn commit(&self) -> Result<(), SessionError> {
        let txn = {
            let mut guard = self.txn.lock().unwrap_or_else(|e| e.into_inner());
            let txn = guard.as_mut().ok_or(SessionError::Closed)?;
            let key = [self.prefix.as_slice(), KEY_LAST_TIMESTAMP].concat();
            txn.set(&key, self.current_run_time.to_rfc3339().as_bytes())?;
            guard.take().ok_or(SessionError::Closed)?
        };
        txn.commit()?;
        self.cancel.cancel();
        tracing::debug!(collector = %self.name, host = %self.node.hostname,
            "committed session data");
        Ok(())
    }

    /// Discard the transaction without persisting anything. Idempotent.
    pub fn cancel(&self) {
        let txn = {
            let mut guard = self.txn.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(txn) = txn {
            txn.discard();
            tracing::debug!(collector = %self.name, host = %self.node.hostname,
                "session cancelled, transaction discarded");
        }
        self.cancel.cancel();
    }

    /// Resolve when the session is cancelled or its deadline passes.
    pub async fn cancelled(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep_until(self.deadline) => {}
        }
    }

    /// True once the session deadline has passed.
    pub fn deadline_exceeded(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// True once the session has been cancelled or its deadline passed.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline_exceeded()
    }

    // --- Accessors ---

    /// Collector name bound to this session.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node bound to this session.
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Configured run timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Last successful run time for `(collector, host)`; epoch zero when
    /// this job never completed before.
    pub fn last_run_time(&self) -> DateTime<Utc> {
        self.last_run_time
    }

    /// This run's fixed timestamp.
    pub fn current_run_time(&self) -> DateTime<Utc> {
        self.current_run_time
    }

    pub(crate) fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    pub(crate) fn warm_cache(&self) -> &WarmCache {
        &self.cache
    }

    /// Inject run metadata into an outgoing event: timestamp (when absent),
    /// collector name and host.
    pub fn enrich(&self, event: &mut Event) {
        if !event.contains_key(FIELD_TIMESTAMP) {
            event.insert(
                FIELD_TIMESTAMP.to_string(),
                self.current_run_time.to_rfc3339().into(),
            );
        }
        event.insert(FIELD_METRIC.to_string(), self.name.clone().into());
        event.insert(FIELD_HOST.to_string(), self.node.hostname.clone().into());
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("host", &self.node.hostname)
            .field("current_run_time", &self.current_run_time)
            .finish_non_exhaustive()
    }
}
