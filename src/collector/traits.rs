//! Collector collaborator contracts.

use thiserror::Error;
use tokio::sync::mpsc;

use crate::event::{Event, EventError};
use crate::session::{Session, SessionError};
use crate::storage::StorageError;

/// Errors a data source can fail with.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// I/O failure reaching the target.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Session storage failure.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Raw command output could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// The run was cancelled while acquiring data.
    #[error("run cancelled")]
    Cancelled,
}

/// Data-acquisition contract.
///
/// A source streams raw serialized events into `out` and signals end of
/// stream by returning (dropping the sender). It must respect the session's
/// cancellation: stop sending once [`Session::is_cancelled`] holds or a send
/// fails. Sources may fan in from concurrently spawned sub-tasks as long as
/// they all write to clones of `out`.
#[async_trait::async_trait]
pub trait Source: Send + Sync {
    /// Stream raw events for one run.
    async fn get_data(&self, session: &Session, out: mpsc::Sender<Event>)
        -> Result<(), CollectorError>;
}

/// Pure synchronous post-processing hook, applied after event ops.
///
/// A failure drops the event and the run continues.
pub type PostOps = Box<dyn Fn(Event) -> Result<Event, EventError> + Send + Sync>;
