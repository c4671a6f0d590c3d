//! Sonde - Pluggable Telemetry-Collection Runtime
//!
//! This crate runs named collectors against remote hosts and databases,
//! normalizes their output into structured events, computes stateful derived
//! metrics (deltas/rates), enriches events by joining against other
//! collectors' cached output, and schedules recurring collection under
//! bounded concurrency with crash-safe state persistence.
//!
//! # Architecture
//!
//! - **Collectors**: registered units of acquisition implementing [`Source`]
//! - **Session**: per-run binding of collector, node, transaction and deadline
//! - **EventOps**: field coercion and delta/rate computation
//! - **Join/Cache**: cross-collector enrichment from TTL-bound cached output
//! - **Scheduler**: cron-triggered, semaphore-bounded orchestration
//! - **Storage**: ordered transactional key-value persistence ([`SledStore`])
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sonde::{collector::local, Registry, Scheduler, SledStore, Node, Store};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut registry = Registry::new();
//! local::register(&mut registry)?;
//!
//! let store: Arc<dyn Store> = Arc::new(SledStore::open("./statedb")?);
//! let (tx, mut rx) = tokio::sync::mpsc::channel(64);
//!
//! let scheduler = Scheduler::new(
//!     Arc::new(registry), store, 4, Duration::from_secs(5), tx,
//! ).await?;
//! scheduler
//!     .add_job("0 */1 * * * *", "/local/system/loadavg",
//!         Arc::new(Node::new("localhost")), Duration::from_secs(30))
//!     .await?;
//! scheduler.start().await?;
//!
//! while let Some(event) = rx.recv().await {
//!     println!("{}", serde_json::Value::Object(event));
//! }
//! # Ok(())
//! # }
//! ```

mod cache;
pub mod collector;
pub mod config;
pub mod event;
mod eventops;
mod join;
mod node;
mod registry;
mod scheduler;
mod session;
pub mod storage;

pub use cache::CacheError;
pub use collector::{Collector, CollectorError, PostOps, Source};
pub use config::{AppConfig, ConfigError, JobConfig, SchedulerConfig};
pub use event::{Event, EventError, FieldRule, FieldType};
pub use eventops::{blacklist, Blacklist, DeltaOps, EventOps, EventOpsError};
pub use join::Join;
pub use node::Node;
pub use registry::{Registry, RegistryError};
pub use scheduler::{Scheduler, SchedulerError};
pub use session::{Session, SessionError, WarmCache};
pub use storage::{Entry, SledStore, StorageError, Store, Txn};
