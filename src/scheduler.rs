//! Cron-triggered, concurrency-bounded run orchestration.
//!
//! Each registered job fires on its cron expression, creates a fresh
//! [`Session`], acquires a run slot from a counting semaphore within a grace
//! period, and registers itself in the running-set keyed `collector/host`.
//! A slot timeout or an already-running job identity drops the trigger
//! entirely: missed runs are logged, never queued.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;

use crate::collector::Collector;
use crate::event::Event;
use crate::node::Node;
use crate::registry::{Registry, RegistryError};
use crate::session::Session;
use crate::storage::Store;

/// Grace window for running jobs to drain on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Drain poll interval.
const DRAIN_POLL: Duration = Duration::from_secs(1);

/// Scheduler setup and registration errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Invalid cron expression.
    #[error("invalid cron expression {spec:?}: {reason}")]
    InvalidCron {
        /// The rejected expression.
        spec: String,
        /// Parse failure detail.
        reason: String,
    },

    /// Underlying cron engine failure.
    #[error("cron engine error: {0}")]
    Engine(String),

    /// Job references an unregistered collector.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Cron orchestrator with bounded parallelism and per-job run deduplication.
pub struct Scheduler {
    cron: JobScheduler,
    registry: Arc<Registry>,
    store: Arc<dyn Store>,
    root: CancellationToken,
    sema: Arc<Semaphore>,
    max_tasks: usize,
    grace: Duration,
    running: Arc<Mutex<HashMap<String, Arc<Session>>>>,
    out: mpsc::Sender<Event>,
}

impl Scheduler {
    /// Create a scheduler delivering all job output to `out`.
    ///
    /// `max_tasks` bounds concurrent runs across all jobs; `grace` bounds
    /// how long a trigger waits for a free run slot before being dropped.
    pub async fn new(
        registry: Arc<Registry>,
        store: Arc<dyn Store>,
        max_tasks: usize,
        grace: Duration,
        out: mpsc::Sender<Event>,
    ) -> Result<Self, SchedulerError> {
        let cron = JobScheduler::new()
            .await
            .map_err(|e| SchedulerError::Engine(e.to_string()))?;

        Ok(Self {
            cron,
            registry,
            store,
            root: CancellationToken::new(),
            sema: Arc::new(Semaphore::new(max_tasks)),
            max_tasks,
            grace,
            running: Arc::new(Mutex::new(HashMap::new())),
            out,
        })
    }

    /// Register a recurring run of `collector` against `node`.
    pub async fn add_job(
        &self,
        spec: &str,
        collector: &str,
        node: Arc<Node>,
        timeout: Duration,
    ) -> Result<uuid::Uuid, SchedulerError> {
        use std::str::FromStr;

        let collector = self.registry.get(collector)?;

        // Validate eagerly so a bad expression fails registration, not the
        // first trigger.
        cron::Schedule::from_str(spec).map_err(|e| SchedulerError::InvalidCron {
            spec: spec.to_string(),
            reason: e.to_string(),
        })?;

        let job = {
            let registry = Arc::clone(&self.registry);
            let store = Arc::clone(&self.store);
            let root = self.root.clone();
            let sema = Arc::clone(&self.sema);
            let grace = self.grace;
            let running = Arc::clone(&self.running);
            let out = self.out.clone();

            Job::new_cron_job_async(spec, move |_id: uuid::Uuid, _sched: JobScheduler| {
                let registry = Arc::clone(&registry);
                let store = Arc::clone(&store);
                let collector = Arc::clone(&collector);
                let node = Arc::clone(&node);
                let root = root.clone();
                let sema = Arc::clone(&sema);
                let running = Arc::clone(&running);
                let out = out.clone();
                Box::pin(async move {
                    run_job(
                        registry, store, collector, node, timeout, root, sema, grace, running,
                        out,
                    )
                    .await;
                })
                    as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
            })
            .map_err(|e| SchedulerError::Engine(e.to_string()))?
        };

        let id = self
            .cron
            .add(job)
            .await
            .map_err(|e| SchedulerError::Engine(e.to_string()))?;
        tracing::info!(job_id = %id, schedule = %spec, "job registered");
        Ok(id)
    }

    /// Start firing cron triggers.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        self.cron
            .start()
            .await
            .map_err(|e| SchedulerError::Engine(e.to_string()))?;
        tracing::info!("scheduler started");
        Ok(())
    }

    /// Halt new triggers, wait for running jobs to drain (bounded), then
    /// cancel the root context.
    pub async fn stop(mut self) -> Result<(), SchedulerError> {
        self.cron
            .shutdown()
            .await
            .map_err(|e| SchedulerError::Engine(e.to_string()))?;
        self.wait_jobs().await;
        self.root.cancel();
        tracing::info!("scheduler stopped");
        Ok(())
    }

    /// Immediate shutdown: cancel running jobs first, then wait for them to
    /// release their slots.
    pub async fn cancel(mut self) -> Result<(), SchedulerError> {
        self.cron
            .shutdown()
            .await
            .map_err(|e| SchedulerError::Engine(e.to_string()))?;
        self.root.cancel();
        self.wait_jobs().await;
        tracing::info!("scheduler cancelled");
        Ok(())
    }

    async fn wait_jobs(&self) {
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while self.sema.available_permits() < self.max_tasks {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("drain window elapsed with jobs still running");
                return;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }
}

/// One triggered execution: session creation, slot acquisition, dedup,
/// pipeline run, cleanup.
#[allow(clippy::too_many_arguments)]
async fn run_job(
    registry: Arc<Registry>,
    store: Arc<dyn Store>,
    collector: Arc<Collector>,
    node: Arc<Node>,
    timeout: Duration,
    root: CancellationToken,
    sema: Arc<Semaphore>,
    grace: Duration,
    running: Arc<Mutex<HashMap<String, Arc<Session>>>>,
    out: mpsc::Sender<Event>,
) {
    let job_name = format!("{}/{}", collector.name(), node.hostname);

    let session = match Session::new(
        collector.name(),
        Arc::clone(&node),
        store,
        timeout,
        &root,
    ) {
        Ok(session) => Arc::new(session),
        Err(e) => {
            tracing::error!(job = %job_name, error = %e, "creating session");
            return;
        }
    };

    let permit = match tokio::time::timeout(grace, sema.acquire()).await {
        Ok(Ok(permit)) => permit,
        Ok(Err(_)) => return, // semaphore closed, shutting down
        Err(_) => {
            tracing::error!(job = %job_name, grace = ?grace,
                "timeout waiting for run slot, trigger dropped");
            session.cancel();
            return;
        }
    };

    {
        let mut guard = running.lock().unwrap_or_else(|e| e.into_inner());
        if guard.contains_key(&job_name) {
            drop(guard);
            tracing::error!(job = %job_name, "already running, trigger dropped");
            session.cancel();
            drop(permit);
            return;
        }
        guard.insert(job_name.clone(), Arc::clone(&session));
    }

    collector.start(&registry, &session, out).await;

    let removed = running
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&job_name);
    if removed.is_none() {
        tracing::error!(job = %job_name, "not found in running set after completion");
    }
    drop(permit);
}
