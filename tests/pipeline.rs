//! End-to-end pipeline and scheduler tests.
//!
//! Cover commit atomicity, cancellation, join cache warm-up and reuse, and
//! the scheduler's run deduplication and dropped-trigger behavior.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sonde::{
    Collector, CollectorError, Event, Join, Node, Registry, Scheduler, Session, SledStore,
    Source, Store,
};

// =============================================================================
// Test helpers
// =============================================================================

fn ev(pairs: &[(&str, Value)]) -> Event {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Source emitting fixed events, counting runs, then optionally holding the
/// stream open until cancelled.
struct MockSource {
    events: Vec<Event>,
    runs: Arc<AtomicUsize>,
    hold: Option<Duration>,
}

impl MockSource {
    fn new(events: Vec<Event>) -> (Arc<Self>, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let source = Arc::new(Self {
            events,
            runs: Arc::clone(&runs),
            hold: None,
        });
        (source, runs)
    }

    fn holding(events: Vec<Event>, hold: Duration) -> (Arc<Self>, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let source = Arc::new(Self {
            events,
            runs: Arc::clone(&runs),
            hold: Some(hold),
        });
        (source, runs)
    }
}

#[async_trait::async_trait]
impl Source for MockSource {
    async fn get_data(
        &self,
        session: &Session,
        out: mpsc::Sender<Event>,
    ) -> Result<(), CollectorError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        for event in self.events.clone() {
            if out.send(event).await.is_err() {
                return Ok(());
            }
        }
        if let Some(hold) = self.hold {
            tokio::select! {
                _ = session.cancelled() => {}
                _ = tokio::time::sleep(hold) => {}
            }
        }
        Ok(())
    }
}

fn temp_store() -> Arc<dyn Store> {
    Arc::new(SledStore::temporary().unwrap())
}

fn session(store: &Arc<dyn Store>, name: &str, timeout: Duration) -> Arc<Session> {
    Arc::new(
        Session::new(
            name,
            Arc::new(Node::new("host01")),
            Arc::clone(store),
            timeout,
            &CancellationToken::new(),
        )
        .unwrap(),
    )
}

/// Run a collector to completion and collect its output.
async fn collect(
    registry: &Arc<Registry>,
    collector: &Collector,
    session: &Arc<Session>,
) -> Vec<Event> {
    let (tx, mut rx) = mpsc::channel(16);
    let mut events = Vec::new();
    tokio::join!(collector.start(registry, session, tx), async {
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
    });
    events
}

// =============================================================================
// Commit atomicity and cancellation
// =============================================================================

#[tokio::test]
async fn clean_run_commits_and_advances_last_run_time() {
    let store = temp_store();
    let registry = Arc::new(Registry::new());
    let (source, runs) = MockSource::new(vec![ev(&[("n", json!(1))]), ev(&[("n", json!(2))])]);
    let collector = Collector::new("/t/seq", source);

    let first = session(&store, "/t/seq", Duration::from_secs(10));
    let first_run = first.current_run_time();
    let events = collect(&registry, &collector, &first).await;

    assert_eq!(events.len(), 2);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let second = session(&store, "/t/seq", Duration::from_secs(10));
    assert_eq!(second.last_run_time(), first_run);
}

#[tokio::test]
async fn cancelled_run_discards_everything() {
    let store = temp_store();
    let registry = Arc::new(Registry::new());
    let (source, _) = MockSource::holding(
        vec![ev(&[("n", json!(1))])],
        Duration::from_secs(30),
    );
    let collector = Collector::new("/t/slow", source);

    // Deadline fires while the producer holds the stream open.
    let run = session(&store, "/t/slow", Duration::from_millis(200));
    let events = collect(&registry, &collector, &run).await;
    assert_eq!(events.len(), 1);

    // Nothing persisted: last run time did not advance.
    let after = session(&store, "/t/slow", Duration::from_secs(10));
    assert_eq!(after.last_run_time(), DateTime::<Utc>::UNIX_EPOCH);
}

// =============================================================================
// Join cache warm-up and reuse
// =============================================================================

fn join_registry() -> (Arc<Registry>, Arc<AtomicUsize>) {
    let (lvm_source, lvm_runs) = MockSource::new(vec![ev(&[
        ("dev", json!("sda")),
        ("vg", json!("rootvg")),
    ])]);

    let mut registry = Registry::new();
    registry
        .add(Collector::new("/t/config/lvm", lvm_source))
        .unwrap();
    (Arc::new(registry), lvm_runs)
}

fn iostat_collector() -> (Collector, Arc<AtomicUsize>) {
    let (source, runs) = MockSource::new(vec![ev(&[("dev", json!("sda")), ("rw", json!(9))])]);
    let collector = Collector::new("/t/perf/iostat", source).with_join(
        Join::new("/t/config/lvm", Duration::from_secs(600))
            .join_fields(["dev"])
            .join_on_fields(["dev"])
            .include_fields(["vg"]),
    );
    (collector, runs)
}

#[tokio::test]
async fn join_warm_up_runs_target_and_enriches() {
    let store = temp_store();
    let (registry, lvm_runs) = join_registry();
    let (iostat, _) = iostat_collector();

    let run = session(&store, "/t/perf/iostat", Duration::from_secs(10));
    let events = collect(&registry, &iostat, &run).await;

    assert_eq!(lvm_runs.load(Ordering::SeqCst), 1);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["vg"], json!("rootvg"));
    assert_eq!(events[0]["rw"], json!(9));
}

#[tokio::test]
async fn persisted_cache_is_reused_across_runs() {
    let store = temp_store();
    let (registry, lvm_runs) = join_registry();
    let (iostat, _) = iostat_collector();

    let first = session(&store, "/t/perf/iostat", Duration::from_secs(10));
    collect(&registry, &iostat, &first).await;
    assert_eq!(lvm_runs.load(Ordering::SeqCst), 1);

    // Fresh top-level run: cache batch is still valid in the store.
    let second = session(&store, "/t/perf/iostat", Duration::from_secs(10));
    let events = collect(&registry, &iostat, &second).await;
    assert_eq!(lvm_runs.load(Ordering::SeqCst), 1);
    assert_eq!(events[0]["vg"], json!("rootvg"));
}

#[tokio::test]
async fn expired_cache_triggers_target_rerun() {
    let store = temp_store();
    let (registry, lvm_runs) = join_registry();

    let (source, _) = MockSource::new(vec![ev(&[("dev", json!("sda"))])]);
    let iostat = Collector::new("/t/perf/iostat", source).with_join(
        Join::new("/t/config/lvm", Duration::from_millis(20))
            .join_fields(["dev"])
            .join_on_fields(["dev"])
            .include_fields(["vg"]),
    );

    let first = session(&store, "/t/perf/iostat", Duration::from_secs(10));
    collect(&registry, &iostat, &first).await;
    assert_eq!(lvm_runs.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = session(&store, "/t/perf/iostat", Duration::from_secs(10));
    collect(&registry, &iostat, &second).await;
    assert_eq!(lvm_runs.load(Ordering::SeqCst), 2);
}

// =============================================================================
// Scheduler
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn overlapping_triggers_of_one_job_run_once() {
    let store = temp_store();
    let (source, runs) = MockSource::holding(vec![ev(&[("n", json!(1))])], Duration::from_secs(30));

    let mut registry = Registry::new();
    registry.add(Collector::new("/t/slow", source)).unwrap();
    let registry = Arc::new(registry);

    let (tx, mut rx) = mpsc::channel(64);
    let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });

    let scheduler = Scheduler::new(
        Arc::clone(&registry),
        store,
        4,
        Duration::from_millis(100),
        tx,
    )
    .await
    .unwrap();
    scheduler
        .add_job(
            "* * * * * *",
            "/t/slow",
            Arc::new(Node::new("host01")),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
    scheduler.start().await.unwrap();

    // Three-plus triggers fire; the first run is still draining, so the
    // rest are dropped by the running-set.
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    scheduler.cancel().await.unwrap();
    drain.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn trigger_is_dropped_when_no_run_slot_frees_up() {
    let store = temp_store();
    let (slow_a, runs_a) =
        MockSource::holding(vec![ev(&[("n", json!(1))])], Duration::from_secs(30));
    let (slow_b, runs_b) =
        MockSource::holding(vec![ev(&[("n", json!(2))])], Duration::from_secs(30));

    let mut registry = Registry::new();
    registry.add(Collector::new("/t/a", slow_a)).unwrap();
    registry.add(Collector::new("/t/b", slow_b)).unwrap();
    let registry = Arc::new(registry);

    let (tx, mut rx) = mpsc::channel(64);
    let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });

    // One slot for two jobs: whichever fires second times out of its grace
    // period and is dropped.
    let scheduler = Scheduler::new(
        Arc::clone(&registry),
        store,
        1,
        Duration::from_millis(100),
        tx,
    )
    .await
    .unwrap();
    let node = Arc::new(Node::new("host01"));
    scheduler
        .add_job("* * * * * *", "/t/a", Arc::clone(&node), Duration::from_secs(60))
        .await
        .unwrap();
    scheduler
        .add_job("* * * * * *", "/t/b", Arc::clone(&node), Duration::from_secs(60))
        .await
        .unwrap();
    scheduler.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(runs_a.load(Ordering::SeqCst) + runs_b.load(Ordering::SeqCst), 1);

    scheduler.cancel().await.unwrap();
    drain.abort();
}

#[tokio::test]
async fn add_job_rejects_bad_input() {
    let store = temp_store();
    let registry = Arc::new(Registry::new());
    let (tx, _rx) = mpsc::channel(4);

    let scheduler = Scheduler::new(registry, store, 1, Duration::from_secs(1), tx)
        .await
        .unwrap();
    let node = Arc::new(Node::new("host01"));

    let err = scheduler
        .add_job("* * * * * *", "/missing", Arc::clone(&node), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"));
}
