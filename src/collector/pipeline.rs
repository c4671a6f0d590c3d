//! The collector run pipeline.
//!
//! One run moves through three phases: warm join caches, stream events
//! through the transform chain, then commit on clean end-of-stream. Any
//! cancellation or deadline expiry discards the session instead, so the last
//! successful run time never advances for an interrupted run and the next
//! trigger re-covers the same window.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::cache::{self, CacheError};
use crate::collector::{PostOps, Source};
use crate::event::Event;
use crate::eventops::EventOps;
use crate::join::Join;
use crate::registry::Registry;
use crate::session::Session;

/// A registered unit of telemetry acquisition plus its processing
/// configuration. Immutable after registration.
pub struct Collector {
    name: String,
    source: Arc<dyn Source>,
    event_ops: Option<EventOps>,
    joins: Vec<Join>,
    post_ops: Option<PostOps>,
}

impl Collector {
    /// Create a collector with the given hierarchical name and source.
    pub fn new(name: impl Into<String>, source: Arc<dyn Source>) -> Self {
        Self {
            name: name.into(),
            source,
            event_ops: None,
            joins: Vec::new(),
            post_ops: None,
        }
    }

    /// Attach coercion and delta/rate configuration.
    pub fn with_event_ops(mut self, ops: EventOps) -> Self {
        self.event_ops = Some(ops);
        self
    }

    /// Append a join, applied in registration order.
    pub fn with_join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    /// Attach a post-processing hook.
    pub fn with_post_ops(
        mut self,
        post_ops: impl Fn(Event) -> Result<Event, crate::event::EventError> + Send + Sync + 'static,
    ) -> Self {
        self.post_ops = Some(Box::new(post_ops));
        self
    }

    /// Collector name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Joins configured on this collector.
    pub fn joins(&self) -> &[Join] {
        &self.joins
    }

    /// Run this collector within `session`, delivering processed events to
    /// `out`. Consumes the session: it is committed on clean end-of-stream
    /// and discarded on warm-up failure or cancellation.
    pub async fn start(
        &self,
        registry: &Arc<Registry>,
        session: &Arc<Session>,
        out: mpsc::Sender<Event>,
    ) {
        let host = session.node().hostname.clone();

        // Warming.
        if let Err(e) = self.build_run_cache(registry, session).await {
            tracing::error!(collector = %self.name, host = %host, error = %e,
                "join cache warm-up failed, aborting run");
            session.cancel();
            return;
        }

        // Streaming.
        let (tx, mut rx) = mpsc::channel::<Event>(1);
        let producer = {
            let source = Arc::clone(&self.source);
            let session = Arc::clone(session);
            let name = self.name.clone();
            tokio::spawn(async move {
                if let Err(e) = source.get_data(&session, tx).await {
                    tracing::warn!(collector = %name, error = %e,
                        "data source finished with error");
                }
            })
        };

        loop {
            tokio::select! {
                _ = session.cancelled() => {
                    if session.deadline_exceeded() {
                        tracing::warn!(collector = %self.name, host = %host,
                            timeout = ?session.timeout(), "run cancelled at deadline");
                    } else {
                        tracing::warn!(collector = %self.name, host = %host, "run cancelled");
                    }
                    session.cancel();
                    producer.abort();
                    return;
                }

                received = rx.recv() => {
                    let Some(event) = received else {
                        // Done: producer closed the stream.
                        match session.commit() {
                            Ok(()) => tracing::info!(collector = %self.name, host = %host,
                                "finished successfully"),
                            Err(e) => tracing::error!(collector = %self.name, host = %host,
                                error = %e, "committing session data"),
                        }
                        return;
                    };
                    self.handle_event(session, &out, event).await;
                }
            }
        }
    }

    /// Transform and deliver one raw event. Per-event failures are logged
    /// and drop only the event.
    async fn handle_event(&self, session: &Arc<Session>, out: &mpsc::Sender<Event>, event: Event) {
        let host = &session.node().hostname;

        if event.is_empty() {
            tracing::warn!(collector = %self.name, host = %host, "received empty event");
            return;
        }

        let mut event = match &self.event_ops {
            Some(ops) => match ops.process(session, event) {
                Some(ev) => ev,
                // Consumed: delta baseline or dropped on error (logged there).
                None => return,
            },
            None => event,
        };

        if let Some(post_ops) = &self.post_ops {
            event = match post_ops(event) {
                Ok(ev) => ev,
                Err(e) => {
                    tracing::error!(collector = %self.name, host = %host, error = %e,
                        "post ops processing failed, event dropped");
                    return;
                }
            };
        }

        for join in &self.joins {
            let (joined, matched) = join.process(session, event);
            event = joined;
            if !matched {
                tracing::debug!(collector = %self.name, host = %host, target = %join.name,
                    "event not matched by join");
            }
        }

        session.enrich(&mut event);

        // Cancellation-aware delivery: a cancelled send is a delivery
        // timeout, not fatal to the run.
        tokio::select! {
            _ = session.cancelled() => {
                tracing::error!(collector = %self.name, host = %host,
                    "timeout sending event to output");
            }
            sent = out.send(event) => {
                if sent.is_err() {
                    tracing::warn!(collector = %self.name, host = %host,
                        "output channel closed, event dropped");
                }
            }
        }
    }

    /// Warm the cache for every configured join, at most once per target per
    /// top-level run even when several joins or child runs share a target.
    async fn build_run_cache(
        &self,
        registry: &Arc<Registry>,
        session: &Arc<Session>,
    ) -> Result<(), CacheError> {
        for join in &self.joins {
            let warmed = session
                .warm_cache()
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains_key(&join.name);
            if warmed {
                continue;
            }

            let index =
                cache::get(registry, session, join.ttl, &join.name, &join.join_on_fields).await?;
            session
                .warm_cache()
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(join.name.clone(), index);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("name", &self.name)
            .field("joins", &self.joins.len())
            .field("has_event_ops", &self.event_ops.is_some())
            .field("has_post_ops", &self.post_ops.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::test_support::static_source;
    use crate::event::{EventError, FIELD_HOST, FIELD_METRIC, FIELD_TIMESTAMP};
    use crate::node::Node;
    use crate::storage::{SledStore, Store};
    use serde_json::json;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn ev(pairs: &[(&str, serde_json::Value)]) -> Event {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn session(store: &Arc<dyn Store>, name: &str) -> Arc<Session> {
        Arc::new(
            Session::new(
                name,
                Arc::new(Node::new("host01")),
                Arc::clone(store),
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .unwrap(),
        )
    }

    async fn collect(collector: &Collector, session: &Arc<Session>) -> Vec<Event> {
        let registry = Arc::new(Registry::new());
        let (tx, mut rx) = mpsc::channel(16);
        let mut events = Vec::new();
        tokio::join!(collector.start(&registry, session, tx), async {
            while let Some(event) = rx.recv().await {
                events.push(event);
            }
        });
        events
    }

    #[tokio::test]
    async fn test_events_are_enriched_in_order() {
        let store: Arc<dyn Store> = Arc::new(SledStore::temporary().unwrap());
        let collector = Collector::new(
            "/t/seq",
            static_source(vec![ev(&[("n", json!(1))]), ev(&[("n", json!(2))])]),
        );

        let events = collect(&collector, &session(&store, "/t/seq")).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["n"], json!(1));
        assert_eq!(events[1]["n"], json!(2));
        for event in &events {
            assert_eq!(event[FIELD_METRIC], json!("/t/seq"));
            assert_eq!(event[FIELD_HOST], json!("host01"));
            assert!(event.contains_key(FIELD_TIMESTAMP));
        }
    }

    #[tokio::test]
    async fn test_empty_events_are_dropped() {
        let store: Arc<dyn Store> = Arc::new(SledStore::temporary().unwrap());
        let collector = Collector::new(
            "/t/seq",
            static_source(vec![Event::new(), ev(&[("n", json!(1))])]),
        );

        let events = collect(&collector, &session(&store, "/t/seq")).await;
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_post_ops_failure_drops_only_the_event() {
        let store: Arc<dyn Store> = Arc::new(SledStore::temporary().unwrap());
        let collector = Collector::new(
            "/t/seq",
            static_source(vec![ev(&[("bad", json!(1))]), ev(&[("good", json!(2))])]),
        )
        .with_post_ops(|event: Event| {
            if event.contains_key("bad") {
                Err(EventError::FieldNotFound("bad".into()))
            } else {
                Ok(event)
            }
        });

        let events = collect(&collector, &session(&store, "/t/seq")).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["good"], json!(2));
    }

    #[tokio::test]
    async fn test_clean_end_of_stream_commits() {
        let store: Arc<dyn Store> = Arc::new(SledStore::temporary().unwrap());
        let collector = Collector::new("/t/seq", static_source(vec![ev(&[("n", json!(1))])]));

        let first = session(&store, "/t/seq");
        let first_run = first.current_run_time();
        collect(&collector, &first).await;

        let second = session(&store, "/t/seq");
        assert_eq!(second.last_run_time(), first_run);
    }

    #[tokio::test]
    async fn test_missing_join_target_aborts_run_without_commit() {
        let store: Arc<dyn Store> = Arc::new(SledStore::temporary().unwrap());
        let collector = Collector::new("/t/seq", static_source(vec![ev(&[("n", json!(1))])]))
            .with_join(
                Join::new("/t/ghost", Duration::from_secs(60))
                    .join_fields(["n"])
                    .join_on_fields(["n"]),
            );

        let first = session(&store, "/t/seq");
        let events = collect(&collector, &first).await;
        assert!(events.is_empty());

        let second = session(&store, "/t/seq");
        assert_eq!(second.last_run_time(), chrono::DateTime::<chrono::Utc>::UNIX_EPOCH);
    }
}
