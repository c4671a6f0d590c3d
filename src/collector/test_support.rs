//! Mock sources shared by unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::collector::{CollectorError, Source};
use crate::event::Event;
use crate::session::Session;

/// Source emitting `count` events `{"seq": n}` and counting its runs.
pub(crate) fn counting_source(count: usize) -> (Arc<dyn Source>, Arc<AtomicUsize>) {
    let runs = Arc::new(AtomicUsize::new(0));
    let source = Arc::new(CountingSource {
        count,
        runs: Arc::clone(&runs),
    });
    (source, runs)
}

struct CountingSource {
    count: usize,
    runs: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Source for CountingSource {
    async fn get_data(
        &self,
        _session: &Session,
        out: mpsc::Sender<Event>,
    ) -> Result<(), CollectorError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        for seq in 0..self.count {
            let mut event = Event::new();
            event.insert("seq".to_string(), (seq as u64).into());
            if out.send(event).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// Source emitting the given events in order.
pub(crate) fn static_source(events: Vec<Event>) -> Arc<dyn Source> {
    Arc::new(StaticSource { events })
}

struct StaticSource {
    events: Vec<Event>,
}

#[async_trait::async_trait]
impl Source for StaticSource {
    async fn get_data(
        &self,
        _session: &Session,
        out: mpsc::Sender<Event>,
    ) -> Result<(), CollectorError> {
        for event in self.events.clone() {
            if out.send(event).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}
