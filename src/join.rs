//! Cross-collector event enrichment.
//!
//! A [`Join`] enriches events from one collector with fields from another
//! collector's cached last output. Candidate key fields are tried in
//! declared order against the current event; the first one with a non-empty
//! value and a hit in the target index wins. No match is not an error, the
//! event passes through unmodified.

use std::time::Duration;

use crate::event::{self, Event};
use crate::session::Session;

/// Join configuration against one target collector.
#[derive(Debug, Clone)]
pub struct Join {
    /// Target collector name, e.g. `/aix/config/lvm`.
    pub name: String,
    /// TTL for the target's persisted cache batch.
    pub ttl: Duration,
    /// Candidate key fields on the current event, first match wins.
    pub join_fields: Vec<String>,
    /// Key fields used to index the target collector's cached events.
    pub join_on_fields: Vec<String>,
    /// Fields copied from the matched cached event.
    pub include_fields: Vec<String>,
}

impl Join {
    /// Create a join against `name` with the given cache TTL.
    pub fn new(name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            ttl,
            join_fields: Vec::new(),
            join_on_fields: Vec::new(),
            include_fields: Vec::new(),
        }
    }

    /// Candidate key fields on the current event.
    pub fn join_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.join_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Key fields indexing the target collector's cached events.
    pub fn join_on_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.join_on_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Fields copied across on match.
    pub fn include_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Enrich one event from the warmed cache.
    ///
    /// Returns the (possibly updated) event and whether a match was found.
    /// Overwrite-safe: re-processing an already-joined event with the same
    /// cache state yields the same result.
    pub fn process(&self, session: &Session, mut event: Event) -> (Event, bool) {
        let cache = session.warm_cache().lock().unwrap_or_else(|e| e.into_inner());
        let Some(index) = cache.get(&self.name) else {
            return (event, false);
        };

        for field in &self.join_fields {
            let Some(key) = event::get_string(&event, field) else {
                continue;
            };
            if key.is_empty() {
                continue;
            }
            if let Some(cached) = index.get(&key) {
                for include in &self.include_fields {
                    if let Some(value) = cached.get(include) {
                        event.insert(include.clone(), value.clone());
                    }
                }
                return (event, true);
            }
        }

        (event, false)
    }
}
