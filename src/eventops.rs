//! Per-event transforms: field type coercion and delta/rate computation.
//!
//! [`EventOps`] is configuration, not state. Coercion failures are soft: the
//! offending field is logged and skipped. Delta failures discard the whole
//! event; the common, routine case is the first observation of a new key,
//! which only establishes the baseline snapshot and emits nothing.

use std::collections::HashSet;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::event::{self, Event, EventError, FieldRule, FIELD_TIMESTAMP};
use crate::session::{Session, SessionError};
use crate::storage::StorageError;

const DELTA_PREFIX: &str = "delta";

/// Fields excluded from delta or rate computation.
pub type Blacklist = HashSet<String>;

/// Build a blacklist from field names.
pub fn blacklist<I, S>(fields: I) -> Blacklist
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    fields.into_iter().map(Into::into).collect()
}

/// Errors aborting delta computation for one event.
#[derive(Debug, Error)]
pub enum EventOpsError {
    /// Field access or parse failure on the current or previous event.
    #[error(transparent)]
    Event(#[from] EventError),

    /// Session storage failure.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Persisted snapshot is not a JSON object.
    #[error("corrupt delta snapshot: {0}")]
    CorruptSnapshot(String),
}

/// Delta/rate computation parameters.
#[derive(Debug, Clone, Default)]
pub struct DeltaOps {
    /// Field whose value keys the per-event snapshot. Empty supports
    /// single-series collectors.
    pub key_field: String,
    /// Compute value-per-second rates instead of raw deltas.
    pub rate: bool,
    /// TTL for the retained previous-value snapshot.
    pub ttl: Duration,
    /// Fields excluded from delta computation entirely.
    pub blacklist: Blacklist,
    /// Fields kept as raw deltas when rate computation is on.
    pub rate_blacklist: Blacklist,
}

/// Stateless per-event transform configuration.
#[derive(Debug, Clone, Default)]
pub struct EventOps {
    /// Decimal precision for rounded float results.
    pub round: u32,
    /// Field coercion rules, applied before delta computation.
    pub fields: Vec<FieldRule>,
    /// Optional delta/rate parameters.
    pub delta: Option<DeltaOps>,
}

impl EventOps {
    /// Apply coercion and delta rules to one event.
    ///
    /// Returns `None` when the event is consumed: the first observation of a
    /// delta key (baseline only) or a delta computation failure (logged).
    pub fn process(&self, session: &Session, mut event: Event) -> Option<Event> {
        for rule in &self.fields {
            let Some(raw) = event.get(&rule.field) else {
                tracing::warn!(collector = %session.name(), host = %session.node().hostname,
                    field = %rule.field, "type conversion: field not present in event");
                continue;
            };
            match rule.coerce(raw, self.round) {
                Ok(value) => {
                    event.insert(rule.field.clone(), value);
                }
                Err(e) => {
                    tracing::warn!(collector = %session.name(), host = %session.node().hostname,
                        error = %e, "type conversion failed, field skipped");
                }
            }
        }

        if let Some(delta) = &self.delta {
            return match self.event_delta(session, delta, event) {
                Ok(out) => out,
                Err(e) => {
                    tracing::error!(collector = %session.name(), host = %session.node().hostname,
                        error = %e, "delta calculation failed, event dropped");
                    None
                }
            };
        }

        Some(event)
    }

    /// Delta/rate computation against the previously persisted snapshot.
    ///
    /// The first observation of a key persists the snapshot and emits
    /// nothing. Any missing or non-numeric non-blacklisted field in the
    /// previous snapshot aborts the whole event; this strictness is
    /// deliberate and keeps partially-comparable series out of the stream.
    fn event_delta(
        &self,
        session: &Session,
        delta: &DeltaOps,
        mut event: Event,
    ) -> Result<Option<Event>, EventOpsError> {
        let key_val = event::get_string(&event, &delta.key_field).unwrap_or_default();

        // Snapshots carry the run timestamp for elapsed-time computation.
        if !event.contains_key(FIELD_TIMESTAMP) {
            event.insert(
                FIELD_TIMESTAMP.to_string(),
                session.current_run_time().to_rfc3339().into(),
            );
        }

        let key = format!(
            "{}/{}/{}/{}",
            DELTA_PREFIX,
            session.name(),
            session.node().hostname,
            key_val
        )
        .into_bytes();

        let serialized = serde_json::to_vec(&event)
            .map_err(|e| EventOpsError::CorruptSnapshot(e.to_string()))?;

        let previous = match session.raw_get(&key) {
            Ok(raw) => raw,
            Err(SessionError::Storage(StorageError::NotFound)) => {
                // First observation: baseline only.
                session.raw_set_with_ttl(&key, &serialized, delta.ttl)?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        session.raw_set_with_ttl(&key, &serialized, delta.ttl)?;

        let previous: Event = serde_json::from_slice(&previous)
            .map_err(|e| EventOpsError::CorruptSnapshot(e.to_string()))?;
        let previous_ts = event::timestamp_of(&previous)?;
        let time_delta =
            (session.current_run_time() - previous_ts).num_milliseconds() as f64 / 1000.0;

        let fields: Vec<String> = event
            .keys()
            .filter(|k| k.as_str() != FIELD_TIMESTAMP && !delta.blacklist.contains(k.as_str()))
            .cloned()
            .collect();

        for field in fields {
            let previous_value = event::get_f64(&previous, &field)?;
            let current_value = event::get_f64(&event, &field)?;
            let value_delta = current_value - previous_value;

            let out = if !delta.rate || delta.rate_blacklist.contains(&field) {
                value_delta
            } else {
                event::round_to(value_delta / time_delta, self.round)
            };
            event.insert(field, number(out));
        }

        Ok(Some(event))
    }
}

fn number(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
