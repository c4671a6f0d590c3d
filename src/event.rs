//! Raw event model and field-level value coercion.
//!
//! Events are flat JSON objects (`serde_json::Map`) produced by collector
//! sources and transformed in place by the processing pipeline. A few field
//! names are reserved for metadata injected by the session:
//!
//! - [`FIELD_TIMESTAMP`]: RFC 3339 event time
//! - [`FIELD_METRIC`]: the collector name that produced the event
//! - [`FIELD_HOST`]: the node the event was collected from

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

/// Event time, RFC 3339. Injected by the session when absent.
pub const FIELD_TIMESTAMP: &str = "timestamp";

/// Collector name metadata field.
pub const FIELD_METRIC: &str = "_metric";

/// Host name metadata field.
pub const FIELD_HOST: &str = "host";

/// A raw collector event: a flat JSON object.
pub type Event = serde_json::Map<String, Value>;

/// Errors raised by field access and coercion.
#[derive(Debug, Error)]
pub enum EventError {
    /// Field is absent from the event.
    #[error("field not found: {0}")]
    FieldNotFound(String),

    /// Field exists but holds no numeric value.
    #[error("field {field} is not numeric: {value}")]
    NotNumeric {
        /// Offending field name.
        field: String,
        /// The value that failed to parse.
        value: String,
    },

    /// Field could not be coerced to the requested type.
    #[error("cannot coerce field {field} to {kind}: {reason}")]
    Coerce {
        /// Offending field name.
        field: String,
        /// Target type name.
        kind: &'static str,
        /// Parse failure detail.
        reason: String,
    },

    /// Timestamp field is absent or not RFC 3339.
    #[error("invalid event timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Target types for field coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// 64-bit float, rounded to the configured precision.
    Float,
    /// 64-bit signed integer.
    Integer,
    /// Boolean.
    Bool,
    /// UTF-8 string.
    String,
    /// Humantime duration (e.g. `1h30m`), coerced to seconds as a float.
    Duration,
    /// RFC 3339 timestamp string. Numeric input is taken as epoch seconds.
    Timestamp,
}

impl FieldType {
    fn name(self) -> &'static str {
        match self {
            Self::Float => "float",
            Self::Integer => "integer",
            Self::Bool => "bool",
            Self::String => "string",
            Self::Duration => "duration",
            Self::Timestamp => "timestamp",
        }
    }
}

/// A single coercion rule: coerce `field` to `kind`.
#[derive(Debug, Clone)]
pub struct FieldRule {
    /// Field name to coerce.
    pub field: String,
    /// Target type.
    pub kind: FieldType,
}

impl FieldRule {
    /// Create a coercion rule.
    pub fn new(field: impl Into<String>, kind: FieldType) -> Self {
        Self {
            field: field.into(),
            kind,
        }
    }

    /// Coerce the raw value to this rule's target type.
    ///
    /// Floats are rounded to `round` decimal places.
    pub fn coerce(&self, raw: &Value, round: u32) -> Result<Value, EventError> {
        let fail = |reason: String| EventError::Coerce {
            field: self.field.clone(),
            kind: self.kind.name(),
            reason,
        };

        match self.kind {
            FieldType::Float => {
                let v = value_as_f64(raw).ok_or_else(|| fail(raw.to_string()))?;
                Ok(json_f64(round_to(v, round)))
            }
            FieldType::Integer => {
                let v = match raw {
                    Value::Number(n) => n
                        .as_i64()
                        .or_else(|| n.as_f64().map(|f| f as i64))
                        .ok_or_else(|| fail(raw.to_string()))?,
                    Value::String(s) => s
                        .trim()
                        .parse::<i64>()
                        .or_else(|_| s.trim().parse::<f64>().map(|f| f as i64))
                        .map_err(|e| fail(e.to_string()))?,
                    other => return Err(fail(other.to_string())),
                };
                Ok(Value::from(v))
            }
            FieldType::Bool => {
                let v = match raw {
                    Value::Bool(b) => *b,
                    Value::String(s) => s.trim().parse::<bool>().map_err(|e| fail(e.to_string()))?,
                    other => return Err(fail(other.to_string())),
                };
                Ok(Value::from(v))
            }
            FieldType::String => Ok(Value::from(value_to_string(raw))),
            FieldType::Duration => {
                let s = raw.as_str().ok_or_else(|| fail(raw.to_string()))?;
                let d = humantime::parse_duration(s.trim()).map_err(|e| fail(e.to_string()))?;
                Ok(json_f64(round_to(d.as_secs_f64(), round)))
            }
            FieldType::Timestamp => {
                let ts = match raw {
                    Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
                        .map(|t| t.with_timezone(&Utc))
                        .map_err(|e| fail(e.to_string()))?,
                    Value::Number(n) => {
                        let secs = n.as_i64().ok_or_else(|| fail(raw.to_string()))?;
                        DateTime::<Utc>::from_timestamp(secs, 0)
                            .ok_or_else(|| fail(format!("epoch out of range: {secs}")))?
                    }
                    other => return Err(fail(other.to_string())),
                };
                Ok(Value::from(ts.to_rfc3339()))
            }
        }
    }
}

/// Read a field as a float, accepting numbers and numeric strings.
pub fn get_f64(event: &Event, field: &str) -> Result<f64, EventError> {
    let raw = event
        .get(field)
        .ok_or_else(|| EventError::FieldNotFound(field.to_string()))?;
    value_as_f64(raw).ok_or_else(|| EventError::NotNumeric {
        field: field.to_string(),
        value: raw.to_string(),
    })
}

/// Read a field as a string, rendering scalar values as text.
///
/// Returns `None` for absent fields and non-scalar values.
pub fn get_string(event: &Event, field: &str) -> Option<String> {
    match event.get(field)? {
        Value::String(s) => Some(s.clone()),
        v @ (Value::Number(_) | Value::Bool(_)) => Some(v.to_string()),
        _ => None,
    }
}

/// Read the event's reserved timestamp field.
pub fn timestamp_of(event: &Event) -> Result<DateTime<Utc>, EventError> {
    let raw = event
        .get(FIELD_TIMESTAMP)
        .and_then(Value::as_str)
        .ok_or_else(|| EventError::InvalidTimestamp("missing".to_string()))?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| EventError::InvalidTimestamp(e.to_string()))
}

/// Round half-up at the given decimal precision.
pub fn round_to(v: f64, round: u32) -> f64 {
    let shift = 10f64.powi(round as i32);
    ((v * shift) + 0.5).floor() / shift
}

fn value_as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_f64(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(pairs: &[(&str, Value)]) -> Event {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_round_half_up() {
        assert_eq!(round_to(1.25, 1), 1.3);
        assert_eq!(round_to(1.24, 1), 1.2);
        assert_eq!(round_to(1.2, 0), 1.0);
        assert_eq!(round_to(2.5, 0), 3.0);
    }

    #[test]
    fn test_get_f64_accepts_numeric_strings() {
        let ev = event(&[("a", json!("12.5")), ("b", json!(3))]);
        assert_eq!(get_f64(&ev, "a").unwrap(), 12.5);
        assert_eq!(get_f64(&ev, "b").unwrap(), 3.0);
    }

    #[test]
    fn test_get_f64_rejects_non_numeric() {
        let ev = event(&[("a", json!("abc"))]);
        assert!(matches!(
            get_f64(&ev, "a"),
            Err(EventError::NotNumeric { .. })
        ));
        assert!(matches!(
            get_f64(&ev, "missing"),
            Err(EventError::FieldNotFound(_))
        ));
    }

    #[test]
    fn test_coerce_float_rounds() {
        let rule = FieldRule::new("x", FieldType::Float);
        let out = rule.coerce(&json!("1.256"), 2).unwrap();
        assert_eq!(out, json!(1.26));
    }

    #[test]
    fn test_coerce_integer_from_float_string() {
        let rule = FieldRule::new("x", FieldType::Integer);
        assert_eq!(rule.coerce(&json!("42"), 0).unwrap(), json!(42));
        assert_eq!(rule.coerce(&json!("42.9"), 0).unwrap(), json!(42));
    }

    #[test]
    fn test_coerce_duration_to_seconds() {
        let rule = FieldRule::new("x", FieldType::Duration);
        assert_eq!(rule.coerce(&json!("1m30s"), 2).unwrap(), json!(90.0));
    }

    #[test]
    fn test_coerce_timestamp_from_epoch() {
        let rule = FieldRule::new("x", FieldType::Timestamp);
        let out = rule.coerce(&json!(0), 0).unwrap();
        assert!(out.as_str().unwrap().starts_with("1970-01-01T00:00:00"));
    }

    #[test]
    fn test_coerce_error_carries_field() {
        let rule = FieldRule::new("x", FieldType::Bool);
        let err = rule.coerce(&json!(1.5), 0).unwrap_err();
        assert!(err.to_string().contains("x"));
    }

    #[test]
    fn test_timestamp_of_round_trip() {
        let now = Utc::now();
        let ev = event(&[(FIELD_TIMESTAMP, json!(now.to_rfc3339()))]);
        assert_eq!(timestamp_of(&ev).unwrap(), now);
    }
}
