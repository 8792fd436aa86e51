use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::Level;

/// Level assigned to records whose field bag carries no `level` key.
pub const DEFAULT_LEVEL: &str = "info";

/// A normalized log entry, as stored in one row of the destination table.
///
/// Everything that is not the level, the timestamp or the message lives in
/// `metadata`. An empty mapping is kept as `None` so the table holds `NULL`
/// instead of `{}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub level: String,
    pub timestamp: DateTime<Utc>,
    pub message: Option<String>,
    pub metadata: Option<BTreeMap<String, Value>>,
}

impl LogRecord {
    /// Create a record stamped with the current time.
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            timestamp: Utc::now(),
            message: None,
            metadata: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attach one metadata entry.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Build a record from an open bag of fields.
    ///
    /// `level`, `message` and `timestamp` are lifted out of the bag; the
    /// remaining keys become metadata. A timestamp may be an RFC 3339 string
    /// or epoch milliseconds; anything else falls back to the capture time.
    pub fn from_fields(mut fields: BTreeMap<String, Value>) -> Self {
        let level = match fields.remove("level") {
            Some(Value::String(level)) => level,
            Some(Value::Null) | None => DEFAULT_LEVEL.to_string(),
            Some(other) => other.to_string(),
        };

        let message = match fields.remove("message") {
            Some(Value::String(message)) => Some(message),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };

        let timestamp = fields
            .remove("timestamp")
            .and_then(|value| parse_timestamp(&value))
            .unwrap_or_else(Utc::now);

        Self {
            level,
            timestamp,
            message,
            metadata: if fields.is_empty() { None } else { Some(fields) },
        }
    }

    /// Map the free-form level tag onto a `tracing` level.
    ///
    /// Both tracing names and npm-style names are understood. Unknown tags
    /// yield `None`.
    pub fn severity(&self) -> Option<Level> {
        match self.level.trim().to_ascii_lowercase().as_str() {
            "error" | "fatal" | "crit" | "critical" => Some(Level::ERROR),
            "warn" | "warning" => Some(Level::WARN),
            "info" | "notice" | "http" => Some(Level::INFO),
            "debug" | "verbose" => Some(Level::DEBUG),
            "trace" | "silly" => Some(Level::TRACE),
            _ => None,
        }
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        Value::Number(number) => number
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}
