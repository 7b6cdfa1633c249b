//! Event record and history filtering

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// An event as delivered to subscribers and retained in history
///
/// Immutable once published; subscribers receive a shared reference and
/// history queries receive clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub event_type: String,
    pub data: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Convenience accessor for a string field in the payload
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Predicate over retained events, used by history queries
///
/// All set fields must match. An empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_type: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub data_field: Option<(String, Value)>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn with_data_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data_field = Some((key.into(), value));
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(event_type) = &self.event_type {
            if &event.event_type != event_type {
                return false;
            }
        }
        if let Some(since) = &self.since {
            if event.timestamp < *since {
                return false;
            }
        }
        if let Some(until) = &self.until {
            if event.timestamp > *until {
                return false;
            }
        }
        if let Some((key, value)) = &self.data_field {
            if event.data.get(key) != Some(value) {
                return false;
            }
        }
        true
    }
}
