//! The Recorded Event value object.

use std::collections::HashMap;

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved extra key carrying the execution counter. Never user-settable;
/// stripped from every public payload.
pub const EXECUTION_COUNTER_KEY: &str = "#execution_counter";

/// Category and name of the synthetic restart marker event.
pub const RESTART_CATEGORY: &str = "glean";
pub const RESTART_NAME: &str = "restarted";

/// An immutable, recorded occurrence of a user-defined (or internal) event.
///
/// `extra` carries user-supplied extras plus, once inserted by the events
/// database, the reserved `#execution_counter` key. [`RecordedEvent::payload`]
/// strips reserved keys for external exposure; [`RecordedEvent::raw`] keeps
/// them for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub category: String,
    pub name: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<HashMap<String, Value>>,
}

impl RecordedEvent {
    pub fn new(
        category: impl Into<String>,
        name: impl Into<String>,
        timestamp: i64,
        extra: Option<HashMap<String, Value>>,
    ) -> Self {
        Self {
            category: category.into(),
            name: name.into(),
            timestamp,
            extra,
        }
    }

    /// Construct the synthetic `glean.restarted` marker for the given lifetime.
    pub fn restart_marker(execution_counter: i64, raw_timestamp: i64) -> Self {
        let mut event = Self::new(RESTART_CATEGORY, RESTART_NAME, raw_timestamp, None);
        event.set_execution_counter(execution_counter);
        event
    }

    pub fn is_restart_marker(&self) -> bool {
        self.category == RESTART_CATEGORY && self.name == RESTART_NAME
    }

    pub fn execution_counter(&self) -> Option<i64> {
        self.extra
            .as_ref()?
            .get(EXECUTION_COUNTER_KEY)?
            .as_i64()
    }

    pub fn set_execution_counter(&mut self, counter: i64) {
        self.extra
            .get_or_insert_with(HashMap::new)
            .insert(EXECUTION_COUNTER_KEY.to_owned(), Value::from(counter));
    }

    /// Full JSON representation, reserved extras included. Used only for
    /// internal persistence and sorting.
    pub fn raw(&self) -> Value {
        serde_json::to_value(self).expect("RecordedEvent always serializes")
    }

    /// Public payload with reserved extras stripped and `timestamp` as recorded.
    pub fn payload(&self) -> Value {
        self.payload_with_timestamp(self.timestamp)
    }

    /// Public payload with reserved extras stripped and a caller-supplied,
    /// normalized `timestamp` (see the events database's normalization pipeline).
    pub fn payload_with_timestamp(&self, timestamp: i64) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("category".to_owned(), Value::String(self.category.clone()));
        map.insert("name".to_owned(), Value::String(self.name.clone()));
        map.insert("timestamp".to_owned(), Value::from(timestamp));
        if let Some(extra) = self.public_extra() {
            map.insert("extra".to_owned(), Value::Object(extra));
        }
        Value::Object(map)
    }

    fn public_extra(&self) -> Option<serde_json::Map<String, Value>> {
        let extra = self.extra.as_ref()?;
        let filtered: serde_json::Map<String, Value> = extra
            .iter()
            .filter(|(key, _)| !key.starts_with('#'))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if filtered.is_empty() {
            None
        } else {
            Some(filtered)
        }
    }
}
