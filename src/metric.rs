//! The Event Metric Type: validates a record request, stamps it with the
//! monotonic timestamp, and forwards to the [`EventsDatabase`](crate::database::EventsDatabase).

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::clock::MonotonicClock;
use crate::database::EventsDatabase;
use crate::errors::ErrorType;
use crate::event::RecordedEvent;

/// Maximum length, in characters, of a string extra value before it is
/// truncated (§4.3).
const MAX_EXTRA_VALUE_LEN: usize = 500;

/// Lifetime of a metric. Event metrics only ever use `Ping` (§1 Non-goals);
/// the variant exists so `CommonMetricData` matches the shape every other
/// Glean metric type carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    Ping,
    Application,
    User,
}

/// The identity record shared by every Glean metric type.
#[derive(Debug, Clone)]
pub struct CommonMetricData {
    pub category: String,
    pub name: String,
    pub send_in_pings: Vec<String>,
    pub lifetime: Lifetime,
    pub disabled: bool,
}

impl CommonMetricData {
    pub fn new(
        category: impl Into<String>,
        name: impl Into<String>,
        send_in_pings: Vec<String>,
    ) -> Self {
        Self {
            category: category.into(),
            name: name.into(),
            send_in_pings,
            lifetime: Lifetime::Ping,
            disabled: false,
        }
    }
}

/// A user-defined event metric.
pub struct EventMetric {
    meta: CommonMetricData,
    allowed_extra_keys: Vec<String>,
    database: Arc<EventsDatabase>,
    clock: Arc<dyn MonotonicClock>,
}

impl EventMetric {
    pub fn new(
        meta: CommonMetricData,
        allowed_extra_keys: Vec<String>,
        database: Arc<EventsDatabase>,
        clock: Arc<dyn MonotonicClock>,
    ) -> Self {
        Self {
            meta,
            allowed_extra_keys,
            database,
            clock,
        }
    }

    /// Validate `extra`, stamp the current monotonic timestamp, and forward
    /// to the events database. Never fails visibly; validation failures are
    /// recorded against this metric's error counter (§4.3). A no-op, with no
    /// error side effects, if this metric or upload globally is disabled.
    pub async fn record(&self, extra: Option<HashMap<String, Value>>) {
        if self.meta.disabled {
            return;
        }
        if !self.database.upload_enabled().await {
            return;
        }

        let mut sanitized: HashMap<String, Value> = HashMap::new();
        if let Some(extra) = extra {
            for (key, value) in extra {
                if key.starts_with('#') {
                    self.record_error(ErrorType::InvalidValue);
                    return;
                }
                if !self.allowed_extra_keys.iter().any(|allowed| allowed == &key) {
                    self.record_error(ErrorType::InvalidValue);
                    return;
                }
                let value = match value {
                    Value::String(s) if s.chars().count() > MAX_EXTRA_VALUE_LEN => {
                        self.record_error(ErrorType::InvalidOverflow);
                        Value::String(s.chars().take(MAX_EXTRA_VALUE_LEN).collect())
                    }
                    other => other,
                };
                sanitized.insert(key, value);
            }
        }

        let timestamp = self.clock.now_ms();
        let extra = if sanitized.is_empty() {
            None
        } else {
            Some(sanitized)
        };
        let event = RecordedEvent::new(&self.meta.category, &self.meta.name, timestamp, extra);
        self.database.record(&self.meta, event).await;
    }

    fn record_error(&self, error_type: ErrorType) {
        self.database
            .error_recorder()
            .record(&self.meta.category, &self.meta.name, error_type);
    }

    /// Recorded public payloads matching this metric in `ping`. Test-only.
    pub async fn test_get_value(&self, ping: &str) -> Vec<Value> {
        let events = self.database.get_ping_events(ping, false).await;
        events
            .unwrap_or_default()
            .into_iter()
            .filter(|event| {
                event
                    .as_object()
                    .map(|obj| {
                        obj.get("category") == Some(&Value::String(self.meta.category.clone()))
                            && obj.get("name") == Some(&Value::String(self.meta.name.clone()))
                    })
                    .unwrap_or(false)
            })
            .collect()
    }
}
