//! The events database: per-ping durable event buffers with restart
//! bridging, timestamp normalization, and capacity/startup submission.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::clock::MonotonicClock;
use crate::config::Configuration;
use crate::error_recorder::ErrorRecorder;
use crate::errors::ErrorType;
use crate::event::RecordedEvent;
use crate::metric::CommonMetricData;
use crate::store::PersistentStore;
use crate::uploader::{PingRequest, Uploader};

const EVENTS_PATH: &str = "events";
const EVENTS_META_PATH: &str = "events-meta";
const START_TIME_KEY: &str = "start-time";
const COUNTER_METRIC_NAME: &str = "glean.execution_counter";

/// The ping that startup and capacity submissions always target. Other ping
/// names may accumulate events and receive restart markers, but only the
/// ping literally named `events` is ever handed to the uploader by this
/// subsystem.
const EVENTS_PING: &str = "events";

struct Inner {
    buffers: HashMap<String, Vec<Value>>,
    counters: HashMap<String, i64>,
    uploader: Option<Arc<dyn Uploader>>,
    max_events: u32,
    upload_enabled: bool,
}

pub struct EventsDatabase {
    store: Arc<dyn PersistentStore>,
    clock: Arc<dyn MonotonicClock>,
    error_recorder: ErrorRecorder,
    inner: Mutex<Inner>,
}

impl EventsDatabase {
    pub fn new(store: Arc<dyn PersistentStore>, clock: Arc<dyn MonotonicClock>) -> Self {
        Self {
            store,
            clock,
            error_recorder: ErrorRecorder::new(),
            inner: Mutex::new(Inner {
                buffers: HashMap::new(),
                counters: HashMap::new(),
                uploader: None,
                max_events: 1,
                upload_enabled: true,
            }),
        }
    }

    pub fn error_recorder(&self) -> &ErrorRecorder {
        &self.error_recorder
    }

    /// Whether upload is currently enabled globally (§4.3). Checked by
    /// [`crate::metric::EventMetric::record`] before any validation runs, so
    /// a globally-disabled upload never touches an error counter.
    pub async fn upload_enabled(&self) -> bool {
        self.inner.lock().await.upload_enabled
    }

    pub fn test_get_num_recorded_errors(
        &self,
        category: &str,
        name: &str,
        error_type: ErrorType,
    ) -> u32 {
        self.error_recorder
            .test_get_num_recorded_errors(category, name, error_type)
    }

    async fn load_buffers(&self) -> HashMap<String, Vec<Value>> {
        match self.store.get(&[EVENTS_PATH]).await {
            Ok(Some(Value::Object(map))) => map
                .into_iter()
                .filter_map(|(ping, value)| match value {
                    Value::Array(events) => Some((ping, events)),
                    _ => None,
                })
                .collect(),
            _ => HashMap::new(),
        }
    }

    async fn load_counters(&self) -> HashMap<String, i64> {
        match self
            .store
            .get(&["metrics", "user", "counter", COUNTER_METRIC_NAME])
            .await
        {
            Ok(Some(Value::Object(map))) => map
                .into_iter()
                .filter_map(|(ping, value)| value.as_i64().map(|n| (ping, n)))
                .collect(),
            _ => HashMap::new(),
        }
    }

    /// Persists `events` as `ping`'s buffer. Returns `false` on a storage
    /// failure; callers must treat the in-memory mutation that produced
    /// `events` as not having happened when this returns `false` (§4.2: a
    /// storage write failure drops the event, it doesn't just log past it).
    async fn persist_buffer(&self, ping: &str, events: Vec<Value>) -> bool {
        let ping = ping.to_owned();
        if let Err(e) = self
            .store
            .update(&[EVENTS_PATH, &ping], Box::new(move |_| Some(Value::Array(events))))
            .await
        {
            log::error!("failed to persist event buffer for {ping}: {e}");
            return false;
        }
        true
    }

    async fn clear_buffer(&self, ping: &str) {
        if let Err(e) = self.store.delete(&[EVENTS_PATH, ping]).await {
            log::error!("failed to clear event buffer for {ping}: {e}");
        }
    }

    /// Persists `value` as `ping`'s execution counter. Returns `false` on a
    /// storage failure, same contract as [`Self::persist_buffer`].
    async fn persist_counter(&self, ping: &str, value: i64) -> bool {
        let ping_owned = ping.to_owned();
        let path = ["metrics", "user", "counter", COUNTER_METRIC_NAME];
        if let Err(e) = self
            .store
            .update(
                &path,
                Box::new(move |existing| {
                    let mut map = match existing {
                        Some(Value::Object(m)) => m,
                        _ => serde_json::Map::new(),
                    };
                    map.insert(ping_owned, Value::from(value));
                    Some(Value::Object(map))
                }),
            )
            .await
        {
            log::error!("failed to persist execution counter for {ping}: {e}");
            return false;
        }
        true
    }

    async fn clear_counter(&self, ping: &str) {
        let ping_owned = ping.to_owned();
        let path = ["metrics", "user", "counter", COUNTER_METRIC_NAME];
        if let Err(e) = self
            .store
            .update(
                &path,
                Box::new(move |existing| {
                    let mut map = match existing {
                        Some(Value::Object(m)) => m,
                        _ => return None,
                    };
                    map.remove(&ping_owned);
                    Some(Value::Object(map))
                }),
            )
            .await
        {
            log::error!("failed to clear execution counter for {ping}: {e}");
        }
    }

    /// Start a new lifetime: load whatever is on disk, inject restart
    /// markers for every ping with a non-empty prior buffer, and schedule a
    /// startup submission if warranted (§4.2).
    pub async fn initialize(&self, config: &Configuration) {
        let current_start = self.clock.start_time_ms();
        let previous_start = match self.store.get(&[EVENTS_META_PATH, START_TIME_KEY]).await {
            Ok(Some(v)) => v.as_i64(),
            _ => None,
        };

        let mut any_non_empty = false;
        {
            let mut inner = self.inner.lock().await;
            inner.uploader = Some(config.uploader.clone());
            inner.max_events = config.settings.max_events;
            inner.upload_enabled = config.settings.upload_enabled;
            inner.buffers = self.load_buffers().await;
            inner.counters = self.load_counters().await;

            let ping_names: Vec<String> = inner
                .buffers
                .iter()
                .filter(|(_, events)| !events.is_empty())
                .map(|(ping, _)| ping.clone())
                .collect();

            for ping in ping_names {
                any_non_empty = true;

                let previous_counter = inner.counters.get(&ping).copied();
                let counter = previous_counter.unwrap_or(0) + 1;
                inner.counters.insert(ping.clone(), counter);
                if !self.persist_counter(&ping, counter).await {
                    match previous_counter {
                        Some(prev) => inner.counters.insert(ping.clone(), prev),
                        None => inner.counters.remove(&ping),
                    };
                    continue;
                }

                let raw_timestamp = match previous_start {
                    Some(prev) if current_start > prev => current_start - prev,
                    Some(_) => {
                        self.error_recorder
                            .record("glean", "restarted", ErrorType::InvalidValue);
                        0
                    }
                    None => 0,
                };

                let marker = RecordedEvent::restart_marker(counter, raw_timestamp);
                let buffer = inner.buffers.entry(ping.clone()).or_default();
                buffer.push(marker.raw());
                let snapshot = buffer.clone();
                if !self.persist_buffer(&ping, snapshot).await {
                    inner.buffers.entry(ping.clone()).or_default().pop();
                }
            }
        }

        if let Err(e) = self
            .store
            .update(
                &[EVENTS_META_PATH, START_TIME_KEY],
                Box::new(move |_| Some(Value::from(current_start))),
            )
            .await
        {
            log::error!("failed to persist lifetime start time: {e}");
        }

        if any_non_empty {
            let uploader = {
                let inner = self.inner.lock().await;
                inner.uploader.clone()
            };
            if let Some(uploader) = uploader {
                self.submit_ping(EVENTS_PING, "startup", &uploader).await;
            }
        }
    }

    /// Append `event` to every ping `meta` sends to, stamping the
    /// execution counter and triggering capacity submission when needed.
    pub async fn record(&self, meta: &CommonMetricData, event: RecordedEvent) {
        if meta.disabled {
            return;
        }

        for ping in &meta.send_in_pings {
            let outcome = {
                let mut inner = self.inner.lock().await;
                if !inner.upload_enabled {
                    return;
                }

                let had_counter = inner.counters.contains_key(ping);
                let counter = *inner.counters.entry(ping.clone()).or_insert(1);

                let mut stamped = event.clone();
                stamped.set_execution_counter(counter);
                let buffer = inner.buffers.entry(ping.clone()).or_default();
                buffer.push(stamped.raw());

                if !self.persist_counter(ping, counter).await {
                    if !had_counter {
                        inner.counters.remove(ping);
                    }
                    inner.buffers.entry(ping.clone()).or_default().pop();
                    None
                } else {
                    let buffer = inner.buffers.entry(ping.clone()).or_default();
                    let snapshot = buffer.clone();
                    if !self.persist_buffer(ping, snapshot.clone()).await {
                        inner.buffers.entry(ping.clone()).or_default().pop();
                        None
                    } else {
                        let len = snapshot.len();
                        let max_events = inner.max_events as usize;
                        let reached_capacity = ping == EVENTS_PING && len >= max_events;
                        Some((inner.uploader.clone(), reached_capacity, len))
                    }
                }
            };

            let Some((uploader, reached_capacity, snapshot_len)) = outcome else {
                continue;
            };

            if reached_capacity {
                log::debug!("{ping} buffer reached capacity at {snapshot_len} events");
                if let Some(uploader) = uploader {
                    self.submit_ping(EVENTS_PING, "max_capacity", &uploader).await;
                }
            }
        }
    }

    /// Drain and normalize `ping`'s buffer into a submission, if non-empty.
    async fn submit_ping(&self, ping: &str, reason: &str, uploader: &Arc<dyn Uploader>) {
        let Some(events) = self.get_ping_events(ping, true).await else {
            return;
        };
        if events.is_empty() {
            return;
        }

        let request = PingRequest {
            ping_name: ping.to_owned(),
            reason: reason.to_owned(),
            events,
        };
        if let Err(e) = uploader.submit(request).await {
            log::error!("failed to submit {ping} ping: {e}");
        }
    }

    /// The ordered, normalized public payload for `ping`, or `None` if its
    /// buffer is empty or absent. Clears the buffer and counter when
    /// `clear` is set (§4.2, P3).
    pub async fn get_ping_events(&self, ping: &str, clear: bool) -> Option<Vec<Value>> {
        let mut inner = self.inner.lock().await;
        let raw = inner.buffers.get(ping)?.clone();
        if raw.is_empty() {
            return None;
        }

        let normalized = self.normalize(ping, &raw);

        if clear {
            inner.buffers.remove(ping);
            inner.counters.remove(ping);
            drop(inner);
            self.clear_buffer(ping).await;
            self.clear_counter(ping).await;
        }

        Some(normalized)
    }

    /// Remove every ping's buffer, counters, and the persisted start time.
    pub async fn clear_all(&self) {
        let pings: Vec<String> = {
            let mut inner = self.inner.lock().await;
            let pings: Vec<String> = inner.buffers.keys().cloned().collect();
            inner.buffers.clear();
            inner.counters.clear();
            pings
        };
        for ping in pings {
            self.clear_buffer(&ping).await;
            self.clear_counter(&ping).await;
        }
        if let Err(e) = self.store.delete(&[EVENTS_META_PATH, START_TIME_KEY]).await {
            log::error!("failed to clear lifetime start time: {e}");
        }
    }

    /// Parse, sort, trim, and rebase timestamps for one ping's raw buffer
    /// (§4.2 normalization pipeline).
    ///
    /// Restart markers sort first within their execution-counter group
    /// regardless of their (wall-clock-scale) raw timestamp, and establish a
    /// fresh per-lifetime anchor at the event immediately following them:
    /// the marker's own raw value only measures the inter-lifetime gap, not
    /// a point on the same timeline as the events that follow it, so reusing
    /// it as the new anchor would make those events' deltas go negative.
    fn normalize(&self, ping: &str, raw: &[Value]) -> Vec<Value> {
        let mut events: Vec<RecordedEvent> = Vec::with_capacity(raw.len());
        for value in raw {
            match serde_json::from_value::<RecordedEvent>(value.clone()) {
                Ok(event) => events.push(event),
                Err(_) => {
                    self.error_recorder
                        .record("glean", "events_database", ErrorType::InvalidValue);
                    log::warn!("discarding malformed persisted event for {ping}");
                }
            }
        }

        events.sort_by(|a, b| {
            let ca = a.execution_counter().unwrap_or(0);
            let cb = b.execution_counter().unwrap_or(0);
            ca.cmp(&cb)
                .then_with(|| a.is_restart_marker().cmp(&b.is_restart_marker()).reverse())
                .then_with(|| a.timestamp.cmp(&b.timestamp))
        });

        if events.last().map(|e| e.is_restart_marker()).unwrap_or(false) {
            events.pop();
        }
        if events.is_empty() {
            return Vec::new();
        }

        let mut output = Vec::with_capacity(events.len());
        let mut anchor = 0i64;
        let mut base = 0i64;
        let mut prev_counter: Option<i64> = None;
        let mut prev_output = 0i64;
        let mut pending_rebase = false;

        for event in &events {
            let counter = event.execution_counter().unwrap_or(0);
            let out = match prev_counter {
                None => {
                    anchor = event.timestamp;
                    base = 0;
                    0
                }
                Some(pc) if pc != counter => {
                    // the restart marker opening this new lifetime
                    pending_rebase = true;
                    prev_output + std::cmp::max(1, event.timestamp)
                }
                Some(_) if pending_rebase => {
                    // first regular event after the marker: re-anchor here
                    anchor = event.timestamp;
                    base = prev_output + 1;
                    pending_rebase = false;
                    base
                }
                Some(_) => base + (event.timestamp - anchor),
            };

            output.push(event.payload_with_timestamp(out));
            prev_counter = Some(counter);
            prev_output = out;
        }

        output
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Settings;
    use crate::store::FileStore;
    use crate::test_support::FakeClock;
    use crate::uploader::RecordingUploader;

    fn meta(pings: &[&str]) -> CommonMetricData {
        CommonMetricData::new(
            "views",
            "screen",
            pings.iter().map(|s| s.to_string()).collect(),
        )
    }

    async fn configured(
        dir: &std::path::Path,
        clock: Arc<FakeClock>,
        max_events: u32,
    ) -> (Arc<EventsDatabase>, Arc<RecordingUploader>) {
        let store = Arc::new(FileStore::open(dir.join("store.json")).unwrap());
        let uploader = Arc::new(RecordingUploader::new());
        let settings = Settings {
            test_mode: true,
            max_events,
            ..Settings::default()
        };
        let config = Configuration::new(settings, uploader.clone()).unwrap();
        let db = Arc::new(EventsDatabase::new(store, clock));
        db.initialize(&config).await;
        (db, uploader)
    }

    #[tokio::test]
    async fn p1_outputs_are_strictly_increasing_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FakeClock::new(0));
        let (db, _uploader) = configured(dir.path(), clock, 1000).await;

        for ts in [0, 10, 10, 40] {
            let event = RecordedEvent::new("views", "screen", ts, None);
            db.record(&meta(&["aPing"]), event).await;
        }

        let events = db.get_ping_events("aPing", false).await.unwrap();
        let mut last = -1i64;
        for event in &events {
            let ts = event["timestamp"].as_i64().unwrap();
            assert!(ts > last, "timestamps must be strictly increasing");
            last = ts;
        }
        assert_eq!(events[0]["timestamp"], 0);
    }

    #[tokio::test]
    async fn p3_drain_resets_the_execution_counter() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FakeClock::new(0));
        let (db, _uploader) = configured(dir.path(), clock, 1000).await;

        db.record(&meta(&["aPing"]), RecordedEvent::new("views", "screen", 0, None))
            .await;
        assert!(db.get_ping_events("aPing", true).await.is_some());
        assert!(db.get_ping_events("aPing", false).await.is_none());
    }

    #[tokio::test]
    async fn p4_public_reads_never_carry_reserved_extras() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FakeClock::new(0));
        let (db, _uploader) = configured(dir.path(), clock, 1000).await;

        db.record(&meta(&["aPing"]), RecordedEvent::new("views", "screen", 0, None))
            .await;
        let events = db.get_ping_events("aPing", false).await.unwrap();
        for event in &events {
            assert!(event.get("extra").map(|e| e.get("#execution_counter").is_none()).unwrap_or(true));
        }
    }

    #[tokio::test]
    async fn p6_trailing_restart_marker_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("store.json");

        {
            let clock = Arc::new(FakeClock::new(0));
            let (db, _uploader) = configured(dir.path(), clock, 1000).await;
            db.record(&meta(&["aPing"]), RecordedEvent::new("views", "screen", 0, None))
                .await;
        }

        // re-initialize (simulated restart) without recording anything new:
        // the injected restart marker would be the sole trailing event.
        let store = Arc::new(FileStore::open(&file).unwrap());
        let clock = Arc::new(FakeClock::new(5));
        let uploader = Arc::new(RecordingUploader::new());
        let settings = Settings {
            test_mode: true,
            ..Settings::default()
        };
        let config = Configuration::new(settings, uploader).unwrap();
        let db = EventsDatabase::new(store, clock);
        db.initialize(&config).await;

        let events = db.get_ping_events("aPing", false).await.unwrap();
        assert!(!events.last().unwrap()["name"].as_str().unwrap().eq("restarted"));
    }

    #[tokio::test]
    async fn cross_restart_stitching_keeps_insertion_order_within_a_lifetime() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("store.json");

        {
            let clock = Arc::new(FakeClock::new(1_000));
            let (db, _uploader) = configured(dir.path(), clock, 1000).await;
            db.record(&meta(&["aPing"]), RecordedEvent::new("views", "screen", 0, None))
                .await;
            db.record(&meta(&["aPing"]), RecordedEvent::new("views", "screen", 10, None))
                .await;
        }

        let store = Arc::new(FileStore::open(&file).unwrap());
        let clock = Arc::new(FakeClock::new(1_000 + 3_600_000));
        let uploader = Arc::new(RecordingUploader::new());
        let settings = Settings {
            test_mode: true,
            ..Settings::default()
        };
        let config = Configuration::new(settings, uploader).unwrap();
        let db = EventsDatabase::new(store, clock);
        db.initialize(&config).await;

        db.record(&meta(&["aPing"]), RecordedEvent::new("views", "screen", 10, None))
            .await;
        db.record(&meta(&["aPing"]), RecordedEvent::new("views", "screen", 40, None))
            .await;

        let events = db.get_ping_events("aPing", false).await.unwrap();
        assert_eq!(events.len(), 5);
        assert_eq!(events[2]["name"], "restarted");

        let timestamps: Vec<i64> = events.iter().map(|e| e["timestamp"].as_i64().unwrap()).collect();
        for window in timestamps.windows(2) {
            assert!(window[1] > window[0]);
        }
        assert_eq!(timestamps[0], 0);
    }

    #[tokio::test]
    async fn clock_stood_still_across_restarts_still_advances_and_records_errors() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("store.json");

        {
            let clock = Arc::new(FakeClock::new(500));
            let (db, _uploader) = configured(dir.path(), clock, 1000).await;
            db.record(&meta(&["aPing"]), RecordedEvent::new("views", "screen", 0, None))
                .await;
        }

        let mut last_errors = 0;
        for _ in 0..9 {
            let store = Arc::new(FileStore::open(&file).unwrap());
            let clock = Arc::new(FakeClock::new(500));
            let uploader = Arc::new(RecordingUploader::new());
            let settings = Settings {
                test_mode: true,
                ..Settings::default()
            };
            let config = Configuration::new(settings, uploader).unwrap();
            let db = EventsDatabase::new(store, clock);
            db.initialize(&config).await;
            db.record(&meta(&["aPing"]), RecordedEvent::new("views", "screen", 0, None))
                .await;
            last_errors = db.test_get_num_recorded_errors("glean", "restarted", ErrorType::InvalidValue);
        }

        assert_eq!(last_errors, 9);
    }

    #[tokio::test]
    async fn clock_moved_backward_across_restarts_still_advances_and_records_errors() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("store.json");
        let mut start_time = 1_000_000_000i64;

        {
            let clock = Arc::new(FakeClock::new(start_time));
            let (db, _uploader) = configured(dir.path(), clock, 1000).await;
            db.record(&meta(&["aPing"]), RecordedEvent::new("views", "screen", 0, None))
                .await;
        }

        let mut last_errors = 0;
        for _ in 0..9 {
            start_time -= 3_600_000;
            let store = Arc::new(FileStore::open(&file).unwrap());
            let clock = Arc::new(FakeClock::new(start_time));
            let uploader = Arc::new(RecordingUploader::new());
            let settings = Settings {
                test_mode: true,
                ..Settings::default()
            };
            let config = Configuration::new(settings, uploader).unwrap();
            let db = EventsDatabase::new(store, clock);
            db.initialize(&config).await;
            db.record(&meta(&["aPing"]), RecordedEvent::new("views", "screen", 0, None))
                .await;
            last_errors = db.test_get_num_recorded_errors("glean", "restarted", ErrorType::InvalidValue);

            let events = db.get_ping_events("aPing", false).await.unwrap();
            assert_eq!(events[0]["timestamp"], 0);
        }

        assert_eq!(last_errors, 9);
    }

    #[tokio::test]
    async fn p5_capacity_submission_carries_exactly_max_events() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FakeClock::new(0));
        let (db, uploader) = configured(dir.path(), clock, 10).await;

        for i in 0..15 {
            db.record(&meta(&[EVENTS_PING]), RecordedEvent::new("views", "screen", i, None))
                .await;
        }

        assert_eq!(uploader.count(), 1);
        let submitted = &uploader.submitted()[0];
        assert_eq!(submitted.ping_name, EVENTS_PING);
        assert_eq!(submitted.events.len(), 10);
        assert_eq!(submitted.reason, "max_capacity");

        let remaining = db.get_ping_events(EVENTS_PING, false).await.unwrap();
        assert_eq!(remaining.len(), 5);
    }

    #[tokio::test]
    async fn startup_submission_fires_once_when_prior_events_exist() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("store.json");

        {
            let clock = Arc::new(FakeClock::new(0));
            let (db, _uploader) = configured(dir.path(), clock, 1000).await;
            for i in 0..10 {
                db.record(&meta(&[EVENTS_PING]), RecordedEvent::new("views", "screen", i, None))
                    .await;
            }
        }

        let store = Arc::new(FileStore::open(&file).unwrap());
        let clock = Arc::new(FakeClock::new(1_000));
        let uploader = Arc::new(RecordingUploader::new());
        let settings = Settings {
            test_mode: true,
            ..Settings::default()
        };
        let config = Configuration::new(settings, uploader.clone()).unwrap();
        let db = EventsDatabase::new(store, clock);
        db.initialize(&config).await;

        assert_eq!(uploader.count(), 1);
        assert_eq!(uploader.submitted()[0].reason, "startup");
    }

    #[tokio::test]
    async fn reserved_extra_key_is_rejected_before_it_reaches_a_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FakeClock::new(0));
        let (db, _uploader) = configured(dir.path(), clock, 1000).await;

        let mut extra: HashMap<String, Value> = HashMap::new();
        extra.insert("#execution_counter".to_owned(), Value::from(42));
        let event = RecordedEvent::new("views", "screen", 0, Some(extra));
        db.record(&meta(&["aPing"]), event).await;

        let events = db.get_ping_events("aPing", false).await.unwrap();
        assert!(events[0].get("extra").is_none());
    }
}
