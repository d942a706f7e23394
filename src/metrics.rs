//! Session-scoped metrics hub.
//!
//! Counters are keyed `(category, id, counter)`, e.g.
//! `("sinks", "cloudwatch-1", "records_success")`. Two kinds exist:
//! current-value counters replace, increment counters add. Subscribers get
//! a replay of every known counter at attach time and live events after,
//! so a late-attaching metrics sink starts from a complete picture.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MetricKey {
    pub category: String,
    pub id: String,
    pub counter: String,
}

impl MetricKey {
    pub fn new(
        category: impl Into<String>,
        id: impl Into<String>,
        counter: impl Into<String>,
    ) -> Self {
        MetricKey {
            category: category.into(),
            id: id.into(),
            counter: counter.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CounterKind {
    /// Replaces the stored value.
    CurrentValue,
    /// Adds to the stored value.
    Increment,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricEvent {
    pub key: MetricKey,
    pub kind: CounterKind,
    /// For `CurrentValue` the new value; for `Increment` the delta.
    pub value: i64,
}

/// Multi-writer multi-reader hub. One per session, owned by the session
/// and handed to components through their construction context.
pub struct MetricsHub {
    values: DashMap<MetricKey, i64>,
    events: broadcast::Sender<MetricEvent>,
    // Serializes publishes against subscriber attach so a replay snapshot
    // and the live stream can never double-count an event.
    publish_order: Mutex<()>,
}

impl Default for MetricsHub {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        MetricsHub {
            values: DashMap::new(),
            events,
            publish_order: Mutex::new(()),
        }
    }
}

impl MetricsHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, key: MetricKey, value: i64) {
        let _order = self.publish_order.lock().expect("metrics hub poisoned");
        self.values.insert(key.clone(), value);
        self.events
            .send(MetricEvent {
                key,
                kind: CounterKind::CurrentValue,
                value,
            })
            .ok();
    }

    pub fn increment(&self, key: MetricKey, delta: i64) {
        let _order = self.publish_order.lock().expect("metrics hub poisoned");
        *self.values.entry(key.clone()).or_insert(0) += delta;
        self.events
            .send(MetricEvent {
                key,
                kind: CounterKind::Increment,
                value: delta,
            })
            .ok();
    }

    /// Pre-create a counter group at zero so subscribers see the group
    /// even before its first real event.
    pub fn initialize_group(&self, category: &str, id: &str, counters: &[&str]) {
        let _order = self.publish_order.lock().expect("metrics hub poisoned");
        for counter in counters {
            self.values
                .entry(MetricKey::new(category, id, *counter))
                .or_insert(0);
        }
    }

    /// Attach a subscriber: a replay of all current values plus the live
    /// event stream from this instant on.
    pub fn subscribe(&self) -> (Vec<MetricEvent>, broadcast::Receiver<MetricEvent>) {
        let _order = self.publish_order.lock().expect("metrics hub poisoned");
        let receiver = self.events.subscribe();
        let mut replay: Vec<MetricEvent> = self
            .values
            .iter()
            .map(|entry| MetricEvent {
                key: entry.key().clone(),
                kind: CounterKind::CurrentValue,
                value: *entry.value(),
            })
            .collect();
        replay.sort_by(|a, b| a.key.cmp(&b.key));
        (replay, receiver)
    }

    /// Stable-ordered dump of every counter, for status output and the
    /// aggregating metrics sink.
    pub fn snapshot(&self) -> Vec<(MetricKey, i64)> {
        let mut all: Vec<(MetricKey, i64)> = self
            .values
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn get(&self, key: &MetricKey) -> Option<i64> {
        self.values.get(key).map(|v| *v.value())
    }
}

/// Convenience wrapper binding a hub to one component's category and id.
#[derive(Clone)]
pub struct ComponentMetrics {
    hub: Arc<MetricsHub>,
    category: &'static str,
    id: String,
}

impl ComponentMetrics {
    pub fn new(hub: Arc<MetricsHub>, category: &'static str, id: impl Into<String>) -> Self {
        ComponentMetrics {
            hub,
            category,
            id: id.into(),
        }
    }

    pub fn initialize(&self, counters: &[&str]) {
        self.hub.initialize_group(self.category, &self.id, counters);
    }

    pub fn set(&self, counter: &str, value: i64) {
        self.hub
            .set(MetricKey::new(self.category, &self.id, counter), value);
    }

    pub fn increment(&self, counter: &str, delta: i64) {
        self.hub
            .increment(MetricKey::new(self.category, &self.id, counter), delta);
    }
}

/// Counter names shared by sinks and sources.
pub mod counters {
    pub const BYTES_ATTEMPTED: &str = "bytes_attempted";
    pub const RECORDS_ATTEMPTED: &str = "records_attempted";
    pub const RECORDS_SUCCESS: &str = "records_success";
    pub const RECORDS_FAILED_RECOVERABLE: &str = "records_failed_recoverable";
    pub const RECORDS_FAILED_NONRECOVERABLE: &str = "records_failed_nonrecoverable";
    pub const RECOVERABLE_SERVICE_ERRORS: &str = "recoverable_service_errors";
    pub const NONRECOVERABLE_SERVICE_ERRORS: &str = "nonrecoverable_service_errors";
    pub const LATENCY_MS: &str = "latency_ms";
    pub const CLIENT_LATENCY_MS: &str = "client_latency_ms";
    pub const RECORDS_READ: &str = "records_read";
    pub const PARSE_FAILURES: &str = "parse_failures";
    pub const BATCHES_DROPPED: &str = "batches_dropped";
}
