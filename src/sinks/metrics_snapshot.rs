//! Aggregating metrics sink.
//!
//! Subscribes to the session's metrics hub and periodically emits one
//! aggregated snapshot through structured logging, so operators get a
//! heartbeat of counter state without an external metrics system.

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::metrics::MetricsHub;

pub struct MetricsSnapshotSink {
    id: String,
    hub: Arc<MetricsHub>,
    interval: Duration,
}

impl MetricsSnapshotSink {
    pub fn new(id: impl Into<String>, hub: Arc<MetricsHub>, interval: Duration) -> Self {
        MetricsSnapshotSink {
            id: id.into(),
            hub,
            interval,
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            // The replay primes the subscription; the periodic snapshot
            // below reads the aggregated view directly.
            let (_replay, _events) = self.hub.subscribe();
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.interval) => self.emit(),
                }
            }
            self.emit();
        })
    }

    fn emit(&self) {
        let snapshot = self.hub.snapshot();
        if snapshot.is_empty() {
            return;
        }
        let rendered: Vec<String> = snapshot
            .iter()
            .map(|(key, value)| format!("{}/{}/{}={value}", key.category, key.id, key.counter))
            .collect();
        info!(
            message = "Metrics snapshot.",
            sink_id = %self.id,
            counters = %rendered.join(" "),
        );
    }
}
