//! Sink that writes each event's text form to stdout. Used by `validate`
//! runs and local debugging.

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::event::Envelope;
use crate::metrics::{counters, ComponentMetrics};
use crate::pipes::EventSink;

pub struct ConsoleSink {
    stdout: Mutex<tokio::io::Stdout>,
    metrics: ComponentMetrics,
}

impl ConsoleSink {
    pub fn new(metrics: ComponentMetrics) -> Self {
        metrics.initialize(&[counters::RECORDS_SUCCESS]);
        ConsoleSink {
            stdout: Mutex::new(tokio::io::stdout()),
            metrics,
        }
    }
}

#[async_trait]
impl EventSink for ConsoleSink {
    async fn accept(&self, envelope: Envelope) {
        let mut line = envelope.payload.text_form().into_owned();
        line.push('\n');
        let mut stdout = self.stdout.lock().await;
        if stdout.write_all(line.as_bytes()).await.is_ok() {
            self.metrics.increment(counters::RECORDS_SUCCESS, 1);
        }
    }
}
