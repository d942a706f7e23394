//! Directory source: wires the file-tail harvester into the pipe graph.
//!
//! The harvester runs on a blocking thread and feeds a bounded channel; a
//! forwarder task turns tailed records into envelopes and drives them into
//! the downstream stage. Backpressure flows naturally: a slow sink fills
//! its batcher, which fills the channel, which stalls the reader.

use std::{path::Path, sync::Arc};

use chrono::Utc;
use file_tail::{
    bookmarks::BookmarkStore, Harvester, HarvesterConfig, TailedRecord,
};
use snafu::{ResultExt, Snafu};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::event::{Envelope, EventPayload, RecordPosition};
use crate::metrics::{counters, ComponentMetrics};
use crate::pipes::EventSink;

const RECORD_CHANNEL_CAPACITY: usize = 1_024;

#[derive(Debug, Snafu)]
pub enum DirectorySourceError {
    #[snafu(display("could not open bookmark store for source {id:?}: {source}"))]
    Bookmarks { id: String, source: std::io::Error },
    #[snafu(display("invalid tailer settings for source {id:?}: {source}"))]
    Tailer {
        id: String,
        source: file_tail::HarvesterError,
    },
}

/// A bookmarked directory tailer source.
pub struct DirectorySource {
    id: Arc<str>,
    config: HarvesterConfig,
    bookmarks: Arc<BookmarkStore>,
    metrics: ComponentMetrics,
}

impl DirectorySource {
    /// Construct the source and load its bookmarks. Static validation
    /// (parser patterns, paths) happens here so sessions can reject bad
    /// configuration before anything starts.
    pub fn new(
        id: &str,
        config: HarvesterConfig,
        data_dir: &Path,
        metrics: ComponentMetrics,
    ) -> Result<Self, DirectorySourceError> {
        let bookmarks = Arc::new(
            BookmarkStore::new(data_dir, id).context(BookmarksSnafu { id })?,
        );
        bookmarks.load().context(BookmarksSnafu { id })?;

        // Probe-build a harvester so configuration errors surface now.
        Harvester::new(config.clone(), Arc::clone(&bookmarks)).context(TailerSnafu { id })?;

        metrics.initialize(&[counters::RECORDS_READ, counters::PARSE_FAILURES]);

        Ok(DirectorySource {
            id: Arc::from(id),
            config,
            bookmarks,
            metrics,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Start the harvester thread and the forwarder task.
    pub fn spawn(
        &self,
        downstream: Arc<dyn EventSink>,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let (tx, rx) = mpsc::channel::<TailedRecord>(RECORD_CHANNEL_CAPACITY);

        let harvester = Harvester::new(self.config.clone(), Arc::clone(&self.bookmarks))
            .expect("settings validated at construction");
        let parse_failures = harvester.failure_counter();
        let harvester_shutdown = shutdown.clone();
        let reader = tokio::task::spawn_blocking(move || {
            harvester.run(tx, harvester_shutdown);
        });

        let forwarder = tokio::spawn(forward(
            Arc::clone(&self.id),
            rx,
            downstream,
            self.metrics.clone(),
            parse_failures,
            shutdown,
        ));

        info!(message = "Started directory source.", source_id = %self.id, directory = ?self.config.directory);
        vec![reader, forwarder]
    }
}

async fn forward(
    source_id: Arc<str>,
    mut rx: mpsc::Receiver<TailedRecord>,
    downstream: Arc<dyn EventSink>,
    metrics: ComponentMetrics,
    parse_failures: Arc<std::sync::atomic::AtomicU64>,
    shutdown: CancellationToken,
) {
    loop {
        let record = tokio::select! {
            _ = shutdown.cancelled() => break,
            record = rx.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };

        metrics.increment(counters::RECORDS_READ, 1);
        metrics.set(
            counters::PARSE_FAILURES,
            parse_failures.load(std::sync::atomic::Ordering::Relaxed) as i64,
        );

        let payload = if record.fields.is_empty() {
            EventPayload::Text(record.text)
        } else {
            EventPayload::Record(record.fields)
        };
        let envelope = Envelope::new(
            Arc::clone(&source_id),
            record.timestamp.unwrap_or_else(Utc::now),
            payload,
        )
        .with_position(
            RecordPosition {
                file_id: record.file_id,
                offset: record.offset,
                line: record.line,
            },
            record.bookmark,
        );

        downstream.accept(envelope).await;
    }

    // Drain whatever the reader already queued so a graceful stop loses
    // nothing that was read off disk.
    while let Ok(record) = rx.try_recv() {
        metrics.increment(counters::RECORDS_READ, 1);
        let envelope = Envelope::new(
            Arc::clone(&source_id),
            record.timestamp.unwrap_or_else(Utc::now),
            EventPayload::Text(record.text),
        )
        .with_position(
            RecordPosition {
                file_id: record.file_id,
                offset: record.offset,
                line: record.line,
            },
            record.bookmark,
        );
        downstream.accept(envelope).await;
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    use super::DirectorySource;
    use crate::metrics::{ComponentMetrics, MetricsHub};
    use crate::pipes::test_util::CollectingSink;
    use crate::pipes::EventSink;
    use file_tail::HarvesterConfig;

    #[tokio::test(flavor = "multi_thread")]
    async fn tails_files_into_envelopes() {
        let log_dir = tempdir().unwrap();
        let data_dir = tempdir().unwrap();
        std::fs::write(log_dir.path().join("app.log"), b"alpha\nbeta\n").unwrap();

        let mut config = HarvesterConfig::new(log_dir.path().to_path_buf());
        config.include = vec!["*.log".to_owned()];
        config.sweep_interval = Duration::from_millis(20);

        let hub = MetricsHub::new();
        let source = DirectorySource::new(
            "app-logs",
            config,
            data_dir.path(),
            ComponentMetrics::new(Arc::clone(&hub), "sources", "app-logs"),
        )
        .unwrap();

        let sink = CollectingSink::new();
        let shutdown = CancellationToken::new();
        let handles = source.spawn(Arc::clone(&sink) as Arc<dyn EventSink>, shutdown.clone());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if sink.received.lock().await.len() >= 2 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "records never arrived");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }

        let received = sink.received.lock().await;
        assert_eq!(received[0].payload.text_form(), "alpha");
        assert_eq!(received[1].payload.text_form(), "beta");
        assert_eq!(&*received[0].source_id, "app-logs");
        assert!(received[0].position.is_some());
        assert!(received[0].bookmark.is_some());
    }

    #[test]
    fn invalid_parser_fails_construction() {
        let data_dir = tempdir().unwrap();
        let mut config = HarvesterConfig::new(std::path::PathBuf::from("/tmp"));
        config.parser = file_tail::parser::ParserSpec::Regex {
            pattern: "(unclosed".to_owned(),
            extraction: None,
            timestamp_format: None,
            options: Default::default(),
        };

        let hub = crate::metrics::MetricsHub::new();
        let result = DirectorySource::new(
            "bad",
            config,
            data_dir.path(),
            crate::metrics::ComponentMetrics::new(hub, "sources", "bad"),
        );
        assert!(result.is_err());
    }
}
