//! Generic batching sink runtime.
//!
//! A concrete sink supplies a [`SinkDriver`] (conversion, sizing, and the
//! transport call) and the runtime supplies everything else: batching,
//! the two-tier buffer, throttling, recoverable retries through the
//! overflow tier, regional failover, bookmark acknowledgement, and
//! per-batch metrics.

use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use durable_queue::{AddError, TwoTierBuffer};
use file_tail::bookmarks::{BookmarkHandle, BookmarkPosition};
use futures::FutureExt;
use rand::Rng;
use snafu::Snafu;
use std::collections::HashMap;
use std::time::Duration;
use tokio::{sync::Mutex, task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::event::Envelope;
use crate::failover::FailoverController;
use crate::metrics::{counters, ComponentMetrics};
use crate::sinks::util::batcher::{Batcher, BatcherSettings, FlushReason};
use crate::throttle::Throttle;

#[derive(Debug, Snafu)]
#[snafu(display("could not convert event: {message}"))]
pub struct ConvertError {
    pub message: String,
}

/// Whether a send failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Transient service trouble, throttling, expired credentials,
    /// timeouts: requeue and fail over.
    Recoverable,
    /// Validation or permission failures: the batch can never succeed.
    NonRecoverable,
}

/// A failed transport call, already classified by the driver.
#[derive(Debug)]
pub struct SendFailure {
    pub disposition: ErrorDisposition,
    pub message: String,
}

impl SendFailure {
    pub fn recoverable(message: impl Into<String>) -> Self {
        SendFailure {
            disposition: ErrorDisposition::Recoverable,
            message: message.into(),
        }
    }

    pub fn non_recoverable(message: impl Into<String>) -> Self {
        SendFailure {
            disposition: ErrorDisposition::NonRecoverable,
            message: message.into(),
        }
    }
}

/// The destination-specific core of a batching sink. The runtime is
/// generic over this trait; concrete sinks only convert records and issue
/// the transport call (including any protocol quirks like sequence-token
/// retries).
#[async_trait]
pub trait SinkDriver: Send + Sync + 'static {
    type Record: Send + 'static;
    type Client: Send + 'static;

    fn convert(&self, envelope: &Envelope) -> Result<Self::Record, ConvertError>;

    /// Wire size of one record including the destination's per-record
    /// overhead.
    fn size_of(&self, record: &Self::Record) -> usize;

    /// Largest acceptable single record; larger ones are rejected outright
    /// as non-recoverable.
    fn max_record_bytes(&self) -> usize;

    async fn send_batch(
        &self,
        client: &mut Self::Client,
        records: &[Self::Record],
    ) -> Result<(), SendFailure>;
}

/// One batcher entry: the converted record plus its ack path.
pub struct BatchEntry<R> {
    pub record: R,
    pub size: usize,
    pub ack: Option<(BookmarkHandle, BookmarkPosition)>,
    pub event_timestamp: DateTime<Utc>,
}

/// A cut batch travelling through the buffer to the uploader.
pub struct SinkBatch<R> {
    pub records: Vec<R>,
    pub acks: Vec<(BookmarkHandle, BookmarkPosition)>,
    pub bytes: usize,
    pub earliest_event: Option<DateTime<Utc>>,
    pub attempts: u32,
}

impl<R> SinkBatch<R> {
    fn from_entries(entries: Vec<BatchEntry<R>>) -> Self {
        let mut records = Vec::with_capacity(entries.len());
        let mut acks = Vec::new();
        let mut bytes = 0;
        let mut earliest_event: Option<DateTime<Utc>> = None;
        for entry in entries {
            bytes += entry.size;
            earliest_event = Some(
                earliest_event.map_or(entry.event_timestamp, |e| e.min(entry.event_timestamp)),
            );
            if let Some(ack) = entry.ack {
                acks.push(ack);
            }
            records.push(entry.record);
        }
        SinkBatch {
            records,
            acks,
            bytes,
            earliest_event,
            attempts: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SinkRuntimeSettings {
    pub batcher: BatcherSettings,
    /// Consecutive recoverable failures before a batch is dropped.
    pub max_attempts: u32,
    /// Budget for one remote call.
    pub client_timeout: Duration,
    /// Upper bound on how often the failback timer retries the primary.
    pub max_failback_retry_interval: Duration,
}

impl Default for SinkRuntimeSettings {
    fn default() -> Self {
        SinkRuntimeSettings {
            batcher: BatcherSettings::default(),
            max_attempts: 3,
            client_timeout: Duration::from_secs(30),
            max_failback_retry_interval: Duration::from_secs(300),
        }
    }
}

/// Batching sink runtime: accepts envelopes, uploads batches.
pub struct BatchSink<D: SinkDriver> {
    id: String,
    driver: Arc<D>,
    settings: SinkRuntimeSettings,
    batcher: Batcher<BatchEntry<D::Record>>,
    buffer: Arc<TwoTierBuffer<SinkBatch<D::Record>>>,
    controller: Arc<Mutex<FailoverController<D::Client>>>,
    client_slot: Arc<Mutex<Option<D::Client>>>,
    throttle: Mutex<Throttle>,
    metrics: ComponentMetrics,
}

impl<D: SinkDriver> BatchSink<D> {
    pub fn new(
        id: impl Into<String>,
        driver: Arc<D>,
        settings: SinkRuntimeSettings,
        buffer: Arc<TwoTierBuffer<SinkBatch<D::Record>>>,
        controller: FailoverController<D::Client>,
        throttle: Throttle,
        metrics: ComponentMetrics,
    ) -> Arc<Self> {
        metrics.initialize(&[
            counters::BYTES_ATTEMPTED,
            counters::RECORDS_ATTEMPTED,
            counters::RECORDS_SUCCESS,
            counters::RECORDS_FAILED_RECOVERABLE,
            counters::RECORDS_FAILED_NONRECOVERABLE,
            counters::RECOVERABLE_SERVICE_ERRORS,
            counters::NONRECOVERABLE_SERVICE_ERRORS,
            counters::BATCHES_DROPPED,
        ]);

        let flush_buffer = Arc::clone(&buffer);
        let flush_metrics = metrics.clone();
        let batcher = Batcher::new(
            settings.batcher,
            Box::new(move |entries: Vec<BatchEntry<D::Record>>, reason: FlushReason| {
                let buffer = Arc::clone(&flush_buffer);
                let metrics = flush_metrics.clone();
                async move {
                    let batch = SinkBatch::from_entries(entries);
                    debug!(
                        message = "Cut batch.",
                        records = batch.records.len(),
                        bytes = batch.bytes,
                        ?reason,
                    );
                    match buffer.add(batch).await {
                        Ok(()) => {}
                        Err(AddError::Dropped) => {
                            metrics.increment(counters::BATCHES_DROPPED, 1);
                        }
                        Err(error) => {
                            warn!(message = "Could not buffer batch.", %error);
                            metrics.increment(counters::BATCHES_DROPPED, 1);
                        }
                    }
                }
                .boxed()
            }),
        );

        Arc::new(BatchSink {
            id: id.into(),
            driver,
            settings,
            batcher,
            buffer,
            controller: Arc::new(Mutex::new(controller)),
            client_slot: Arc::new(Mutex::new(None)),
            throttle: Mutex::new(throttle),
            metrics,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Start the uploader, the batch-age timer, and the failback timer.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        // Batch-age timer: shares the batcher lock with `accept`.
        {
            let sink = Arc::clone(self);
            let shutdown = shutdown.clone();
            let period = (sink.batcher.max_age() / 4).max(Duration::from_millis(25));
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(period) => sink.batcher.flush_aged().await,
                    }
                }
            }));
        }

        // Failback timer: checked at most every `max_failback_retry_interval`.
        {
            let sink = Arc::clone(self);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(sink.settings.max_failback_retry_interval) => {
                            sink.try_failback(&shutdown).await;
                        }
                    }
                }
            }));
        }

        // Uploader: the single consumer of the buffer.
        {
            let sink = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                sink.uploader(shutdown).await;
            }));
        }

        handles
    }

    /// Flush the batcher and close the buffer; the uploader then drains
    /// whatever remains and exits.
    pub async fn stop(&self) {
        self.batcher.stop().await;
        self.buffer.close().await;
    }

    /// True once the buffer has fully drained. Used by graceful stop to
    /// decide when cancelling the background tasks loses nothing.
    pub async fn is_idle(&self) -> bool {
        self.buffer.is_empty().await
    }

    async fn try_failback(&self, shutdown: &CancellationToken) {
        let client = {
            let mut controller = self.controller.lock().await;
            if controller.is_on_primary() {
                return;
            }
            controller.try_failback().await
        };
        if let Some(client) = client {
            // Jitter the switchback so a fleet does not stampede the
            // recovered primary in the same instant.
            let jitter = Duration::from_millis(rand::rng().random_range(0..2_000));
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(jitter) => {}
            }
            *self.client_slot.lock().await = Some(client);
            info!(message = "Failed back to primary endpoint.", sink_id = %self.id);
        }
    }

    async fn uploader(&self, shutdown: CancellationToken) {
        loop {
            let batch = tokio::select! {
                _ = shutdown.cancelled() => break,
                batch = self.buffer.next() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };

            let delay = {
                let mut throttle = self.throttle.lock().await;
                throttle.get_delay(&[batch.records.len() as f64, batch.bytes as f64])
            };
            if !delay.is_zero() {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        // Push the batch toward the durable tier rather than
                        // dropping it mid-shutdown.
                        self.buffer.enqueue_low_priority(batch).await.ok();
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            self.send_one(batch).await;
        }
    }

    async fn send_one(&self, mut batch: SinkBatch<D::Record>) {
        let record_count = batch.records.len() as i64;
        self.metrics
            .increment(counters::RECORDS_ATTEMPTED, record_count);
        self.metrics
            .increment(counters::BYTES_ATTEMPTED, batch.bytes as i64);

        let mut slot = self.client_slot.lock().await;
        if slot.is_none() {
            match self.controller.lock().await.select().await {
                Ok(client) => *slot = Some(client),
                Err(error) => {
                    warn!(message = "No endpoint available; requeueing batch.", sink_id = %self.id, %error);
                    self.throttle.lock().await.set_error();
                    drop(slot);
                    self.requeue(batch).await;
                    return;
                }
            }
        }
        let client = slot.as_mut().expect("client populated above");

        let started = Instant::now();
        let outcome = match timeout(
            self.settings.client_timeout,
            self.driver.send_batch(client, &batch.records),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(SendFailure::recoverable("client call timed out")),
        };

        match outcome {
            Ok(()) => {
                drop(slot);
                self.throttle.lock().await.set_success();
                self.metrics
                    .increment(counters::RECORDS_SUCCESS, record_count);
                self.metrics
                    .set(counters::LATENCY_MS, started.elapsed().as_millis() as i64);
                if let Some(earliest) = batch.earliest_event {
                    let client_latency = (Utc::now() - earliest).num_milliseconds().max(0);
                    self.metrics.set(counters::CLIENT_LATENCY_MS, client_latency);
                }
                self.acknowledge(&batch);
            }
            Err(failure) if failure.disposition == ErrorDisposition::Recoverable => {
                warn!(
                    message = "Recoverable error sending batch.",
                    sink_id = %self.id,
                    error = %failure.message,
                );
                self.metrics
                    .increment(counters::RECOVERABLE_SERVICE_ERRORS, 1);
                self.throttle.lock().await.set_error();

                // Move off the failing region before the next attempt.
                *slot = match self.controller.lock().await.fail_over_to_secondary().await {
                    Ok(client) => Some(client),
                    Err(error) => {
                        warn!(message = "Failover found no available endpoint.", sink_id = %self.id, %error);
                        None
                    }
                };
                drop(slot);

                batch.attempts += 1;
                if batch.attempts >= self.settings.max_attempts {
                    warn!(
                        message = "Batch exhausted its retry budget; dropping.",
                        sink_id = %self.id,
                        attempts = batch.attempts,
                    );
                    self.metrics
                        .increment(counters::RECORDS_FAILED_RECOVERABLE, record_count);
                } else {
                    self.requeue(batch).await;
                }
            }
            Err(failure) => {
                error!(
                    message = "Non-recoverable error sending batch; dropping.",
                    sink_id = %self.id,
                    error = %failure.message,
                );
                self.metrics
                    .increment(counters::NONRECOVERABLE_SERVICE_ERRORS, 1);
                self.metrics
                    .increment(counters::RECORDS_FAILED_NONRECOVERABLE, record_count);
            }
        }
    }

    async fn requeue(&self, batch: SinkBatch<D::Record>) {
        let record_count = batch.records.len() as i64;
        match self.buffer.enqueue_low_priority(batch).await {
            Ok(()) => {}
            Err(error) => {
                warn!(message = "Could not requeue failed batch.", sink_id = %self.id, %error);
                self.metrics.increment(counters::BATCHES_DROPPED, 1);
                self.metrics
                    .increment(counters::RECORDS_FAILED_RECOVERABLE, record_count);
            }
        }
    }

    /// Advance bookmarks for every acknowledged record and persist once
    /// per source.
    fn acknowledge(&self, batch: &SinkBatch<D::Record>) {
        let mut per_source: HashMap<String, &BookmarkHandle> = HashMap::new();
        for (handle, position) in &batch.acks {
            handle.advance(*position);
            per_source.insert(handle.source_id().to_owned(), handle);
        }
        for (source_id, handle) in per_source {
            if let Err(error) = handle.persist() {
                warn!(message = "Failed to persist bookmarks.", source_id = %source_id, %error);
            }
        }
    }
}

#[async_trait]
impl<D: SinkDriver> crate::pipes::EventSink for BatchSink<D> {
    async fn accept(&self, envelope: Envelope) {
        let record = match self.driver.convert(&envelope) {
            Ok(record) => record,
            Err(error) => {
                debug!(message = "Dropping unconvertible event.", sink_id = %self.id, %error);
                self.metrics
                    .increment(counters::RECORDS_FAILED_NONRECOVERABLE, 1);
                return;
            }
        };

        let size = self.driver.size_of(&record);
        if size > self.driver.max_record_bytes() {
            warn!(
                message = "Record exceeds the destination's maximum size; dropping.",
                sink_id = %self.id,
                size,
            );
            self.metrics
                .increment(counters::RECORDS_FAILED_NONRECOVERABLE, 1);
            return;
        }

        let ack = match (envelope.position, envelope.bookmark.clone()) {
            (Some(position), Some(handle)) => Some((
                handle,
                BookmarkPosition {
                    offset: position.offset,
                    line: position.line,
                },
            )),
            _ => None,
        };

        self.batcher
            .add(
                BatchEntry {
                    record,
                    size,
                    ack,
                    event_timestamp: envelope.timestamp,
                },
                size,
                Some(envelope.timestamp),
            )
            .await;
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{Arc, Mutex as StdMutex},
        time::Duration,
    };

    use async_trait::async_trait;
    use chrono::Utc;
    use durable_queue::{BufferMode, Overflow, TwoTierBuffer};
    use tokio_util::sync::CancellationToken;

    use super::{
        BatchSink, ConvertError, SendFailure, SinkDriver, SinkRuntimeSettings,
    };
    use crate::event::{Envelope, EventPayload, RecordPosition};
    use crate::failover::{ClientFactory, Endpoint, FailoverController, FailoverError, SelectionPolicy};
    use crate::metrics::{counters, ComponentMetrics, MetricKey, MetricsHub};
    use crate::pipes::EventSink;
    use crate::sinks::util::batcher::BatcherSettings;
    use crate::throttle::{Throttle, ThrottleSettings, TokenBucket};

    #[derive(Debug, Clone)]
    struct FakeClient {
        endpoint: String,
    }

    struct FakeFactory;

    #[async_trait]
    impl ClientFactory<FakeClient> for FakeFactory {
        async fn build(&self, endpoint: &Endpoint) -> Result<FakeClient, FailoverError> {
            Ok(FakeClient {
                endpoint: endpoint.id.clone(),
            })
        }

        async fn probe(&self, _endpoint: &Endpoint) -> Option<Duration> {
            Some(Duration::from_millis(1))
        }
    }

    /// Driver recording every send and failing per an endpoint rule.
    struct FakeDriver {
        sent: Arc<StdMutex<Vec<(String, Vec<String>)>>>,
        fail_on: Option<(&'static str, super::ErrorDisposition)>,
    }

    #[async_trait]
    impl SinkDriver for FakeDriver {
        type Record = String;
        type Client = FakeClient;

        fn convert(&self, envelope: &Envelope) -> Result<String, ConvertError> {
            match &envelope.payload {
                EventPayload::Text(text) if text == "unconvertible" => Err(ConvertError {
                    message: "bad payload".to_owned(),
                }),
                payload => Ok(payload.text_form().into_owned()),
            }
        }

        fn size_of(&self, record: &String) -> usize {
            record.len() + 26
        }

        fn max_record_bytes(&self) -> usize {
            1024
        }

        async fn send_batch(
            &self,
            client: &mut FakeClient,
            records: &[String],
        ) -> Result<(), SendFailure> {
            if let Some((endpoint, disposition)) = &self.fail_on {
                if client.endpoint == *endpoint {
                    return Err(SendFailure {
                        disposition: *disposition,
                        message: "service unavailable".to_owned(),
                    });
                }
            }
            self.sent
                .lock()
                .unwrap()
                .push((client.endpoint.clone(), records.to_vec()));
            Ok(())
        }
    }

    struct Fixture {
        sink: Arc<BatchSink<FakeDriver>>,
        sent: Arc<StdMutex<Vec<(String, Vec<String>)>>>,
        hub: Arc<MetricsHub>,
        shutdown: CancellationToken,
        handles: Vec<tokio::task::JoinHandle<()>>,
    }

    fn fixture(
        fail_on: Option<(&'static str, super::ErrorDisposition)>,
        settings: SinkRuntimeSettings,
    ) -> Fixture {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let driver = Arc::new(FakeDriver {
            sent: Arc::clone(&sent),
            fail_on,
        });
        let buffer = Arc::new(TwoTierBuffer::new(
            BufferMode::HighCapacity,
            4,
            Overflow::Memory { capacity: 16 },
        ));
        let controller = FailoverController::new(
            vec![
                Endpoint::new("primary", "https://a"),
                Endpoint::new("second", "https://b"),
            ],
            SelectionPolicy::Priority,
            Duration::from_secs(60),
            Box::new(FakeFactory),
        );
        let throttle = Throttle::new(
            vec![TokenBucket::new(1_000_000.0, 1_000_000.0)],
            ThrottleSettings::default(),
        );
        let hub = MetricsHub::new();
        let metrics = ComponentMetrics::new(Arc::clone(&hub), "sinks", "test-sink");
        let sink = BatchSink::new(
            "test-sink",
            driver,
            settings,
            buffer,
            controller,
            throttle,
            metrics,
        );
        let shutdown = CancellationToken::new();
        let handles = sink.spawn(shutdown.clone());
        Fixture {
            sink,
            sent,
            hub,
            shutdown,
            handles,
        }
    }

    fn envelope(text: &str) -> Envelope {
        Envelope::new(
            Arc::from("src1"),
            Utc::now(),
            EventPayload::Text(text.to_owned()),
        )
    }

    async fn settle(fixture: &mut Fixture) {
        // Let in-flight uploads and requeues finish before closing up.
        tokio::time::sleep(Duration::from_millis(100)).await;
        fixture.sink.stop().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        fixture.shutdown.cancel();
        for handle in fixture.handles.drain(..) {
            handle.await.unwrap();
        }
    }

    fn metric(fixture: &Fixture, counter: &str) -> i64 {
        fixture
            .hub
            .get(&MetricKey::new("sinks", "test-sink", counter))
            .unwrap_or(0)
    }

    fn small_batches() -> SinkRuntimeSettings {
        SinkRuntimeSettings {
            batcher: BatcherSettings {
                max_count: 1,
                ..Default::default()
            },
            max_attempts: 3,
            client_timeout: Duration::from_secs(5),
            max_failback_retry_interval: Duration::from_secs(300),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delivers_batches_and_counts() {
        let mut fixture = fixture(None, small_batches());
        fixture.sink.accept(envelope("one")).await;
        fixture.sink.accept(envelope("two")).await;

        settle(&mut fixture).await;

        let sent = fixture.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(endpoint, _)| endpoint == "primary"));
        assert_eq!(metric(&fixture, counters::RECORDS_SUCCESS), 2);
        assert_eq!(metric(&fixture, counters::RECORDS_ATTEMPTED), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn recoverable_failure_fails_over_and_requeues() {
        let mut fixture = fixture(
            Some(("primary", super::ErrorDisposition::Recoverable)),
            small_batches(),
        );
        fixture.sink.accept(envelope("e1")).await;
        fixture.sink.accept(envelope("e2")).await;

        settle(&mut fixture).await;

        let sent = fixture.sent.lock().unwrap().clone();
        // Both batches eventually arrive via the secondary.
        assert!(sent.iter().all(|(endpoint, _)| endpoint == "second"));
        let delivered: Vec<String> = sent.iter().flat_map(|(_, r)| r.clone()).collect();
        assert!(delivered.contains(&"e1".to_owned()));
        assert!(delivered.contains(&"e2".to_owned()));
        assert!(metric(&fixture, counters::RECOVERABLE_SERVICE_ERRORS) >= 1);
        assert_eq!(metric(&fixture, counters::RECORDS_SUCCESS), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn non_recoverable_failure_drops_batch() {
        let mut fixture = fixture(
            Some(("primary", super::ErrorDisposition::NonRecoverable)),
            small_batches(),
        );
        fixture.sink.accept(envelope("doomed")).await;

        settle(&mut fixture).await;

        assert!(fixture.sent.lock().unwrap().is_empty());
        assert_eq!(metric(&fixture, counters::RECORDS_FAILED_NONRECOVERABLE), 1);
        assert_eq!(metric(&fixture, counters::NONRECOVERABLE_SERVICE_ERRORS), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unconvertible_event_is_counted_and_skipped() {
        let mut fixture = fixture(None, small_batches());
        fixture.sink.accept(envelope("unconvertible")).await;
        fixture.sink.accept(envelope("fine")).await;

        settle(&mut fixture).await;

        let sent = fixture.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, vec!["fine".to_owned()]);
        assert_eq!(metric(&fixture, counters::RECORDS_FAILED_NONRECOVERABLE), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn successful_upload_acknowledges_bookmarks() {
        use file_tail::bookmarks::BookmarkStore;
        use file_tail::FileId;

        let data_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BookmarkStore::new(data_dir.path(), "src1").unwrap());
        let handle = store.register(FileId::DevInode(1, 2));

        let mut fixture = fixture(None, small_batches());
        let envelope = envelope("bookmarked").with_position(
            RecordPosition {
                file_id: FileId::DevInode(1, 2),
                offset: 11,
                line: 1,
            },
            handle,
        );
        fixture.sink.accept(envelope).await;

        settle(&mut fixture).await;

        let reloaded = BookmarkStore::new(data_dir.path(), "src1").unwrap();
        reloaded.load().unwrap();
        let position = reloaded.get(FileId::DevInode(1, 2)).unwrap();
        assert_eq!(position.offset, 11);
        assert_eq!(position.line, 1);
    }
}
