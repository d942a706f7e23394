//! Cloud log-ingestion sink.
//!
//! The transport is opaque: anything implementing [`LogDestination`] can
//! back this sink. The driver owns the destination's protocol quirks:
//! per-record overhead, the 24-hour batch span, and the sequence-token
//! dance where the service tells you the token it expected.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::event::Envelope;
use crate::failover::{ClientFactory, Endpoint, FailoverError};
use crate::sinks::util::driver::{ConvertError, SendFailure, SinkDriver};

/// Bytes the destination charges per record on top of the payload.
pub const PER_RECORD_OVERHEAD: usize = 26;
/// Largest single record the destination accepts.
pub const MAX_RECORD_BYTES: usize = 256 * 1024;
/// Largest batch payload the destination accepts.
pub const MAX_BATCH_BYTES: usize = 1024 * 1024;
/// Widest allowed earliest-to-latest timestamp span within one batch.
pub const MAX_BATCH_SPAN_HOURS: i64 = 24;
/// The sentinel the service returns in place of a token when the stream
/// has never been written to.
pub const NULL_TOKEN_SENTINEL: &str = "null";

/// One log record as the destination sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudLogRecord {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Error classes a destination can report. The driver maps these onto the
/// runtime's recoverable / non-recoverable split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationErrorKind {
    Throttled,
    ServiceUnavailable,
    ExpiredCredentials,
    InvalidSequenceToken,
    Timeout,
    Validation,
    AccessDenied,
}

impl DestinationErrorKind {
    fn is_recoverable(self) -> bool {
        !matches!(
            self,
            DestinationErrorKind::Validation | DestinationErrorKind::AccessDenied
        )
    }
}

/// Outcome of one `send` call against the destination.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    Accepted {
        next_token: Option<String>,
    },
    Rejected {
        kind: DestinationErrorKind,
        message: String,
        /// For sequence-token errors, the token the service expected,
        /// possibly the [`NULL_TOKEN_SENTINEL`].
        expected_token: Option<String>,
    },
}

/// The opaque remote service behind this sink.
#[async_trait]
pub trait LogDestination: Send + Sync {
    async fn send(
        &self,
        stream: &str,
        records: &[CloudLogRecord],
        sequence_token: Option<&str>,
    ) -> SendOutcome;

    /// Fetch the stream's current sequence token, e.g. after the service
    /// answered with the null sentinel.
    async fn fetch_token(&self, stream: &str) -> Option<String>;

    /// Health probe for the round-trip-time selection policy.
    async fn probe(&self) -> Option<Duration>;
}

/// A destination bound to a stream, plus the sequence token cached across
/// calls. Rebuilt whenever the failover controller switches endpoints.
pub struct CloudLogsClient {
    destination: Arc<dyn LogDestination>,
    stream: String,
    token: Option<String>,
}

/// Builds [`CloudLogsClient`]s out of per-endpoint destinations.
pub struct CloudLogsClientFactory {
    destinations: HashMap<String, Arc<dyn LogDestination>>,
    stream: String,
}

impl CloudLogsClientFactory {
    pub fn new(stream: impl Into<String>) -> Self {
        CloudLogsClientFactory {
            destinations: HashMap::new(),
            stream: stream.into(),
        }
    }

    pub fn with_destination(
        mut self,
        endpoint_id: impl Into<String>,
        destination: Arc<dyn LogDestination>,
    ) -> Self {
        self.destinations.insert(endpoint_id.into(), destination);
        self
    }
}

#[async_trait]
impl ClientFactory<CloudLogsClient> for CloudLogsClientFactory {
    async fn build(&self, endpoint: &Endpoint) -> Result<CloudLogsClient, FailoverError> {
        let destination = self.destinations.get(&endpoint.id).ok_or_else(|| {
            FailoverError::ClientBuild {
                endpoint: endpoint.id.clone(),
                message: "no destination registered for endpoint".to_owned(),
            }
        })?;
        // A fresh client starts without a token; the first send negotiates
        // one through the expected-token reply.
        Ok(CloudLogsClient {
            destination: Arc::clone(destination),
            stream: self.stream.clone(),
            token: None,
        })
    }

    async fn probe(&self, endpoint: &Endpoint) -> Option<Duration> {
        match self.destinations.get(&endpoint.id) {
            Some(destination) => destination.probe().await,
            None => None,
        }
    }
}

/// [`SinkDriver`] for cloud log destinations.
pub struct CloudLogsDriver;

#[async_trait]
impl SinkDriver for CloudLogsDriver {
    type Record = CloudLogRecord;
    type Client = CloudLogsClient;

    fn convert(&self, envelope: &Envelope) -> Result<CloudLogRecord, ConvertError> {
        let message = envelope.payload.text_form().into_owned();
        if message.is_empty() {
            return Err(ConvertError {
                message: "empty record".to_owned(),
            });
        }
        Ok(CloudLogRecord {
            timestamp: envelope.timestamp,
            message,
        })
    }

    fn size_of(&self, record: &CloudLogRecord) -> usize {
        record.message.len() + PER_RECORD_OVERHEAD
    }

    fn max_record_bytes(&self) -> usize {
        MAX_RECORD_BYTES
    }

    async fn send_batch(
        &self,
        client: &mut CloudLogsClient,
        records: &[CloudLogRecord],
    ) -> Result<(), SendFailure> {
        // Up to two in-place retries with the token the service says it
        // expected; a null sentinel means the token must be re-fetched,
        // which we do at most once.
        let mut token_retries = 0;
        let mut refetched = false;
        loop {
            let outcome = client
                .destination
                .send(&client.stream, records, client.token.as_deref())
                .await;
            match outcome {
                SendOutcome::Accepted { next_token } => {
                    client.token = next_token;
                    return Ok(());
                }
                SendOutcome::Rejected {
                    kind: DestinationErrorKind::InvalidSequenceToken,
                    message,
                    expected_token,
                } if token_retries < 2 => {
                    match expected_token.as_deref() {
                        Some(NULL_TOKEN_SENTINEL) if !refetched => {
                            debug!(message = "Service returned the null token sentinel; re-fetching.");
                            client.token = client.destination.fetch_token(&client.stream).await;
                            refetched = true;
                        }
                        Some(expected) => {
                            debug!(message = "Retrying with the sequence token the service expected.");
                            client.token = Some(expected.to_owned());
                        }
                        _ => {
                            return Err(SendFailure::recoverable(message));
                        }
                    }
                    token_retries += 1;
                }
                SendOutcome::Rejected { kind, message, .. } => {
                    return Err(if kind.is_recoverable() {
                        SendFailure::recoverable(message)
                    } else {
                        SendFailure::non_recoverable(message)
                    });
                }
            }
        }
    }
}

/// Supplies the destination behind each configured endpoint. The embedding
/// application installs a provider speaking the real service protocol; the
/// built-in default keeps batches in memory for validation runs and tests.
pub trait DestinationProvider: Send + Sync {
    fn destination(&self, sink_id: &str, endpoint_id: &str, url: &str) -> Arc<dyn LogDestination>;
}

/// Default provider: one shared [`MemoryDestination`] per `(sink, endpoint)`.
#[derive(Default)]
pub struct MemoryDestinationProvider {
    destinations: dashmap::DashMap<(String, String), Arc<MemoryDestination>>,
}

impl MemoryDestinationProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The destination a sink/endpoint pair resolved to, for inspection.
    pub fn get(&self, sink_id: &str, endpoint_id: &str) -> Option<Arc<MemoryDestination>> {
        self.destinations
            .get(&(sink_id.to_owned(), endpoint_id.to_owned()))
            .map(|entry| Arc::clone(entry.value()))
    }
}

impl DestinationProvider for MemoryDestinationProvider {
    fn destination(&self, sink_id: &str, endpoint_id: &str, _url: &str) -> Arc<dyn LogDestination> {
        let entry = self
            .destinations
            .entry((sink_id.to_owned(), endpoint_id.to_owned()))
            .or_insert_with(MemoryDestination::new);
        Arc::clone(entry.value()) as Arc<dyn LogDestination>
    }
}

/// In-memory destination. Backs tests and `validate` runs; a production
/// transport implements [`LogDestination`] against the real service API.
pub struct MemoryDestination {
    state: std::sync::Mutex<MemoryState>,
}

struct MemoryState {
    batches: Vec<Vec<CloudLogRecord>>,
    token_counter: u64,
    expected_token: Option<String>,
    /// Scripted rejections consumed one per call.
    rejections: Vec<(DestinationErrorKind, Option<String>)>,
}

impl Default for MemoryDestination {
    fn default() -> Self {
        MemoryDestination {
            state: std::sync::Mutex::new(MemoryState {
                batches: Vec::new(),
                token_counter: 0,
                expected_token: None,
                rejections: Vec::new(),
            }),
        }
    }
}

impl MemoryDestination {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a rejection for the next `send` call.
    pub fn push_rejection(&self, kind: DestinationErrorKind, expected_token: Option<String>) {
        self.state
            .lock()
            .expect("destination state poisoned")
            .rejections
            .push((kind, expected_token));
    }

    pub fn batches(&self) -> Vec<Vec<CloudLogRecord>> {
        self.state
            .lock()
            .expect("destination state poisoned")
            .batches
            .clone()
    }

    pub fn record_texts(&self) -> Vec<String> {
        self.batches()
            .into_iter()
            .flatten()
            .map(|record| record.message)
            .collect()
    }
}

#[async_trait]
impl LogDestination for MemoryDestination {
    async fn send(
        &self,
        _stream: &str,
        records: &[CloudLogRecord],
        sequence_token: Option<&str>,
    ) -> SendOutcome {
        let mut state = self.state.lock().expect("destination state poisoned");
        if !state.rejections.is_empty() {
            let (kind, expected_token) = state.rejections.remove(0);
            return SendOutcome::Rejected {
                kind,
                message: format!("scripted rejection: {kind:?}"),
                expected_token,
            };
        }
        if let Some(expected) = state.expected_token.clone() {
            if sequence_token != Some(expected.as_str()) {
                warn!(message = "Rejecting send with stale sequence token.");
                return SendOutcome::Rejected {
                    kind: DestinationErrorKind::InvalidSequenceToken,
                    message: "invalid sequence token".to_owned(),
                    expected_token: Some(expected),
                };
            }
        }
        state.batches.push(records.to_vec());
        state.token_counter += 1;
        let next = format!("token-{}", state.token_counter);
        state.expected_token = Some(next.clone());
        SendOutcome::Accepted {
            next_token: Some(next),
        }
    }

    async fn fetch_token(&self, _stream: &str) -> Option<String> {
        self.state
            .lock()
            .expect("destination state poisoned")
            .expected_token
            .clone()
    }

    async fn probe(&self) -> Option<Duration> {
        Some(Duration::from_micros(50))
    }
}
