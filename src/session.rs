//! A session is the runtime embodiment of one configuration file: its
//! sources, pipes, and sinks, wired and owned together.
//!
//! Construction is forgiving: a component that fails its static checks is
//! recorded and skipped, and the rest of the graph still runs. The session
//! is `validated` only when every component constructed cleanly; status
//! output flags the difference.
//!
//! Lifecycle order matters. Start brings up sinks first (ready to absorb),
//! then sources. Stop is the mirror: sources first (quiesce the graph),
//! then sinks (flush buffers), all under one graceful deadline.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use durable_queue::{
    BufferMode, CodecError, ItemCodec, Overflow, PersistentQueue, TwoTierBuffer,
};
use file_tail::parser::RegexOptions;
use file_tail::HarvesterConfig;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{
    AgentConfig, OverflowKindConfig, PipeConfig, QueueModeConfig, SelectionPolicyConfig,
    SinkConfig, SourceConfig,
};
use crate::failover::{Endpoint, FailoverController, SelectionPolicy};
use crate::metrics::{ComponentMetrics, MetricsHub};
use crate::parameters::ParameterStore;
use crate::pipes::{EventSink, FanOutSink, RegexFilterPipe};
use crate::shutdown::join_with_deadline;
use crate::sinks::cloud_logs::{
    CloudLogRecord, CloudLogsClientFactory, CloudLogsDriver, DestinationProvider,
};
use crate::sinks::console::ConsoleSink;
use crate::sinks::metrics_snapshot::MetricsSnapshotSink;
use crate::sinks::util::batcher::BatcherSettings;
use crate::sinks::util::driver::{BatchSink, SinkBatch, SinkRuntimeSettings};
use crate::sources::directory::DirectorySource;
use crate::throttle::{Throttle, ThrottleSettings, TokenBucket};

/// Process-level collaborators handed to every session.
pub struct SessionContext {
    pub data_dir: PathBuf,
    pub parameters: Arc<ParameterStore>,
    pub destinations: Arc<dyn DestinationProvider>,
}

/// On-disk codec for persisted batches. Acknowledgement handles cannot
/// survive a restart, so a recovered batch uploads without advancing any
/// bookmark; the bookmark already covers it from the original read.
struct CloudBatchCodec;

#[derive(serde::Serialize, serde::Deserialize)]
struct PersistedBatch {
    records: Vec<CloudLogRecord>,
    bytes: usize,
}

impl ItemCodec<SinkBatch<CloudLogRecord>> for CloudBatchCodec {
    fn encode(&self, batch: &SinkBatch<CloudLogRecord>) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(&PersistedBatch {
            records: batch.records.clone(),
            bytes: batch.bytes,
        })?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<SinkBatch<CloudLogRecord>, CodecError> {
        let persisted: PersistedBatch = serde_json::from_slice(bytes)?;
        Ok(SinkBatch {
            records: persisted.records,
            acks: Vec::new(),
            bytes: persisted.bytes,
            earliest_event: None,
            attempts: 0,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub name: String,
    pub path: PathBuf,
    pub validated: bool,
    pub errors: Vec<String>,
    pub sources: usize,
    pub sinks: usize,
}

pub struct Session {
    name: String,
    path: PathBuf,
    validated: bool,
    errors: Vec<String>,
    metrics: Arc<MetricsHub>,
    sources: Vec<(DirectorySource, Option<Arc<dyn EventSink>>)>,
    cloud_sinks: Vec<Arc<BatchSink<CloudLogsDriver>>>,
    metrics_sinks: Vec<MetricsSnapshotSink>,
    sink_count: usize,
    source_token: CancellationToken,
    sink_token: CancellationToken,
    source_handles: Vec<JoinHandle<()>>,
    sink_handles: Vec<JoinHandle<()>>,
}

impl Session {
    /// Construct the full graph for one parsed configuration. Component
    /// failures are collected rather than fatal; see the module docs.
    pub fn load(path: &Path, config: &AgentConfig, ctx: &SessionContext) -> Session {
        let name = config.display_name(path);
        let metrics = MetricsHub::new();
        let mut errors = Vec::new();

        // Sinks first: pipes and sources hang off them.
        let mut event_sinks: HashMap<String, Arc<dyn EventSink>> = HashMap::new();
        let mut cloud_sinks = Vec::new();
        let mut metrics_sinks = Vec::new();
        let mut metrics_sink_ids: HashSet<String> = HashSet::new();
        let mut sink_count = 0;

        for sink_config in &config.sinks {
            match sink_config {
                SinkConfig::CloudLogsSink { .. } => {
                    match build_cloud_sink(&name, sink_config, ctx, &metrics) {
                        Ok(sink) => {
                            event_sinks.insert(
                                sink_config.id().to_owned(),
                                Arc::clone(&sink) as Arc<dyn EventSink>,
                            );
                            cloud_sinks.push(sink);
                            sink_count += 1;
                        }
                        Err(message) => {
                            warn!(message = "Skipping sink that failed to construct.", sink_id = %sink_config.id(), error = %message);
                            errors.push(message);
                        }
                    }
                }
                SinkConfig::ConsoleSink { id } => {
                    let sink = Arc::new(ConsoleSink::new(ComponentMetrics::new(
                        Arc::clone(&metrics),
                        "sinks",
                        id,
                    )));
                    event_sinks.insert(id.clone(), sink as Arc<dyn EventSink>);
                    sink_count += 1;
                }
                SinkConfig::MetricsSink {
                    id,
                    interval_seconds,
                } => {
                    metrics_sinks.push(MetricsSnapshotSink::new(
                        id.clone(),
                        Arc::clone(&metrics),
                        Duration::from_secs((*interval_seconds).max(1)),
                    ));
                    metrics_sink_ids.insert(id.clone());
                    sink_count += 1;
                }
            }
        }

        // Pipes define the connectivity; a source may feed several.
        let mut per_source: HashMap<String, Vec<Arc<dyn EventSink>>> = HashMap::new();
        for pipe in &config.pipes {
            if metrics_sink_ids.contains(pipe.sink_ref()) {
                errors.push(format!(
                    "pipe {:?}: a MetricsSink cannot be a pipe target",
                    pipe.id()
                ));
                continue;
            }
            let Some(sink) = event_sinks.get(pipe.sink_ref()) else {
                errors.push(format!(
                    "pipe {:?}: sink {:?} is not available",
                    pipe.id(),
                    pipe.sink_ref()
                ));
                continue;
            };
            let stage: Arc<dyn EventSink> = match pipe {
                PipeConfig::Pipe { .. } => Arc::clone(sink),
                PipeConfig::RegexFilterPipe {
                    filter_pattern,
                    negate,
                    multiline,
                    case_insensitive,
                    right_to_left,
                    ..
                } => {
                    let options = RegexOptions {
                        multiline: *multiline,
                        case_insensitive: *case_insensitive,
                        right_to_left: *right_to_left,
                    };
                    match RegexFilterPipe::new(filter_pattern, options, *negate, Arc::clone(sink))
                    {
                        Ok(built) => Arc::new(built),
                        Err(error) => {
                            errors.push(format!("pipe {:?}: {error}", pipe.id()));
                            continue;
                        }
                    }
                }
            };
            per_source
                .entry(pipe.source_ref().to_owned())
                .or_default()
                .push(stage);
        }

        // Sources last.
        let mut sources = Vec::new();
        for source_config in &config.sources {
            match build_source(source_config, ctx, &metrics) {
                Ok(source) => {
                    let downstream = match per_source.remove(source_config.id()) {
                        Some(stages) if stages.len() == 1 => {
                            Some(stages.into_iter().next().expect("one stage"))
                        }
                        Some(stages) => Some(Arc::new(FanOutSink::new(stages)) as Arc<dyn EventSink>),
                        None => {
                            warn!(
                                message = "Source has no pipe connecting it to a sink; it will not be started.",
                                source_id = %source_config.id(),
                            );
                            None
                        }
                    };
                    sources.push((source, downstream));
                }
                Err(message) => {
                    warn!(message = "Skipping source that failed to construct.", source_id = %source_config.id(), error = %message);
                    errors.push(message);
                }
            }
        }

        let validated = errors.is_empty();
        Session {
            name,
            path: path.to_path_buf(),
            validated,
            errors,
            metrics,
            sources,
            cloud_sinks,
            metrics_sinks,
            sink_count,
            source_token: CancellationToken::new(),
            sink_token: CancellationToken::new(),
            source_handles: Vec::new(),
            sink_handles: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn validated(&self) -> bool {
        self.validated
    }

    pub fn metrics(&self) -> Arc<MetricsHub> {
        Arc::clone(&self.metrics)
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            name: self.name.clone(),
            path: self.path.clone(),
            validated: self.validated,
            errors: self.errors.clone(),
            sources: self.sources.len(),
            sinks: self.sink_count,
        }
    }

    /// Start sinks, then sources.
    pub fn start(&mut self) {
        for sink in &self.cloud_sinks {
            self.sink_handles.extend(sink.spawn(self.sink_token.clone()));
        }
        for metrics_sink in self.metrics_sinks.drain(..) {
            self.sink_handles
                .push(metrics_sink.spawn(self.sink_token.clone()));
        }
        for (source, downstream) in &self.sources {
            if let Some(downstream) = downstream {
                self.source_handles
                    .extend(source.spawn(Arc::clone(downstream), self.source_token.clone()));
            }
        }
        info!(
            message = "Session started.",
            session = %self.name,
            validated = self.validated,
            sources = self.sources.len(),
            sinks = self.sink_count,
        );
    }

    /// Stop sources, drain and stop sinks, all within `graceful`.
    pub async fn stop(&mut self, graceful: Duration) {
        let started = tokio::time::Instant::now();

        self.source_token.cancel();
        join_with_deadline(
            std::mem::take(&mut self.source_handles),
            graceful.mul_f64(0.4),
            "sources",
        )
        .await;

        for sink in &self.cloud_sinks {
            sink.stop().await;
        }

        // Give the uploaders the rest of the budget to drain their
        // buffers; anything durable survives to the next start anyway.
        let deadline = started + graceful;
        loop {
            let mut all_idle = true;
            for sink in &self.cloud_sinks {
                if !sink.is_idle().await {
                    all_idle = false;
                    break;
                }
            }
            if all_idle || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        self.sink_token.cancel();
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .unwrap_or(Duration::from_millis(250))
            .max(Duration::from_millis(250));
        join_with_deadline(std::mem::take(&mut self.sink_handles), remaining, "sinks").await;

        info!(message = "Session stopped.", session = %self.name);
    }
}

fn build_source(
    config: &SourceConfig,
    ctx: &SessionContext,
    hub: &Arc<MetricsHub>,
) -> Result<DirectorySource, String> {
    let SourceConfig::DirectorySource {
        id,
        directory,
        include_subdirectories,
        directory_exclude_filter,
        ..
    } = config;

    let mut harvester = HarvesterConfig::new(directory.clone());
    harvester.include = config.include_globs();
    harvester.exclude = directory_exclude_filter.clone();
    harvester.recursive = *include_subdirectories;
    harvester.initial_position = config.initial_position().map_err(|e| e.to_string())?;
    harvester.parser = config.parser_spec().map_err(|e| e.to_string())?;

    DirectorySource::new(
        id,
        harvester,
        &ctx.data_dir,
        ComponentMetrics::new(Arc::clone(hub), "sources", id),
    )
    .map_err(|e| e.to_string())
}

fn build_cloud_sink(
    session_name: &str,
    config: &SinkConfig,
    ctx: &SessionContext,
    hub: &Arc<MetricsHub>,
) -> Result<Arc<BatchSink<CloudLogsDriver>>, String> {
    let SinkConfig::CloudLogsSink {
        id,
        log_stream,
        endpoints,
        selection_policy,
        region_cooldown_seconds,
        max_failback_retry_interval_seconds,
        batch_max_count,
        batch_max_bytes,
        batch_interval_ms,
        records_per_second,
        bytes_per_second,
        max_attempts,
        client_timeout_seconds,
        queue_mode,
        primary_queue_size,
        overflow_queue,
        overflow_capacity,
    } = config
    else {
        return Err(format!("sink {:?} is not a CloudLogsSink", config.id()));
    };

    let endpoint_configs = if endpoints.is_empty() {
        vec![crate::config::EndpointConfig {
            id: "primary".to_owned(),
            url: String::new(),
            weight: 1.0,
        }]
    } else {
        endpoints.clone()
    };

    let mut factory = CloudLogsClientFactory::new(log_stream.clone());
    let mut pool = Vec::with_capacity(endpoint_configs.len());
    for endpoint in &endpoint_configs {
        factory = factory.with_destination(
            endpoint.id.clone(),
            ctx.destinations.destination(id, &endpoint.id, &endpoint.url),
        );
        pool.push(Endpoint::new(endpoint.id.clone(), endpoint.url.clone()).with_weight(endpoint.weight));
    }

    let policy = match selection_policy {
        SelectionPolicyConfig::Priority => SelectionPolicy::Priority,
        SelectionPolicyConfig::LoadBalance => SelectionPolicy::LoadBalance,
        SelectionPolicyConfig::WeightedLoadBalance => SelectionPolicy::WeightedLoadBalance,
        SelectionPolicyConfig::RoundTripTime => SelectionPolicy::RoundTripTime,
    };
    let controller = FailoverController::new(
        pool,
        policy,
        Duration::from_secs(*region_cooldown_seconds),
        Box::new(factory),
    );

    let throttle = Throttle::new(
        vec![
            TokenBucket::new(*records_per_second, *records_per_second),
            TokenBucket::new(*bytes_per_second, *bytes_per_second),
        ],
        ThrottleSettings::default(),
    );

    let overflow = match overflow_queue {
        OverflowKindConfig::Memory => Overflow::Memory {
            capacity: *overflow_capacity as usize,
        },
        OverflowKindConfig::File => {
            let directory = ctx
                .data_dir
                .join("queues")
                .join(session_name)
                .join(id);
            let queue = PersistentQueue::open(directory, *overflow_capacity, Box::new(CloudBatchCodec))
                .map_err(|e| format!("sink {id:?}: {e}"))?;
            Overflow::Durable(queue)
        }
    };
    let mode = match queue_mode {
        QueueModeConfig::HiLow => BufferMode::HiLow,
        QueueModeConfig::HighCapacity => BufferMode::HighCapacity,
    };
    let buffer = Arc::new(TwoTierBuffer::new(mode, *primary_queue_size, overflow));

    let settings = SinkRuntimeSettings {
        batcher: BatcherSettings {
            max_count: *batch_max_count,
            max_bytes: *batch_max_bytes,
            max_age: Duration::from_millis(*batch_interval_ms),
            max_timestamp_span: Some(chrono::Duration::hours(
                crate::sinks::cloud_logs::MAX_BATCH_SPAN_HOURS,
            )),
        },
        max_attempts: *max_attempts,
        client_timeout: Duration::from_secs(*client_timeout_seconds),
        max_failback_retry_interval: Duration::from_secs(*max_failback_retry_interval_seconds),
    };

    Ok(BatchSink::new(
        id.clone(),
        Arc::new(CloudLogsDriver),
        settings,
        buffer,
        controller,
        throttle,
        ComponentMetrics::new(Arc::clone(hub), "sinks", id),
    ))
}
