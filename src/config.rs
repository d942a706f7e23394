//! JSON configuration model.
//!
//! A configuration file carries top-level `Sources`, `Sinks`, `Pipes`,
//! `Credentials`, and `Plugins` arrays. Every entry has an `Id` and a
//! `Type`; pipes additionally carry `SourceRef`/`SinkRef` pairs that define
//! the graph. Keys are PascalCase on disk.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use crc::{Crc, CRC_64_ECMA_182};
use serde::Deserialize;
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use file_tail::parser::{ParserSpec, RegexOptions};
use file_tail::InitialPosition;

const CONTENT_HASH: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("could not read configuration {path:?}: {source}"))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("configuration {path:?} is not valid JSON: {source}"))]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[snafu(display("duplicate component id {id:?}"))]
    DuplicateId { id: String },
    #[snafu(display("pipe {pipe:?} references unknown {what} {reference:?}"))]
    UnknownRef {
        pipe: String,
        what: &'static str,
        reference: String,
    },
    #[snafu(display("{message}"))]
    Invalid { message: String },
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct AgentConfig {
    /// Optional stable session name; defaults to the file stem.
    pub name: Option<String>,
    pub sources: Vec<SourceConfig>,
    pub sinks: Vec<SinkConfig>,
    pub pipes: Vec<PipeConfig>,
    /// Credential provider entries are passed through to plug-ins; the
    /// core does not interpret them.
    pub credentials: Vec<serde_json::Value>,
    pub plugins: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub enum InitialPositionConfig {
    #[default]
    Bookmark,
    Beginning,
    End,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub enum RecordParserKind {
    #[default]
    SingleLine,
    Timestamp,
    Regex,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "Type", rename_all_fields = "PascalCase")]
pub enum SourceConfig {
    DirectorySource {
        id: String,
        directory: PathBuf,
        /// `|`-separated file globs, e.g. `"*.log|*.txt"`.
        #[serde(default = "default_file_name_filter")]
        file_name_filter: String,
        #[serde(default)]
        include_subdirectories: bool,
        #[serde(default)]
        directory_exclude_filter: Vec<String>,
        #[serde(default)]
        initial_position: InitialPositionConfig,
        #[serde(default)]
        initial_position_timestamp: Option<DateTime<Utc>>,
        #[serde(default)]
        record_parser: RecordParserKind,
        #[serde(default)]
        timestamp_format: Option<String>,
        #[serde(default)]
        pattern: Option<String>,
        #[serde(default)]
        extraction_pattern: Option<String>,
        #[serde(default)]
        multiline: bool,
        #[serde(default)]
        case_insensitive: bool,
        #[serde(default)]
        right_to_left: bool,
    },
}

impl SourceConfig {
    pub fn id(&self) -> &str {
        match self {
            SourceConfig::DirectorySource { id, .. } => id,
        }
    }

    /// Translate the flat parser keys into a parser spec, rejecting
    /// combinations that cannot work at load time.
    pub fn parser_spec(&self) -> Result<ParserSpec, ConfigError> {
        let SourceConfig::DirectorySource {
            id,
            record_parser,
            timestamp_format,
            pattern,
            extraction_pattern,
            multiline,
            case_insensitive,
            right_to_left,
            ..
        } = self;
        let options = RegexOptions {
            multiline: *multiline,
            case_insensitive: *case_insensitive,
            right_to_left: *right_to_left,
        };
        match record_parser {
            RecordParserKind::SingleLine => Ok(ParserSpec::SingleLine),
            RecordParserKind::Timestamp => {
                let pattern = pattern.clone().context(InvalidSnafu {
                    message: format!("source {id:?}: Timestamp parser requires Pattern"),
                })?;
                let timestamp_format = timestamp_format.clone().context(InvalidSnafu {
                    message: format!("source {id:?}: Timestamp parser requires TimestampFormat"),
                })?;
                Ok(ParserSpec::TimestampAnchored {
                    pattern,
                    timestamp_format,
                })
            }
            RecordParserKind::Regex => {
                let pattern = pattern.clone().context(InvalidSnafu {
                    message: format!("source {id:?}: Regex parser requires Pattern"),
                })?;
                Ok(ParserSpec::Regex {
                    pattern,
                    extraction: extraction_pattern.clone(),
                    timestamp_format: timestamp_format.clone(),
                    options,
                })
            }
        }
    }

    pub fn initial_position(&self) -> Result<InitialPosition, ConfigError> {
        let SourceConfig::DirectorySource {
            id,
            initial_position,
            initial_position_timestamp,
            ..
        } = self;
        Ok(match initial_position {
            InitialPositionConfig::Bookmark => InitialPosition::Bookmark,
            InitialPositionConfig::Beginning => InitialPosition::Beginning,
            InitialPositionConfig::End => InitialPosition::End,
            InitialPositionConfig::Timestamp => InitialPosition::Timestamp(
                initial_position_timestamp.context(InvalidSnafu {
                    message: format!(
                        "source {id:?}: InitialPosition Timestamp requires InitialPositionTimestamp"
                    ),
                })?,
            ),
        })
    }

    pub fn include_globs(&self) -> Vec<String> {
        let SourceConfig::DirectorySource {
            file_name_filter, ..
        } = self;
        file_name_filter
            .split('|')
            .map(|part| part.trim().to_owned())
            .filter(|part| !part.is_empty())
            .collect()
    }
}

fn default_file_name_filter() -> String {
    "*.*".to_owned()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EndpointConfig {
    pub id: String,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub enum SelectionPolicyConfig {
    #[default]
    Priority,
    LoadBalance,
    WeightedLoadBalance,
    RoundTripTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub enum QueueModeConfig {
    #[default]
    HiLow,
    HighCapacity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub enum OverflowKindConfig {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "Type", rename_all_fields = "PascalCase")]
pub enum SinkConfig {
    CloudLogsSink {
        id: String,
        #[serde(default = "default_log_stream")]
        log_stream: String,
        #[serde(default)]
        endpoints: Vec<EndpointConfig>,
        #[serde(default)]
        selection_policy: SelectionPolicyConfig,
        #[serde(default = "default_cooldown_seconds")]
        region_cooldown_seconds: u64,
        #[serde(default = "default_failback_seconds")]
        max_failback_retry_interval_seconds: u64,
        #[serde(default = "default_batch_count")]
        batch_max_count: usize,
        #[serde(default = "default_batch_bytes")]
        batch_max_bytes: usize,
        #[serde(default = "default_batch_interval_ms")]
        batch_interval_ms: u64,
        #[serde(default = "default_records_per_second")]
        records_per_second: f64,
        #[serde(default = "default_bytes_per_second")]
        bytes_per_second: f64,
        #[serde(default = "default_max_attempts")]
        max_attempts: u32,
        #[serde(default = "default_client_timeout_seconds")]
        client_timeout_seconds: u64,
        #[serde(default)]
        queue_mode: QueueModeConfig,
        #[serde(default = "default_primary_queue_size")]
        primary_queue_size: usize,
        #[serde(default)]
        overflow_queue: OverflowKindConfig,
        #[serde(default = "default_overflow_capacity")]
        overflow_capacity: u64,
    },
    ConsoleSink {
        id: String,
    },
    MetricsSink {
        id: String,
        #[serde(default = "default_metrics_interval_seconds")]
        interval_seconds: u64,
    },
}

impl SinkConfig {
    pub fn id(&self) -> &str {
        match self {
            SinkConfig::CloudLogsSink { id, .. } => id,
            SinkConfig::ConsoleSink { id } => id,
            SinkConfig::MetricsSink { id, .. } => id,
        }
    }
}

fn default_log_stream() -> String {
    "kinesistap".to_owned()
}

fn default_cooldown_seconds() -> u64 {
    300
}

fn default_failback_seconds() -> u64 {
    300
}

fn default_batch_count() -> usize {
    500
}

fn default_batch_bytes() -> usize {
    crate::sinks::cloud_logs::MAX_BATCH_BYTES
}

fn default_batch_interval_ms() -> u64 {
    1_000
}

fn default_records_per_second() -> f64 {
    10_000.0
}

fn default_bytes_per_second() -> f64 {
    1_048_576.0
}

fn default_max_attempts() -> u32 {
    3
}

fn default_client_timeout_seconds() -> u64 {
    30
}

fn default_primary_queue_size() -> usize {
    100
}

fn default_overflow_capacity() -> u64 {
    1_000
}

fn default_metrics_interval_seconds() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "Type", rename_all_fields = "PascalCase")]
pub enum PipeConfig {
    /// Pass-through connector from a source to a sink.
    Pipe {
        id: String,
        source_ref: String,
        sink_ref: String,
    },
    RegexFilterPipe {
        id: String,
        source_ref: String,
        sink_ref: String,
        filter_pattern: String,
        #[serde(default)]
        negate: bool,
        #[serde(default)]
        multiline: bool,
        #[serde(default)]
        case_insensitive: bool,
        #[serde(default)]
        right_to_left: bool,
    },
}

impl PipeConfig {
    pub fn id(&self) -> &str {
        match self {
            PipeConfig::Pipe { id, .. } => id,
            PipeConfig::RegexFilterPipe { id, .. } => id,
        }
    }

    pub fn source_ref(&self) -> &str {
        match self {
            PipeConfig::Pipe { source_ref, .. } => source_ref,
            PipeConfig::RegexFilterPipe { source_ref, .. } => source_ref,
        }
    }

    pub fn sink_ref(&self) -> &str {
        match self {
            PipeConfig::Pipe { sink_ref, .. } => sink_ref,
            PipeConfig::RegexFilterPipe { sink_ref, .. } => sink_ref,
        }
    }
}

impl AgentConfig {
    /// Read and parse a configuration file, returning the parsed model and
    /// a content hash used for modified-file detection.
    pub fn load(path: &Path) -> Result<(AgentConfig, u64), ConfigError> {
        let bytes = fs::read(path).context(IoSnafu { path })?;
        let config: AgentConfig =
            serde_json::from_slice(&bytes).context(ParseSnafu { path })?;
        config.validate()?;
        Ok((config, CONTENT_HASH.checksum(&bytes)))
    }

    /// Static checks: unique ids, resolvable pipe references, non-empty
    /// filter patterns.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        for id in self
            .sources
            .iter()
            .map(SourceConfig::id)
            .chain(self.sinks.iter().map(SinkConfig::id))
            .chain(self.pipes.iter().map(PipeConfig::id))
        {
            ensure!(ids.insert(id.to_owned()), DuplicateIdSnafu { id });
        }

        let source_ids: HashSet<&str> = self.sources.iter().map(SourceConfig::id).collect();
        let sink_ids: HashSet<&str> = self.sinks.iter().map(SinkConfig::id).collect();
        for pipe in &self.pipes {
            ensure!(
                source_ids.contains(pipe.source_ref()),
                UnknownRefSnafu {
                    pipe: pipe.id(),
                    what: "source",
                    reference: pipe.source_ref(),
                }
            );
            ensure!(
                sink_ids.contains(pipe.sink_ref()),
                UnknownRefSnafu {
                    pipe: pipe.id(),
                    what: "sink",
                    reference: pipe.sink_ref(),
                }
            );
            if let PipeConfig::RegexFilterPipe { filter_pattern, .. } = pipe {
                ensure!(
                    !filter_pattern.is_empty(),
                    InvalidSnafu {
                        message: format!("pipe {:?}: FilterPattern must not be empty", pipe.id()),
                    }
                );
            }
        }

        for source in &self.sources {
            source.parser_spec()?;
            source.initial_position()?;
        }

        Ok(())
    }

    /// Stable display name: the `Name` field when present, else the file
    /// stem.
    pub fn display_name(&self, path: &Path) -> String {
        self.name.clone().unwrap_or_else(|| {
            path.file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "default".to_owned())
        })
    }
}

/// File-name policy for the extra-configs directory: only `*.json`, and no
/// whitespace or reserved characters in the stem.
pub fn is_acceptable_config_file_name(path: &Path) -> bool {
    if path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| !e.eq_ignore_ascii_case("json"))
        .unwrap_or(true)
    {
        return false;
    }
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    !name
        .chars()
        .any(|c| c.is_whitespace() || "<>:\"/\\|?*'".contains(c))
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use super::{is_acceptable_config_file_name, AgentConfig, ConfigError};

    fn parse(json: &str) -> Result<AgentConfig, serde_json::Error> {
        serde_json::from_str(json)
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config = parse(
            r#"{
                "Sources": [
                    {"Type": "DirectorySource", "Id": "logs", "Directory": "/var/log/app"}
                ],
                "Sinks": [
                    {"Type": "ConsoleSink", "Id": "console"}
                ],
                "Pipes": [
                    {"Type": "Pipe", "Id": "p1", "SourceRef": "logs", "SinkRef": "console"}
                ]
            }"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.sources[0].include_globs(), vec!["*.*"]);
        assert_eq!(config.display_name(Path::new("/etc/a/b.json")), "b");
    }

    #[test]
    fn name_field_overrides_file_stem() {
        let config = parse(r#"{"Name": "edge-logs"}"#).unwrap();
        assert_eq!(config.display_name(Path::new("/x/y.json")), "edge-logs");
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let config = parse(
            r#"{
                "Sources": [
                    {"Type": "DirectorySource", "Id": "dup", "Directory": "/a"}
                ],
                "Sinks": [{"Type": "ConsoleSink", "Id": "dup"}]
            }"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateId { .. })
        ));
    }

    #[test]
    fn dangling_pipe_ref_is_rejected() {
        let config = parse(
            r#"{
                "Sinks": [{"Type": "ConsoleSink", "Id": "console"}],
                "Pipes": [
                    {"Type": "Pipe", "Id": "p", "SourceRef": "ghost", "SinkRef": "console"}
                ]
            }"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownRef { .. })
        ));
    }

    #[test]
    fn empty_filter_pattern_is_rejected() {
        let config = parse(
            r#"{
                "Sources": [
                    {"Type": "DirectorySource", "Id": "s", "Directory": "/a"}
                ],
                "Sinks": [{"Type": "ConsoleSink", "Id": "k"}],
                "Pipes": [
                    {
                        "Type": "RegexFilterPipe", "Id": "p",
                        "SourceRef": "s", "SinkRef": "k", "FilterPattern": ""
                    }
                ]
            }"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn timestamp_parser_requires_format() {
        let config = parse(
            r#"{
                "Sources": [
                    {
                        "Type": "DirectorySource", "Id": "s", "Directory": "/a",
                        "RecordParser": "Timestamp",
                        "Pattern": "^\\d{4}"
                    }
                ]
            }"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn cloud_logs_sink_defaults() {
        let config = parse(
            r#"{
                "Sinks": [
                    {"Type": "CloudLogsSink", "Id": "cw"}
                ]
            }"#,
        )
        .unwrap();
        let super::SinkConfig::CloudLogsSink {
            batch_max_count,
            batch_max_bytes,
            max_attempts,
            client_timeout_seconds,
            ..
        } = &config.sinks[0]
        else {
            panic!("wrong sink type");
        };
        assert_eq!(*batch_max_count, 500);
        assert_eq!(*batch_max_bytes, 1024 * 1024);
        assert_eq!(*max_attempts, 3);
        assert_eq!(*client_timeout_seconds, 30);
    }

    #[test]
    fn file_name_policy() {
        assert!(is_acceptable_config_file_name(Path::new("a.json")));
        assert!(is_acceptable_config_file_name(Path::new("edge-1.JSON")));
        assert!(!is_acceptable_config_file_name(Path::new("a.yaml")));
        assert!(!is_acceptable_config_file_name(Path::new("a b.json")));
        assert!(!is_acceptable_config_file_name(Path::new("a'b.json")));
        assert!(!is_acceptable_config_file_name(Path::new("noext")));
    }
}
