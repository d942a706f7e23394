//! In-graph transforms between sources and sinks.
//!
//! A pipe consumes envelopes and forwards (possibly different) envelopes to
//! its downstream stage. The graph is explicit: every stage holds an
//! `Arc<dyn EventSink>` for the next one, and a source drives the chain by
//! calling `accept`. Backpressure comes from the terminal sink's bounded
//! batcher, not from the pipes themselves.

use std::sync::Arc;

use async_trait::async_trait;
use file_tail::parser::{build_regex, BuildError, RegexOptions};
use regex::Regex;
use snafu::{ResultExt, Snafu};

use crate::event::{Envelope, EventPayload};

#[derive(Debug, Snafu)]
pub enum PipeError {
    #[snafu(display("invalid filter pattern: {source}"))]
    InvalidFilter { source: BuildError },
}

/// Anything that can receive envelopes: terminal sinks and pipes alike.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn accept(&self, envelope: Envelope);
}

/// Forwards envelopes passing a predicate; `negate` inverts the test.
pub struct FilterPipe {
    predicate: Box<dyn Fn(&Envelope) -> bool + Send + Sync>,
    negate: bool,
    downstream: Arc<dyn EventSink>,
}

impl FilterPipe {
    pub fn new(
        predicate: Box<dyn Fn(&Envelope) -> bool + Send + Sync>,
        negate: bool,
        downstream: Arc<dyn EventSink>,
    ) -> Self {
        FilterPipe {
            predicate,
            negate,
            downstream,
        }
    }
}

#[async_trait]
impl EventSink for FilterPipe {
    async fn accept(&self, envelope: Envelope) {
        if (self.predicate)(&envelope) != self.negate {
            self.downstream.accept(envelope).await;
        }
    }
}

/// Filter whose predicate is a regex over the record's text form.
pub struct RegexFilterPipe {
    regex: Regex,
    negate: bool,
    downstream: Arc<dyn EventSink>,
}

impl RegexFilterPipe {
    /// Fails at wiring time on an empty or invalid pattern.
    pub fn new(
        pattern: &str,
        options: RegexOptions,
        negate: bool,
        downstream: Arc<dyn EventSink>,
    ) -> Result<Self, PipeError> {
        Ok(RegexFilterPipe {
            regex: build_regex(pattern, options).context(InvalidFilterSnafu)?,
            negate,
            downstream,
        })
    }
}

#[async_trait]
impl EventSink for RegexFilterPipe {
    async fn accept(&self, envelope: Envelope) {
        let matched = self.regex.is_match(&envelope.payload.text_form());
        if matched != self.negate {
            self.downstream.accept(envelope).await;
        }
    }
}

/// Maps each envelope's payload through a function.
pub struct ProjectionPipe {
    map: Box<dyn Fn(EventPayload) -> EventPayload + Send + Sync>,
    downstream: Arc<dyn EventSink>,
}

impl ProjectionPipe {
    pub fn new(
        map: Box<dyn Fn(EventPayload) -> EventPayload + Send + Sync>,
        downstream: Arc<dyn EventSink>,
    ) -> Self {
        ProjectionPipe { map, downstream }
    }
}

#[async_trait]
impl EventSink for ProjectionPipe {
    async fn accept(&self, envelope: Envelope) {
        let payload = (self.map)(envelope.payload.clone());
        self.downstream.accept(envelope.map_payload(payload)).await;
    }
}

/// Duplicates each envelope to several downstream stages, so one source
/// can feed multiple pipes.
pub struct FanOutSink {
    downstreams: Vec<Arc<dyn EventSink>>,
}

impl FanOutSink {
    pub fn new(downstreams: Vec<Arc<dyn EventSink>>) -> Self {
        FanOutSink { downstreams }
    }
}

#[async_trait]
impl EventSink for FanOutSink {
    async fn accept(&self, envelope: Envelope) {
        if let Some((last, rest)) = self.downstreams.split_last() {
            for downstream in rest {
                downstream.accept(envelope.clone()).await;
            }
            last.accept(envelope).await;
        }
    }
}


#[cfg(test)]
mod test {
    use std::sync::Arc;

    use chrono::Utc;
    use file_tail::parser::RegexOptions;

    use super::test_util::CollectingSink;
    use super::{EventSink, FilterPipe, ProjectionPipe, RegexFilterPipe};
    use crate::event::{Envelope, EventPayload};

    fn envelope(text: &str) -> Envelope {
        Envelope::new(
            Arc::from("test"),
            Utc::now(),
            EventPayload::Text(text.to_owned()),
        )
    }

    #[tokio::test]
    async fn regex_filter_forwards_matches() {
        let sink = CollectingSink::new();
        let pipe = RegexFilterPipe::new(
            "^ERROR",
            RegexOptions::default(),
            false,
            Arc::clone(&sink) as Arc<dyn EventSink>,
        )
        .unwrap();

        for text in ["ERROR 1", "WARN 2", "ERROR 3"] {
            pipe.accept(envelope(text)).await;
        }
        assert_eq!(sink.texts().await, vec!["ERROR 1", "ERROR 3"]);
    }

    #[tokio::test]
    async fn regex_filter_negate_inverts() {
        let sink = CollectingSink::new();
        let pipe = RegexFilterPipe::new(
            "^ERROR",
            RegexOptions::default(),
            true,
            Arc::clone(&sink) as Arc<dyn EventSink>,
        )
        .unwrap();

        for text in ["ERROR 1", "WARN 2", "ERROR 3"] {
            pipe.accept(envelope(text)).await;
        }
        assert_eq!(sink.texts().await, vec!["WARN 2"]);
    }

    #[tokio::test]
    async fn empty_pattern_is_rejected_at_wiring() {
        let sink = CollectingSink::new();
        assert!(RegexFilterPipe::new(
            "",
            RegexOptions::default(),
            false,
            sink as Arc<dyn EventSink>,
        )
        .is_err());
    }

    #[tokio::test]
    async fn filter_pipe_predicate() {
        let sink = CollectingSink::new();
        let pipe = FilterPipe::new(
            Box::new(|e: &Envelope| e.payload.text_form().len() > 3),
            false,
            Arc::clone(&sink) as Arc<dyn EventSink>,
        );
        pipe.accept(envelope("no")).await;
        pipe.accept(envelope("long enough")).await;
        assert_eq!(sink.texts().await, vec!["long enough"]);
    }

    #[tokio::test]
    async fn projection_pipe_maps_payload() {
        let sink = CollectingSink::new();
        let pipe = ProjectionPipe::new(
            Box::new(|payload| {
                EventPayload::Text(payload.text_form().to_uppercase())
            }),
            Arc::clone(&sink) as Arc<dyn EventSink>,
        );
        pipe.accept(envelope("quiet")).await;
        assert_eq!(sink.texts().await, vec!["QUIET"]);
    }
}
