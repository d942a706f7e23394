//! The event envelope flowing through every pipeline stage.

use std::{borrow::Cow, collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use file_tail::{bookmarks::BookmarkHandle, FileId};

/// Typed payload carried by an [`Envelope`]. Sources pick the variant that
/// preserves the most structure; sinks convert to their own record type and
/// may fall back to [`text_form`](EventPayload::text_form).
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Text(String),
    Json(serde_json::Value),
    /// Key/value pairs, e.g. named captures from a regex parser.
    Record(Vec<(String, String)>),
}

impl EventPayload {
    /// Canonical text rendering, used by regex filters and text sinks.
    pub fn text_form(&self) -> Cow<'_, str> {
        match self {
            EventPayload::Text(text) => Cow::Borrowed(text),
            EventPayload::Json(value) => Cow::Owned(value.to_string()),
            EventPayload::Record(fields) => Cow::Owned(
                fields
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(" "),
            ),
        }
    }

    /// Approximate in-flight size, used for buffer accounting before a sink
    /// applies its own per-record overhead.
    pub fn size(&self) -> usize {
        match self {
            EventPayload::Text(text) => text.len(),
            EventPayload::Json(value) => value.to_string().len(),
            EventPayload::Record(fields) => {
                fields.iter().map(|(k, v)| k.len() + v.len() + 2).sum()
            }
        }
    }
}

/// Where a record came from, precise enough to resume after it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordPosition {
    pub file_id: FileId,
    /// Offset past the record's final byte.
    pub offset: u64,
    pub line: u64,
}

/// One event plus the metadata the pipeline needs around it. Envelopes are
/// immutable once emitted; stages that change the payload build a new one.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
    pub source_id: Arc<str>,
    pub position: Option<RecordPosition>,
    /// Ack path back to the source's bookmark store; set only for
    /// bookmarkable sources.
    pub bookmark: Option<BookmarkHandle>,
    /// Local variables for decorators; empty for most envelopes.
    pub variables: BTreeMap<String, String>,
}

impl Envelope {
    pub fn new(source_id: Arc<str>, timestamp: DateTime<Utc>, payload: EventPayload) -> Self {
        Envelope {
            timestamp,
            payload,
            source_id,
            position: None,
            bookmark: None,
            variables: BTreeMap::new(),
        }
    }

    pub fn with_position(mut self, position: RecordPosition, bookmark: BookmarkHandle) -> Self {
        self.position = Some(position);
        self.bookmark = Some(bookmark);
        self
    }

    /// Replace the payload, keeping provenance. Used by projection pipes.
    pub fn map_payload(mut self, payload: EventPayload) -> Self {
        self.payload = payload;
        self
    }
}
