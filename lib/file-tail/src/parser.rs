//! Record parsers.
//!
//! A parser turns the raw line stream of one file into records. Single-line
//! treats every non-blank line as a record. The timestamp-anchored and regex
//! parsers accumulate: a record starts at a line matching the start pattern
//! and runs until the next such line, with blank lines belonging to the
//! record in progress. Lines that cannot open or extend a record are dropped
//! and counted; a bad record never stalls the stream.

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use snafu::{ResultExt, Snafu};

use crate::{watcher::RawLine, FilePosition};

#[derive(Debug, Snafu)]
pub enum BuildError {
    #[snafu(display("parser pattern must not be empty"))]
    EmptyPattern,
    #[snafu(display("invalid parser pattern {pattern:?}: {source}"))]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },
}

/// Options shared by the regex-driven parsers and filter pipes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegexOptions {
    pub multiline: bool,
    pub case_insensitive: bool,
    /// Scan for the last match instead of the first when extracting.
    pub right_to_left: bool,
}

/// Compile a pattern with the option flags applied inline.
pub fn build_regex(pattern: &str, options: RegexOptions) -> Result<Regex, BuildError> {
    if pattern.is_empty() {
        return EmptyPatternSnafu.fail();
    }
    let mut flags = String::new();
    if options.multiline {
        flags.push('m');
    }
    if options.case_insensitive {
        flags.push('i');
    }
    let full = if flags.is_empty() {
        pattern.to_owned()
    } else {
        format!("(?{flags}){pattern}")
    };
    Regex::new(&full).context(InvalidPatternSnafu { pattern })
}

/// Which parser to build for a source, with its type-specific knobs.
#[derive(Debug, Clone)]
pub enum ParserSpec {
    SingleLine,
    TimestampAnchored {
        /// Pattern that marks the first line of a record. A named capture
        /// `timestamp` narrows which part of the line holds the time.
        pattern: String,
        timestamp_format: String,
    },
    Regex {
        pattern: String,
        /// Optional separate extraction pattern run over the whole record.
        extraction: Option<String>,
        timestamp_format: Option<String>,
        options: RegexOptions,
    },
}

/// A complete record with its bookmarkable position.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    pub text: String,
    pub timestamp: Option<DateTime<Utc>>,
    /// Named-capture extractions, present only for the regex parser.
    pub fields: Vec<(String, String)>,
    /// Offset past the last byte of the record, the restart point.
    pub end_offset: FilePosition,
    /// Line number of the record's final physical line.
    pub line: u64,
}

/// Parse `s` with a chrono format, accepting both zoned and naive inputs.
/// Naive timestamps are taken as UTC.
pub fn parse_timestamp(s: &str, format: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_str(s, format) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, format)
        .ok()
        .map(|naive| naive.and_utc())
}

#[derive(Debug)]
struct Pending {
    text: String,
    timestamp: Option<DateTime<Utc>>,
    end_offset: FilePosition,
    line: u64,
}

impl Pending {
    fn into_record(self, fields: Vec<(String, String)>) -> ParsedRecord {
        ParsedRecord {
            text: self.text,
            timestamp: self.timestamp,
            fields,
            end_offset: self.end_offset,
            line: self.line,
        }
    }
}

/// Stateful per-file record assembler.
pub struct RecordParser {
    kind: Kind,
    pending: Option<Pending>,
    failures: u64,
}

enum Kind {
    SingleLine,
    Anchored {
        anchor: Regex,
        timestamp_format: String,
    },
    Regex {
        start: Regex,
        extraction: Option<Regex>,
        timestamp_format: Option<String>,
        right_to_left: bool,
    },
}

impl RecordParser {
    pub fn new(spec: &ParserSpec) -> Result<Self, BuildError> {
        let kind = match spec {
            ParserSpec::SingleLine => Kind::SingleLine,
            ParserSpec::TimestampAnchored {
                pattern,
                timestamp_format,
            } => Kind::Anchored {
                anchor: build_regex(pattern, RegexOptions::default())?,
                timestamp_format: timestamp_format.clone(),
            },
            ParserSpec::Regex {
                pattern,
                extraction,
                timestamp_format,
                options,
            } => Kind::Regex {
                start: build_regex(pattern, *options)?,
                extraction: extraction
                    .as_deref()
                    .map(|p| build_regex(p, *options))
                    .transpose()?,
                timestamp_format: timestamp_format.clone(),
                right_to_left: options.right_to_left,
            },
        };
        Ok(RecordParser {
            kind,
            pending: None,
            failures: 0,
        })
    }

    /// Whether this parser can hold a record open across lines. The
    /// harvester uses this to decide if idle flushing applies.
    pub fn accumulates(&self) -> bool {
        !matches!(self.kind, Kind::SingleLine)
    }

    /// Records dropped so far (unparseable or orphaned lines).
    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Feed one raw line; returns a record completed by this line, if any.
    pub fn push(&mut self, raw: RawLine) -> Option<ParsedRecord> {
        let text = String::from_utf8_lossy(&raw.bytes).into_owned();
        match self.classify(&text) {
            LineClass::Skip => None,
            LineClass::Record => Some(ParsedRecord {
                text,
                timestamp: None,
                fields: Vec::new(),
                end_offset: raw.end_offset,
                line: raw.line,
            }),
            LineClass::Start {
                timestamp,
                timestamp_failed,
            } => {
                if timestamp_failed {
                    self.failures += 1;
                }
                let completed = self.complete_pending();
                self.pending = Some(Pending {
                    text,
                    timestamp,
                    end_offset: raw.end_offset,
                    line: raw.line,
                });
                completed
            }
            LineClass::Continuation => self.continuation(text, raw),
        }
    }

    fn classify(&self, text: &str) -> LineClass {
        match &self.kind {
            Kind::SingleLine => {
                if text.trim().is_empty() {
                    LineClass::Skip
                } else {
                    LineClass::Record
                }
            }
            Kind::Anchored {
                anchor,
                timestamp_format,
            } => match anchor.find(text) {
                Some(found) => {
                    let capture_text = anchor
                        .captures(text)
                        .and_then(|c| c.name("timestamp").map(|m| m.as_str().to_owned()))
                        .unwrap_or_else(|| found.as_str().to_owned());
                    let timestamp = parse_timestamp(&capture_text, timestamp_format);
                    LineClass::Start {
                        timestamp_failed: timestamp.is_none(),
                        timestamp,
                    }
                }
                None => LineClass::Continuation,
            },
            Kind::Regex { start, .. } => {
                if start.is_match(text) {
                    LineClass::Start {
                        timestamp: None,
                        timestamp_failed: false,
                    }
                } else {
                    LineClass::Continuation
                }
            }
        }
    }

    /// Emit any record still being accumulated. Called when a file goes
    /// idle or the tailer stops, since the final record has no successor
    /// anchor to close it.
    pub fn flush(&mut self) -> Option<ParsedRecord> {
        self.complete_pending()
    }

    fn continuation(&mut self, text: String, raw: RawLine) -> Option<ParsedRecord> {
        match self.pending.as_mut() {
            Some(pending) => {
                pending.text.push('\n');
                pending.text.push_str(&text);
                pending.end_offset = raw.end_offset;
                pending.line = raw.line;
                None
            }
            None => {
                // A continuation with no open record: mid-record start of
                // the file, or a corrupt stretch. Drop it.
                self.failures += 1;
                None
            }
        }
    }

    fn complete_pending(&mut self) -> Option<ParsedRecord> {
        let pending = self.pending.take()?;
        let (record, failed) = match &self.kind {
            Kind::Regex {
                extraction,
                timestamp_format,
                right_to_left,
                ..
            } => Self::finish_regex_record(
                pending,
                extraction.as_ref(),
                timestamp_format.as_deref(),
                *right_to_left,
            ),
            _ => (Some(pending.into_record(Vec::new())), false),
        };
        if failed {
            self.failures += 1;
        }
        record
    }

    fn finish_regex_record(
        pending: Pending,
        extraction: Option<&Regex>,
        timestamp_format: Option<&str>,
        right_to_left: bool,
    ) -> (Option<ParsedRecord>, bool) {
        let mut fields = Vec::new();
        if let Some(extraction) = extraction {
            let captures = if right_to_left {
                let last = extraction.find_iter(&pending.text).last();
                last.and_then(|m| extraction.captures(&pending.text[m.start()..]))
            } else {
                extraction.captures(&pending.text)
            };
            let Some(captures) = captures else {
                return (None, true);
            };
            for name in extraction.capture_names().flatten() {
                if let Some(m) = captures.name(name) {
                    fields.push((name.to_owned(), m.as_str().to_owned()));
                }
            }
        }
        let timestamp = timestamp_format.and_then(|format| {
            fields
                .iter()
                .find(|(name, _)| name == "timestamp")
                .and_then(|(_, value)| parse_timestamp(value, format))
        });
        let mut record = pending.into_record(fields);
        record.timestamp = timestamp;
        (Some(record), false)
    }
}

enum LineClass {
    /// Blank line outside any record; silently skipped.
    Skip,
    /// A complete single-line record.
    Record,
    /// Opens a new record, closing any record in progress.
    Start {
        timestamp: Option<DateTime<Utc>>,
        timestamp_failed: bool,
    },
    /// Extends the record in progress.
    Continuation,
}
