use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    bookmarks::{BookmarkHandle, BookmarkStore},
    parser::{BuildError, ParsedRecord, ParserSpec, RecordParser},
    paths::GlobPaths,
    watcher::FileWatcher,
    FileId, FilePosition, InitialPosition, ReadFrom,
};

#[derive(Debug, Snafu)]
pub enum HarvesterError {
    #[snafu(display("directory or patterns are not valid UTF-8"))]
    InvalidPaths,
    #[snafu(display("invalid parser: {source}"))]
    InvalidParser { source: BuildError },
}

/// Settings for one directory tailer.
#[derive(Debug, Clone)]
pub struct HarvesterConfig {
    pub directory: PathBuf,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub recursive: bool,
    pub initial_position: InitialPosition,
    pub parser: ParserSpec,
    /// Records longer than this are discarded whole.
    pub max_record_bytes: usize,
    /// Budget of bytes read from one file in one pass, so a busy file
    /// cannot starve its neighbors.
    pub max_read_bytes: usize,
    pub sweep_interval: Duration,
    pub persist_interval: Duration,
    /// How long a multi-line record may sit open at EOF before it is
    /// flushed without waiting for the next anchor line.
    pub idle_flush: Duration,
}

impl HarvesterConfig {
    pub fn new(directory: PathBuf) -> Self {
        HarvesterConfig {
            directory,
            include: vec!["*.*".to_owned()],
            exclude: Vec::new(),
            recursive: false,
            initial_position: InitialPosition::Bookmark,
            parser: ParserSpec::SingleLine,
            max_record_bytes: 100 * 1024,
            max_read_bytes: 512 * 1024,
            sweep_interval: Duration::from_millis(1000),
            persist_interval: Duration::from_secs(5),
            idle_flush: Duration::from_millis(1000),
        }
    }
}

/// A parsed record leaving the tailer, carrying everything the downstream
/// sink needs to acknowledge it durably.
#[derive(Debug, Clone)]
pub struct TailedRecord {
    pub text: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub fields: Vec<(String, String)>,
    pub file_id: FileId,
    /// Offset past the record; the value a bookmark should advance to.
    pub offset: FilePosition,
    pub line: u64,
    pub bookmark: BookmarkHandle,
}

struct Watched {
    watcher: FileWatcher,
    parser: RecordParser,
    handle: BookmarkHandle,
    last_line_at: Instant,
}

/// Cooperative tailer over one directory: discovers files on a sweep
/// interval, reads new bytes fairly across them, assembles records, and
/// emits them to a bounded channel. Designed to run on a blocking thread
/// (`tokio::task::spawn_blocking`) with backpressure provided by the
/// channel and cancellation via the token.
pub struct Harvester {
    config: HarvesterConfig,
    provider: GlobPaths,
    bookmarks: Arc<BookmarkStore>,
    watched: HashMap<FileId, Watched>,
    unreadable: HashSet<PathBuf>,
    first_sweep: bool,
    /// Parse failures across retired watchers; live ones are summed in.
    retired_failures: u64,
    failure_counter: Arc<AtomicU64>,
}

impl Harvester {
    pub fn new(
        config: HarvesterConfig,
        bookmarks: Arc<BookmarkStore>,
    ) -> Result<Self, HarvesterError> {
        // Fail fast on bad parser settings rather than per file later.
        RecordParser::new(&config.parser).context(InvalidParserSnafu)?;

        let provider = GlobPaths::new(
            &config.directory,
            &config.include,
            &config.exclude,
            config.recursive,
        )
        .context(InvalidPathsSnafu)?;

        Ok(Harvester {
            config,
            provider,
            bookmarks,
            watched: HashMap::new(),
            unreadable: HashSet::new(),
            first_sweep: true,
            retired_failures: 0,
            failure_counter: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Share a counter that tracks records dropped by the parsers, so the
    /// embedding source can surface it as a metric.
    pub fn failure_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.failure_counter)
    }

    /// Drive the tailer until the token is cancelled or the receiving side
    /// of `tx` goes away. Flushes open records and persists bookmarks on
    /// the way out.
    pub fn run(mut self, tx: mpsc::Sender<TailedRecord>, shutdown: CancellationToken) {
        let mut backoff_cap: u64 = 1;
        let mut last_sweep: Option<Instant> = None;
        let mut last_persist = Instant::now();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if last_sweep.map_or(true, |at| at.elapsed() >= self.config.sweep_interval) {
                self.sweep();
                last_sweep = Some(Instant::now());
            }

            let Some(bytes_read) = self.read_pass(&tx) else {
                break; // channel closed
            };

            if self.flush_idle(&tx).is_none() {
                break;
            }

            self.retire_dead(&tx);

            if last_persist.elapsed() >= self.config.persist_interval {
                if let Err(error) = self.bookmarks.persist() {
                    warn!(message = "Failed to persist bookmarks.", %error);
                }
                last_persist = Instant::now();
            }

            let live_failures: u64 = self.watched.values().map(|w| w.parser.failures()).sum();
            self.failure_counter
                .store(self.retired_failures + live_failures, Ordering::Relaxed);

            // Busy files reset the backoff; quiet directories converge to a
            // couple-second poll without burning CPU.
            if bytes_read == 0 {
                backoff_cap = (backoff_cap * 2).min(2_048);
            } else {
                backoff_cap = 1;
            }
            let backoff = backoff_cap.saturating_sub(bytes_read as u64);
            if !self.sleep(Duration::from_millis(backoff), &shutdown) {
                break;
            }
        }

        self.finish(&tx);
    }

    /// Cancellation-aware sleep; false when the token fired.
    fn sleep(&self, duration: Duration, shutdown: &CancellationToken) -> bool {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            if shutdown.is_cancelled() {
                return false;
            }
            std::thread::sleep(Duration::from_millis(20).min(deadline - Instant::now()));
        }
        !shutdown.is_cancelled()
    }

    /// Reconcile the watcher set against the current directory listing.
    fn sweep(&mut self) {
        let mut seen: HashSet<FileId> = HashSet::new();

        for path in self.provider.paths() {
            let file_id = match std::fs::File::open(&path).and_then(|f| FileId::of(&f)) {
                Ok(id) => id,
                Err(error) => {
                    // Locked or permission-denied files get one warning per
                    // occurrence and are retried on the next sweep.
                    if self.unreadable.insert(path.clone()) {
                        warn!(message = "File is unreadable; will retry.", ?path, %error);
                    }
                    continue;
                }
            };
            self.unreadable.remove(&path);

            if let Some(watched) = self.watched.get_mut(&file_id) {
                if watched.watcher.path != path {
                    watched.watcher.update_path(path);
                }
                watched.watcher.set_findable(true);
                seen.insert(file_id);
                continue;
            }

            match self.open_watcher(path.clone()) {
                Ok(Some(watched)) => {
                    let file_id = watched.watcher.file_id();
                    info!(
                        message = "Found file to watch.",
                        ?path,
                        position = watched.watcher.position(),
                    );
                    seen.insert(file_id);
                    self.watched.insert(file_id, watched);
                }
                Ok(None) => {}
                Err(error) => {
                    if self.unreadable.insert(path.clone()) {
                        warn!(message = "File is unreadable; will retry.", ?path, %error);
                    }
                }
            }
        }

        for (file_id, watched) in self.watched.iter_mut() {
            if !seen.contains(file_id) {
                watched.watcher.set_findable(false);
            }
        }

        self.first_sweep = false;
    }

    fn open_watcher(&self, path: PathBuf) -> std::io::Result<Option<Watched>> {
        let probe = std::fs::File::open(&path)?;
        let file_id = FileId::of(&probe)?;
        drop(probe);

        let mut skip_before = None;
        let (read_from, start_line) = match self.bookmarks.get(file_id) {
            Some(position) => (ReadFrom::Checkpoint(position.offset), position.line),
            None => match self.config.initial_position {
                InitialPosition::Beginning | InitialPosition::Bookmark => (ReadFrom::Beginning, 0),
                // `End` only applies to files present at startup; anything
                // discovered on a later sweep is new output we must not skip.
                InitialPosition::End if self.first_sweep => (ReadFrom::End, 0),
                InitialPosition::End => (ReadFrom::Beginning, 0),
                InitialPosition::Timestamp(at) => {
                    skip_before = Some(at);
                    (ReadFrom::Beginning, 0)
                }
            },
        };

        let mut watcher =
            FileWatcher::new(path, read_from, start_line, self.config.max_record_bytes)?;
        if watcher.file_id() != file_id {
            // The path was replaced between the probe and the open; the
            // next sweep will pick the newcomer up under its real identity.
            return Ok(None);
        }
        watcher.skip_before = skip_before;

        let parser = RecordParser::new(&self.config.parser)
            .expect("parser spec validated at construction");
        let handle = self.bookmarks.register(file_id);

        Ok(Some(Watched {
            watcher,
            parser,
            handle,
            last_line_at: Instant::now(),
        }))
    }

    /// Read new bytes from every watched file, emitting completed records.
    /// Returns bytes read, or `None` when the output channel closed.
    fn read_pass(&mut self, tx: &mpsc::Sender<TailedRecord>) -> Option<usize> {
        let mut total = 0usize;

        for watched in self.watched.values_mut() {
            if let Err(error) = watched.watcher.check_truncated() {
                if !watched.watcher.dead() {
                    debug!(message = "Could not stat watched file.", path = ?watched.watcher.path, %error);
                }
                continue;
            }

            let mut bytes_read = 0usize;
            loop {
                match watched.watcher.read_line() {
                    Ok(Some(raw)) => {
                        bytes_read += raw.bytes.len();
                        watched.last_line_at = Instant::now();
                        let completed = watched.parser.push(raw);
                        if let Some(record) = completed {
                            if !emit(tx, &mut watched.watcher, &watched.handle, record) {
                                return None;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        debug!(message = "Error reading watched file.", path = ?watched.watcher.path, %error);
                        break;
                    }
                }
                if bytes_read > self.config.max_read_bytes {
                    break;
                }
            }
            total += bytes_read;
        }

        Some(total)
    }

    /// Close out multi-line records that have been sitting open at EOF
    /// longer than the idle window.
    fn flush_idle(&mut self, tx: &mpsc::Sender<TailedRecord>) -> Option<()> {
        let idle_flush = self.config.idle_flush;
        for watched in self.watched.values_mut() {
            if watched.parser.accumulates()
                && watched.watcher.reached_eof()
                && watched.last_line_at.elapsed() >= idle_flush
            {
                if let Some(record) = watched.parser.flush() {
                    if !emit(tx, &mut watched.watcher, &watched.handle, record) {
                        return None;
                    }
                }
            }
        }
        Some(())
    }

    /// Drop watchers whose files have disappeared, flushing any record
    /// still in their parsers first.
    fn retire_dead(&mut self, tx: &mpsc::Sender<TailedRecord>) {
        let mut dead = Vec::new();
        for (file_id, watched) in self.watched.iter_mut() {
            if watched.watcher.dead() {
                if let Some(record) = watched.parser.flush() {
                    emit(tx, &mut watched.watcher, &watched.handle, record);
                }
                debug!(message = "Stopped watching file.", path = ?watched.watcher.path);
                dead.push(*file_id);
            }
        }
        for file_id in dead {
            if let Some(watched) = self.watched.remove(&file_id) {
                self.retired_failures += watched.parser.failures();
            }
        }
    }

    fn finish(mut self, tx: &mpsc::Sender<TailedRecord>) {
        for watched in self.watched.values_mut() {
            if let Some(record) = watched.parser.flush() {
                emit(tx, &mut watched.watcher, &watched.handle, record);
            }
        }
        if let Err(error) = self.bookmarks.persist() {
            warn!(message = "Failed to persist bookmarks during shutdown.", %error);
        }
    }
}

/// Send one record downstream, honoring the timestamp skip window.
/// Returns false when the channel has closed.
fn emit(
    tx: &mpsc::Sender<TailedRecord>,
    watcher: &mut FileWatcher,
    handle: &BookmarkHandle,
    record: ParsedRecord,
) -> bool {
    if let Some(skip_before) = watcher.skip_before {
        match record.timestamp {
            Some(at) if at < skip_before => return true,
            Some(_) => watcher.skip_before = None,
            None => {}
        }
    }

    tx.blocking_send(TailedRecord {
        text: record.text,
        timestamp: record.timestamp,
        fields: record.fields,
        file_id: watcher.file_id(),
        offset: record.end_offset,
        line: record.line,
        bookmark: handle.clone(),
    })
    .is_ok()
}
