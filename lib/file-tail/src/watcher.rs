use std::{
    fs,
    io::{self, BufReader, Seek, SeekFrom},
    path::PathBuf,
    time::Instant,
};

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::{
    buffer::{read_until_with_max_size, ReadResult},
    FileId, FilePosition, PortableFileExt, ReadFrom,
};

/// One delimited line read out of a file, tagged with the position the next
/// read will start from and the 1-based physical line number.
#[derive(Debug)]
pub struct RawLine {
    pub bytes: Bytes,
    /// Byte offset immediately past this line's delimiter. Persisting this
    /// as the bookmark guarantees a restart resumes at the next line.
    pub end_offset: FilePosition,
    pub line: u64,
}

/// Polling state machine that follows a single file path across renames and
/// truncation. `FileWatcher` tracks exactly one file identity; the
/// [`Harvester`](crate::Harvester) retires watchers whose files disappear.
pub struct FileWatcher {
    pub path: PathBuf,
    file_id: FileId,
    reader: BufReader<fs::File>,
    file_position: FilePosition,
    line: u64,
    findable: bool,
    is_dead: bool,
    reached_eof: bool,
    last_seen: Instant,
    max_record_bytes: usize,
    buf: BytesMut,
    /// Set when the file's pre-existing content must be filtered by record
    /// timestamp before emission (initial position `timestamp`).
    pub skip_before: Option<chrono::DateTime<chrono::Utc>>,
}

impl FileWatcher {
    /// Open `path` and seek to the resolved starting position. Returns an
    /// error when the file cannot be opened, which callers treat as
    /// retryable (the file may be locked or momentarily gone).
    pub fn new(
        path: PathBuf,
        read_from: ReadFrom,
        start_line: u64,
        max_record_bytes: usize,
    ) -> io::Result<FileWatcher> {
        let f = fs::File::open(&path)?;
        let file_id = FileId::of(&f)?;
        let mut reader = BufReader::new(f);

        let file_position = match read_from {
            ReadFrom::Beginning => reader.seek(SeekFrom::Start(0))?,
            ReadFrom::End => reader.seek(SeekFrom::End(0))?,
            ReadFrom::Checkpoint(position) => reader.seek(SeekFrom::Start(position))?,
        };

        Ok(FileWatcher {
            path,
            file_id,
            reader,
            file_position,
            line: start_line,
            findable: true,
            is_dead: false,
            reached_eof: false,
            last_seen: Instant::now(),
            max_record_bytes,
            buf: BytesMut::new(),
            skip_before: None,
        })
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn position(&self) -> FilePosition {
        self.file_position
    }

    /// The file was found at a new path with the same identity: a rename.
    /// The open descriptor stays valid, so only the path changes.
    pub fn update_path(&mut self, path: PathBuf) {
        debug!(message = "Watched file has been renamed.", new_path = ?path, old_path = ?self.path);
        self.path = path;
    }

    pub fn set_findable(&mut self, findable: bool) {
        self.findable = findable;
        if findable {
            self.last_seen = Instant::now();
        }
    }

    pub fn findable(&self) -> bool {
        self.findable
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn set_dead(&mut self) {
        self.is_dead = true;
    }

    pub fn dead(&self) -> bool {
        self.is_dead
    }

    pub fn reached_eof(&self) -> bool {
        self.reached_eof
    }

    /// Detect truncation-in-place (the common copytruncate rotation): when
    /// the file is now shorter than our offset, reopen from the start.
    pub fn check_truncated(&mut self) -> io::Result<bool> {
        let len = self.reader.get_ref().metadata()?.len();
        if len < self.file_position {
            warn!(
                message = "Watched file smaller than bookmarked offset; restarting from the beginning.",
                path = ?self.path,
                offset = self.file_position,
                len,
            );
            let f = fs::File::open(&self.path)?;
            self.reader = BufReader::new(f);
            self.file_position = 0;
            self.line = 0;
            self.buf.clear();
            return Ok(true);
        }
        Ok(false)
    }

    /// Read the next delimited line, if one is complete.
    ///
    /// Returns `Ok(None)` at EOF. When the file is both at EOF and no
    /// longer findable, any partial trailing content is emitted as a final
    /// line and the watcher is marked dead.
    pub fn read_line(&mut self) -> io::Result<Option<RawLine>> {
        let reader = &mut self.reader;
        let position = &mut self.file_position;
        match read_until_with_max_size(reader, position, b"\n", &mut self.buf, self.max_record_bytes)
        {
            Ok(ReadResult {
                successfully_read: Some(_),
                ..
            }) => {
                self.reached_eof = false;
                self.line += 1;
                if self.buf.last() == Some(&b'\r') {
                    self.buf.truncate(self.buf.len() - 1);
                }
                Ok(Some(RawLine {
                    bytes: self.buf.split().freeze(),
                    end_offset: self.file_position,
                    line: self.line,
                }))
            }
            Ok(ReadResult {
                successfully_read: None,
                ..
            }) => {
                if !self.findable {
                    self.set_dead();
                    // The file is gone; flush whatever partial line we hold
                    // rather than lose it waiting for a delimiter.
                    let buf = self.buf.split().freeze();
                    if buf.is_empty() {
                        self.reached_eof = true;
                        Ok(None)
                    } else {
                        self.line += 1;
                        Ok(Some(RawLine {
                            bytes: buf,
                            end_offset: self.file_position,
                            line: self.line,
                        }))
                    }
                } else {
                    self.reached_eof = true;
                    Ok(None)
                }
            }
            Err(e) => {
                if e.kind() == io::ErrorKind::NotFound {
                    self.set_dead();
                }
                Err(e)
            }
        }
    }
}
