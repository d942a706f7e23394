//! Durable read positions, one store per source.
//!
//! A [`BookmarkStore`] owns `bookmarks/<source-id>.bm` and an in-memory view
//! shared with whoever acknowledges uploads. Offsets only move forward, and
//! the file is rewritten with a write-temp / fsync / atomic-rename sequence
//! so a crash always leaves one complete valid file behind.
//!
//! The on-disk body is a stable binary layout: a one-byte format tag, an
//! entry count, then fixed-width `(device, inode, offset, line)` records in
//! little-endian order. Truncated or malformed files are rejected on load
//! and the source falls back to its configured initial position.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use dashmap::DashMap;
use tracing::{info, warn};

use crate::{FileId, FilePosition};

/// Format tag for the current layout. Incompatible changes get a new tag
/// and load support everywhere the format transits.
const FORMAT_V1: u8 = 1;
/// Tag byte plus the little-endian entry count.
const HEADER_BYTES: usize = 9;
/// Four 8-byte fields: device, inode, offset, line.
const ENTRY_BYTES: usize = 32;

/// A single persisted position: byte offset plus the line count consumed so
/// far, so multi-line parsers can resume their numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookmarkPosition {
    pub offset: FilePosition,
    pub line: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    file_id: FileId,
    offset: FilePosition,
    line: u64,
}

fn encode_entries(entries: &[Entry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_BYTES + entries.len() * ENTRY_BYTES);
    out.push(FORMAT_V1);
    out.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    for entry in entries {
        let FileId::DevInode(device, inode) = entry.file_id;
        for field in [device, inode, entry.offset, entry.line] {
            out.extend_from_slice(&field.to_le_bytes());
        }
    }
    out
}

fn decode_entries(bytes: &[u8]) -> io::Result<Vec<Entry>> {
    let malformed = |message: &str| io::Error::new(io::ErrorKind::InvalidData, message.to_owned());

    let Some((&tag, rest)) = bytes.split_first() else {
        return Err(malformed("empty bookmark file"));
    };
    if tag != FORMAT_V1 {
        return Err(malformed("unsupported bookmark format tag"));
    }
    if rest.len() < HEADER_BYTES - 1 {
        return Err(malformed("truncated bookmark header"));
    }
    let (count_bytes, body) = rest.split_at(HEADER_BYTES - 1);
    let count = u64::from_le_bytes(count_bytes.try_into().expect("eight header bytes")) as usize;
    if count.checked_mul(ENTRY_BYTES) != Some(body.len()) {
        return Err(malformed("bookmark entry count does not match file size"));
    }

    let mut entries = Vec::with_capacity(count);
    for record in body.chunks_exact(ENTRY_BYTES) {
        let field = |index: usize| {
            u64::from_le_bytes(
                record[index * 8..(index + 1) * 8]
                    .try_into()
                    .expect("eight-byte field"),
            )
        };
        entries.push(Entry {
            file_id: FileId::DevInode(field(0), field(1)),
            offset: field(2),
            line: field(3),
        });
    }
    Ok(entries)
}

/// Thread-safe in-memory positions, shared between the harvester (reads) and
/// the acknowledging sink (writes).
#[derive(Debug, Default)]
pub struct BookmarkView {
    positions: DashMap<FileId, BookmarkPosition>,
}

impl BookmarkView {
    /// Advance the position for a file. Regressions are ignored so replayed
    /// or reordered acknowledgements can never move a bookmark backwards.
    pub fn advance(&self, file_id: FileId, position: BookmarkPosition) {
        let mut entry = self.positions.entry(file_id).or_insert(position);
        if position.offset > entry.offset {
            *entry = position;
        }
    }

    pub fn get(&self, file_id: FileId) -> Option<BookmarkPosition> {
        self.positions.get(&file_id).map(|r| *r.value())
    }

    pub fn remove(&self, file_id: FileId) {
        self.positions.remove(&file_id);
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    fn load_entries(&self, entries: Vec<Entry>) {
        for entry in entries {
            self.positions.insert(
                entry.file_id,
                BookmarkPosition {
                    offset: entry.offset,
                    line: entry.line,
                },
            );
        }
    }

    fn entries(&self) -> Vec<Entry> {
        let mut entries: Vec<Entry> = self
            .positions
            .iter()
            .map(|e| Entry {
                file_id: *e.key(),
                offset: e.value().offset,
                line: e.value().line,
            })
            .collect();
        entries.sort();
        entries
    }
}

/// A handle bound to one `(source, file)` pair, carried through the pipeline
/// so the terminal sink can acknowledge without knowing the store layout.
#[derive(Clone)]
pub struct BookmarkHandle {
    store: Arc<BookmarkStore>,
    file_id: FileId,
}

impl BookmarkHandle {
    pub fn advance(&self, position: BookmarkPosition) {
        self.store.view.advance(self.file_id, position);
    }

    /// One atomic write covering every position advanced under this
    /// handle's source since the last persist.
    pub fn persist(&self) -> io::Result<usize> {
        self.store.persist()
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn source_id(&self) -> &str {
        &self.store.source_id
    }
}

impl std::fmt::Debug for BookmarkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BookmarkHandle")
            .field("source_id", &self.store.source_id)
            .field("file_id", &self.file_id)
            .finish()
    }
}

/// Persistent bookmark store for a single source id.
pub struct BookmarkStore {
    source_id: String,
    tmp_file_path: PathBuf,
    stable_file_path: PathBuf,
    view: Arc<BookmarkView>,
    last: Mutex<Option<Vec<u8>>>,
}

impl BookmarkStore {
    /// Create a store rooted at `<data_dir>/bookmarks/<source-id>.bm`.
    pub fn new(data_dir: &Path, source_id: &str) -> io::Result<BookmarkStore> {
        let directory = data_dir.join("bookmarks");
        fs::create_dir_all(&directory)?;

        Ok(BookmarkStore {
            source_id: source_id.to_owned(),
            tmp_file_path: directory.join(format!("{source_id}.bm.new")),
            stable_file_path: directory.join(format!("{source_id}.bm")),
            view: Arc::new(BookmarkView::default()),
            last: Mutex::new(None),
        })
    }

    pub fn view(&self) -> Arc<BookmarkView> {
        Arc::clone(&self.view)
    }

    /// Register a file with the store, yielding a handle the pipeline can
    /// use to acknowledge positions for it.
    pub fn register(self: &Arc<Self>, file_id: FileId) -> BookmarkHandle {
        BookmarkHandle {
            store: Arc::clone(self),
            file_id,
        }
    }

    pub fn get(&self, file_id: FileId) -> Option<BookmarkPosition> {
        self.view.get(file_id)
    }

    /// Write the current positions to disk if they changed since the last
    /// persist. The stable file is only ever replaced by a fully flushed
    /// temp file, so a crash mid-write cannot corrupt it.
    pub fn persist(&self) -> io::Result<usize> {
        let encoded = encode_entries(&self.view.entries());

        let mut last = self.last.lock().expect("bookmark state poisoned");
        if last.as_deref() != Some(encoded.as_slice()) {
            let mut f = fs::File::create(&self.tmp_file_path)?;
            io::Write::write_all(&mut f, &encoded)?;
            f.sync_all()?;

            fs::rename(&self.tmp_file_path, &self.stable_file_path)?;

            *last = Some(encoded);
        }

        Ok(self.view.len())
    }

    /// Load persisted positions. A missing file is a normal first start; a
    /// malformed or truncated file is logged and discarded, and the caller
    /// falls back to its configured initial position.
    pub fn load(&self) -> io::Result<()> {
        // An orphaned temp file means the previous process died while
        // persisting; it holds newer data than the stable file.
        match self.read_entries(&self.tmp_file_path) {
            Ok(entries) => {
                warn!(
                    message = "Recovered bookmark data from interrupted persist.",
                    source_id = %self.source_id,
                );
                self.view.load_entries(entries);
                if let Err(error) = fs::rename(&self.tmp_file_path, &self.stable_file_path) {
                    warn!(message = "Error promoting recovered bookmark file.", %error);
                }
                return Ok(());
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => {
                warn!(message = "Discarding unreadable bookmark temp file.", %error);
                fs::remove_file(&self.tmp_file_path).ok();
            }
        }

        match self.read_entries(&self.stable_file_path) {
            Ok(entries) => {
                self.view.load_entries(entries);
                info!(
                    message = "Loaded bookmark data.",
                    source_id = %self.source_id,
                    entries = self.view.len(),
                );
                Ok(())
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => {
                warn!(
                    message = "Bookmark file malformed; starting from the configured initial position.",
                    source_id = %self.source_id,
                    %error,
                );
                Ok(())
            }
        }
    }

    fn read_entries(&self, path: &Path) -> io::Result<Vec<Entry>> {
        decode_entries(&fs::read(path)?)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use similar_asserts::assert_eq;
    use tempfile::tempdir;

    use super::{BookmarkPosition, BookmarkStore};
    use crate::FileId;

    fn pos(offset: u64, line: u64) -> BookmarkPosition {
        BookmarkPosition { offset, line }
    }

    #[test]
    fn advance_is_monotonic() {
        let data_dir = tempdir().unwrap();
        let store = Arc::new(BookmarkStore::new(data_dir.path(), "source1").unwrap());
        let handle = store.register(FileId::DevInode(1, 2));

        handle.advance(pos(100, 3));
        handle.advance(pos(50, 1));

        assert_eq!(store.get(FileId::DevInode(1, 2)), Some(pos(100, 3)));

        handle.advance(pos(150, 4));
        assert_eq!(store.get(FileId::DevInode(1, 2)), Some(pos(150, 4)));
    }

    #[test]
    fn restart_round_trip() {
        let data_dir = tempdir().unwrap();
        let file_id = FileId::DevInode(7, 42);

        {
            let store = Arc::new(BookmarkStore::new(data_dir.path(), "app-log").unwrap());
            store.register(file_id).advance(pos(1234, 10));
            store.persist().unwrap();
        }
        {
            let store = BookmarkStore::new(data_dir.path(), "app-log").unwrap();
            assert_eq!(store.get(file_id), None);
            store.load().unwrap();
            assert_eq!(store.get(file_id), Some(pos(1234, 10)));
        }
    }

    #[test]
    fn stores_are_namespaced_by_source() {
        let data_dir = tempdir().unwrap();
        let file_id = FileId::DevInode(1, 1);

        let a = Arc::new(BookmarkStore::new(data_dir.path(), "a").unwrap());
        let b = BookmarkStore::new(data_dir.path(), "b").unwrap();
        a.register(file_id).advance(pos(10, 1));
        a.persist().unwrap();
        b.persist().unwrap();

        let b2 = BookmarkStore::new(data_dir.path(), "b").unwrap();
        b2.load().unwrap();
        assert_eq!(b2.get(file_id), None);

        let a2 = BookmarkStore::new(data_dir.path(), "a").unwrap();
        a2.load().unwrap();
        assert_eq!(a2.get(file_id), Some(pos(10, 1)));
    }

    #[test]
    fn malformed_file_falls_back_to_empty() {
        let data_dir = tempdir().unwrap();
        std::fs::create_dir_all(data_dir.path().join("bookmarks")).unwrap();
        std::fs::write(
            data_dir.path().join("bookmarks").join("s.bm"),
            b"this is not a bookmark file",
        )
        .unwrap();

        let store = BookmarkStore::new(data_dir.path(), "s").unwrap();
        store.load().unwrap();
        assert!(store.view().is_empty());
    }

    #[test]
    fn truncated_file_falls_back_to_empty() {
        let data_dir = tempdir().unwrap();

        // Persist one entry, then chop bytes off the end of the file.
        let store = Arc::new(BookmarkStore::new(data_dir.path(), "s").unwrap());
        store.register(FileId::DevInode(1, 2)).advance(pos(10, 1));
        store.persist().unwrap();

        let path = data_dir.path().join("bookmarks").join("s.bm");
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 5]).unwrap();

        let store = BookmarkStore::new(data_dir.path(), "s").unwrap();
        store.load().unwrap();
        assert!(store.view().is_empty());
    }

    #[test]
    fn interrupted_persist_is_recovered() {
        let data_dir = tempdir().unwrap();
        let file_id = FileId::DevInode(3, 9);

        // Persist offset 10 to the stable file.
        let store = Arc::new(BookmarkStore::new(data_dir.path(), "s").unwrap());
        store.register(file_id).advance(pos(10, 1));
        store.persist().unwrap();

        // Simulate a crash that left a newer temp file behind: a scratch
        // store produces the offset-20 bytes the dying process would have
        // been renaming into place.
        let scratch_dir = tempdir().unwrap();
        let scratch = Arc::new(BookmarkStore::new(scratch_dir.path(), "s").unwrap());
        scratch.register(file_id).advance(pos(20, 2));
        scratch.persist().unwrap();
        std::fs::copy(
            scratch_dir.path().join("bookmarks").join("s.bm"),
            data_dir.path().join("bookmarks").join("s.bm.new"),
        )
        .unwrap();

        let store = BookmarkStore::new(data_dir.path(), "s").unwrap();
        store.load().unwrap();
        assert_eq!(store.get(file_id), Some(pos(20, 2)));
        assert!(!data_dir.path().join("bookmarks").join("s.bm.new").exists());
    }

    // guards against accidental changes to the on-disk bookmark layout
    #[test]
    fn binary_layout_is_stable() {
        let data_dir = tempdir().unwrap();
        let store = Arc::new(BookmarkStore::new(data_dir.path(), "s").unwrap());
        store.register(FileId::DevInode(1, 2)).advance(pos(1234, 5));
        store.persist().unwrap();

        let mut expected = vec![super::FORMAT_V1];
        expected.extend_from_slice(&1u64.to_le_bytes());
        for field in [1u64, 2, 1234, 5] {
            expected.extend_from_slice(&field.to_le_bytes());
        }

        let written = std::fs::read(data_dir.path().join("bookmarks").join("s.bm")).unwrap();
        assert_eq!(written, expected);
    }

    #[test]
    fn entries_persist_in_stable_order() {
        let data_dir = tempdir().unwrap();
        let store = Arc::new(BookmarkStore::new(data_dir.path(), "s").unwrap());
        store.register(FileId::DevInode(9, 9)).advance(pos(1, 1));
        store.register(FileId::DevInode(1, 1)).advance(pos(2, 1));
        store.persist().unwrap();
        let first = std::fs::read(data_dir.path().join("bookmarks").join("s.bm")).unwrap();

        // Re-persisting identical state writes identical bytes.
        let reloaded = Arc::new(BookmarkStore::new(data_dir.path(), "s").unwrap());
        reloaded.load().unwrap();
        reloaded.register(FileId::DevInode(5, 5)).advance(pos(3, 1));
        reloaded.persist().unwrap();
        let second = std::fs::read(data_dir.path().join("bookmarks").join("s.bm")).unwrap();

        let decoded = super::decode_entries(&second).unwrap();
        assert_eq!(decoded.len(), 3);
        assert!(decoded.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(super::decode_entries(&first).unwrap().len(), 2);
    }
}
