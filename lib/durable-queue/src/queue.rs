//! Bounded file-backed FIFO.
//!
//! Layout under the queue directory: one file per item named by its
//! zero-padded sequence number, plus an `index` file holding
//! `"<head> <tail>"` as two decimal integers. Enqueue writes the item file
//! first and the index second, so a crash between the two leaves a
//! straggler file the next open can reconcile. Item files start with a
//! one-byte format tag so the on-disk layout can evolve.

use std::{
    collections::BTreeSet,
    fs, io,
    io::Write,
    path::{Path, PathBuf},
};

use snafu::{ensure, ResultExt, Snafu};
use tracing::{info, warn};

/// On-disk format tag prepended to every item file.
const FORMAT_V1: u8 = 1;

const INDEX_FILE: &str = "index";
const INDEX_TMP_FILE: &str = "index.new";
const LOCK_FILE: &str = "lock";

pub type CodecError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Snafu)]
pub enum QueueError {
    #[snafu(display("queue I/O error at {path:?}: {source}"))]
    Io { path: PathBuf, source: io::Error },
    #[snafu(display("failed to serialize queue item: {source}"))]
    Serialize { source: CodecError },
    #[snafu(display("failed to deserialize queue item {index}: {source}"))]
    Deserialize { index: u64, source: CodecError },
    #[snafu(display("queue item {index} has unsupported format tag {tag}"))]
    UnknownFormat { index: u64, tag: u8 },
}

/// Pluggable per-item serialization.
pub trait ItemCodec<T>: Send {
    fn encode(&self, item: &T) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// Single-writer single-reader durable FIFO, bounded by `max_items`.
pub struct PersistentQueue<T> {
    directory: PathBuf,
    codec: Box<dyn ItemCodec<T>>,
    max_items: u64,
    head: u64,
    tail: u64,
}

impl<T> PersistentQueue<T> {
    /// Open (or create) the queue at `directory`. A missing or malformed
    /// index is rebuilt by scanning the directory for numerically named
    /// item files and taking the longest consecutive run; files beyond a
    /// gap are partial-crash stragglers and are removed.
    pub fn open(
        directory: impl Into<PathBuf>,
        max_items: u64,
        codec: Box<dyn ItemCodec<T>>,
    ) -> Result<Self, QueueError> {
        let directory = directory.into();
        fs::create_dir_all(&directory).context(IoSnafu { path: &directory })?;

        let lock_path = directory.join(LOCK_FILE);
        if lock_path.exists() {
            warn!(
                message = "Queue directory lock already present; assuming stale lock from a previous run.",
                path = ?directory,
            );
        }
        fs::write(&lock_path, std::process::id().to_string())
            .context(IoSnafu { path: &lock_path })?;

        let mut queue = PersistentQueue {
            directory,
            codec,
            max_items,
            head: 0,
            tail: 0,
        };

        match queue.read_index() {
            Ok(Some((head, tail))) if head <= tail => {
                queue.head = head;
                queue.tail = tail;
            }
            Ok(_) | Err(_) => queue.rebuild_index()?,
        }

        Ok(queue)
    }

    pub fn len(&self) -> u64 {
        self.tail - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn max_items(&self) -> u64 {
        self.max_items
    }

    /// Append an item, or report `false` without touching the queue when
    /// it is full.
    pub fn try_enqueue(&mut self, item: &T) -> Result<bool, QueueError> {
        if self.len() >= self.max_items {
            return Ok(false);
        }

        let encoded = self.codec.encode(item).context(SerializeSnafu)?;
        let path = self.item_path(self.tail);
        let mut file = fs::File::create(&path).context(IoSnafu { path: &path })?;
        file.write_all(&[FORMAT_V1]).context(IoSnafu { path: &path })?;
        file.write_all(&encoded).context(IoSnafu { path: &path })?;
        file.sync_all().context(IoSnafu { path: &path })?;

        self.write_index(self.head, self.tail + 1)?;
        self.tail += 1;
        Ok(true)
    }

    /// Pop the oldest item. A corrupt item file is removed and skipped so
    /// one bad record cannot wedge the queue; the error is still surfaced
    /// for accounting.
    pub fn dequeue(&mut self) -> Result<Option<T>, QueueError> {
        if self.is_empty() {
            return Ok(None);
        }

        let index = self.head;
        let path = self.item_path(index);
        let result = self.read_item(index, &path);

        fs::remove_file(&path).ok();
        self.write_index(self.head + 1, self.tail)?;
        self.head += 1;

        result.map(Some)
    }

    fn read_item(&self, index: u64, path: &Path) -> Result<T, QueueError> {
        let bytes = fs::read(path).context(IoSnafu { path })?;
        ensure!(
            bytes.first() == Some(&FORMAT_V1),
            UnknownFormatSnafu {
                index,
                tag: bytes.first().copied().unwrap_or(0),
            }
        );
        self.codec
            .decode(&bytes[1..])
            .context(DeserializeSnafu { index })
    }

    fn item_path(&self, index: u64) -> PathBuf {
        self.directory.join(format!("{index:08}"))
    }

    fn read_index(&self) -> Result<Option<(u64, u64)>, QueueError> {
        let path = self.directory.join(INDEX_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(QueueError::Io { path, source }),
        };
        let mut parts = content.split_whitespace();
        let head = parts.next().and_then(|p| p.parse::<u64>().ok());
        let tail = parts.next().and_then(|p| p.parse::<u64>().ok());
        match (head, tail, parts.next()) {
            (Some(head), Some(tail), None) => Ok(Some((head, tail))),
            _ => Ok(None),
        }
    }

    fn write_index(&self, head: u64, tail: u64) -> Result<(), QueueError> {
        let tmp = self.directory.join(INDEX_TMP_FILE);
        let stable = self.directory.join(INDEX_FILE);
        let mut file = fs::File::create(&tmp).context(IoSnafu { path: &tmp })?;
        file.write_all(format!("{head} {tail}").as_bytes())
            .context(IoSnafu { path: &tmp })?;
        file.sync_all().context(IoSnafu { path: &tmp })?;
        fs::rename(&tmp, &stable).context(IoSnafu { path: &stable })?;
        Ok(())
    }

    /// Reconstruct head/tail from the item files actually on disk.
    fn rebuild_index(&mut self) -> Result<(), QueueError> {
        let mut indices = BTreeSet::new();
        let entries = fs::read_dir(&self.directory).context(IoSnafu {
            path: &self.directory,
        })?;
        for entry in entries {
            let entry = entry.context(IoSnafu {
                path: &self.directory,
            })?;
            if let Some(index) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u64>().ok())
            {
                indices.insert(index);
            }
        }

        let Some(&head) = indices.first() else {
            self.head = 0;
            self.tail = 0;
            self.write_index(0, 0)?;
            return Ok(());
        };

        // Keep the longest consecutive run from the head; anything past a
        // gap was written after a partial crash and is unreachable.
        let mut tail = head;
        for &index in &indices {
            if index == tail {
                tail += 1;
            } else {
                warn!(
                    message = "Removing non-consecutive queue item left by a partial crash.",
                    index,
                );
                fs::remove_file(self.item_path(index)).ok();
            }
        }

        info!(
            message = "Rebuilt queue index from directory scan.",
            path = ?self.directory,
            head,
            tail,
        );
        self.head = head;
        self.tail = tail;
        self.write_index(head, tail)
    }
}

impl<T> Drop for PersistentQueue<T> {
    fn drop(&mut self) {
        fs::remove_file(self.directory.join(LOCK_FILE)).ok();
    }
}

#[cfg(test)]
mod test {
    use serde::{Deserialize, Serialize};
    use tempfile::tempdir;

    use super::{ItemCodec, PersistentQueue};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        id: u64,
        body: String,
    }

    struct JsonCodec;

    impl ItemCodec<Item> for JsonCodec {
        fn encode(&self, item: &Item) -> Result<Vec<u8>, super::CodecError> {
            Ok(serde_json::to_vec(item)?)
        }

        fn decode(&self, bytes: &[u8]) -> Result<Item, super::CodecError> {
            Ok(serde_json::from_slice(bytes)?)
        }
    }

    fn item(id: u64) -> Item {
        Item {
            id,
            body: format!("body-{id}"),
        }
    }

    fn open(path: &std::path::Path, max_items: u64) -> PersistentQueue<Item> {
        PersistentQueue::open(path, max_items, Box::new(JsonCodec)).unwrap()
    }

    #[test]
    fn round_trip_preserves_order() {
        let dir = tempdir().unwrap();
        let mut queue = open(dir.path(), 16);

        for id in 0..5 {
            assert!(queue.try_enqueue(&item(id)).unwrap());
        }
        assert_eq!(queue.len(), 5);

        for id in 0..5 {
            assert_eq!(queue.dequeue().unwrap(), Some(item(id)));
        }
        assert_eq!(queue.dequeue().unwrap(), None);
    }

    #[test]
    fn full_queue_rejects_without_modification() {
        let dir = tempdir().unwrap();
        let mut queue = open(dir.path(), 3);

        for id in 0..3 {
            assert!(queue.try_enqueue(&item(id)).unwrap());
        }
        assert!(!queue.try_enqueue(&item(99)).unwrap());
        assert_eq!(queue.len(), 3);

        // Draining yields only the accepted items, in order.
        for id in 0..3 {
            assert_eq!(queue.dequeue().unwrap(), Some(item(id)));
        }
    }

    #[test]
    fn reopen_preserves_contents() {
        let dir = tempdir().unwrap();
        {
            let mut queue = open(dir.path(), 5);
            for id in 0..3 {
                assert!(queue.try_enqueue(&item(id)).unwrap());
            }
        }
        let mut queue = open(dir.path(), 5);
        assert_eq!(queue.len(), 3);
        for id in 0..3 {
            assert_eq!(queue.dequeue().unwrap(), Some(item(id)));
        }
    }

    #[test]
    fn crash_between_item_write_and_index_update() {
        let dir = tempdir().unwrap();
        {
            let mut queue = open(dir.path(), 8);
            for id in 0..2 {
                assert!(queue.try_enqueue(&item(id)).unwrap());
            }
            // Simulate the crash: item 2 landed on disk but the index was
            // never rewritten.
            let body = [&[super::FORMAT_V1][..], &serde_json::to_vec(&item(2)).unwrap()].concat();
            std::fs::write(dir.path().join("00000002"), body).unwrap();
        }

        let mut queue = open(dir.path(), 8);
        // Index says two items; the straggler is invisible until a rebuild.
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dequeue().unwrap(), Some(item(0)));
        assert_eq!(queue.dequeue().unwrap(), Some(item(1)));
    }

    #[test]
    fn corrupt_index_is_rebuilt_from_files() {
        let dir = tempdir().unwrap();
        {
            let mut queue = open(dir.path(), 8);
            for id in 0..4 {
                assert!(queue.try_enqueue(&item(id)).unwrap());
            }
            queue.dequeue().unwrap();
        }
        std::fs::write(dir.path().join("index"), b"not numbers").unwrap();

        let mut queue = open(dir.path(), 8);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dequeue().unwrap(), Some(item(1)));
        assert_eq!(queue.dequeue().unwrap(), Some(item(2)));
        assert_eq!(queue.dequeue().unwrap(), Some(item(3)));
    }

    #[test]
    fn rebuild_discards_items_past_a_gap() {
        let dir = tempdir().unwrap();
        {
            let mut queue = open(dir.path(), 8);
            for id in 0..3 {
                assert!(queue.try_enqueue(&item(id)).unwrap());
            }
        }
        // Lose the middle item and the index, then reopen.
        std::fs::remove_file(dir.path().join("00000001")).unwrap();
        std::fs::remove_file(dir.path().join("index")).unwrap();

        let mut queue = open(dir.path(), 8);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dequeue().unwrap(), Some(item(0)));
        assert_eq!(queue.dequeue().unwrap(), None);
        assert!(!dir.path().join("00000002").exists());
    }

    #[test]
    fn corrupt_item_is_skipped_with_error() {
        let dir = tempdir().unwrap();
        {
            let mut queue = open(dir.path(), 8);
            assert!(queue.try_enqueue(&item(0)).unwrap());
            assert!(queue.try_enqueue(&item(1)).unwrap());
        }
        std::fs::write(dir.path().join("00000000"), [super::FORMAT_V1, b'{']).unwrap();

        let mut queue = open(dir.path(), 8);
        assert!(queue.dequeue().is_err());
        // The bad item is consumed; the next one is intact.
        assert_eq!(queue.dequeue().unwrap(), Some(item(1)));
    }

    #[test]
    fn quickcheck_round_trip() {
        fn prop(bodies: Vec<String>) -> bool {
            let dir = tempdir().unwrap();
            let mut queue: PersistentQueue<Item> =
                PersistentQueue::open(dir.path(), bodies.len() as u64 + 1, Box::new(JsonCodec))
                    .unwrap();
            let items: Vec<Item> = bodies
                .into_iter()
                .enumerate()
                .map(|(id, body)| Item { id: id as u64, body })
                .collect();
            for item in &items {
                if !queue.try_enqueue(item).unwrap() {
                    return false;
                }
            }
            let mut drained = Vec::new();
            while let Some(item) = queue.dequeue().unwrap() {
                drained.push(item);
            }
            drained == items
        }
        quickcheck::quickcheck(prop as fn(Vec<String>) -> bool);
    }
}
