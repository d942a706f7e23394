#![deny(clippy::all)]

//! Bookmarked directory tailer.
//!
//! Discovers files under a directory with glob filters, follows them across
//! rotation and rename, parses timestamped records, and persists read
//! positions so a restart resumes exactly where the previous process left
//! off. The unit of identity is the [`FileId`], a stable OS-level handle,
//! so a rename never restarts a file from scratch.

pub mod bookmarks;
pub mod buffer;
mod harvester;
mod metadata_ext;
pub mod parser;
mod paths;
mod watcher;

pub use self::bookmarks::{BookmarkHandle, BookmarkStore, BookmarkView};
pub use self::harvester::{Harvester, HarvesterConfig, HarvesterError, TailedRecord};
pub use self::metadata_ext::PortableFileExt;
pub use self::paths::GlobPaths;
pub use self::watcher::{FileWatcher, RawLine};

use chrono::{DateTime, Utc};

/// Byte offset within a followed file.
pub type FilePosition = u64;

/// Stable identity of a file, independent of its path.
///
/// On Unix this is `(device, inode)`; on Windows the volume serial number
/// and file index play the same role. Two paths with the same `FileId` are
/// the same file; a path whose `FileId` changes has been replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FileId {
    DevInode(u64, u64),
}

impl FileId {
    pub fn of(file: &std::fs::File) -> std::io::Result<Self> {
        Ok(FileId::DevInode(file.portable_dev()?, file.portable_ino()?))
    }
}

/// Where to begin reading a file seen for the first time.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum InitialPosition {
    /// Read the whole file from offset zero.
    Beginning,
    /// Skip existing content and read only new bytes.
    End,
    /// Resume from a saved bookmark, falling back to the beginning when no
    /// bookmark exists for the file.
    #[default]
    Bookmark,
    /// Skip records whose parsed timestamp is earlier than the given time.
    Timestamp(DateTime<Utc>),
}

/// Resolved per-file read start, after bookmarks have been consulted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReadFrom {
    Beginning,
    End,
    Checkpoint(FilePosition),
}
