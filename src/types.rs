//! Entry metadata types shared between the index, the store, and callers.

use crate::error::Result;
use crate::paths;

/// Sentinel meaning "no shard size limit". Stored verbatim in the index
/// config so archives written by other implementations compare equal.
pub const SHARD_SIZE_UNLIMITED: u64 = i64::MAX as u64;

/// Major schema version. A mismatch here requires running the upgrader.
pub const SCHEMA_VERSION_MAJOR: i64 = 0;
/// Minor schema version. Newer minors in the database are tolerated.
pub const SCHEMA_VERSION_MINOR: i64 = 3;

/// Metadata of one stored file: its placement inside the shards plus
/// POSIX-style attributes. Used both when reading existing entries and when
/// adding new ones.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    /// Normalized archive path.
    pub path: String,
    /// Shard number holding the payload.
    pub shard: usize,
    /// Byte offset of the payload within the shard.
    pub offset: u64,
    /// Payload size in bytes.
    pub size: u64,
    /// CRC-32C (Castagnoli) of the payload, if recorded.
    pub crc32c: Option<u32>,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Last modification time in nanoseconds since the Unix epoch.
    pub mtime_ns: Option<i64>,
}

impl FileInfo {
    /// A fresh record for `path` with no placement yet. Fails when the
    /// path cannot be normalized (a `..` escaping the root).
    pub fn new(path: &str) -> Result<Self> {
        Ok(FileInfo {
            path: paths::normalize(path)?,
            shard: 0,
            offset: 0,
            size: 0,
            crc32c: None,
            mode: None,
            uid: None,
            gid: None,
            mtime_ns: None,
        })
    }

    /// One past the last byte of the payload within its shard.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Parent directory path.
    pub fn parent(&self) -> &str {
        paths::parent(&self.path).unwrap_or("")
    }
}

/// Metadata of one directory, including the maintained aggregate columns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirInfo {
    /// Normalized archive path; empty string is the root.
    pub path: String,
    /// Number of immediate subdirectories.
    pub num_subdirs: u64,
    /// Number of immediate files.
    pub num_files: u64,
    /// Total size of all files in the subtree, in bytes.
    pub size_tree: u64,
    /// Total number of files in the subtree.
    pub num_files_tree: u64,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mtime_ns: Option<i64>,
}

impl DirInfo {
    /// A fresh record for `path`. Fails when the path cannot be
    /// normalized (a `..` escaping the root).
    pub fn new(path: &str) -> Result<Self> {
        Ok(DirInfo {
            path: paths::normalize(path)?,
            num_subdirs: 0,
            num_files: 0,
            size_tree: 0,
            num_files_tree: 0,
            mode: None,
            uid: None,
            gid: None,
            mtime_ns: None,
        })
    }

    /// Immediate entry count (files plus subdirectories).
    pub fn num_entries(&self) -> u64 {
        self.num_subdirs + self.num_files
    }
}

/// A file or directory entry, as returned by mixed lookups and listings.
#[derive(Clone, Debug)]
pub enum EntryInfo {
    File(FileInfo),
    Dir(DirInfo),
}

impl EntryInfo {
    pub fn path(&self) -> &str {
        match self {
            EntryInfo::File(f) => &f.path,
            EntryInfo::Dir(d) => &d.path,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, EntryInfo::File(_))
    }

    pub fn as_file(&self) -> Option<&FileInfo> {
        match self {
            EntryInfo::File(f) => Some(f),
            EntryInfo::Dir(_) => None,
        }
    }
}

/// Row ordering for listings and iteration.
///
/// `Any` is SQLite's natural order, which streams without sorting and is
/// typically address order for linearly built archives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Order {
    Any,
    Random,
    /// By `(shard, offset)` ascending.
    Address,
    /// By `(shard, offset)` descending.
    AddressDesc,
    /// Alphabetical by path.
    Path,
    PathDesc,
}

impl Order {
    /// The ORDER BY clause for this ordering (empty for `Any`).
    pub(crate) fn as_sql(self) -> &'static str {
        match self {
            Order::Any => "",
            Order::Random => " ORDER BY RANDOM()",
            Order::Address => " ORDER BY shard, offset",
            Order::AddressDesc => " ORDER BY shard DESC, offset DESC",
            Order::Path => " ORDER BY path",
            Order::PathDesc => " ORDER BY path DESC",
        }
    }
}
