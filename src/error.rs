//! Error types for Barecat archives.

use std::path::PathBuf;

/// Errors surfaced by archive operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("file already exists: {0}")]
    FileExists(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// A single payload cannot fit into any shard under the current limit.
    #[error("file of size {size} is too large to fit into a shard (shard_size_limit={limit})")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("not enough space: {0}")]
    NotEnoughSpace(String),

    /// Structurally invalid request, e.g. renaming the archive root.
    #[error("{0}")]
    InvalidArgument(String),

    /// CRC mismatch, overlapping placements, short shard files, stat drift.
    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("operation not allowed on a read-only archive")]
    ReadOnly,

    #[error("operation not allowed on an append-only archive")]
    AppendOnly,

    /// Index schema version is incompatible with this build.
    #[error("schema error: {0}")]
    Schema(String),

    /// Writing through a symlinked shard would desync the archive the
    /// symlink points into.
    #[error("shard file {0} is a symlink; refusing to write through it")]
    SymlinkedShard(PathBuf),

    /// Another process holds the write lock on the index.
    #[error("archive is locked by another writer: {0}")]
    Locked(PathBuf),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
