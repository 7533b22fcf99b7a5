//! SQL schema and pragma constants for the index database.
//!
//! The `parent` columns are STORED generated: `rtrim(rtrim(path,
//! replace(path, '/', '')), '/')` strips the final path segment (every
//! non-slash character of the string is in the trim set, so trimming stops
//! at the last separator). Root-level entries get `''`; the root dir itself
//! gets NULL so it never matches a parent filter.

pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value_int INTEGER,
    value_text TEXT
);

CREATE TABLE IF NOT EXISTS dirs (
    path TEXT PRIMARY KEY,
    parent TEXT GENERATED ALWAYS AS (
        CASE
            WHEN path = '' THEN NULL
            ELSE rtrim(rtrim(path, replace(path, '/', '')), '/')
        END
    ) STORED,
    num_subdirs INTEGER NOT NULL DEFAULT 0,
    num_files INTEGER NOT NULL DEFAULT 0,
    size_tree INTEGER NOT NULL DEFAULT 0,
    num_files_tree INTEGER NOT NULL DEFAULT 0,
    mode INTEGER,
    uid INTEGER,
    gid INTEGER,
    mtime_ns INTEGER
);

CREATE TABLE IF NOT EXISTS files (
    path TEXT PRIMARY KEY,
    parent TEXT GENERATED ALWAYS AS (
        rtrim(rtrim(path, replace(path, '/', '')), '/')
    ) STORED,
    shard INTEGER NOT NULL DEFAULT 0,
    offset INTEGER NOT NULL DEFAULT 0,
    size INTEGER NOT NULL DEFAULT 0,
    crc32c INTEGER,
    mode INTEGER,
    uid INTEGER,
    gid INTEGER,
    mtime_ns INTEGER
);
"#;

pub(crate) const INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_files_parent ON files(parent);
CREATE INDEX IF NOT EXISTS idx_files_shard_offset ON files(shard, offset);
CREATE INDEX IF NOT EXISTS idx_dirs_parent ON dirs(parent);
"#;

/// Pragmas applied to every connection.
pub(crate) const COMMON_PRAGMAS: &str = r#"
PRAGMA busy_timeout = 5000;
PRAGMA temp_store = MEMORY;
PRAGMA mmap_size = 30000000000;
"#;

/// Extra pragmas for read-only connections (large page cache for lookups).
pub(crate) const READONLY_PRAGMAS: &str = r#"
PRAGMA cache_size = -64000;
"#;

/// Column list shared by every file query, in [`file_from_row`] order.
pub(crate) const FILE_COLS: &str = "path, shard, offset, size, crc32c, mode, uid, gid, mtime_ns";

/// Column list shared by every dir query, in [`dir_from_row`] order.
pub(crate) const DIR_COLS: &str =
    "path, num_subdirs, num_files, size_tree, num_files_tree, mode, uid, gid, mtime_ns";

use crate::types::{DirInfo, FileInfo};

pub(crate) fn file_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileInfo> {
    Ok(FileInfo {
        path: row.get(0)?,
        shard: row.get::<_, i64>(1)? as usize,
        offset: row.get::<_, i64>(2)? as u64,
        size: row.get::<_, i64>(3)? as u64,
        crc32c: row.get::<_, Option<i64>>(4)?.map(|v| v as u32),
        mode: row.get::<_, Option<i64>>(5)?.map(|v| v as u32),
        uid: row.get::<_, Option<i64>>(6)?.map(|v| v as u32),
        gid: row.get::<_, Option<i64>>(7)?.map(|v| v as u32),
        mtime_ns: row.get(8)?,
    })
}

pub(crate) fn dir_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DirInfo> {
    Ok(DirInfo {
        path: row.get(0)?,
        num_subdirs: row.get::<_, i64>(1)?.max(0) as u64,
        num_files: row.get::<_, i64>(2)?.max(0) as u64,
        size_tree: row.get::<_, i64>(3)?.max(0) as u64,
        num_files_tree: row.get::<_, i64>(4)?.max(0) as u64,
        mode: row.get::<_, Option<i64>>(5)?.map(|v| v as u32),
        uid: row.get::<_, Option<i64>>(6)?.map(|v| v as u32),
        gid: row.get::<_, Option<i64>>(7)?.map(|v| v as u32),
        mtime_ns: row.get(8)?,
    })
}
