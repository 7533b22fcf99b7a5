//! The embedded metadata index of a Barecat archive.
//!
//! One SQLite database holds the `files`, `dirs` and `config` tables. Every
//! file row records where its payload lives (`shard`, `offset`, `size`) and
//! every dir row carries maintained aggregates (`num_files`, `num_subdirs`,
//! `num_files_tree`, `size_tree`). The index is the authority on logical
//! archive content; shard files are raw payload bytes only.

mod glob;
mod schema;
mod stats;
mod walk;

pub use glob::GlobRule;
pub use walk::Walk;

use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};

use crate::error::{Error, Result};
use crate::paths;
use crate::types::{
    DirInfo, EntryInfo, FileInfo, Order, SCHEMA_VERSION_MAJOR, SCHEMA_VERSION_MINOR,
    SHARD_SIZE_UNLIMITED,
};

use schema::{DIR_COLS, FILE_COLS, dir_from_row, file_from_row};

/// Partial update of a file row; `None` fields keep their current value.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileMetaUpdate {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mtime_ns: Option<i64>,
}

/// Metadata index of one archive.
#[derive(Debug)]
pub struct Index {
    conn: Connection,
    path: PathBuf,
    readonly: bool,
    shard_size_limit_cache: Cell<Option<u64>>,
}

pub(crate) fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

pub(crate) fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl Index {
    /// Open or create the index database at `path`.
    ///
    /// A new database gets the full schema, default config and the root dir
    /// row. An existing one is checked for schema compatibility per the
    /// version rules (major must match, newer minor is tolerated with a
    /// warning).
    pub fn open(path: &Path, readonly: bool, wal: bool) -> Result<Index> {
        // A zero-length file counts as new: taking the writer lock creates
        // the index file before SQLite ever writes a header to it.
        let is_new = match std::fs::metadata(path) {
            Ok(meta) => meta.len() == 0,
            Err(_) => true,
        };
        let conn = if readonly {
            if is_new {
                return Err(Error::FileNotFound(path.display().to_string()));
            }
            Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        } else {
            Connection::open(path)?
        };

        conn.execute_batch(schema::COMMON_PRAGMAS)?;
        if readonly {
            conn.execute_batch(schema::READONLY_PRAGMAS)?;
        } else if wal {
            conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        }

        let index = Index {
            conn,
            path: path.to_path_buf(),
            readonly,
            shard_size_limit_cache: Cell::new(None),
        };

        if is_new {
            index.create_schema()?;
        } else {
            index.check_schema_version()?;
        }
        Ok(index)
    }

    fn create_schema(&self) -> Result<()> {
        self.conn.execute_batch(schema::SCHEMA)?;
        self.conn.execute_batch(schema::INDEXES)?;
        self.conn.execute(
            "INSERT OR IGNORE INTO config (key, value_int) VALUES ('shard_size_limit', ?1)",
            params![SHARD_SIZE_UNLIMITED as i64],
        )?;
        self.conn.execute(
            "INSERT OR IGNORE INTO config (key, value_int) VALUES ('schema_version_major', ?1)",
            params![SCHEMA_VERSION_MAJOR],
        )?;
        self.conn.execute(
            "INSERT OR IGNORE INTO config (key, value_int) VALUES ('schema_version_minor', ?1)",
            params![SCHEMA_VERSION_MINOR],
        )?;
        self.conn.execute(
            "INSERT OR IGNORE INTO config (key, value_int) VALUES ('use_triggers', 1)",
            [],
        )?;
        self.conn.execute(
            "INSERT OR IGNORE INTO dirs (path, mtime_ns) VALUES ('', ?1)",
            params![now_ns()],
        )?;
        Ok(())
    }

    fn check_schema_version(&self) -> Result<()> {
        // A database without a config table or version rows predates
        // versioning; treat it as one major version behind.
        let (db_major, db_minor) = match self.get_config_int("schema_version_major") {
            Ok(Some(major)) => {
                let minor = self.get_config_int("schema_version_minor")?.unwrap_or(0);
                (major, minor)
            }
            Ok(None) => (SCHEMA_VERSION_MAJOR - 1, 0),
            Err(_) => (SCHEMA_VERSION_MAJOR - 1, 0),
        };

        if db_major > SCHEMA_VERSION_MAJOR {
            return Err(Error::Schema(format!(
                "index schema {db_major}.{db_minor} is newer than supported \
                 {SCHEMA_VERSION_MAJOR}.{SCHEMA_VERSION_MINOR}; upgrade this library"
            )));
        }
        if db_major < SCHEMA_VERSION_MAJOR {
            return Err(Error::Schema(format!(
                "index schema {db_major}.{db_minor} is older than supported \
                 {SCHEMA_VERSION_MAJOR}.{SCHEMA_VERSION_MINOR}; run the schema upgrader"
            )));
        }
        if db_minor > SCHEMA_VERSION_MINOR {
            warn!(
                "index schema {db_major}.{db_minor} is newer than supported \
                 {SCHEMA_VERSION_MAJOR}.{SCHEMA_VERSION_MINOR}; some features may not work"
            );
        } else if db_minor < SCHEMA_VERSION_MINOR {
            warn!(
                "index schema is outdated ({db_major}.{db_minor} < \
                 {SCHEMA_VERSION_MAJOR}.{SCHEMA_VERSION_MINOR}); consider upgrading the archive"
            );
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn get_config_int(&self, key: &str) -> Result<Option<i64>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT value_int FROM config WHERE key = ?1")?;
        Ok(stmt.query_row(params![key], |row| row.get(0)).optional()?)
    }

    pub(crate) fn set_config_int(&self, key: &str, value: i64) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO config (key, value_int) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value_int = excluded.value_int",
        )?;
        stmt.execute(params![key, value])?;
        Ok(())
    }

    // ---- Reading ----

    /// Look up a file by path.
    pub fn lookup_file(&self, path: &str) -> Result<FileInfo> {
        let path = paths::normalize(path)?;
        let sql = format!("SELECT {FILE_COLS} FROM files WHERE path = ?1");
        let mut stmt = self.conn.prepare_cached(&sql)?;
        stmt.query_row(params![path], file_from_row)
            .optional()?
            .ok_or(Error::FileNotFound(path))
    }

    /// Look up a directory by path.
    pub fn lookup_dir(&self, path: &str) -> Result<DirInfo> {
        let path = paths::normalize(path)?;
        let sql = format!("SELECT {DIR_COLS} FROM dirs WHERE path = ?1");
        let mut stmt = self.conn.prepare_cached(&sql)?;
        stmt.query_row(params![path], dir_from_row)
            .optional()?
            .ok_or(Error::FileNotFound(path))
    }

    /// Look up a file or directory by path.
    pub fn lookup(&self, path: &str) -> Result<EntryInfo> {
        match self.lookup_file(path) {
            Ok(finfo) => Ok(EntryInfo::File(finfo)),
            Err(Error::FileNotFound(_)) => Ok(EntryInfo::Dir(self.lookup_dir(path)?)),
            Err(e) => Err(e),
        }
    }

    pub fn isfile(&self, path: &str) -> Result<bool> {
        let path = paths::normalize(path)?;
        let mut stmt = self
            .conn
            .prepare_cached("SELECT 1 FROM files WHERE path = ?1")?;
        Ok(stmt.exists(params![path])?)
    }

    pub fn isdir(&self, path: &str) -> Result<bool> {
        let path = paths::normalize(path)?;
        let mut stmt = self
            .conn
            .prepare_cached("SELECT 1 FROM dirs WHERE path = ?1")?;
        Ok(stmt.exists(params![path])?)
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.isfile(path)? || self.isdir(path)?)
    }

    /// Number of files in the archive (root subtree count).
    pub fn num_files(&self) -> Result<u64> {
        Ok(self.lookup_dir("")?.num_files_tree)
    }

    /// Number of directories in the archive, including the root.
    pub fn num_dirs(&self) -> Result<u64> {
        let mut stmt = self.conn.prepare_cached("SELECT COUNT(*) FROM dirs")?;
        let n: i64 = stmt.query_row([], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }

    /// Total size of all stored files, in bytes.
    pub fn total_size(&self) -> Result<u64> {
        Ok(self.lookup_dir("")?.size_tree)
    }

    /// All file records, in the requested order.
    pub fn all_fileinfos(&self, order: Order) -> Result<Vec<FileInfo>> {
        let sql = format!("SELECT {FILE_COLS} FROM files{}", order.as_sql());
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map([], file_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Stream all file records through `f` without materializing them.
    pub fn for_each_fileinfo(
        &self,
        order: Order,
        mut f: impl FnMut(FileInfo) -> Result<()>,
    ) -> Result<()> {
        let sql = format!("SELECT {FILE_COLS} FROM files{}", order.as_sql());
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            f(file_from_row(row)?)?;
        }
        Ok(())
    }

    pub fn all_dirinfos(&self, order: Order) -> Result<Vec<DirInfo>> {
        let sql = format!("SELECT {DIR_COLS} FROM dirs{}", order.as_sql());
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map([], dir_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn all_filepaths(&self, order: Order) -> Result<Vec<String>> {
        let sql = format!("SELECT path FROM files{}", order.as_sql());
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn all_dirpaths(&self, order: Order) -> Result<Vec<String>> {
        let sql = format!("SELECT path FROM dirs{}", order.as_sql());
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn all_paths(&self, order: Order) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT path FROM dirs UNION ALL SELECT path FROM files{}",
            order.as_sql()
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ---- Listing ----

    /// Files directly inside `dirpath` (non-recursive).
    pub fn list_direct_fileinfos(&self, dirpath: &str, order: Order) -> Result<Vec<FileInfo>> {
        let dirpath = paths::normalize(dirpath)?;
        let sql = format!(
            "SELECT {FILE_COLS} FROM files WHERE parent = ?1{}",
            order.as_sql()
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![dirpath], file_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Immediate subdirectories of `dirpath`.
    pub fn list_subdir_dirinfos(&self, dirpath: &str, order: Order) -> Result<Vec<DirInfo>> {
        let dirpath = paths::normalize(dirpath)?;
        let sql = format!(
            "SELECT {DIR_COLS} FROM dirs WHERE parent = ?1{}",
            order.as_sql()
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![dirpath], dir_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Names of all entries directly inside `dirpath`.
    pub fn listdir_names(&self, dirpath: &str, order: Order) -> Result<Vec<String>> {
        let dirpath = paths::normalize(dirpath)?;
        if !self.isdir(&dirpath)? {
            return Err(Error::FileNotFound(dirpath));
        }
        let sql = format!(
            "SELECT path FROM dirs WHERE parent = :parent
             UNION ALL
             SELECT path FROM files WHERE parent = :parent{}",
            order.as_sql()
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(rusqlite::named_params! {":parent": dirpath}, |row| {
            row.get::<_, String>(0)
        })?;
        let mut names = Vec::new();
        for row in rows {
            names.push(paths::basename(&row?).to_string());
        }
        Ok(names)
    }

    /// All entries directly inside `dirpath`, subdirectories first.
    pub fn listdir_infos(&self, dirpath: &str, order: Order) -> Result<Vec<EntryInfo>> {
        let mut out: Vec<EntryInfo> = self
            .list_subdir_dirinfos(dirpath, order)?
            .into_iter()
            .map(EntryInfo::Dir)
            .collect();
        out.extend(
            self.list_direct_fileinfos(dirpath, order)?
                .into_iter()
                .map(EntryInfo::File),
        );
        Ok(out)
    }

    /// Lazy depth-first walk from `root`.
    pub fn walk(&self, root: &str) -> Result<Walk<'_>> {
        let rootinfo = self.lookup_dir(root)?;
        Ok(Walk::new(self, rootinfo))
    }

    /// The file with the highest `(shard, offset)` address, if any.
    pub fn last_fileinfo(&self) -> Result<Option<FileInfo>> {
        let sql = format!(
            "SELECT {FILE_COLS} FROM files ORDER BY shard DESC, offset DESC LIMIT 1"
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        Ok(stmt.query_row([], file_from_row).optional()?)
    }

    /// One past the last byte of the last file in `shard` (0 when empty).
    pub fn logical_shard_end(&self, shard: usize) -> Result<u64> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT coalesce(MAX(offset + size), 0) FROM files WHERE shard = ?1",
        )?;
        let end: i64 = stmt.query_row(params![shard as i64], |row| row.get(0))?;
        Ok(end.max(0) as u64)
    }

    /// Highest shard number referenced by any file, plus one.
    pub fn num_used_shards(&self) -> Result<usize> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT coalesce(MAX(shard), -1) + 1 FROM files")?;
        let n: i64 = stmt.query_row([], |row| row.get(0))?;
        Ok(n.max(0) as usize)
    }

    /// The configured shard size limit (cached after the first read).
    pub fn shard_size_limit(&self) -> Result<u64> {
        if let Some(limit) = self.shard_size_limit_cache.get() {
            return Ok(limit);
        }
        let limit = self
            .get_config_int("shard_size_limit")?
            .unwrap_or(SHARD_SIZE_UNLIMITED as i64) as u64;
        self.shard_size_limit_cache.set(Some(limit));
        Ok(limit)
    }

    /// Change the shard size limit. Shrinking below the size of an existing
    /// shard is refused; reshard the archive instead.
    pub fn set_shard_size_limit(&self, limit: u64) -> Result<()> {
        if self.readonly {
            return Err(Error::ReadOnly);
        }
        let current = self.shard_size_limit()?;
        if limit == current {
            return Ok(());
        }
        if limit < current {
            let mut largest = 0;
            for shard in 0..self.num_used_shards()? {
                largest = largest.max(self.logical_shard_end(shard)?);
            }
            if limit < largest {
                return Err(Error::InvalidArgument(format!(
                    "shard size limit {limit} is smaller than the largest existing shard \
                     ({largest} bytes); reshard the archive first"
                )));
            }
        }
        self.set_config_int("shard_size_limit", limit as i64)?;
        self.shard_size_limit_cache.set(Some(limit));
        Ok(())
    }

    // ---- Writing ----

    /// Insert a new file row, creating missing ancestor directories and
    /// propagating aggregates.
    pub fn add_file(&self, finfo: &FileInfo) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        self.insert_file_row(finfo)?;
        tx.commit()?;
        Ok(())
    }

    /// Insert many file rows in one transaction.
    pub fn add_files(&self, finfos: &[FileInfo]) -> Result<()> {
        if finfos.is_empty() {
            return Ok(());
        }
        let tx = self.conn.unchecked_transaction()?;
        for finfo in finfos {
            self.insert_file_row(finfo)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn insert_file_row(&self, finfo: &FileInfo) -> Result<()> {
        if self.isdir(&finfo.path)? {
            return Err(Error::IsADirectory(finfo.path.clone()));
        }
        let tracked = self.stats_enabled()?;
        if tracked {
            self.ensure_dir_chain(finfo.parent())?;
        }
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO files (path, shard, offset, size, crc32c, mode, uid, gid, mtime_ns)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        stmt.execute(params![
            finfo.path,
            finfo.shard as i64,
            finfo.offset as i64,
            finfo.size as i64,
            finfo.crc32c.map(|v| v as i64),
            finfo.mode.map(|v| v as i64),
            finfo.uid.map(|v| v as i64),
            finfo.gid.map(|v| v as i64),
            finfo.mtime_ns,
        ])
        .map_err(|e| {
            if is_constraint_violation(&e) {
                Error::FileExists(finfo.path.clone())
            } else {
                Error::Sqlite(e)
            }
        })?;
        if tracked {
            self.stats_file_added(finfo.parent(), finfo.size)?;
        }
        Ok(())
    }

    /// Move a file row to a new shard address without touching its size or
    /// checksum. Used by defrag, reshard and relocating updates.
    pub fn update_placement(&self, path: &str, shard: usize, offset: u64) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("UPDATE files SET shard = ?2, offset = ?3 WHERE path = ?1")?;
        let n = stmt.execute(params![path, shard as i64, offset as i64])?;
        if n == 0 {
            return Err(Error::FileNotFound(path.to_string()));
        }
        Ok(())
    }

    /// Rewrite a file row's placement, size and checksum after its payload
    /// changed, propagating the size delta up the ancestor chain.
    pub fn update_contents(
        &self,
        path: &str,
        shard: usize,
        offset: u64,
        size: u64,
        crc32c: Option<u32>,
    ) -> Result<()> {
        let old = self.lookup_file(path)?;
        let tx = self.conn.unchecked_transaction()?;
        let mut stmt = self.conn.prepare_cached(
            "UPDATE files SET shard = ?2, offset = ?3, size = ?4, crc32c = ?5 WHERE path = ?1",
        )?;
        stmt.execute(params![
            old.path,
            shard as i64,
            offset as i64,
            size as i64,
            crc32c.map(|v| v as i64),
        ])?;
        if self.stats_enabled()? && size != old.size {
            self.stats_file_resized(old.parent(), size as i64 - old.size as i64)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Update POSIX-style metadata fields of a file row.
    pub fn update_file_metadata(&self, path: &str, meta: &FileMetaUpdate) -> Result<()> {
        let path = paths::normalize(path)?;
        let mut stmt = self.conn.prepare_cached(
            "UPDATE files SET
                 mode = coalesce(?2, mode),
                 uid = coalesce(?3, uid),
                 gid = coalesce(?4, gid),
                 mtime_ns = coalesce(?5, mtime_ns)
             WHERE path = ?1",
        )?;
        let n = stmt.execute(params![
            path,
            meta.mode.map(|v| v as i64),
            meta.uid.map(|v| v as i64),
            meta.gid.map(|v| v as i64),
            meta.mtime_ns,
        ])?;
        if n == 0 {
            return Err(Error::FileNotFound(path));
        }
        Ok(())
    }

    /// Insert a directory row. With `exist_ok`, an existing directory has
    /// its metadata updated instead.
    pub fn add_dir(&self, dinfo: &DirInfo, exist_ok: bool) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        self.insert_dir_row(dinfo, exist_ok)?;
        tx.commit()?;
        Ok(())
    }

    fn insert_dir_row(&self, dinfo: &DirInfo, exist_ok: bool) -> Result<()> {
        if self.isfile(&dinfo.path)? {
            return Err(Error::NotADirectory(dinfo.path.clone()));
        }
        if self.isdir(&dinfo.path)? {
            if !exist_ok {
                return Err(Error::FileExists(dinfo.path.clone()));
            }
            let mut stmt = self.conn.prepare_cached(
                "UPDATE dirs SET
                     mode = coalesce(?2, mode),
                     uid = coalesce(?3, uid),
                     gid = coalesce(?4, gid),
                     mtime_ns = coalesce(?5, mtime_ns)
                 WHERE path = ?1",
            )?;
            stmt.execute(params![
                dinfo.path,
                dinfo.mode.map(|v| v as i64),
                dinfo.uid.map(|v| v as i64),
                dinfo.gid.map(|v| v as i64),
                dinfo.mtime_ns,
            ])?;
            return Ok(());
        }
        let tracked = self.stats_enabled()?;
        if tracked {
            if let Some(parent) = paths::parent(&dinfo.path) {
                self.ensure_dir_chain(parent)?;
            }
        }
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO dirs (path, mode, uid, gid, mtime_ns) VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        stmt.execute(params![
            dinfo.path,
            dinfo.mode.map(|v| v as i64),
            dinfo.uid.map(|v| v as i64),
            dinfo.gid.map(|v| v as i64),
            dinfo.mtime_ns,
        ])
        .map_err(|e| {
            if is_constraint_violation(&e) {
                Error::FileExists(dinfo.path.clone())
            } else {
                Error::Sqlite(e)
            }
        })?;
        if tracked {
            if let Some(parent) = paths::parent(&dinfo.path) {
                self.stats_subdir_added(parent)?;
            }
        }
        Ok(())
    }

    // ---- Renaming ----

    /// Rename a file or a directory.
    pub fn rename(&self, old: &str, new: &str, allow_overwrite: bool) -> Result<()> {
        if self.isfile(old)? {
            self.rename_file(old, new, allow_overwrite)
        } else if self.isdir(old)? {
            self.rename_dir(old, new, allow_overwrite)
        } else {
            Err(Error::FileNotFound(paths::normalize(old)?))
        }
    }

    pub fn rename_file(&self, old: &str, new: &str, allow_overwrite: bool) -> Result<()> {
        let old = paths::normalize(old)?;
        let new = paths::normalize(new)?;
        if old == new {
            return Ok(());
        }
        if self.isdir(&new)? {
            return Err(Error::IsADirectory(new));
        }
        let finfo = self.lookup_file(&old)?;

        let tx = self.conn.unchecked_transaction()?;
        if self.isfile(&new)? {
            if !allow_overwrite {
                return Err(Error::FileExists(new));
            }
            self.delete_file_row(&new)?;
        }
        let tracked = self.stats_enabled()?;
        let new_parent = paths::parent(&new).unwrap_or("");
        if tracked {
            self.ensure_dir_chain(new_parent)?;
        }
        let mut stmt = self
            .conn
            .prepare_cached("UPDATE files SET path = ?2 WHERE path = ?1")?;
        stmt.execute(params![old, new]).map_err(|e| {
            if is_constraint_violation(&e) {
                Error::FileExists(new.clone())
            } else {
                Error::Sqlite(e)
            }
        })?;
        if tracked && finfo.parent() != new_parent {
            self.stats_file_removed(finfo.parent(), finfo.size)?;
            self.stats_file_added(new_parent, finfo.size)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Rename a directory, rewriting every descendant path with one indexed
    /// update per table instead of re-traversing the tree.
    pub fn rename_dir(&self, old: &str, new: &str, allow_overwrite: bool) -> Result<()> {
        let old = paths::normalize(old)?;
        let new = paths::normalize(new)?;
        if old == new {
            return Ok(());
        }
        if old.is_empty() {
            return Err(Error::InvalidArgument(
                "cannot rename the root directory".into(),
            ));
        }
        if self.isfile(&new)? {
            return Err(Error::NotADirectory(new));
        }
        let dinfo = self.lookup_dir(&old)?;

        let tx = self.conn.unchecked_transaction()?;
        if self.isdir(&new)? {
            if !allow_overwrite {
                return Err(Error::FileExists(new));
            }
            self.delete_empty_dir_row(&new)?;
        }
        let tracked = self.stats_enabled()?;
        let old_parent = paths::parent(&old).unwrap_or("").to_string();
        let new_parent = paths::parent(&new).unwrap_or("").to_string();
        if tracked {
            self.ensure_dir_chain(&new_parent)?;
        }

        let mut stmt = self
            .conn
            .prepare_cached("UPDATE dirs SET path = ?2 WHERE path = ?1")?;
        stmt.execute(params![old, new]).map_err(|e| {
            if is_constraint_violation(&e) {
                Error::FileExists(new.clone())
            } else {
                Error::Sqlite(e)
            }
        })?;

        if dinfo.num_files_tree > 0 || dinfo.num_subdirs > 0 {
            // The substring starts right after the old prefix; SQL string
            // indexing is 1-based. GLOB metacharacters in the old path are
            // escaped so only literal descendants match.
            let mut stmt = self.conn.prepare_cached(
                "UPDATE files
                 SET path = :new || substr(path, length(:old) + 1)
                 WHERE path GLOB
                     replace(replace(replace(:old, '[', '[[]'), '?', '[?]'), '*', '[*]') || '/*'",
            )?;
            stmt.execute(rusqlite::named_params! {":old": old, ":new": new})?;
            let mut stmt = self.conn.prepare_cached(
                "UPDATE dirs
                 SET path = :new || substr(path, length(:old) + 1)
                 WHERE path GLOB
                     replace(replace(replace(:old, '[', '[[]'), '?', '[?]'), '*', '[*]') || '/*'",
            )?;
            stmt.execute(rusqlite::named_params! {":old": old, ":new": new})?;
        }

        if tracked && old_parent != new_parent {
            self.stats_subdir_removed(&old_parent)?;
            self.stats_subdir_added(&new_parent)?;
            self.stats_tree_delta(
                &old_parent,
                -(dinfo.size_tree as i64),
                -(dinfo.num_files_tree as i64),
            )?;
            self.stats_tree_delta(
                &new_parent,
                dinfo.size_tree as i64,
                dinfo.num_files_tree as i64,
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ---- Deleting ----

    /// Remove a file row, propagating aggregates.
    pub fn remove_file(&self, path: &str) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        self.delete_file_row(&paths::normalize(path)?)?;
        tx.commit()?;
        Ok(())
    }

    /// Remove many file rows in one transaction.
    pub fn remove_files<'a>(&self, paths_iter: impl IntoIterator<Item = &'a str>) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for path in paths_iter {
            self.delete_file_row(&paths::normalize(path)?)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn delete_file_row(&self, path: &str) -> Result<()> {
        let finfo = self.lookup_file(path)?;
        let mut stmt = self
            .conn
            .prepare_cached("DELETE FROM files WHERE path = ?1")?;
        stmt.execute(params![finfo.path])?;
        if self.stats_enabled()? {
            self.stats_file_removed(finfo.parent(), finfo.size)?;
        }
        Ok(())
    }

    /// Remove an empty directory.
    pub fn remove_empty_dir(&self, path: &str) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        self.delete_empty_dir_row(&paths::normalize(path)?)?;
        tx.commit()?;
        Ok(())
    }

    fn delete_empty_dir_row(&self, path: &str) -> Result<()> {
        let dinfo = self.lookup_dir(path)?;
        if dinfo.path.is_empty() {
            return Err(Error::InvalidArgument(
                "cannot remove the root directory".into(),
            ));
        }
        if dinfo.num_entries() != 0 {
            return Err(Error::DirectoryNotEmpty(dinfo.path));
        }
        let mut stmt = self.conn.prepare_cached("DELETE FROM dirs WHERE path = ?1")?;
        stmt.execute(params![dinfo.path])?;
        if self.stats_enabled()? {
            if let Some(parent) = paths::parent(&dinfo.path) {
                self.stats_subdir_removed(parent)?;
            }
        }
        Ok(())
    }

    /// Remove a directory and everything under it.
    pub fn remove_recursively(&self, path: &str) -> Result<()> {
        let dinfo = self.lookup_dir(path)?;
        if dinfo.path.is_empty() {
            return Err(Error::InvalidArgument(
                "cannot remove the root directory".into(),
            ));
        }
        let tx = self.conn.unchecked_transaction()?;
        if dinfo.num_files_tree > 0 || dinfo.num_subdirs > 0 {
            let mut stmt = self.conn.prepare_cached(
                "DELETE FROM files WHERE path GLOB
                     replace(replace(replace(:dir, '[', '[[]'), '?', '[?]'), '*', '[*]') || '/*'",
            )?;
            stmt.execute(rusqlite::named_params! {":dir": dinfo.path})?;
            let mut stmt = self.conn.prepare_cached(
                "DELETE FROM dirs WHERE path GLOB
                     replace(replace(replace(:dir, '[', '[[]'), '?', '[?]'), '*', '[*]') || '/*'",
            )?;
            stmt.execute(rusqlite::named_params! {":dir": dinfo.path})?;
        }
        let mut stmt = self.conn.prepare_cached("DELETE FROM dirs WHERE path = ?1")?;
        stmt.execute(params![dinfo.path])?;
        if self.stats_enabled()? {
            let parent = paths::parent(&dinfo.path).unwrap_or("");
            self.stats_subdir_removed(parent)?;
            self.stats_tree_delta(
                parent,
                -(dinfo.size_tree as i64),
                -(dinfo.num_files_tree as i64),
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ---- Metadata on either kind ----

    /// Change the permission bits of a file or directory.
    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        self.set_either("mode", path, mode as i64)
    }

    /// Change the owner of a file or directory.
    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        let path = paths::normalize(path)?;
        let mut stmt = self
            .conn
            .prepare_cached("UPDATE files SET uid = ?2, gid = ?3 WHERE path = ?1")?;
        if stmt.execute(params![path, uid as i64, gid as i64])? > 0 {
            return Ok(());
        }
        let mut stmt = self
            .conn
            .prepare_cached("UPDATE dirs SET uid = ?2, gid = ?3 WHERE path = ?1")?;
        if stmt.execute(params![path, uid as i64, gid as i64])? == 0 {
            return Err(Error::FileNotFound(path));
        }
        Ok(())
    }

    /// Set the modification time of a file or directory.
    pub fn set_mtime(&self, path: &str, mtime_ns: i64) -> Result<()> {
        self.set_either("mtime_ns", path, mtime_ns)
    }

    fn set_either(&self, column: &str, path: &str, value: i64) -> Result<()> {
        let path = paths::normalize(path)?;
        let sql = format!("UPDATE files SET {column} = ?2 WHERE path = ?1");
        let mut stmt = self.conn.prepare_cached(&sql)?;
        if stmt.execute(params![path, value])? > 0 {
            return Ok(());
        }
        let sql = format!("UPDATE dirs SET {column} = ?2 WHERE path = ?1");
        let mut stmt = self.conn.prepare_cached(&sql)?;
        if stmt.execute(params![path, value])? == 0 {
            return Err(Error::FileNotFound(path));
        }
        Ok(())
    }

    // ---- Placement advisor ----

    /// Find a destination for `finfo`'s payload grown to `new_size`, without
    /// moving any bytes: keep the current spot when the trailing gap is big
    /// enough, otherwise the first gap anywhere that fits the whole new
    /// payload, otherwise a fresh shard.
    pub fn find_space(&self, finfo: &FileInfo, new_size: u64) -> Result<FileInfo> {
        let mut placement = finfo.clone();
        placement.size = new_size;
        if new_size <= finfo.size {
            return Ok(placement);
        }
        let limit = self.shard_size_limit()?;

        let mut stmt = self.conn.prepare_cached(
            "SELECT offset FROM files WHERE shard = ?1 AND offset > ?2 ORDER BY offset LIMIT 1",
        )?;
        let next_offset: Option<i64> = stmt
            .query_row(params![finfo.shard as i64, finfo.offset as i64], |row| row.get(0))
            .optional()?;
        let available = next_offset.map(|v| v as u64).unwrap_or(limit) - finfo.offset;
        if available >= new_size {
            return Ok(placement);
        }

        let mut stmt = self.conn.prepare_cached(
            "SELECT shard, gap_offset FROM (
                 SELECT
                     shard,
                     (offset + size) AS gap_offset,
                     LEAD(offset, 1, :limit) OVER (PARTITION BY shard ORDER BY offset)
                         AS gap_end
                 FROM files)
             WHERE gap_end - gap_offset >= :size
             ORDER BY shard, gap_offset
             LIMIT 1",
        )?;
        let gap: Option<(i64, i64)> = stmt
            .query_row(
                rusqlite::named_params! {":limit": limit as i64, ":size": new_size as i64},
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((shard, offset)) = gap {
            placement.shard = shard as usize;
            placement.offset = offset as u64;
            return Ok(placement);
        }

        placement.shard = self.num_used_shards()?;
        placement.offset = 0;
        Ok(placement)
    }

    // ---- Attached databases ----

    pub(crate) fn attach_source(&self, db_path: &Path) -> Result<()> {
        let uri = format!("file:{}?mode=ro", db_path.display());
        self.conn
            .execute("ATTACH DATABASE ?1 AS sourcedb", params![uri])?;
        Ok(())
    }

    pub(crate) fn detach_source(&self) -> Result<()> {
        self.conn.execute("DETACH DATABASE sourcedb", [])?;
        Ok(())
    }

    // ---- Lifecycle ----

    pub(crate) fn conn_pragma_optimize(&self) -> Result<()> {
        self.conn.execute_batch("PRAGMA optimize;")?;
        Ok(())
    }

    /// ANALYZE and VACUUM the database.
    pub fn optimize(&self) -> Result<()> {
        if !self.readonly {
            self.conn.execute_batch("ANALYZE; VACUUM; PRAGMA optimize;")?;
        }
        Ok(())
    }
}
