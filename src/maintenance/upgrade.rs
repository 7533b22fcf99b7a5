//! Index schema upgrades.
//!
//! Older archives are upgraded by rebuilding: a fresh index with the
//! current schema is populated from the old database (whatever columns it
//! has), directory rows and tree statistics are recomputed, and the new
//! file is swapped into place with the old one kept as a `.old` backup.
//! Missing checksums are backfilled afterward by reading the payloads.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use rayon::prelude::*;
use rusqlite::{Connection, OpenFlags, OptionalExtension};

use crate::error::{Error, Result};
use crate::index::Index;
use crate::paths;
use crate::store::{Barecat, BarecatOptions};
use crate::types::{Order, SCHEMA_VERSION_MAJOR, SCHEMA_VERSION_MINOR};

/// Read the schema version of an index database without fully opening it.
/// Databases without version rows count as one major version behind.
pub fn get_schema_version(index_path: &Path) -> Result<(i64, i64)> {
    let conn = Connection::open_with_flags(
        index_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
    )?;
    let major: std::result::Result<Option<i64>, _> = conn
        .query_row(
            "SELECT value_int FROM config WHERE key = 'schema_version_major'",
            [],
            |row| row.get(0),
        )
        .optional();
    match major {
        Ok(Some(major)) => {
            let minor: Option<i64> = conn
                .query_row(
                    "SELECT value_int FROM config WHERE key = 'schema_version_minor'",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            Ok((major, minor.unwrap_or(0)))
        }
        // Missing row or missing config table entirely.
        Ok(None) | Err(_) => Ok((SCHEMA_VERSION_MAJOR - 1, 0)),
    }
}

/// Upgrade the archive at `path` to the current schema version.
pub fn upgrade(path: &Path) -> Result<()> {
    let index_path = paths::resolve_index_path(path);
    if !index_path.exists() {
        return Err(Error::FileNotFound(index_path.display().to_string()));
    }
    let (db_major, db_minor) = get_schema_version(&index_path)?;
    if db_major == SCHEMA_VERSION_MAJOR && db_minor == SCHEMA_VERSION_MINOR {
        info!("index is already at schema version {db_major}.{db_minor}, nothing to do");
        return Ok(());
    }
    if db_major > SCHEMA_VERSION_MAJOR {
        return Err(Error::Schema(format!(
            "index schema {db_major}.{db_minor} is newer than supported \
             {SCHEMA_VERSION_MAJOR}.{SCHEMA_VERSION_MINOR}; upgrade this library instead"
        )));
    }
    info!(
        "upgrading index schema {db_major}.{db_minor} to \
         {SCHEMA_VERSION_MAJOR}.{SCHEMA_VERSION_MINOR}"
    );
    rebuild(&index_path)?;
    backfill_crc32c(path)?;
    info!("upgrade complete; previous index kept as {}.old", index_path.display());
    Ok(())
}

/// Names of the columns of `table` in the attached source database.
fn source_columns(index: &Index, table: &str) -> Result<Vec<String>> {
    let sql = format!("PRAGMA sourcedb.table_info({table})");
    let mut stmt = index.conn().prepare(&sql)?;
    let cols = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(cols)
}

fn source_has_table(index: &Index, table: &str) -> Result<bool> {
    let mut stmt = index
        .conn()
        .prepare("SELECT 1 FROM sourcedb.sqlite_master WHERE type = 'table' AND name = ?1")?;
    Ok(stmt.exists(rusqlite::params![table])?)
}

fn rebuild(index_path: &Path) -> Result<()> {
    let mut tmp = index_path.as_os_str().to_os_string();
    tmp.push(".upgrade-tmp");
    let tmp_path = PathBuf::from(tmp);
    if tmp_path.exists() {
        fs::remove_file(&tmp_path)?;
    }

    {
        let index = Index::open(&tmp_path, false, false)?;
        index.attach_source(index_path)?;
        let result = copy_from_source(&index);
        let detach = index.detach_source();
        result?;
        detach?;
    }

    let mut backup = index_path.as_os_str().to_os_string();
    backup.push(".old");
    fs::rename(index_path, PathBuf::from(backup))?;
    fs::rename(&tmp_path, index_path)?;
    // SQLite leaves journal siblings behind after the rename.
    for suffix in ["-journal", "-wal", "-shm"] {
        let mut s = tmp_path.as_os_str().to_os_string();
        s.push(suffix);
        let p = PathBuf::from(s);
        if p.exists() {
            fs::remove_file(&p)?;
        }
    }
    Ok(())
}

fn copy_from_source(index: &Index) -> Result<()> {
    // Copy whatever file columns the old schema has; the rest default.
    let known = ["path", "shard", "offset", "size", "crc32c", "mode", "uid", "gid", "mtime_ns"];
    let present = source_columns(index, "files")?;
    let cols: Vec<&str> = known
        .iter()
        .copied()
        .filter(|c| present.iter().any(|p| p == c))
        .collect();
    let col_list = cols.join(", ");
    index.bulk_mode(|index| {
        index.conn().execute(
            &format!("INSERT INTO files ({col_list}) SELECT {col_list} FROM sourcedb.files"),
            [],
        )?;

        if source_has_table(index, "dirs")? {
            let known_dir = ["path", "mode", "uid", "gid", "mtime_ns"];
            let present = source_columns(index, "dirs")?;
            let cols: Vec<&str> = known_dir
                .iter()
                .copied()
                .filter(|c| present.iter().any(|p| p == c))
                .collect();
            let col_list = cols.join(", ");
            index.conn().execute(
                &format!(
                    "INSERT OR IGNORE INTO dirs ({col_list})
                     SELECT {col_list} FROM sourcedb.dirs"
                ),
                [],
            )?;
        } else if source_has_table(index, "directories")? {
            // The pre-versioned layout kept a bare directory list.
            index.conn().execute(
                "INSERT OR IGNORE INTO dirs (path)
                 SELECT path FROM sourcedb.directories WHERE path != ''",
                [],
            )?;
        }

        if source_has_table(index, "config")? {
            let limit: Option<i64> = index
                .conn()
                .query_row(
                    "SELECT value_int FROM sourcedb.config WHERE key = 'shard_size_limit'",
                    [],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
            if let Some(limit) = limit {
                index.set_shard_size_limit(limit.max(0) as u64)?;
            }
        }
        Ok(())
    })
}

/// Compute and store checksums for every file that lacks one.
fn backfill_crc32c(archive_path: &Path) -> Result<()> {
    let store = Barecat::with_options(
        archive_path,
        &BarecatOptions { readonly: false, ..Default::default() },
    )?;
    let missing: Vec<_> = store
        .index()
        .all_fileinfos(Order::Address)?
        .into_iter()
        .filter(|fi| fi.crc32c.is_none())
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    info!("computing crc32c for {} files", missing.len());
    let sharder = store.sharder();
    let checksums: Vec<Result<(String, u32)>> = missing
        .par_iter()
        .map(|fi| {
            let data = sharder.read_range(fi.shard, fi.offset, fi.size)?;
            Ok((fi.path.clone(), crc32c::crc32c(&data)))
        })
        .collect();
    for (fi, checksum) in missing.iter().zip(checksums) {
        let (path, crc) = checksum?;
        store
            .index()
            .update_contents(&path, fi.shard, fi.offset, fi.size, Some(crc))?;
    }
    Ok(())
}
