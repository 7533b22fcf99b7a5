//! Merging one archive into another.
//!
//! Two modes. Index-only merge (symlink mode) copies metadata alone: the
//! caller arranges for the target's shard sequence to continue into the
//! source's shard files (typically via symlinks), so the source's `shard`
//! column is shifted by the target's shard count and no payload moves.
//! Copy merge streams the source's payload bytes into the target's tail
//! shard, starting new shards as the size limit requires. A filtered merge
//! selects source files by glob pattern or rsync-style rules and copies
//! contiguous runs as single transfers.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use log::info;
use rusqlite::OptionalExtension;

use crate::error::{Error, Result};
use crate::index::{GlobRule, Index, is_constraint_violation};
use crate::paths;
use crate::store::Barecat;
use crate::types::{EntryInfo, FileInfo, SHARD_SIZE_UNLIMITED};

/// Options controlling a merge.
#[derive(Clone, Debug, Default)]
pub struct MergeOptions {
    /// Skip source files whose target path already exists instead of
    /// failing the merge.
    pub ignore_duplicates: bool,
    /// Prefix prepended to every source path (empty for none).
    pub prefix: String,
    /// Copy only source files matching this glob pattern.
    pub pattern: Option<String>,
    /// Copy only source files selected by these first-match-wins rules.
    pub filter_rules: Vec<GlobRule>,
    /// Symlink mode: merge only the index, shifting shard numbers; the
    /// caller is responsible for placing the source's shard files after
    /// the target's.
    pub index_only: bool,
}

/// SQL fragment merging dir metadata on path conflict: permission bits are
/// OR'd, mtime is the max, owner prefers the source. The triple-coalesce
/// keeps NULLs from poisoning the combination.
const DIR_META_MERGE: &str = "mode = coalesce(dirs.mode | excluded.mode,
                     coalesce(dirs.mode, 0) | excluded.mode,
                     dirs.mode | coalesce(excluded.mode, 0)),
     uid = coalesce(excluded.uid, dirs.uid),
     gid = coalesce(excluded.gid, dirs.gid),
     mtime_ns = coalesce(
         max(dirs.mtime_ns, excluded.mtime_ns),
         max(coalesce(dirs.mtime_ns, 0), excluded.mtime_ns),
         max(dirs.mtime_ns, coalesce(excluded.mtime_ns, 0)))";

pub fn merge(store: &mut Barecat, source_base: &Path, options: &MergeOptions) -> Result<()> {
    let prefix = paths::normalize(&options.prefix)?;
    if options.index_only {
        let source_index = paths::resolve_index_path(source_base);
        return store.index().merge_index_only(
            &source_index,
            options.ignore_duplicates,
            &prefix,
            true,
        );
    }
    if options.pattern.is_some() || !options.filter_rules.is_empty() {
        return merge_filtered(store, source_base, options, &prefix);
    }
    merge_copy(store, source_base, options, &prefix)
}

impl Index {
    /// Add the files and directories of another index to this one without
    /// moving any payload bytes. The source's shard numbers are shifted by
    /// this archive's shard count; overlapping directories merge
    /// additively.
    pub fn merge_index_only(
        &self,
        source_index_path: &Path,
        ignore_duplicates: bool,
        prefix: &str,
        update_treestats: bool,
    ) -> Result<()> {
        self.attach_source(source_index_path)?;
        let result = self.merge_index_attached(ignore_duplicates, prefix, update_treestats);
        let detach = self.detach_source();
        result?;
        detach
    }

    fn merge_index_attached(
        &self,
        ignore_duplicates: bool,
        prefix: &str,
        update_treestats: bool,
    ) -> Result<()> {
        let path_expr = self.check_merge_conflicts(prefix)?;
        let conn = self.conn();

        if !prefix.is_empty() {
            // The prefix chain absorbs the source root's subtree stats.
            let root_stats: Option<(i64, i64)> = conn
                .query_row(
                    "SELECT size_tree, num_files_tree FROM sourcedb.dirs WHERE path = ''",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            if let Some((size_tree, num_files_tree)) = root_stats {
                let mut stmt = conn.prepare_cached(
                    "INSERT INTO dirs (path, size_tree, num_files_tree) VALUES (?1, ?2, ?3)
                     ON CONFLICT (path) DO UPDATE SET
                         size_tree = size_tree + excluded.size_tree,
                         num_files_tree = num_files_tree + excluded.num_files_tree",
                )?;
                for ancestor in paths::ancestors(prefix) {
                    stmt.execute(rusqlite::params![ancestor, size_tree, num_files_tree])?;
                }
            }
        }

        // Upsert all source dirs; overlapping dirs merge additively. The
        // root row was already handled when a prefix is in play.
        let root_filter = if prefix.is_empty() { "1" } else { "path != ''" };
        conn.execute(
            &format!(
                "INSERT INTO dirs (
                     path, num_subdirs, num_files, size_tree, num_files_tree,
                     mode, uid, gid, mtime_ns)
                 SELECT {path_expr}, num_subdirs, num_files, size_tree, num_files_tree,
                     mode, uid, gid, mtime_ns
                 FROM sourcedb.dirs WHERE {root_filter}
                 ON CONFLICT (path) DO UPDATE SET
                     num_subdirs = num_subdirs + excluded.num_subdirs,
                     num_files = num_files + excluded.num_files,
                     size_tree = size_tree + excluded.size_tree,
                     num_files_tree = num_files_tree + excluded.num_files_tree,
                     {DIR_META_MERGE}"
            ),
            [],
        )?;

        let shift = self.num_used_shards()? as i64;
        let maybe_ignore = if ignore_duplicates { "OR IGNORE" } else { "" };
        conn.execute(
            &format!(
                "INSERT {maybe_ignore} INTO files (
                     path, shard, offset, size, crc32c, mode, uid, gid, mtime_ns)
                 SELECT {path_expr}, shard + ?1, offset, size, crc32c, mode, uid, gid, mtime_ns
                 FROM sourcedb.files"
            ),
            rusqlite::params![shift],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                Error::FileExists("duplicate path while merging indexes".into())
            } else {
                Error::Sqlite(e)
            }
        })?;

        if !prefix.is_empty() {
            // Direct-child counts on the prefix chain are not additive;
            // recompute them from the tables.
            let mut stmt = conn.prepare_cached(
                "UPDATE dirs SET
                     num_subdirs = (SELECT COUNT(*) FROM dirs WHERE parent = ?1),
                     num_files = (SELECT COUNT(*) FROM files WHERE parent = ?1)
                 WHERE path = ?1",
            )?;
            for ancestor in paths::ancestors(prefix) {
                stmt.execute(rusqlite::params![ancestor])?;
            }
        } else if update_treestats && ignore_duplicates {
            // Skipped duplicates make the additive stats too high.
            self.update_treestats()?;
        }
        Ok(())
    }

    /// Check for path conflicts between the attached source and this index
    /// and return the SQL expression mapping source paths to target paths.
    pub(crate) fn check_merge_conflicts(&self, prefix: &str) -> Result<String> {
        let path_expr = if prefix.is_empty() {
            "path".to_string()
        } else {
            for ancestor in paths::ancestors(prefix) {
                if !ancestor.is_empty() && self.isfile(&ancestor)? {
                    return Err(Error::NotADirectory(format!(
                        "cannot use prefix {prefix:?}: {ancestor:?} exists as a file"
                    )));
                }
            }
            let escaped = prefix.replace('\'', "''");
            format!("CASE WHEN path = '' THEN '{escaped}' ELSE '{escaped}/' || path END")
        };

        let conn = self.conn();
        let conflict: Option<String> = conn
            .query_row(
                &format!(
                    "SELECT {path_expr} FROM sourcedb.files
                     WHERE {path_expr} IN (SELECT path FROM dirs) LIMIT 1"
                ),
                [],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(path) = conflict {
            return Err(Error::IsADirectory(format!(
                "source file {path:?} conflicts with a target directory"
            )));
        }
        let conflict: Option<String> = conn
            .query_row(
                &format!(
                    "SELECT {path_expr} FROM sourcedb.dirs
                     WHERE {path_expr} IN (SELECT path FROM files) LIMIT 1"
                ),
                [],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(path) = conflict {
            return Err(Error::NotADirectory(format!(
                "source directory {path:?} conflicts with a target file"
            )));
        }
        Ok(path_expr)
    }
}

/// Full merge: stream source payloads into the target's tail shard and
/// insert the corresponding rows, then recompute directory stats exactly.
fn merge_copy(
    store: &mut Barecat,
    source_base: &Path,
    options: &MergeOptions,
    prefix: &str,
) -> Result<()> {
    let source_index_path = paths::resolve_index_path(source_base);
    store.index().attach_source(&source_index_path)?;
    let result = merge_copy_attached(store, source_base, options, prefix);
    let detach = store.index().detach_source();
    result?;
    detach
}

fn merge_copy_attached(
    store: &mut Barecat,
    source_base: &Path,
    options: &MergeOptions,
    prefix: &str,
) -> Result<()> {
    let path_expr = store.index().check_merge_conflicts(prefix)?;
    let limit = store.shard_size_limit()?;

    if limit != SHARD_SIZE_UNLIMITED {
        let in_max: i64 = store.index().conn().query_row(
            "SELECT coalesce(MAX(size), 0) FROM sourcedb.files",
            [],
            |row| row.get(0),
        )?;
        if in_max as u64 > limit {
            return Err(Error::FileTooLarge { size: in_max as u64, limit });
        }
    }

    // Merge dir metadata; aggregates are recomputed wholesale afterward.
    // The WHERE clause disambiguates the upsert's ON CONFLICT from a join.
    store.index().conn().execute(
        &format!(
            "INSERT INTO dirs (path, mode, uid, gid, mtime_ns)
             SELECT {path_expr}, mode, uid, gid, mtime_ns FROM sourcedb.dirs
             WHERE 1
             ON CONFLICT (path) DO UPDATE SET {DIR_META_MERGE}"
        ),
        [],
    )?;

    let mut out_shard = store.sharder().num_shards() - 1;
    let mut out_offset = store.index().logical_shard_end(out_shard)?;
    let maybe_ignore = if options.ignore_duplicates { "OR IGNORE" } else { "" };

    // Zero-size files own no bytes; insert them straight away so the byte
    // loop below only has to track payload-bearing spans.
    store
        .index()
        .conn()
        .execute(
            &format!(
                "INSERT {maybe_ignore} INTO files (
                     path, shard, offset, size, crc32c, mode, uid, gid, mtime_ns)
                 SELECT {path_expr}, ?1, 0, 0, crc32c, mode, uid, gid, mtime_ns
                 FROM sourcedb.files WHERE size = 0"
            ),
            rusqlite::params![out_shard as i64],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                Error::FileExists("duplicate path while merging archives".into())
            } else {
                Error::Sqlite(e)
            }
        })?;

    let mut in_shard_number = 0usize;
    loop {
        let in_shard_path = paths::shard_path(source_base, in_shard_number);
        if !in_shard_path.exists() {
            break;
        }
        let in_end: i64 = store.index().conn().query_row(
            "SELECT coalesce(MAX(offset + size), 0) FROM sourcedb.files
             WHERE shard = ?1 AND size > 0",
            rusqlite::params![in_shard_number as i64],
            |row| row.get(0),
        )?;
        let in_end = in_end.max(0) as u64;
        let mut in_file = File::open(&in_shard_path)?;
        let mut in_offset = 0u64;

        while in_offset < in_end {
            let copiable = if limit == SHARD_SIZE_UNLIMITED {
                in_end - in_offset
            } else {
                let space_left = limit - out_offset;
                let fetched: Option<i64> = store
                    .index()
                    .conn()
                    .query_row(
                        "SELECT MAX(offset + size) - ?1 FROM sourcedb.files
                         WHERE offset >= ?1 AND offset + size <= ?1 + ?2
                           AND shard = ?3 AND size > 0",
                        rusqlite::params![
                            in_offset as i64,
                            space_left as i64,
                            in_shard_number as i64
                        ],
                        |row| row.get(0),
                    )
                    .optional()?
                    .flatten();
                match fetched {
                    // A zero span only happens when nothing real fits (a
                    // zero-size file at the cursor); fall through to the
                    // no-fit handling or the loop would never advance.
                    Some(v) if v > 0 => v as u64,
                    _ => {
                        if out_offset > 0 {
                            // Nothing fits in the remaining space.
                            store.sharder_mut().start_new_shard()?;
                            out_shard += 1;
                            out_offset = 0;
                            continue;
                        }
                        // Even an empty shard cannot absorb the span from
                        // the cursor to the next file's end: a source gap
                        // is inflating it. Skip the gap instead of copying
                        // it.
                        let next: Option<i64> = store
                            .index()
                            .conn()
                            .query_row(
                                "SELECT MIN(offset) FROM sourcedb.files
                                 WHERE offset >= ?1 AND shard = ?2 AND size > 0",
                                rusqlite::params![in_offset as i64, in_shard_number as i64],
                                |row| row.get(0),
                            )
                            .optional()?
                            .flatten();
                        match next {
                            Some(o) if o as u64 > in_offset => {
                                in_offset = o as u64;
                                continue;
                            }
                            _ => {
                                in_offset = in_end;
                                continue;
                            }
                        }
                    }
                }
            };

            // Bytes land before the rows referencing them.
            in_file.seek(SeekFrom::Start(in_offset))?;
            let mut limited = (&mut in_file).take(copiable);
            store
                .sharder()
                .write_tail_from(out_shard, out_offset, &mut limited, copiable)?;

            store
                .index()
                .conn()
                .execute(
                    &format!(
                        "INSERT {maybe_ignore} INTO files (
                             path, shard, offset, size, crc32c, mode, uid, gid, mtime_ns)
                         SELECT {path_expr}, ?1, offset + ?2, size, crc32c,
                                mode, uid, gid, mtime_ns
                         FROM sourcedb.files
                         WHERE shard = ?3 AND offset >= ?4 AND offset + size <= ?5
                           AND size > 0"
                    ),
                    rusqlite::params![
                        out_shard as i64,
                        out_offset as i64 - in_offset as i64,
                        in_shard_number as i64,
                        in_offset as i64,
                        (in_offset + copiable) as i64,
                    ],
                )
                .map_err(|e| {
                    if is_constraint_violation(&e) {
                        Error::FileExists("duplicate path while merging archives".into())
                    } else {
                        Error::Sqlite(e)
                    }
                })?;

            out_offset += copiable;
            in_offset += copiable;
        }
        in_shard_number += 1;
    }

    store.index().update_dirs()?;
    store.index().update_treestats()?;
    info!(
        "merged {} into {}",
        source_base.display(),
        store.path().display()
    );
    Ok(())
}

/// Filtered merge: select source files by pattern or rules, sort by
/// address, plan destination placements, and copy contiguous runs as
/// single transfers.
fn merge_filtered(
    store: &mut Barecat,
    source_base: &Path,
    options: &MergeOptions,
    prefix: &str,
) -> Result<()> {
    let source = Barecat::open(source_base)?;
    let mut file_infos: Vec<FileInfo> = match &options.pattern {
        Some(pattern) => source
            .index()
            .glob_infos(pattern, true, true, true)?
            .into_iter()
            .filter_map(|e| match e {
                EntryInfo::File(f) => Some(f),
                EntryInfo::Dir(_) => None,
            })
            .collect(),
        None => source
            .index()
            .glob_infos_incl_excl(&options.filter_rules, true, true)?
            .into_iter()
            .filter_map(|e| match e {
                EntryInfo::File(f) => Some(f),
                EntryInfo::Dir(_) => None,
            })
            .collect(),
    };
    if file_infos.is_empty() {
        return Ok(());
    }
    file_infos.sort_by_key(|f| (f.shard, f.offset));

    let target_path = |src: &str| -> String {
        if prefix.is_empty() {
            src.to_string()
        } else if src.is_empty() {
            prefix.to_string()
        } else {
            format!("{prefix}/{src}")
        }
    };

    // Fail before copying any byte if a selected file would land on an
    // existing directory.
    for fi in &file_infos {
        let dst = target_path(&fi.path);
        if store.index().isdir(&dst)? {
            return Err(Error::IsADirectory(format!(
                "source file {:?} conflicts with target directory {dst:?}",
                fi.path
            )));
        }
    }

    let limit = store.shard_size_limit()?;
    if limit != SHARD_SIZE_UNLIMITED {
        if let Some(too_big) = file_infos.iter().find(|f| f.size > limit) {
            return Err(Error::FileTooLarge { size: too_big.size, limit });
        }
    }

    let mut dst_shard = store.sharder().num_shards() - 1;
    let mut dst_offset = store.index().logical_shard_end(dst_shard)?;

    // Plan placements, tracking runs that are contiguous in both source
    // and destination so each run moves with one transfer.
    struct Block {
        src_shard: usize,
        src_offset: u64,
        dst_shard: usize,
        dst_offset: u64,
        size: u64,
    }
    let mut placements: Vec<(usize, usize, u64)> = Vec::with_capacity(file_infos.len());
    let mut blocks: Vec<Block> = Vec::new();
    let mut block = Block {
        src_shard: file_infos[0].shard,
        src_offset: file_infos[0].offset,
        dst_shard,
        dst_offset,
        size: 0,
    };

    for (i, fi) in file_infos.iter().enumerate() {
        if limit != SHARD_SIZE_UNLIMITED && dst_offset + fi.size > limit {
            if block.size > 0 {
                blocks.push(block);
            }
            store.sharder_mut().start_new_shard()?;
            dst_shard += 1;
            dst_offset = 0;
            block = Block {
                src_shard: fi.shard,
                src_offset: fi.offset,
                dst_shard,
                dst_offset,
                size: 0,
            };
        }
        let contiguous = fi.shard == block.src_shard && fi.offset == block.src_offset + block.size;
        if !contiguous && block.size > 0 {
            blocks.push(block);
            block = Block {
                src_shard: fi.shard,
                src_offset: fi.offset,
                dst_shard,
                dst_offset,
                size: 0,
            };
        }
        placements.push((i, dst_shard, dst_offset));
        block.size += fi.size;
        dst_offset += fi.size;
    }
    if block.size > 0 {
        blocks.push(block);
    }

    for b in &blocks {
        let src_path = paths::shard_path(source_base, b.src_shard);
        let mut src = File::open(&src_path)?;
        src.seek(SeekFrom::Start(b.src_offset))?;
        let mut limited = (&mut src).take(b.size);
        store
            .sharder()
            .write_tail_from(b.dst_shard, b.dst_offset, &mut limited, b.size)?;
    }

    {
        let conn = store.index().conn();
        let tx = conn.unchecked_transaction()?;
        let maybe_ignore = if options.ignore_duplicates { "OR IGNORE" } else { "" };
        let mut stmt = conn.prepare_cached(&format!(
            "INSERT {maybe_ignore} INTO files (
                 path, shard, offset, size, crc32c, mode, uid, gid, mtime_ns)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
        ))?;
        for &(i, shard, offset) in &placements {
            let fi = &file_infos[i];
            stmt.execute(rusqlite::params![
                target_path(&fi.path),
                shard as i64,
                offset as i64,
                fi.size as i64,
                fi.crc32c.map(|v| v as i64),
                fi.mode.map(|v| v as i64),
                fi.uid.map(|v| v as i64),
                fi.gid.map(|v| v as i64),
                fi.mtime_ns,
            ])
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    Error::FileExists(target_path(&fi.path))
                } else {
                    Error::Sqlite(e)
                }
            })?;
        }
        drop(stmt);
        tx.commit()?;
    }

    drop(source);
    store.index().update_dirs()?;
    store.index().update_treestats()?;
    info!(
        "merged {} selected files from {} into {}",
        placements.len(),
        source_base.display(),
        store.path().display()
    );
    Ok(())
}
