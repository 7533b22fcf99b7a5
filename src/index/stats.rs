//! Directory aggregate maintenance.
//!
//! Two interchangeable modes, selected by the persisted `use_triggers`
//! config flag. Tracked mode walks the ancestor chain with prepared
//! statements on every point mutation. Bulk mode leaves aggregates alone
//! while mass-inserting and recomputes them exactly on exit with recursive
//! CTEs: `update_dirs` materializes missing ancestor rows, then
//! `update_treestats` expands every file to its ancestors and aggregates in
//! one pass, which is O(files x avg_depth) rather than the O(dirs x files)
//! of a naive GLOB join.

use log::debug;
use rusqlite::params;

use super::Index;
use crate::error::{Error, Result};
use crate::paths;

impl Index {
    /// Whether point mutations maintain aggregates eagerly.
    pub fn stats_enabled(&self) -> Result<bool> {
        Ok(self.get_config_int("use_triggers")?.unwrap_or(1) == 1)
    }

    pub(crate) fn set_stats_enabled(&self, enabled: bool) -> Result<()> {
        self.set_config_int("use_triggers", i64::from(enabled))
    }

    /// Run `f` with aggregate tracking suspended, then recompute everything.
    ///
    /// Used for create-from-scratch ingestion, merges and schema upgrades,
    /// where per-row ancestor walks would dominate the runtime.
    pub fn bulk_mode<T>(&self, f: impl FnOnce(&Index) -> Result<T>) -> Result<T> {
        let prev = self.stats_enabled()?;
        if prev {
            self.set_stats_enabled(false)?;
        }
        let result = f(self);
        if prev {
            self.set_stats_enabled(true)?;
        }
        let value = result?;
        self.update_dirs()?;
        self.update_treestats()?;
        Ok(value)
    }

    /// Create any missing directory rows on the chain from the root down to
    /// `dirpath` inclusive, bumping `num_subdirs` for each creation.
    pub(crate) fn ensure_dir_chain(&self, dirpath: &str) -> Result<()> {
        for ancestor in paths::ancestors(dirpath) {
            if ancestor.is_empty() || self.isdir(&ancestor)? {
                continue;
            }
            if self.isfile(&ancestor)? {
                return Err(Error::NotADirectory(format!(
                    "{ancestor} exists as a file"
                )));
            }
            let mut stmt = self
                .conn
                .prepare_cached("INSERT INTO dirs (path) VALUES (?1)")?;
            stmt.execute(params![ancestor])?;
            self.stats_subdir_added(paths::parent(&ancestor).unwrap_or(""))?;
        }
        Ok(())
    }

    pub(crate) fn stats_file_added(&self, parent: &str, size: u64) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("UPDATE dirs SET num_files = num_files + 1 WHERE path = ?1")?;
        stmt.execute(params![parent])?;
        self.stats_tree_delta(parent, size as i64, 1)
    }

    pub(crate) fn stats_file_removed(&self, parent: &str, size: u64) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("UPDATE dirs SET num_files = num_files - 1 WHERE path = ?1")?;
        stmt.execute(params![parent])?;
        self.stats_tree_delta(parent, -(size as i64), -1)
    }

    pub(crate) fn stats_file_resized(&self, parent: &str, size_delta: i64) -> Result<()> {
        self.stats_tree_delta(parent, size_delta, 0)
    }

    pub(crate) fn stats_subdir_added(&self, parent: &str) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("UPDATE dirs SET num_subdirs = num_subdirs + 1 WHERE path = ?1")?;
        stmt.execute(params![parent])?;
        Ok(())
    }

    pub(crate) fn stats_subdir_removed(&self, parent: &str) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("UPDATE dirs SET num_subdirs = num_subdirs - 1 WHERE path = ?1")?;
        stmt.execute(params![parent])?;
        Ok(())
    }

    /// Add `size_delta` / `files_delta` to the subtree aggregates of
    /// `dirpath` and every ancestor up to the root.
    pub(crate) fn stats_tree_delta(
        &self,
        dirpath: &str,
        size_delta: i64,
        files_delta: i64,
    ) -> Result<()> {
        if size_delta == 0 && files_delta == 0 {
            return Ok(());
        }
        let mut stmt = self.conn.prepare_cached(
            "UPDATE dirs SET size_tree = size_tree + ?2, num_files_tree = num_files_tree + ?3
             WHERE path = ?1",
        )?;
        for ancestor in paths::ancestors(dirpath) {
            stmt.execute(params![ancestor, size_delta, files_delta])?;
        }
        Ok(())
    }

    /// Insert a dir row for every ancestor path referenced by any file or
    /// dir record. Used as the first bulk-mode post-pass.
    pub fn update_dirs(&self) -> Result<()> {
        debug!("materializing missing ancestor directories");
        self.conn.execute(
            "WITH RECURSIVE
                 all_ancestors AS (
                     SELECT DISTINCT parent AS path FROM files WHERE parent != ''
                     UNION
                     SELECT DISTINCT parent AS path FROM dirs WHERE parent IS NOT NULL
                     UNION
                     SELECT rtrim(rtrim(path, replace(path, '/', '')), '/')
                     FROM all_ancestors
                     WHERE path LIKE '%/%'
                 )
             INSERT OR IGNORE INTO dirs (path)
             SELECT path FROM all_ancestors
             UNION ALL SELECT ''",
            [],
        )?;
        Ok(())
    }

    /// Recompute all four aggregate columns for every directory. Used as
    /// the second bulk-mode post-pass and by merges that skipped duplicates.
    pub fn update_treestats(&self) -> Result<()> {
        debug!("recomputing directory tree statistics");
        self.conn.execute_batch(
            "DROP TABLE IF EXISTS temp.tmp_treestats;
             DROP TABLE IF EXISTS temp.tmp_file_counts;
             DROP TABLE IF EXISTS temp.tmp_subdir_counts;",
        )?;
        self.conn.execute(
            "CREATE TEMPORARY TABLE tmp_treestats AS
                 WITH RECURSIVE file_ancestors AS (
                     SELECT parent AS ancestor, size FROM files
                     UNION ALL
                     SELECT
                         rtrim(rtrim(ancestor, replace(ancestor, '/', '')), '/'),
                         size
                     FROM file_ancestors
                     WHERE ancestor != ''
                 )
                 SELECT
                     ancestor AS path,
                     SUM(size) AS size_tree,
                     COUNT(*) AS num_files_tree
                 FROM file_ancestors
                 GROUP BY ancestor",
            [],
        )?;
        self.conn.execute(
            "CREATE TEMPORARY TABLE tmp_file_counts AS
                 SELECT parent AS path, COUNT(*) AS num_files
                 FROM files GROUP BY parent",
            [],
        )?;
        self.conn.execute(
            "CREATE TEMPORARY TABLE tmp_subdir_counts AS
                 SELECT parent AS path, COUNT(*) AS num_subdirs
                 FROM dirs WHERE parent IS NOT NULL GROUP BY parent",
            [],
        )?;
        self.conn.execute(
            "UPDATE dirs
             SET
                 num_files = COALESCE(fc.num_files, 0),
                 num_subdirs = COALESCE(sc.num_subdirs, 0),
                 size_tree = COALESCE(ts.size_tree, 0),
                 num_files_tree = COALESCE(ts.num_files_tree, 0)
             FROM dirs AS d
             LEFT JOIN tmp_file_counts fc ON fc.path = d.path
             LEFT JOIN tmp_subdir_counts sc ON sc.path = d.path
             LEFT JOIN tmp_treestats ts ON ts.path = d.path
             WHERE dirs.path = d.path",
            [],
        )?;
        self.conn.execute_batch(
            "DROP TABLE IF EXISTS temp.tmp_treestats;
             DROP TABLE IF EXISTS temp.tmp_file_counts;
             DROP TABLE IF EXISTS temp.tmp_subdir_counts;",
        )?;
        Ok(())
    }

    /// Check the whole index for internal consistency: recomputed
    /// aggregates, dual file/dir presence, orphaned parents, and SQLite's
    /// own integrity check. Returns a description of every problem found.
    pub fn verify_integrity(&self) -> Result<Vec<String>> {
        let mut problems = Vec::new();

        self.conn.execute_batch(
            "DROP TABLE IF EXISTS temp.tmp_verify_stats;",
        )?;
        self.conn.execute(
            "CREATE TEMPORARY TABLE tmp_verify_stats AS
                 WITH RECURSIVE file_ancestors AS (
                     SELECT parent AS ancestor, size FROM files
                     UNION ALL
                     SELECT
                         rtrim(rtrim(ancestor, replace(ancestor, '/', '')), '/'),
                         size
                     FROM file_ancestors
                     WHERE ancestor != ''
                 ),
                 treestats AS (
                     SELECT ancestor AS path, SUM(size) AS size_tree,
                            COUNT(*) AS num_files_tree
                     FROM file_ancestors GROUP BY ancestor
                 ),
                 file_counts AS (
                     SELECT parent AS path, COUNT(*) AS num_files
                     FROM files GROUP BY parent
                 ),
                 subdir_counts AS (
                     SELECT parent AS path, COUNT(*) AS num_subdirs
                     FROM dirs WHERE parent IS NOT NULL GROUP BY parent
                 )
                 SELECT
                     d.path AS path,
                     COALESCE(fc.num_files, 0) AS num_files,
                     COALESCE(sc.num_subdirs, 0) AS num_subdirs,
                     COALESCE(ts.size_tree, 0) AS size_tree,
                     COALESCE(ts.num_files_tree, 0) AS num_files_tree
                 FROM dirs d
                 LEFT JOIN file_counts fc ON fc.path = d.path
                 LEFT JOIN subdir_counts sc ON sc.path = d.path
                 LEFT JOIN treestats ts ON ts.path = d.path",
            [],
        )?;
        {
            let mut stmt = self.conn.prepare(
                "SELECT dirs.path,
                        dirs.num_files, v.num_files,
                        dirs.num_subdirs, v.num_subdirs,
                        dirs.size_tree, v.size_tree,
                        dirs.num_files_tree, v.num_files_tree
                 FROM dirs JOIN tmp_verify_stats v ON dirs.path = v.path
                 WHERE NOT (
                     dirs.num_files = v.num_files AND
                     dirs.num_subdirs = v.num_subdirs AND
                     dirs.size_tree = v.size_tree AND
                     dirs.num_files_tree = v.num_files_tree
                 )",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let path: String = row.get(0)?;
                problems.push(format!(
                    "dir stats mismatch at {:?}: stored \
                     (num_files={}, num_subdirs={}, size_tree={}, num_files_tree={}) \
                     actual (num_files={}, num_subdirs={}, size_tree={}, num_files_tree={})",
                    path,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(8)?,
                ));
            }
        }
        self.conn
            .execute_batch("DROP TABLE IF EXISTS temp.tmp_verify_stats;")?;

        // A path must not exist as both a file and a directory.
        {
            let mut stmt = self.conn.prepare(
                "SELECT path FROM dirs WHERE path IN (SELECT path FROM files)",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let path: String = row.get(0)?;
                problems.push(format!("path exists as both file and directory: {path:?}"));
            }
        }

        // Every non-root entry must have an existing parent directory.
        {
            let mut stmt = self.conn.prepare(
                "SELECT path FROM files
                 WHERE parent != '' AND parent NOT IN (SELECT path FROM dirs)",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let path: String = row.get(0)?;
                problems.push(format!("file has no parent directory row: {path:?}"));
            }
            let mut stmt = self.conn.prepare(
                "SELECT path FROM dirs
                 WHERE parent IS NOT NULL AND parent != ''
                   AND parent NOT IN (SELECT path FROM dirs)",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let path: String = row.get(0)?;
                problems.push(format!("dir has no parent directory row: {path:?}"));
            }
        }

        if !self.isdir("")? {
            problems.push("root directory row is missing".to_string());
        }

        let check: String = self
            .conn
            .query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if check != "ok" {
            problems.push(format!("sqlite integrity_check: {check}"));
        }

        Ok(problems)
    }
}
