//! Defragmentation: reclaim the gaps left behind by removes and updates.
//!
//! Three strategies. Full defrag slides every file forward in address
//! order, producing a minimal set of shards; it is safe for overlapping
//! ranges because the destination always precedes the source. Smart defrag
//! is observably equivalent but detects maximal contiguous runs of files
//! and moves each run with one copy and one SQL update. Quick defrag is a
//! time-bounded best-fit pass that moves tail files into earlier gaps and
//! may leave some gaps behind.

use std::time::{Duration, Instant};

use log::{debug, info};
use rusqlite::OptionalExtension;

use crate::error::Result;
use crate::store::Barecat;
use crate::types::{Order, SHARD_SIZE_UNLIMITED};

/// Which defragmentation strategy to run.
#[derive(Clone, Copy, Debug)]
pub enum DefragMode {
    /// Move every file to its compacted position, one file at a time.
    Full,
    /// Like `Full`, but contiguous runs of files move as single copies.
    Smart,
    /// Best-fit relocation of tail files into earlier gaps, bounded by a
    /// wall-clock budget.
    Quick { budget: Duration },
}

/// An unreferenced byte range inside a shard.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentGap {
    pub shard: usize,
    pub offset: u64,
    pub size: u64,
}

/// Fragmentation report for an archive.
#[derive(Clone, Debug)]
pub struct GapStats {
    pub total_gap_size: u64,
    pub num_gaps: usize,
    pub gap_sizes: Vec<u64>,
    pub physical_size: u64,
    pub logical_size: u64,
    /// `physical / logical`; 1.0 means no fragmentation.
    pub fragmentation_ratio: f64,
}

struct Chunk {
    shard: usize,
    start_offset: u64,
    end_offset: u64,
    total_size: u64,
    file_count: u64,
}

pub struct Defragger<'a> {
    store: &'a mut Barecat,
}

impl<'a> Defragger<'a> {
    pub fn new(store: &'a mut Barecat) -> Self {
        Defragger { store }
    }

    /// Run the chosen strategy; returns the number of bytes reclaimed.
    pub fn run(&mut self, mode: DefragMode) -> Result<u64> {
        match mode {
            DefragMode::Full => self.defrag_full(),
            DefragMode::Smart => self.defrag_smart(),
            DefragMode::Quick { budget } => self.defrag_quick(budget, 2, 10),
        }
    }

    /// True when shard files hold more bytes than the index references.
    pub fn needs_defrag(store: &Barecat) -> Result<bool> {
        Ok(store.total_physical_size()? > store.total_logical_size()?)
    }

    pub fn gap_stats(store: &Barecat) -> Result<GapStats> {
        let gaps = Self::gaps(store, false)?;
        let gap_sizes: Vec<u64> = gaps.iter().map(|g| g.size).collect();
        let total_gap_size = gap_sizes.iter().sum();
        let physical_size = store.total_physical_size()?;
        let logical_size = store.total_logical_size()?;
        Ok(GapStats {
            total_gap_size,
            num_gaps: gaps.len(),
            gap_sizes,
            physical_size,
            logical_size,
            fragmentation_ratio: if logical_size > 0 {
                physical_size as f64 / logical_size as f64
            } else {
                1.0
            },
        })
    }

    fn defrag_full(&mut self) -> Result<u64> {
        let old_total = self.store.total_physical_size()?;
        let limit = self.store.shard_size_limit()?;
        let files = self.store.index().all_fileinfos(Order::Address)?;

        let mut dst_shard = 0usize;
        let mut dst_offset = 0u64;
        for fi in &files {
            if dst_offset + fi.size > limit {
                self.store.sharder().truncate(dst_shard, dst_offset)?;
                dst_shard += 1;
                dst_offset = 0;
            }
            if !(dst_shard == fi.shard && dst_offset == fi.offset) {
                self.store
                    .sharder()
                    .copy_range(fi.shard, fi.offset, dst_shard, dst_offset, fi.size)?;
                self.store
                    .index()
                    .update_placement(&fi.path, dst_shard, dst_offset)?;
            }
            dst_offset += fi.size;
        }

        self.store.sharder().truncate(dst_shard, dst_offset)?;
        self.store.sharder_mut().remove_shards_from(dst_shard + 1)?;

        let new_total = self.store.total_physical_size()?;
        info!("defrag reclaimed {} bytes", old_total.saturating_sub(new_total));
        Ok(old_total.saturating_sub(new_total))
    }

    fn defrag_smart(&mut self) -> Result<u64> {
        let old_total = self.store.total_physical_size()?;
        let limit = self.store.shard_size_limit()?;

        // Zero-size files carry no bytes and would stall the chunk walk at
        // a full destination shard; park them at the shard origin and walk
        // only payload-bearing files.
        self.store.index().conn().execute(
            "UPDATE files SET shard = 0, offset = 0 WHERE size = 0",
            [],
        )?;
        let total_files: i64 = self.store.index().conn().query_row(
            "SELECT COUNT(*) FROM files WHERE size > 0",
            [],
            |row| row.get(0),
        )?;
        let total_files = total_files.max(0) as u64;

        let mut dst_shard = 0usize;
        let mut dst_offset = 0u64;
        let mut src_shard = 0usize;
        let mut src_offset = 0u64;
        let mut files_processed = 0u64;

        while files_processed < total_files {
            let available = limit - dst_offset;
            let chunk = self.find_next_chunk(src_shard, src_offset, available)?;
            let Some(chunk) = chunk else {
                if dst_offset > 0 && limit != SHARD_SIZE_UNLIMITED {
                    self.store.sharder().truncate(dst_shard, dst_offset)?;
                    dst_shard += 1;
                    dst_offset = 0;
                    continue;
                }
                break;
            };

            if !(dst_shard == chunk.shard && dst_offset == chunk.start_offset) {
                self.store.sharder().copy_range(
                    chunk.shard,
                    chunk.start_offset,
                    dst_shard,
                    dst_offset,
                    chunk.total_size,
                )?;
                let offset_delta = dst_offset as i64 - chunk.start_offset as i64;
                self.store.index().conn().execute(
                    "UPDATE files
                     SET shard = ?1, offset = offset + ?2
                     WHERE shard = ?3 AND offset >= ?4 AND offset < ?5",
                    rusqlite::params![
                        dst_shard as i64,
                        offset_delta,
                        chunk.shard as i64,
                        chunk.start_offset as i64,
                        chunk.end_offset as i64,
                    ],
                )?;
            }

            dst_offset += chunk.total_size;
            files_processed += chunk.file_count;
            src_shard = chunk.shard;
            src_offset = chunk.end_offset;
        }

        self.store.sharder().truncate(dst_shard, dst_offset)?;
        self.store.sharder_mut().remove_shards_from(dst_shard + 1)?;

        let new_total = self.store.total_physical_size()?;
        info!("defrag reclaimed {} bytes", old_total.saturating_sub(new_total));
        Ok(old_total.saturating_sub(new_total))
    }

    /// The next maximal run of contiguous files at or after the given
    /// address, capped at `max_size`. A recursive CTE walks file-to-file
    /// adjacency and stops at the first hole or shard boundary.
    fn find_next_chunk(
        &self,
        min_shard: usize,
        min_offset: u64,
        max_size: u64,
    ) -> Result<Option<Chunk>> {
        let conn = self.store.index().conn();
        let mut stmt = conn.prepare_cached(
            "WITH RECURSIVE
             first_file AS (
                 SELECT shard, offset, size, offset + size AS end_offset
                 FROM files
                 WHERE size > 0
                   AND (shard > :min_shard OR (shard = :min_shard AND offset >= :min_offset))
                 ORDER BY shard, offset
                 LIMIT 1
             ),
             chunk_files AS (
                 SELECT shard, offset, size, end_offset, offset AS chunk_start
                 FROM first_file
                 WHERE size <= :max_size
                 UNION ALL
                 SELECT f.shard, f.offset, f.size, f.offset + f.size, c.chunk_start
                 FROM chunk_files c
                 JOIN files f ON f.shard = c.shard AND f.offset = c.end_offset
                 WHERE f.size > 0 AND f.offset + f.size <= c.chunk_start + :max_size
             )
             SELECT
                 MIN(shard), MIN(offset), MAX(end_offset),
                 MAX(end_offset) - MIN(offset), COUNT(*)
             FROM chunk_files",
        )?;
        let chunk = stmt
            .query_row(
                rusqlite::named_params! {
                    ":min_shard": min_shard as i64,
                    ":min_offset": min_offset as i64,
                    ":max_size": max_size.min(i64::MAX as u64) as i64,
                },
                |row| {
                    let count: i64 = row.get(4)?;
                    if count == 0 {
                        return Ok(None);
                    }
                    Ok(Some(Chunk {
                        shard: row.get::<_, i64>(0)? as usize,
                        start_offset: row.get::<_, i64>(1)? as u64,
                        end_offset: row.get::<_, i64>(2)? as u64,
                        total_size: row.get::<_, i64>(3)? as u64,
                        file_count: count as u64,
                    }))
                },
            )
            .optional()?
            .flatten();
        Ok(chunk)
    }

    /// Best-fit quick defrag. Iterates files in address-descending order
    /// and relocates each into the first earlier gap that fits, within a
    /// wall-clock budget. Skipped normal-sized files signal that the gaps
    /// are exhausted; skipped outliers are just individually too big.
    fn defrag_quick(
        &mut self,
        budget: Duration,
        max_skip_normal: usize,
        max_skip_outlier: usize,
    ) -> Result<u64> {
        let started = Instant::now();
        let old_total = self.store.total_physical_size()?;
        let mut gaps = Self::gaps(self.store, true)?;
        let outlier_threshold = self.outlier_threshold()?;

        let files = self.store.index().all_fileinfos(Order::AddressDesc)?;
        let mut skipped = Vec::new();
        let mut normal_skipped = 0usize;
        let mut outlier_skipped = 0usize;

        for fi in files {
            if started.elapsed() > budget {
                debug!("quick defrag budget exhausted");
                break;
            }
            let (old_shard, old_offset) = (fi.shard, fi.offset);
            if self.move_to_earlier_gap(&fi, &mut gaps)? {
                insert_gap_sorted(
                    &mut gaps,
                    FragmentGap { shard: old_shard, offset: old_offset, size: fi.size },
                );
            } else {
                let is_outlier = fi.size >= outlier_threshold;
                skipped.push(fi);
                if is_outlier {
                    outlier_skipped += 1;
                    if outlier_skipped > max_skip_outlier {
                        break;
                    }
                } else {
                    normal_skipped += 1;
                    if normal_skipped > max_skip_normal {
                        break;
                    }
                }
            }
        }

        if let Some(earliest) = skipped
            .iter()
            .min_by_key(|f| (f.shard, f.offset))
            .map(|f| (f.shard, f.offset))
        {
            self.compact_stuck_tail(earliest, &mut gaps)?;
        }

        self.store.truncate_all_to_logical_size()?;
        let new_total = self.store.total_physical_size()?;
        info!("quick defrag reclaimed {} bytes", old_total.saturating_sub(new_total));
        Ok(old_total.saturating_sub(new_total))
    }

    /// Try to relocate `fi` into the first gap strictly before it.
    fn move_to_earlier_gap(
        &mut self,
        fi: &crate::types::FileInfo,
        gaps: &mut Vec<FragmentGap>,
    ) -> Result<bool> {
        for i in 0..gaps.len() {
            let gap = &gaps[i];
            if gap.shard > fi.shard || (gap.shard == fi.shard && gap.offset >= fi.offset) {
                return Ok(false);
            }
            if gap.size >= fi.size {
                self.store
                    .sharder()
                    .copy_range(fi.shard, fi.offset, gap.shard, gap.offset, fi.size)?;
                self.store
                    .index()
                    .update_placement(&fi.path, gap.shard, gap.offset)?;
                let gap = &mut gaps[i];
                gap.offset += fi.size;
                gap.size -= fi.size;
                if gap.size == 0 {
                    gaps.remove(i);
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Shift files at or after `earliest` backward to close the gaps
    /// immediately before them.
    fn compact_stuck_tail(
        &mut self,
        earliest: (usize, u64),
        gaps: &mut [FragmentGap],
    ) -> Result<()> {
        let conn = self.store.index().conn();
        let mut stmt = conn.prepare_cached(
            "SELECT path, shard, offset, size FROM files
             WHERE shard > ?1 OR (shard = ?1 AND offset >= ?2)
             ORDER BY shard, offset",
        )?;
        let tail: Vec<(String, usize, u64, u64)> = stmt
            .query_map(
                rusqlite::params![earliest.0 as i64, earliest.1 as i64],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get::<_, i64>(1)? as usize,
                        row.get::<_, i64>(2)? as u64,
                        row.get::<_, i64>(3)? as u64,
                    ))
                },
            )?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);

        for (path, shard, offset, size) in tail {
            for gap in gaps.iter_mut() {
                if gap.shard == shard && gap.offset + gap.size == offset {
                    let new_offset = gap.offset;
                    self.store
                        .sharder()
                        .copy_range(shard, offset, shard, new_offset, size)?;
                    self.store.index().update_placement(&path, shard, new_offset)?;
                    gap.offset = new_offset + size;
                    break;
                }
                if gap.shard > shard || (gap.shard == shard && gap.offset > offset) {
                    break;
                }
            }
        }
        Ok(())
    }

    /// File size at the 95th percentile; larger files count as outliers
    /// when quick defrag fails to place them.
    fn outlier_threshold(&self) -> Result<u64> {
        let conn = self.store.index().conn();
        let mut stmt = conn.prepare_cached(
            "SELECT size FROM files
             ORDER BY size
             LIMIT 1 OFFSET (SELECT CAST(COUNT(*) * 0.95 AS INTEGER) FROM files)",
        )?;
        let threshold: Option<i64> = stmt.query_row([], |row| row.get(0)).optional()?;
        Ok(threshold.map(|v| v as u64).unwrap_or(u64::MAX))
    }

    /// All gaps, sorted by address. With `include_end_of_shard`, the range
    /// from each shard's last file to the shard size limit counts too, as
    /// do entirely empty shards.
    pub fn gaps(store: &Barecat, include_end_of_shard: bool) -> Result<Vec<FragmentGap>> {
        let conn = store.index().conn();
        let limit = store.shard_size_limit()?;
        let sql = if include_end_of_shard {
            "WITH first_gaps AS (
                 SELECT f.shard, 0 AS offset, MIN(f.offset) AS size
                 FROM files f GROUP BY f.shard
             ),
             nonfirst_gaps AS (
                 SELECT
                     f.shard,
                     (f.offset + f.size) AS offset,
                     coalesce(
                         lead(f.offset, 1) OVER (PARTITION BY f.shard ORDER BY f.offset),
                         :limit
                     ) - (f.offset + f.size) AS size
                 FROM files f
             ),
             all_gaps AS (SELECT * FROM first_gaps UNION ALL SELECT * FROM nonfirst_gaps)
             SELECT shard, offset, size FROM all_gaps
             WHERE size > 0 ORDER BY shard, offset"
        } else {
            "WITH first_gaps AS (
                 SELECT f.shard, 0 AS offset, MIN(f.offset) AS size
                 FROM files f GROUP BY f.shard
             ),
             nonfirst_gaps AS (
                 SELECT
                     f.shard,
                     (f.offset + f.size) AS offset,
                     lead(f.offset, 1) OVER (PARTITION BY f.shard ORDER BY f.offset)
                         - (f.offset + f.size) AS size
                 FROM files f
             ),
             all_gaps AS (SELECT * FROM first_gaps UNION ALL SELECT * FROM nonfirst_gaps)
             SELECT shard, offset, size FROM all_gaps
             WHERE size > 0 ORDER BY shard, offset"
        };
        let mut stmt = conn.prepare_cached(sql)?;
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok(FragmentGap {
                shard: row.get::<_, i64>(0)? as usize,
                offset: row.get::<_, i64>(1)? as u64,
                size: row.get::<_, i64>(2)? as u64,
            })
        };
        let mut gaps: Vec<FragmentGap> = if include_end_of_shard {
            stmt.query_map(rusqlite::named_params! {":limit": limit as i64}, map_row)?
                .collect::<rusqlite::Result<_>>()?
        } else {
            stmt.query_map([], map_row)?
                .collect::<rusqlite::Result<_>>()?
        };
        if include_end_of_shard {
            for shard in 0..store.sharder().num_shards() {
                if store.index().logical_shard_end(shard)? == 0 {
                    gaps.push(FragmentGap { shard, offset: 0, size: limit });
                }
            }
        }
        gaps.sort_by_key(|g| (g.shard, g.offset));
        Ok(gaps)
    }
}

/// Insert a gap into the sorted list, coalescing with adjacent gaps.
fn insert_gap_sorted(gaps: &mut Vec<FragmentGap>, new_gap: FragmentGap) {
    if new_gap.size == 0 {
        return;
    }
    let i = gaps
        .binary_search_by(|g| (g.shard, g.offset).cmp(&(new_gap.shard, new_gap.offset)))
        .unwrap_or_else(|i| i);

    let merges_prev = i > 0
        && gaps[i - 1].shard == new_gap.shard
        && gaps[i - 1].offset + gaps[i - 1].size == new_gap.offset;
    if merges_prev {
        gaps[i - 1].size += new_gap.size;
        let merges_next = i < gaps.len()
            && gaps[i].shard == gaps[i - 1].shard
            && gaps[i - 1].offset + gaps[i - 1].size == gaps[i].offset;
        if merges_next {
            gaps[i - 1].size += gaps[i].size;
            gaps.remove(i);
        }
        return;
    }
    let merges_next = i < gaps.len()
        && gaps[i].shard == new_gap.shard
        && new_gap.offset + new_gap.size == gaps[i].offset;
    if merges_next {
        gaps[i].offset = new_gap.offset;
        gaps[i].size += new_gap.size;
        return;
    }
    gaps.insert(i, new_gap);
}
