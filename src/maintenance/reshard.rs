//! Reshard: change the shard size limit with minimal data motion.
//!
//! Shard 0 keeps its prefix in place and is truncated at the new limit;
//! overflow streams into a temporary shard sequence that is renamed into
//! place at the end. Source shards are truncated to zero as soon as the
//! copy cursor moves past them, keeping intermediate disk usage bounded.

use std::fs;

use log::info;
use rusqlite::OptionalExtension;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::paths;
use crate::sharder::{Mode, Sharder};
use crate::store::Barecat;
use crate::types::Order;

const COPY_CHUNK: u64 = 64 * 1024;

pub fn reshard(store: &mut Barecat, new_limit: u64) -> Result<()> {
    // No single file may exceed the new limit; checked before any byte moves.
    let max_size: Option<i64> = store
        .index()
        .conn()
        .query_row("SELECT MAX(size) FROM files", [], |row| row.get(0))
        .optional()?
        .flatten();
    let max_size = max_size.unwrap_or(0) as u64;
    if max_size > new_limit {
        return Err(Error::FileTooLarge { size: max_size, limit: new_limit });
    }

    let temp_suffix = format!("_{}", &Uuid::new_v4().simple().to_string()[..12]);
    let mut temp_base = store.path().as_os_str().to_os_string();
    temp_base.push(&temp_suffix);
    let temp_base = std::path::PathBuf::from(temp_base);

    let mut temp_sharder: Option<Sharder> = None;

    let mut new_shard = 0usize;
    let mut new_offset = 0u64;
    let mut prev_source_shard = 0usize;
    let mut shard0_final = 0u64;

    let files = store.index().all_fileinfos(Order::Address)?;
    for fi in &files {
        // Once the cursor leaves a source shard, its bytes are all either
        // in place (shard 0) or copied out; reclaim the space immediately.
        if fi.shard > prev_source_shard {
            for s in prev_source_shard..fi.shard {
                if s == 0 {
                    store.sharder().truncate(0, shard0_final)?;
                } else {
                    store.sharder().truncate(s, 0)?;
                }
            }
            prev_source_shard = fi.shard;
        }

        if new_offset + fi.size > new_limit {
            if new_shard == 0 {
                shard0_final = new_offset;
            }
            new_shard += 1;
            new_offset = 0;
        }

        if new_shard == 0 {
            if !(fi.shard == 0 && fi.offset == new_offset) {
                store
                    .sharder()
                    .copy_range(fi.shard, fi.offset, 0, new_offset, fi.size)?;
                store.index().update_placement(&fi.path, 0, new_offset)?;
            }
            shard0_final = new_offset + fi.size;
        } else {
            if temp_sharder.is_none() {
                temp_sharder =
                    Some(Sharder::open(&temp_base, Mode::ReadWrite, new_limit, false)?);
            }
            if let Some(temp) = temp_sharder.as_mut() {
                let temp_idx = new_shard - 1;
                while temp.num_shards() <= temp_idx {
                    temp.start_new_shard()?;
                }
                // Chunked copy from the source shard into the temp shard.
                let mut copied = 0u64;
                while copied < fi.size {
                    let n = COPY_CHUNK.min(fi.size - copied);
                    let buf = store
                        .sharder()
                        .read_range(fi.shard, fi.offset + copied, n)?;
                    temp.write_at(temp_idx, new_offset + copied, &buf)?;
                    copied += n;
                }
            }
            // Temp shard k becomes final shard k + 1.
            store
                .index()
                .update_placement(&fi.path, new_shard, new_offset)?;
        }

        new_offset += fi.size;
    }

    for s in prev_source_shard..store.sharder().num_shards() {
        if s == 0 {
            store.sharder().truncate(0, shard0_final)?;
        } else {
            store.sharder().truncate(s, 0)?;
        }
    }
    store.sharder_mut().remove_shards_from(1)?;

    if let Some(temp) = temp_sharder.take() {
        let count = temp.num_shards();
        drop(temp);
        for i in 0..count {
            let from = paths::shard_path(&temp_base, i);
            let to = paths::shard_path(store.path(), i + 1);
            fs::rename(&from, &to)?;
        }
    }

    store.set_shard_size_limit(new_limit)?;
    store.sharder_mut().reopen()?;
    info!(
        "resharded {} to limit {new_limit} ({} shards)",
        store.path().display(),
        store.sharder().num_shards()
    );
    Ok(())
}
