//! File handles over shard byte ranges.
//!
//! Readers are thin slice views. Writers overwrite in place inside the
//! original payload extent and stage growth in an in-memory spillover
//! buffer; on close the full logical content is committed through the
//! store's update path, which may relocate the payload.

use std::io::{self, Read, Seek, SeekFrom, Write};

use log::error;

use crate::error::{Error, Result};
use crate::index::now_ns;
use crate::sharder::Sharder;
use crate::store::Barecat;
use crate::types::FileInfo;

/// How to open a writable file handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// Read and write; the file must exist (like `r+`).
    ReadWrite,
    /// Truncate to empty, creating the file if missing (like `w`).
    Truncate,
    /// Position at the end, creating the file if missing (like `a`).
    Append,
    /// Create a new file; fail if one exists (like `x`).
    CreateNew,
}

fn to_io(e: Error) -> io::Error {
    io::Error::other(e)
}

/// Read-only view over a stored file's byte range (`Read + Seek`).
///
/// Reads clamp at the end of the file; seeking past the end is permitted
/// and subsequent reads return nothing.
pub struct FileReader<'a> {
    sharder: &'a Sharder,
    info: FileInfo,
    pos: u64,
}

impl<'a> FileReader<'a> {
    pub(crate) fn new(sharder: &'a Sharder, info: FileInfo) -> Self {
        FileReader { sharder, info, pos: 0 }
    }

    /// Metadata record of the file this handle reads.
    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    pub fn len(&self) -> u64 {
        self.info.size
    }

    pub fn is_empty(&self) -> bool {
        self.info.size == 0
    }
}

impl Read for FileReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.info.size.saturating_sub(self.pos);
        let want = (buf.len() as u64).min(remaining) as usize;
        if want == 0 {
            return Ok(0);
        }
        let n = self
            .sharder
            .read_into(self.info.shard, self.info.offset + self.pos, &mut buf[..want])
            .map_err(to_io)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for FileReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = resolve_seek(pos, self.pos, self.info.size)?;
        Ok(self.pos)
    }
}

fn resolve_seek(pos: SeekFrom, current: u64, end: u64) -> io::Result<u64> {
    let target = match pos {
        SeekFrom::Start(p) => p as i64,
        SeekFrom::Current(d) => current as i64 + d,
        SeekFrom::End(d) => end as i64 + d,
    };
    if target < 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "seek before the start of the file",
        ));
    }
    Ok(target as u64)
}

/// Writable handle over a stored file (`Read + Write + Seek`).
///
/// Writes that stay within the original payload extent go straight to the
/// shard. Writes past it accumulate in the spillover buffer, keyed from the
/// original size. Seeking past the end and then writing zero-fills the
/// hole. [`close`](Self::close) commits any changes through the store's
/// update path and must be checked; dropping an unclosed dirty handle
/// commits best-effort and logs failures.
pub struct FileWriter<'a> {
    store: &'a mut Barecat,
    base: FileInfo,
    spill: Vec<u8>,
    logical_len: u64,
    pos: u64,
    dirty: bool,
    closed: bool,
}

impl<'a> FileWriter<'a> {
    pub(crate) fn open(store: &'a mut Barecat, path: &str, mode: WriteMode) -> Result<Self> {
        let exists = store.index().isfile(path)?;
        match mode {
            WriteMode::CreateNew if exists => {
                return Err(Error::FileExists(path.to_string()));
            }
            WriteMode::ReadWrite if !exists => {
                return Err(Error::FileNotFound(path.to_string()));
            }
            _ => {}
        }
        if !exists {
            let mut finfo = FileInfo::new(path)?;
            finfo.mtime_ns = Some(now_ns());
            store.add_file(finfo, b"")?;
        }
        let base = store.index().lookup_file(path)?;
        let (logical_len, dirty) = match mode {
            WriteMode::Truncate => (0, base.size != 0),
            _ => (base.size, false),
        };
        let pos = match mode {
            WriteMode::Append => logical_len,
            _ => 0,
        };
        Ok(FileWriter {
            store,
            base,
            spill: Vec::new(),
            logical_len,
            pos,
            dirty,
            closed: false,
        })
    }

    pub fn len(&self) -> u64 {
        self.logical_len
    }

    pub fn is_empty(&self) -> bool {
        self.logical_len == 0
    }

    /// Shrink or grow the logical file. Growing zero-fills; shrinking
    /// drops spillover past the new length (in-place bytes may remain
    /// physically but are no longer referenced after commit).
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        if len < self.logical_len {
            if len >= self.base.size {
                self.spill.truncate((len - self.base.size) as usize);
            } else {
                self.spill.clear();
            }
            self.logical_len = len;
            self.dirty = true;
        } else if len > self.logical_len {
            self.fill_zeros(len)?;
            self.dirty = true;
        }
        Ok(())
    }

    /// Commit any pending changes and consume the handle. A deferred
    /// update failure surfaces here; callers must check the result.
    pub fn close(mut self) -> Result<()> {
        self.commit()
    }

    fn commit(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if !self.dirty {
            return Ok(());
        }
        let inplace = self.logical_len.min(self.base.size);
        let mut data = if inplace > 0 {
            self.store
                .sharder()
                .read_range(self.base.shard, self.base.offset, inplace)?
        } else {
            Vec::new()
        };
        if self.logical_len > self.base.size {
            let spill_len = (self.logical_len - self.base.size) as usize;
            data.extend_from_slice(&self.spill[..spill_len]);
        }
        self.store.update(&self.base.path, &data)
    }

    /// Zero-fill the range `[logical_len, to)`.
    fn fill_zeros(&mut self, to: u64) -> Result<()> {
        if to <= self.logical_len {
            return Ok(());
        }
        let inplace_end = to.min(self.base.size);
        if self.logical_len < inplace_end {
            let zeros = vec![0u8; (inplace_end - self.logical_len) as usize];
            self.store.sharder().write_at(
                self.base.shard,
                self.base.offset + self.logical_len,
                &zeros,
            )?;
        }
        if to > self.base.size {
            let need = (to - self.base.size) as usize;
            if self.spill.len() < need {
                self.spill.resize(need, 0);
            }
        }
        self.logical_len = to;
        Ok(())
    }
}

impl Read for FileWriter<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.logical_len.saturating_sub(self.pos);
        let want = (buf.len() as u64).min(remaining) as usize;
        if want == 0 {
            return Ok(0);
        }
        let n = if self.pos < self.base.size {
            let in_shard = ((self.base.size - self.pos) as usize).min(want);
            self.store
                .sharder()
                .read_into(
                    self.base.shard,
                    self.base.offset + self.pos,
                    &mut buf[..in_shard],
                )
                .map_err(to_io)?
        } else {
            let start = (self.pos - self.base.size) as usize;
            buf[..want].copy_from_slice(&self.spill[start..start + want]);
            want
        };
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for FileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pos > self.logical_len {
            self.fill_zeros(self.pos).map_err(to_io)?;
        }
        let start = self.pos;
        let end = start + buf.len() as u64;

        if start < self.base.size {
            let in_shard = (self.base.size - start).min(buf.len() as u64) as usize;
            self.store
                .sharder()
                .write_at(self.base.shard, self.base.offset + start, &buf[..in_shard])
                .map_err(to_io)?;
        }
        if end > self.base.size {
            let src_from = (self.base.size.saturating_sub(start)) as usize;
            let spill_from = start.max(self.base.size) - self.base.size;
            let need = spill_from as usize + (buf.len() - src_from);
            if self.spill.len() < need {
                self.spill.resize(need, 0);
            }
            self.spill[spill_from as usize..need].copy_from_slice(&buf[src_from..]);
        }

        self.pos = end;
        self.logical_len = self.logical_len.max(end);
        self.dirty = true;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for FileWriter<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = resolve_seek(pos, self.pos, self.logical_len)?;
        Ok(self.pos)
    }
}

impl Drop for FileWriter<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.commit() {
            error!(
                "deferred update of {:?} failed while dropping the handle: {e}",
                self.base.path
            );
        }
    }
}
