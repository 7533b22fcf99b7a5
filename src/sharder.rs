//! Shard blob file pool.
//!
//! A shard is a raw byte stream of concatenated payloads with no framing.
//! Shards live next to the index as `<base>-shard-00000`, `-shard-00001`,
//! and so on, contiguous from zero. The index is the authority on logical
//! content; this module only moves bytes.
//!
//! All I/O is positional (`read_exact_at` / `write_all_at`), so reads work
//! through a shared reference and never race on seek state.

use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::paths;

/// Copy buffer size for streamed appends and range copies.
pub(crate) const COPY_BUFSIZE: usize = 64 * 1024;

/// Access mode of an open archive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    ReadOnly,
    /// Only appends; existing byte positions are immutable.
    AppendOnly,
    ReadWrite,
}

impl Mode {
    pub fn writable(self) -> bool {
        self != Mode::ReadOnly
    }
}

/// The ordered set of shard files belonging to one archive.
#[derive(Debug)]
pub struct Sharder {
    base: PathBuf,
    mode: Mode,
    shard_size_limit: u64,
    allow_symlinked_shard: bool,
    shards: Vec<File>,
}

impl Sharder {
    /// Open the shard files for the archive at `base`.
    ///
    /// Discovers `<base>-shard-NNNNN` files; a gap in the numbering is an
    /// integrity error. A writable archive with no shards gets shard 0
    /// created. Writing through a symlinked shard is refused unless
    /// `allow_symlinked_shard` is set, since that would desync the index of
    /// the archive the symlink points into.
    pub fn open(
        base: &Path,
        mode: Mode,
        shard_size_limit: u64,
        allow_symlinked_shard: bool,
    ) -> Result<Sharder> {
        let indices = discover_shards(base)?;
        let mut sharder = Sharder {
            base: base.to_path_buf(),
            mode,
            shard_size_limit,
            allow_symlinked_shard,
            shards: Vec::with_capacity(indices.len().max(1)),
        };
        for i in indices {
            let file = sharder.open_shard_file(i, false)?;
            sharder.shards.push(file);
        }
        if sharder.shards.is_empty() && mode.writable() {
            let file = sharder.open_shard_file(0, true)?;
            sharder.shards.push(file);
        }
        Ok(sharder)
    }

    /// Re-enumerate and reopen all shard files, e.g. after a reshard
    /// renamed temp shards into place.
    pub fn reopen(&mut self) -> Result<()> {
        let indices = discover_shards(&self.base)?;
        self.shards.clear();
        for i in indices {
            let file = self.open_shard_file(i, false)?;
            self.shards.push(file);
        }
        if self.shards.is_empty() && self.mode.writable() {
            let file = self.open_shard_file(0, true)?;
            self.shards.push(file);
        }
        Ok(())
    }

    fn open_shard_file(&self, shard: usize, create: bool) -> Result<File> {
        let path = self.shard_path(shard);
        if self.mode.writable() {
            if !create && !self.allow_symlinked_shard {
                let meta = fs::symlink_metadata(&path)?;
                if meta.file_type().is_symlink() {
                    return Err(Error::SymlinkedShard(path));
                }
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(create)
                .open(&path)?;
            Ok(file)
        } else {
            Ok(File::open(&path)?)
        }
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_size_limit(&self) -> u64 {
        self.shard_size_limit
    }

    /// Update the cached limit after a reshard rewrote the config.
    pub fn set_shard_size_limit(&mut self, limit: u64) {
        self.shard_size_limit = limit;
    }

    pub fn shard_path(&self, shard: usize) -> PathBuf {
        paths::shard_path(&self.base, shard)
    }

    fn shard(&self, shard: usize) -> Result<&File> {
        self.shards.get(shard).ok_or_else(|| {
            Error::Integrity(format!("shard {shard} does not exist on disk"))
        })
    }

    /// Read exactly `size` bytes at `(shard, offset)`. A short file is an
    /// integrity error: the index references bytes the shard does not have.
    pub fn read_range(&self, shard: usize, offset: u64, size: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; size as usize];
        let file = self.shard(shard)?;
        file.read_exact_at(&mut buf, offset).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::Integrity(format!(
                    "shard {shard} is too short: wanted [{offset}, {})",
                    offset + size
                ))
            } else {
                Error::Io(e)
            }
        })?;
        Ok(buf)
    }

    /// Read into `buf` at `(shard, offset)`, allowing a short read at end of
    /// file. Returns the number of bytes copied.
    pub fn read_into(&self, shard: usize, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let file = self.shard(shard)?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Append `data` after the current logical end of the last shard,
    /// starting a new shard when the limit would be exceeded.
    ///
    /// `logical_end` comes from the index, which is authoritative: the
    /// physical file may be longer after an aborted write. Returns the
    /// placement and the payload's CRC-32C.
    pub fn append(&mut self, data: &[u8], logical_end: u64) -> Result<(usize, u64, u64, u32)> {
        let (shard, offset) = self.place_append(data.len() as u64, logical_end)?;
        self.shards[shard].write_all_at(data, offset)?;
        Ok((shard, offset, data.len() as u64, crc32c::crc32c(data)))
    }

    /// Streamed variant of [`append`](Self::append). The caller must supply
    /// `size` up front so the too-large check happens before any byte lands.
    pub fn append_from(
        &mut self,
        reader: &mut dyn Read,
        size: u64,
        logical_end: u64,
    ) -> Result<(usize, u64, u64, u32)> {
        let (shard, offset) = self.place_append(size, logical_end)?;
        let crc = self.write_stream(shard, offset, reader, size)?;
        Ok((shard, offset, size, crc))
    }

    fn place_append(&mut self, size: u64, logical_end: u64) -> Result<(usize, u64)> {
        if self.mode == Mode::ReadOnly {
            return Err(Error::ReadOnly);
        }
        if size > self.shard_size_limit {
            return Err(Error::FileTooLarge { size, limit: self.shard_size_limit });
        }
        if self.shards.is_empty() {
            let file = self.open_shard_file(0, true)?;
            self.shards.push(file);
        }
        if logical_end + size > self.shard_size_limit {
            let shard = self.start_new_shard()?;
            Ok((shard, 0))
        } else {
            Ok((self.shards.len() - 1, logical_end))
        }
    }

    /// Write `data` at an exact placement, as used by in-place updates and
    /// defragmentation. Refused on read-only and append-only archives.
    pub fn write_at(&self, shard: usize, offset: u64, data: &[u8]) -> Result<u32> {
        self.check_exact_write(offset, data.len() as u64)?;
        self.shard(shard)?.write_all_at(data, offset)?;
        Ok(crc32c::crc32c(data))
    }

    /// Streamed variant of [`write_at`](Self::write_at).
    pub fn write_at_from(
        &self,
        shard: usize,
        offset: u64,
        reader: &mut dyn Read,
        size: u64,
    ) -> Result<u32> {
        self.check_exact_write(offset, size)?;
        self.shard(shard)?;
        self.write_stream(shard, offset, reader, size)
    }

    /// Streamed write at an exact placement that the caller guarantees is
    /// at or beyond the shard's logical end, i.e. an append in disguise.
    /// Unlike [`write_at_from`](Self::write_at_from) this is allowed on
    /// append-only archives; merge uses it to land payloads at the tail.
    pub fn write_tail_from(
        &self,
        shard: usize,
        offset: u64,
        reader: &mut dyn Read,
        size: u64,
    ) -> Result<u32> {
        if self.mode == Mode::ReadOnly {
            return Err(Error::ReadOnly);
        }
        if offset + size > self.shard_size_limit {
            return Err(Error::FileTooLarge { size, limit: self.shard_size_limit });
        }
        self.shard(shard)?;
        self.write_stream(shard, offset, reader, size)
    }

    fn check_exact_write(&self, offset: u64, size: u64) -> Result<()> {
        match self.mode {
            Mode::ReadOnly => return Err(Error::ReadOnly),
            Mode::AppendOnly => return Err(Error::AppendOnly),
            Mode::ReadWrite => {}
        }
        if offset + size > self.shard_size_limit {
            return Err(Error::FileTooLarge { size, limit: self.shard_size_limit });
        }
        Ok(())
    }

    fn write_stream(
        &self,
        shard: usize,
        mut offset: u64,
        reader: &mut dyn Read,
        size: u64,
    ) -> Result<u32> {
        let file = self.shard(shard)?;
        let mut crc = 0u32;
        let mut remaining = size;
        let mut buf = vec![0u8; COPY_BUFSIZE.min(size.max(1) as usize)];
        while remaining > 0 {
            let want = buf.len().min(remaining as usize);
            let n = reader.read(&mut buf[..want])?;
            if n == 0 {
                return Err(Error::Integrity(format!(
                    "stream ended {remaining} bytes short of the declared size {size}"
                )));
            }
            file.write_all_at(&buf[..n], offset)?;
            crc = crc32c::crc32c_append(crc, &buf[..n]);
            offset += n as u64;
            remaining -= n as u64;
        }
        Ok(crc)
    }

    /// Copy `size` bytes from one shard address to another. Safe for
    /// overlapping ranges as long as the destination precedes the source,
    /// which is how defragmentation uses it.
    pub fn copy_range(
        &self,
        src_shard: usize,
        src_offset: u64,
        dst_shard: usize,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        if self.mode != Mode::ReadWrite {
            return Err(match self.mode {
                Mode::ReadOnly => Error::ReadOnly,
                _ => Error::AppendOnly,
            });
        }
        let src = self.shard(src_shard)?;
        self.shard(dst_shard)?;
        let mut buf = vec![0u8; COPY_BUFSIZE.min(size.max(1) as usize)];
        let mut copied = 0u64;
        while copied < size {
            let want = buf.len().min((size - copied) as usize);
            src.read_exact_at(&mut buf[..want], src_offset + copied).map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    Error::Integrity(format!(
                        "shard {src_shard} is too short while copying [{src_offset}, {})",
                        src_offset + size
                    ))
                } else {
                    Error::Io(e)
                }
            })?;
            self.shard(dst_shard)?.write_all_at(&buf[..want], dst_offset + copied)?;
            copied += want as u64;
        }
        Ok(())
    }

    /// Create the next shard file and return its number.
    pub fn start_new_shard(&mut self) -> Result<usize> {
        if self.mode == Mode::ReadOnly {
            return Err(Error::ReadOnly);
        }
        let shard = self.shards.len();
        let file = self.open_shard_file(shard, true)?;
        self.shards.push(file);
        Ok(shard)
    }

    /// Truncate a shard to `len` bytes. Allowed on append-only archives
    /// only to roll back a failed append (the cut bytes are unreferenced).
    pub fn truncate(&self, shard: usize, len: u64) -> Result<()> {
        if self.mode == Mode::ReadOnly {
            return Err(Error::ReadOnly);
        }
        self.shard(shard)?.set_len(len)?;
        Ok(())
    }

    /// Delete shards `first..` from disk and drop their handles. Shard 0 is
    /// permanent; an emptied archive keeps a zero-length shard 0.
    pub fn remove_shards_from(&mut self, first: usize) -> Result<()> {
        if self.mode != Mode::ReadWrite {
            return Err(match self.mode {
                Mode::ReadOnly => Error::ReadOnly,
                _ => Error::AppendOnly,
            });
        }
        let first = first.max(1);
        while self.shards.len() > first {
            self.shards.pop();
            let path = self.shard_path(self.shards.len());
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// OS-reported byte length of a shard file.
    pub fn physical_shard_end(&self, shard: usize) -> Result<u64> {
        Ok(self.shard(shard)?.metadata()?.len())
    }

    /// Sum of the physical lengths of all shard files.
    pub fn total_physical_size(&self) -> Result<u64> {
        let mut total = 0;
        for i in 0..self.shards.len() {
            total += self.physical_shard_end(i)?;
        }
        Ok(total)
    }
}

/// Enumerate existing shard numbers for `base`, verifying contiguity.
fn discover_shards(base: &Path) -> Result<Vec<usize>> {
    let dir = match base.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let stem = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let prefix = format!("{stem}-shard-");

    let mut indices = Vec::new();
    if dir.exists() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(suffix) = name.strip_prefix(&prefix) {
                if suffix.len() == 5 && suffix.bytes().all(|b| b.is_ascii_digit()) {
                    indices.push(suffix.parse::<usize>().unwrap_or(0));
                }
            }
        }
    }
    indices.sort_unstable();
    for (i, &idx) in indices.iter().enumerate() {
        if idx != i {
            return Err(Error::Integrity(format!(
                "shard numbering is not contiguous: missing shard {i}"
            )));
        }
    }
    Ok(indices)
}
