//! The archive store: shard blobs plus metadata index behind one
//! filesystem-like API.

use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use log::{info, warn};
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::fileobj::{FileReader, FileWriter, WriteMode};
use crate::index::{FileMetaUpdate, Index, now_ns};
use crate::maintenance::defrag::{DefragMode, Defragger, GapStats};
use crate::maintenance::merge::MergeOptions;
use crate::maintenance::reshard;
use crate::paths;
use crate::sharder::{Mode, Sharder};
use crate::types::{DirInfo, EntryInfo, FileInfo, Order};

/// Options for opening an archive.
#[derive(Clone, Debug)]
pub struct BarecatOptions {
    /// Open for reading only (the default).
    pub readonly: bool,
    /// Refuse mutations that would invalidate existing byte positions
    /// (remove, rename, update, defrag). Implies writable.
    pub append_only: bool,
    /// Set the shard size limit on open (writable archives only).
    pub shard_size_limit: Option<u64>,
    /// Delete an existing archive before creating a fresh one.
    pub overwrite: bool,
    /// Allow opening an existing archive for writing (on by default).
    pub exist_ok: bool,
    /// Permit writing through a shard file that is a symlink.
    pub allow_writing_symlinked_shard: bool,
    /// Use WAL journaling on the index.
    pub wal: bool,
}

impl Default for BarecatOptions {
    fn default() -> Self {
        BarecatOptions {
            readonly: true,
            append_only: false,
            shard_size_limit: None,
            overwrite: false,
            exist_ok: true,
            allow_writing_symlinked_shard: false,
            wal: false,
        }
    }
}

impl BarecatOptions {
    /// Options for a writable archive.
    pub fn writable() -> Self {
        BarecatOptions { readonly: false, ..Default::default() }
    }
}

/// A Barecat archive: several large shard files holding concatenated small
/// payloads, and an SQLite index mapping each path to its shard address and
/// metadata.
///
/// A `Barecat` is single-owner. For multi-threaded reading, open one
/// read-only instance per thread; the handles are cheap (one database
/// connection plus the shard file descriptors).
#[derive(Debug)]
pub struct Barecat {
    path: PathBuf,
    mode: Mode,
    index: Index,
    sharder: Sharder,
    _lock: Option<File>,
}

impl Barecat {
    /// Open an existing archive read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Barecat> {
        Self::with_options(path, &BarecatOptions::default())
    }

    /// Open or create an archive for reading and writing.
    pub fn create(path: impl AsRef<Path>) -> Result<Barecat> {
        Self::with_options(path, &BarecatOptions::writable())
    }

    pub fn with_options(path: impl AsRef<Path>, options: &BarecatOptions) -> Result<Barecat> {
        let path = path.as_ref().to_path_buf();
        if !options.readonly && Self::archive_exists(&path) {
            if !options.exist_ok {
                return Err(Error::FileExists(path.display().to_string()));
            }
            if options.overwrite {
                info!("overwriting existing archive at {}", path.display());
                Self::remove_archive(&path)?;
            }
        }
        if options.readonly && !Self::archive_exists(&path) {
            return Err(Error::FileNotFound(path.display().to_string()));
        }

        let mode = if options.readonly {
            Mode::ReadOnly
        } else if options.append_only {
            Mode::AppendOnly
        } else {
            Mode::ReadWrite
        };

        let index_path = paths::resolve_index_path(&path);

        // Single-writer invariant: hold an exclusive lock on the index file
        // for the lifetime of any writable store.
        let lock = if mode.writable() {
            let lock_file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&index_path)?;
            if !lock_file.try_lock_exclusive()? {
                return Err(Error::Locked(index_path));
            }
            Some(lock_file)
        } else {
            None
        };

        let index = Index::open(&index_path, options.readonly, options.wal)?;
        if !options.readonly {
            if let Some(limit) = options.shard_size_limit {
                index.set_shard_size_limit(limit)?;
            }
        }
        let limit = index.shard_size_limit()?;
        let sharder = Sharder::open(&path, mode, limit, options.allow_writing_symlinked_shard)?;

        Ok(Barecat { path, mode, index, sharder, _lock: lock })
    }

    /// True if anything of an archive exists at `path`: an index under
    /// either naming convention, or any shard file.
    pub fn archive_exists(path: &Path) -> bool {
        if path.exists() && !path.is_dir() {
            return true;
        }
        if paths::legacy_index_path(path).exists() {
            return true;
        }
        paths::shard_path(path, 0).exists()
    }

    /// Delete an archive: the index (both naming conventions), journal
    /// siblings, and every shard file.
    pub fn remove_archive(path: &Path) -> Result<()> {
        let mut targets = vec![path.to_path_buf(), paths::legacy_index_path(path)];
        for index_path in targets.clone() {
            for suffix in ["-journal", "-wal", "-shm"] {
                let mut s = index_path.as_os_str().to_os_string();
                s.push(suffix);
                targets.push(PathBuf::from(s));
            }
        }
        let mut shard = 0;
        loop {
            let p = paths::shard_path(path, shard);
            if !p.exists() {
                break;
            }
            targets.push(p);
            shard += 1;
        }
        for target in targets {
            if target.exists() {
                fs::remove_file(&target)?;
            }
        }
        Ok(())
    }

    // ---- Accessors ----

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn readonly(&self) -> bool {
        self.mode == Mode::ReadOnly
    }

    pub fn append_only(&self) -> bool {
        self.mode == Mode::AppendOnly
    }

    /// The metadata index, for direct queries.
    pub fn index(&self) -> &Index {
        &self.index
    }

    pub(crate) fn sharder(&self) -> &Sharder {
        &self.sharder
    }

    pub(crate) fn sharder_mut(&mut self) -> &mut Sharder {
        &mut self.sharder
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.mode == Mode::ReadOnly {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    pub(crate) fn check_read_write(&self) -> Result<()> {
        match self.mode {
            Mode::ReadOnly => Err(Error::ReadOnly),
            Mode::AppendOnly => Err(Error::AppendOnly),
            Mode::ReadWrite => Ok(()),
        }
    }

    // ---- Reading ----

    /// Read a whole file, verifying its checksum when one is stored.
    pub fn read(&self, path: &str) -> Result<Vec<u8>> {
        let finfo = self.index.lookup_file(path)?;
        self.read_info(&finfo)
    }

    /// Read a whole file given its record, verifying the checksum.
    pub fn read_info(&self, finfo: &FileInfo) -> Result<Vec<u8>> {
        let data = self.sharder.read_range(finfo.shard, finfo.offset, finfo.size)?;
        if let Some(expected) = finfo.crc32c {
            let actual = crc32c::crc32c(&data);
            if actual != expected {
                return Err(Error::Integrity(format!(
                    "crc32c mismatch for {:?}: expected {expected:#010x}, got {actual:#010x}",
                    finfo.path
                )));
            }
        }
        Ok(data)
    }

    /// Read a whole file, or `None` if no such file exists.
    pub fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match self.read(path) {
            Ok(data) => Ok(Some(data)),
            Err(Error::FileNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Read part of a file into `buf`, starting at `offset` within the
    /// file. Returns the number of bytes copied (short at end of file).
    pub fn read_into(&self, path: &str, buf: &mut [u8], offset: u64) -> Result<usize> {
        let finfo = self.index.lookup_file(path)?;
        let offset = offset.min(finfo.size);
        let want = (buf.len() as u64).min(finfo.size - offset) as usize;
        self.sharder
            .read_into(finfo.shard, finfo.offset + offset, &mut buf[..want])
    }

    /// Open a read handle over a stored file (`Read + Seek`).
    pub fn open_reader(&self, path: &str) -> Result<FileReader<'_>> {
        let finfo = self.index.lookup_file(path)?;
        Ok(FileReader::new(&self.sharder, finfo))
    }

    /// Open a writable handle over a stored file. Requires a fully
    /// read-write store: the deferred commit goes through the update path,
    /// which append-only archives forbid.
    pub fn open_writer(&mut self, path: &str, mode: WriteMode) -> Result<FileWriter<'_>> {
        self.check_read_write()?;
        FileWriter::open(self, path, mode)
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        self.index.exists(path)
    }

    pub fn isfile(&self, path: &str) -> Result<bool> {
        self.index.isfile(path)
    }

    pub fn isdir(&self, path: &str) -> Result<bool> {
        self.index.isdir(path)
    }

    /// Names of the entries in a directory.
    pub fn listdir(&self, path: &str) -> Result<Vec<String>> {
        self.index.listdir_names(path, Order::Any)
    }

    /// Entry records of a directory's immediate contents.
    pub fn scandir(&self, path: &str) -> Result<Vec<EntryInfo>> {
        self.index.listdir_infos(path, Order::Any)
    }

    /// Depth-first walk yielding `(dir, subdirs, files)` triples.
    pub fn walk(&self, path: &str) -> Result<crate::index::Walk<'_>> {
        self.index.walk(path)
    }

    /// Paths matching a glob pattern.
    pub fn glob(&self, pattern: &str, recursive: bool, include_hidden: bool) -> Result<Vec<String>> {
        self.index.glob_paths(pattern, recursive, include_hidden, false)
    }

    /// File paths matching a glob pattern.
    pub fn glob_files(
        &self,
        pattern: &str,
        recursive: bool,
        include_hidden: bool,
    ) -> Result<Vec<String>> {
        self.index.glob_paths(pattern, recursive, include_hidden, true)
    }

    pub fn num_files(&self) -> Result<u64> {
        self.index.num_files()
    }

    pub fn num_dirs(&self) -> Result<u64> {
        self.index.num_dirs()
    }

    pub fn total_size(&self) -> Result<u64> {
        self.index.total_size()
    }

    // ---- Writing ----

    /// Store a new file. Missing ancestor directories are created.
    pub fn add(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let mut finfo = FileInfo::new(path)?;
        finfo.mtime_ns = Some(now_ns());
        self.add_file(finfo, data)
    }

    /// Store a new file with caller-supplied metadata.
    pub fn add_file(&mut self, mut finfo: FileInfo, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        if self.index.isfile(&finfo.path)? {
            return Err(Error::FileExists(finfo.path));
        }
        let cursor = self.append_cursor()?;
        let (shard, offset, size, crc) = self.sharder.append(data, cursor)?;
        finfo.shard = shard;
        finfo.offset = offset;
        finfo.size = size;
        finfo.crc32c = Some(crc);
        self.commit_appended(finfo)
    }

    /// Store a new file from a reader. `size` must be exact; it is checked
    /// against the shard limit before any byte is written.
    pub fn add_stream(
        &mut self,
        mut finfo: FileInfo,
        reader: &mut dyn Read,
        size: u64,
    ) -> Result<()> {
        self.check_writable()?;
        if self.index.isfile(&finfo.path)? {
            return Err(Error::FileExists(finfo.path));
        }
        let cursor = self.append_cursor()?;
        let (shard, offset, size, crc) = self.sharder.append_from(reader, size, cursor)?;
        finfo.shard = shard;
        finfo.offset = offset;
        finfo.size = size;
        finfo.crc32c = Some(crc);
        self.commit_appended(finfo)
    }

    /// The payload bytes are on disk; insert the row, rolling the shard
    /// back on failure so nothing is leaked.
    fn commit_appended(&mut self, finfo: FileInfo) -> Result<()> {
        let (shard, offset) = (finfo.shard, finfo.offset);
        match self.index.add_file(&finfo) {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(trunc_err) = self.sharder.truncate(shard, offset) {
                    warn!(
                        "could not roll back shard {shard} after failed insert: {trunc_err}"
                    );
                }
                Err(e)
            }
        }
    }

    /// Where the next append lands: the logical end of the last physical
    /// shard, as recorded by the index (the file may be physically longer
    /// after an aborted write; the index is authoritative).
    fn append_cursor(&self) -> Result<u64> {
        let last = self.sharder.num_shards().saturating_sub(1);
        self.index.logical_shard_end(last)
    }

    /// Import a file or directory from the filesystem, preserving stat
    /// metadata.
    pub fn add_from_fs(
        &mut self,
        filesys_path: &Path,
        store_path: &str,
        dir_exist_ok: bool,
    ) -> Result<()> {
        use std::os::unix::fs::MetadataExt;
        self.check_writable()?;
        let meta = fs::metadata(filesys_path)?;
        let mtime_ns = meta.mtime() * 1_000_000_000 + meta.mtime_nsec();
        if meta.is_dir() {
            let mut dinfo = DirInfo::new(store_path)?;
            dinfo.mode = Some(meta.mode());
            dinfo.uid = Some(meta.uid());
            dinfo.gid = Some(meta.gid());
            dinfo.mtime_ns = Some(mtime_ns);
            return self.index.add_dir(&dinfo, dir_exist_ok);
        }
        let mut finfo = FileInfo::new(store_path)?;
        finfo.mode = Some(meta.mode());
        finfo.uid = Some(meta.uid());
        finfo.gid = Some(meta.gid());
        finfo.mtime_ns = Some(mtime_ns);
        let mut file = File::open(filesys_path)?;
        self.add_stream(finfo, &mut file, meta.len())
    }

    /// Create a directory (like `mkdir -p` for the ancestors).
    pub fn mkdir(&mut self, path: &str, mode: u32, exist_ok: bool) -> Result<()> {
        self.check_writable()?;
        let mut dinfo = DirInfo::new(path)?;
        dinfo.mode = Some(mode);
        dinfo.mtime_ns = Some(now_ns());
        self.index.add_dir(&dinfo, exist_ok)
    }

    /// Replace a file's contents. Data no larger than the old payload is
    /// written in place; larger data goes wherever `find_space` points
    /// (the old range becomes a gap).
    pub fn update(&mut self, path: &str, data: &[u8]) -> Result<()> {
        self.update_with(path, data, &FileMetaUpdate::default())
    }

    pub fn update_with(&mut self, path: &str, data: &[u8], meta: &FileMetaUpdate) -> Result<()> {
        self.check_read_write()?;
        let old = self.index.lookup_file(path)?;
        let new_size = data.len() as u64;
        let (shard, offset) = if new_size <= old.size {
            (old.shard, old.offset)
        } else {
            let placement = self.index.find_space(&old, new_size)?;
            while placement.shard >= self.sharder.num_shards() {
                self.sharder.start_new_shard()?;
            }
            (placement.shard, placement.offset)
        };
        let crc = self.sharder.write_at(shard, offset, data)?;
        self.index
            .update_contents(&old.path, shard, offset, new_size, Some(crc))?;
        self.index.update_file_metadata(&old.path, meta)?;
        Ok(())
    }

    /// Remove a file. Its bytes are reclaimed immediately when it sits at
    /// the end of its shard; otherwise they remain as a gap until defrag.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        self.check_read_write()?;
        let finfo = match self.index.lookup_file(path) {
            Ok(finfo) => finfo,
            Err(Error::FileNotFound(p)) => {
                if self.index.isdir(path)? {
                    return Err(Error::IsADirectory(p));
                }
                return Err(Error::FileNotFound(p));
            }
            Err(e) => return Err(e),
        };
        let end = finfo.end();
        if finfo.shard < self.sharder.num_shards()
            && end == self.index.logical_shard_end(finfo.shard)?
            && end >= self.sharder.physical_shard_end(finfo.shard)?
        {
            self.sharder.truncate(finfo.shard, finfo.offset)?;
        }
        self.index.remove_file(&finfo.path)
    }

    /// Remove an empty directory.
    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        self.check_read_write()?;
        self.index.remove_empty_dir(path)
    }

    /// Remove a directory and all its contents. Shard bytes are left as
    /// gaps until defrag.
    pub fn rmtree(&mut self, path: &str) -> Result<()> {
        self.check_read_write()?;
        self.index.remove_recursively(path)
    }

    /// Rename a file or directory.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        self.check_read_write()?;
        self.index.rename(old, new, false)
    }

    pub fn chmod(&mut self, path: &str, mode: u32) -> Result<()> {
        self.check_read_write()?;
        self.index.chmod(path, mode)
    }

    pub fn chown(&mut self, path: &str, uid: u32, gid: u32) -> Result<()> {
        self.check_read_write()?;
        self.index.chown(path, uid, gid)
    }

    pub fn set_mtime(&mut self, path: &str, mtime_ns: i64) -> Result<()> {
        self.check_read_write()?;
        self.index.set_mtime(path, mtime_ns)
    }

    // ---- Sizes ----

    pub fn shard_size_limit(&self) -> Result<u64> {
        self.index.shard_size_limit()
    }

    pub fn set_shard_size_limit(&mut self, limit: u64) -> Result<()> {
        self.index.set_shard_size_limit(limit)?;
        self.sharder.set_shard_size_limit(limit);
        Ok(())
    }

    pub fn logical_shard_end(&self, shard: usize) -> Result<u64> {
        self.index.logical_shard_end(shard)
    }

    pub fn physical_shard_end(&self, shard: usize) -> Result<u64> {
        self.sharder.physical_shard_end(shard)
    }

    /// Sum of all shard file lengths on disk.
    pub fn total_physical_size(&self) -> Result<u64> {
        self.sharder.total_physical_size()
    }

    /// Sum of all stored file sizes per the index.
    pub fn total_logical_size(&self) -> Result<u64> {
        self.index.total_size()
    }

    /// Cut every shard back to its logical end, dropping orphaned tail
    /// bytes left by aborted writes.
    pub fn truncate_all_to_logical_size(&mut self) -> Result<()> {
        self.check_read_write()?;
        for shard in 0..self.sharder.num_shards() {
            let end = self.index.logical_shard_end(shard)?;
            self.sharder.truncate(shard, end)?;
        }
        Ok(())
    }

    // ---- Consistency ----

    /// Re-read one file and compare against its stored checksum.
    pub fn check_crc32c(&self, path: &str) -> Result<bool> {
        let finfo = self.index.lookup_file(path)?;
        Ok(check_file_crc(&self.sharder, &finfo))
    }

    /// Verify archive integrity: payload checksums (all files, or only the
    /// last one with `quick`) plus the index's own consistency checks.
    ///
    /// The full pass fans records out to a rayon pool in address order;
    /// each worker reads and checksums one payload via positional I/O. The
    /// workers share only the shard pool, never the index connection.
    pub fn verify_integrity(&self, quick: bool) -> Result<bool> {
        let mut good = true;
        if quick {
            if let Some(finfo) = self.index.last_fileinfo()? {
                good &= check_file_crc(&self.sharder, &finfo);
            }
        } else {
            let infos = self.index.all_fileinfos(Order::Address)?;
            let sharder = &self.sharder;
            let bad_count = infos
                .par_iter()
                .filter(|finfo| !check_file_crc(sharder, finfo))
                .count();
            good &= bad_count == 0;
        }
        let problems = self.index.verify_integrity()?;
        for problem in &problems {
            warn!("{problem}");
        }
        good &= problems.is_empty();
        Ok(good)
    }

    // ---- Maintenance ----

    /// Defragment the archive. Returns the number of bytes reclaimed.
    pub fn defrag(&mut self, mode: DefragMode) -> Result<u64> {
        self.check_read_write()?;
        Defragger::new(self).run(mode)
    }

    /// Gap statistics for deciding whether a defrag is worthwhile.
    pub fn gap_stats(&self) -> Result<GapStats> {
        Defragger::gap_stats(self)
    }

    /// Change the shard size limit, rewriting shard files with minimal
    /// data motion.
    pub fn reshard(&mut self, new_limit: u64) -> Result<()> {
        self.check_read_write()?;
        reshard::reshard(self, new_limit)
    }

    /// Merge another archive into this one.
    pub fn merge_from(&mut self, source: &Path, options: &MergeOptions) -> Result<()> {
        self.check_writable()?;
        crate::maintenance::merge::merge(self, source, options)
    }

    /// Close the archive, running the index's lightweight optimize pass.
    pub fn close(self) -> Result<()> {
        if self.mode.writable() {
            self.index.conn_pragma_optimize()?;
        }
        Ok(())
    }
}

fn check_file_crc(sharder: &Sharder, finfo: &FileInfo) -> bool {
    match sharder.read_range(finfo.shard, finfo.offset, finfo.size) {
        Ok(data) => match finfo.crc32c {
            Some(expected) => {
                let actual = crc32c::crc32c(&data);
                if actual != expected {
                    warn!(
                        "crc32c mismatch for {:?}: expected {expected:#010x}, got {actual:#010x}",
                        finfo.path
                    );
                    false
                } else {
                    true
                }
            }
            None => true,
        },
        Err(e) => {
            warn!("cannot read {:?}: {e}", finfo.path);
            false
        }
    }
}
