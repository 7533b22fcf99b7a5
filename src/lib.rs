//! Barecat: random-access archive storage for millions of small files.
//!
//! Payloads are concatenated into a handful of large shard files; all
//! metadata (paths, shard addresses, checksums, POSIX attributes, the
//! directory tree with maintained aggregate statistics) lives in an SQLite
//! index next to them. A read resolves `path -> (shard, offset, size)`
//! through the index and slices the shard at that byte range, so per-file
//! overhead stays near zero no matter how many files the archive holds.
//!
//! The main entry point is [`Barecat`]:
//!
//! ```no_run
//! use barecat::Barecat;
//!
//! let mut bc = Barecat::create("data.barecat")?;
//! bc.add("images/0001.jpg", &[0u8; 1024])?;
//! let bytes = bc.read("images/0001.jpg")?;
//! assert_eq!(bytes.len(), 1024);
//! # Ok::<(), barecat::Error>(())
//! ```

pub mod error;
pub mod fileobj;
pub mod index;
pub mod maintenance;
pub mod paths;
pub mod sharder;
pub mod store;
pub mod types;

pub use error::{Error, Result};
pub use fileobj::{FileReader, FileWriter, WriteMode};
pub use index::{FileMetaUpdate, GlobRule, Index, Walk};
pub use maintenance::defrag::{DefragMode, FragmentGap, GapStats};
pub use maintenance::merge::MergeOptions;
pub use maintenance::upgrade::{get_schema_version, upgrade};
pub use sharder::{Mode, Sharder};
pub use store::{Barecat, BarecatOptions};
pub use types::{
    DirInfo, EntryInfo, FileInfo, Order, SCHEMA_VERSION_MAJOR, SCHEMA_VERSION_MINOR,
    SHARD_SIZE_UNLIMITED,
};
