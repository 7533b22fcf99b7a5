//! Archive path canonicalization and decomposition.
//!
//! Archive paths are `/`-separated UTF-8 strings relative to the archive
//! root. The root itself is the empty string. No leading slash, no `.`
//! segments, `..` never escapes the root.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Normalize an archive path: collapse repeated separators, drop `.`
/// segments, resolve `..` against the stack, strip leading and trailing
/// slashes. `""` and `"."` both mean the root. A `..` that would walk
/// above the root is a caller error.
pub fn normalize(path: &str) -> Result<String> {
    let mut stack: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if stack.pop().is_none() {
                    return Err(Error::InvalidArgument(format!(
                        "path {path:?} walks above the archive root"
                    )));
                }
            }
            _ => stack.push(seg),
        }
    }
    Ok(stack.join("/"))
}

/// Parent of a normalized path. `None` for the root, which has no parent.
/// Root-level entries have the root (`""`) as parent.
pub fn parent(path: &str) -> Option<&str> {
    if path.is_empty() {
        return None;
    }
    Some(match path.rfind('/') {
        Some(i) => &path[..i],
        None => "",
    })
}

/// Final path segment. The root's basename is the empty string.
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// All ancestors of a normalized path, root first, ending with the path
/// itself: `"" , a , a/b , a/b/c` for `a/b/c`. For the root, just `""`.
pub fn ancestors(path: &str) -> Vec<String> {
    let mut out = vec![String::new()];
    for (i, b) in path.bytes().enumerate() {
        if b == b'/' {
            out.push(path[..i].to_string());
        }
    }
    if !path.is_empty() {
        out.push(path.to_string());
    }
    out
}

/// Resolve the on-disk index database path for an archive base path.
///
/// Legacy archives stored the index at `<base>-sqlite-index`; current ones
/// use `<base>` directly. An existing file wins; new archives use the
/// current convention.
pub fn resolve_index_path(base: &Path) -> PathBuf {
    if base.exists() && !base.is_dir() {
        return base.to_path_buf();
    }
    let legacy = legacy_index_path(base);
    if legacy.exists() {
        return legacy;
    }
    base.to_path_buf()
}

/// The legacy `<base>-sqlite-index` sibling for an archive base path.
pub fn legacy_index_path(base: &Path) -> PathBuf {
    let mut s = base.as_os_str().to_os_string();
    s.push("-sqlite-index");
    PathBuf::from(s)
}

/// Path of shard number `shard` for an archive base path.
pub fn shard_path(base: &Path, shard: usize) -> PathBuf {
    let mut s = base.as_os_str().to_os_string();
    s.push(format!("-shard-{shard:05}"));
    PathBuf::from(s)
}
