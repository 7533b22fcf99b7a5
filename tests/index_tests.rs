//! Index tests: path handling, aggregates, bulk mode, rename, find_space.

use std::path::PathBuf;

use barecat::{DirInfo, Error, FileInfo, Index, Order, paths};
use tempfile::TempDir;

fn index_path(dir: &TempDir) -> PathBuf {
    dir.path().join("test.index")
}

fn open_index(dir: &TempDir) -> Index {
    Index::open(&index_path(dir), false, false).unwrap()
}

/// A file record with a fabricated placement; index-level tests never
/// touch shard bytes.
fn file_at(path: &str, shard: usize, offset: u64, size: u64) -> FileInfo {
    let mut finfo = FileInfo::new(path).unwrap();
    finfo.shard = shard;
    finfo.offset = offset;
    finfo.size = size;
    finfo
}

#[test]
fn test_normalize() {
    assert_eq!(paths::normalize("").unwrap(), "");
    assert_eq!(paths::normalize(".").unwrap(), "");
    assert_eq!(paths::normalize("/").unwrap(), "");
    assert_eq!(paths::normalize("a/b").unwrap(), "a/b");
    assert_eq!(paths::normalize("/a/b/").unwrap(), "a/b");
    assert_eq!(paths::normalize("a//b").unwrap(), "a/b");
    assert_eq!(paths::normalize("a/./b").unwrap(), "a/b");
    assert_eq!(paths::normalize("a/../b").unwrap(), "b");
    assert_eq!(paths::normalize("a/b/../../c").unwrap(), "c");
}

#[test]
fn test_normalize_rejects_escape_above_root() {
    assert!(matches!(
        paths::normalize("../a"),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        paths::normalize("a/../../b"),
        Err(Error::InvalidArgument(_))
    ));
    assert!(paths::normalize("..").is_err());
}

#[test]
fn test_parent_basename_ancestors() {
    assert_eq!(paths::parent(""), None);
    assert_eq!(paths::parent("a"), Some(""));
    assert_eq!(paths::parent("a/b/c"), Some("a/b"));
    assert_eq!(paths::basename("a/b/c"), "c");
    assert_eq!(paths::basename("a"), "a");
    assert_eq!(paths::ancestors(""), [""]);
    assert_eq!(paths::ancestors("a"), ["", "a"]);
    assert_eq!(paths::ancestors("a/b/c"), ["", "a", "a/b", "a/b/c"]);
}

#[test]
fn test_lookup_and_exists() {
    let dir = TempDir::new().unwrap();
    let ix = open_index(&dir);
    ix.add_file(&file_at("d/f.bin", 0, 0, 10)).unwrap();

    assert!(ix.isfile("d/f.bin").unwrap());
    assert!(ix.isdir("d").unwrap());
    assert!(ix.exists("d").unwrap());
    assert!(!ix.isfile("d").unwrap());
    assert!(!ix.exists("nope").unwrap());

    let finfo = ix.lookup_file("d/f.bin").unwrap();
    assert_eq!(finfo.size, 10);
    assert!(matches!(ix.lookup_file("d"), Err(Error::FileNotFound(_))));
    // Paths are normalized on lookup.
    assert!(ix.isfile("/d/./f.bin").unwrap());
}

#[test]
fn test_aggregates_track_point_mutations() {
    let dir = TempDir::new().unwrap();
    let ix = open_index(&dir);
    ix.add_file(&file_at("a/b/f1", 0, 0, 10)).unwrap();
    ix.add_file(&file_at("a/b/f2", 0, 10, 20)).unwrap();
    ix.add_file(&file_at("a/g", 0, 30, 5)).unwrap();

    let root = ix.lookup_dir("").unwrap();
    assert_eq!(root.num_files_tree, 3);
    assert_eq!(root.size_tree, 35);
    assert_eq!(root.num_subdirs, 1);
    assert_eq!(root.num_files, 0);

    let a = ix.lookup_dir("a").unwrap();
    assert_eq!(a.num_files, 1);
    assert_eq!(a.num_subdirs, 1);
    assert_eq!(a.num_files_tree, 3);
    assert_eq!(a.size_tree, 35);

    ix.remove_file("a/b/f2").unwrap();
    let a = ix.lookup_dir("a").unwrap();
    assert_eq!(a.num_files_tree, 2);
    assert_eq!(a.size_tree, 15);

    ix.update_contents("a/b/f1", 0, 0, 25, None).unwrap();
    let b = ix.lookup_dir("a/b").unwrap();
    assert_eq!(b.size_tree, 25);
    assert_eq!(ix.lookup_dir("").unwrap().size_tree, 30);

    assert!(ix.verify_integrity().unwrap().is_empty());
}

#[test]
fn test_bulk_mode_recomputes_everything() {
    let dir = TempDir::new().unwrap();
    let ix = open_index(&dir);
    ix.bulk_mode(|ix| {
        ix.add_file(&file_at("x/1", 0, 0, 100)).unwrap();
        ix.add_file(&file_at("x/y/2", 0, 100, 200)).unwrap();
        ix.add_file(&file_at("z", 0, 300, 300)).unwrap();
        Ok(())
    })
    .unwrap();

    // Ancestor dirs were created by the post-pass, with exact stats.
    let root = ix.lookup_dir("").unwrap();
    assert_eq!(root.num_files_tree, 3);
    assert_eq!(root.size_tree, 600);
    assert_eq!(root.num_subdirs, 1);
    assert_eq!(root.num_files, 1);
    let y = ix.lookup_dir("x/y").unwrap();
    assert_eq!(y.num_files_tree, 1);
    assert_eq!(y.size_tree, 200);
    assert!(ix.verify_integrity().unwrap().is_empty());
}

#[test]
fn test_rename_file_with_overwrite_flag() {
    let dir = TempDir::new().unwrap();
    let ix = open_index(&dir);
    ix.add_file(&file_at("a", 0, 0, 1)).unwrap();
    ix.add_file(&file_at("b", 0, 1, 2)).unwrap();

    assert!(matches!(
        ix.rename_file("a", "b", false),
        Err(Error::FileExists(_))
    ));
    ix.rename_file("a", "b", true).unwrap();
    assert!(!ix.isfile("a").unwrap());
    assert_eq!(ix.lookup_file("b").unwrap().size, 1);
    assert_eq!(ix.lookup_dir("").unwrap().size_tree, 1);
    assert!(ix.verify_integrity().unwrap().is_empty());
}

#[test]
fn test_rename_dir_restrictions() {
    let dir = TempDir::new().unwrap();
    let ix = open_index(&dir);
    ix.add_file(&file_at("d/f", 0, 0, 1)).unwrap();
    ix.add_file(&file_at("plain", 0, 1, 1)).unwrap();

    assert!(matches!(
        ix.rename_dir("", "other", false),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        ix.rename_dir("d", "plain", false),
        Err(Error::NotADirectory(_))
    ));
    // Overwriting a non-empty directory is refused even with the flag.
    ix.add_file(&file_at("e/g", 0, 2, 1)).unwrap();
    assert!(matches!(
        ix.rename_dir("d", "e", true),
        Err(Error::DirectoryNotEmpty(_))
    ));
}

#[test]
fn test_rename_dir_into_new_parent() {
    let dir = TempDir::new().unwrap();
    let ix = open_index(&dir);
    ix.add_file(&file_at("src/deep/f", 0, 0, 7)).unwrap();
    ix.rename_dir("src", "container/dst", false).unwrap();

    assert!(ix.isfile("container/dst/deep/f").unwrap());
    assert_eq!(ix.lookup_dir("container").unwrap().size_tree, 7);
    assert_eq!(ix.lookup_dir("container/dst/deep").unwrap().num_files, 1);
    assert!(ix.verify_integrity().unwrap().is_empty());
}

#[test]
fn test_find_space() {
    let dir = TempDir::new().unwrap();
    let ix = open_index(&dir);
    ix.set_shard_size_limit(1000).unwrap();
    // Layout in shard 0: f1 [0, 100), gap [100, 400), f2 [400, 900).
    ix.add_file(&file_at("f1", 0, 0, 100)).unwrap();
    ix.add_file(&file_at("f2", 0, 400, 500)).unwrap();

    // Growth that fits in the gap right after the file keeps its spot.
    let f1 = ix.lookup_file("f1").unwrap();
    let spot = ix.find_space(&f1, 300).unwrap();
    assert_eq!((spot.shard, spot.offset), (0, 0));

    // Growth that fits nowhere goes to a fresh shard.
    let f2 = ix.lookup_file("f2").unwrap();
    let spot = ix.find_space(&f2, 700).unwrap();
    assert_eq!((spot.shard, spot.offset), (1, 0));

    // A file that cannot grow in place relocates into the first gap that
    // fits its whole new size.
    ix.add_file(&file_at("f3", 0, 900, 50)).unwrap();
    let f3 = ix.lookup_file("f3").unwrap();
    let spot = ix.find_space(&f3, 200).unwrap();
    assert_eq!((spot.shard, spot.offset), (0, 100));

    // Shrinking always stays put.
    let spot = ix.find_space(&f2, 100).unwrap();
    assert_eq!((spot.shard, spot.offset), (f2.shard, f2.offset));
}

#[test]
fn test_listdir_orders() {
    let dir = TempDir::new().unwrap();
    let ix = open_index(&dir);
    ix.add_file(&file_at("d/b", 0, 0, 1)).unwrap();
    ix.add_file(&file_at("d/a", 0, 1, 1)).unwrap();
    ix.add_file(&file_at("d/c", 1, 0, 1)).unwrap();

    let by_path: Vec<String> = ix
        .list_direct_fileinfos("d", Order::Path)
        .unwrap()
        .into_iter()
        .map(|f| f.path)
        .collect();
    assert_eq!(by_path, ["d/a", "d/b", "d/c"]);

    let by_address: Vec<String> = ix
        .list_direct_fileinfos("d", Order::Address)
        .unwrap()
        .into_iter()
        .map(|f| f.path)
        .collect();
    assert_eq!(by_address, ["d/b", "d/a", "d/c"]);
}

#[test]
fn test_logical_shard_end_and_used_shards() {
    let dir = TempDir::new().unwrap();
    let ix = open_index(&dir);
    assert_eq!(ix.num_used_shards().unwrap(), 0);
    assert_eq!(ix.logical_shard_end(0).unwrap(), 0);

    ix.add_file(&file_at("a", 0, 0, 10)).unwrap();
    ix.add_file(&file_at("b", 2, 5, 10)).unwrap();
    assert_eq!(ix.num_used_shards().unwrap(), 3);
    assert_eq!(ix.logical_shard_end(0).unwrap(), 10);
    assert_eq!(ix.logical_shard_end(1).unwrap(), 0);
    assert_eq!(ix.logical_shard_end(2).unwrap(), 15);

    let last = ix.last_fileinfo().unwrap().unwrap();
    assert_eq!(last.path, "b");
}

#[test]
fn test_shard_size_limit_shrink_refused() {
    let dir = TempDir::new().unwrap();
    let ix = open_index(&dir);
    ix.add_file(&file_at("a", 0, 0, 500)).unwrap();
    assert!(matches!(
        ix.set_shard_size_limit(100),
        Err(Error::InvalidArgument(_))
    ));
    ix.set_shard_size_limit(1000).unwrap();
    assert_eq!(ix.shard_size_limit().unwrap(), 1000);
}

#[test]
fn test_add_dir_exist_ok() {
    let dir = TempDir::new().unwrap();
    let ix = open_index(&dir);
    let mut dinfo = DirInfo::new("d").unwrap();
    dinfo.mode = Some(0o700);
    ix.add_dir(&dinfo, false).unwrap();
    assert!(matches!(
        ix.add_dir(&dinfo, false),
        Err(Error::FileExists(_))
    ));
    let mut update = DirInfo::new("d").unwrap();
    update.mode = Some(0o755);
    ix.add_dir(&update, true).unwrap();
    assert_eq!(ix.lookup_dir("d").unwrap().mode, Some(0o755));
}

#[test]
fn test_schema_version_of_new_archive() {
    let dir = TempDir::new().unwrap();
    let ix = open_index(&dir);
    drop(ix);
    let (major, minor) = barecat::get_schema_version(&index_path(&dir)).unwrap();
    assert_eq!(major, barecat::SCHEMA_VERSION_MAJOR);
    assert_eq!(minor, barecat::SCHEMA_VERSION_MINOR);
}

#[test]
fn test_walk_yields_subdirs_and_files() {
    let dir = TempDir::new().unwrap();
    let ix = open_index(&dir);
    ix.add_file(&file_at("a/f1", 0, 0, 1)).unwrap();
    ix.add_file(&file_at("a/b/f2", 0, 1, 1)).unwrap();
    ix.add_file(&file_at("c/f3", 0, 2, 1)).unwrap();

    let steps: Vec<_> = ix.walk("").unwrap().collect::<Result<Vec<_>, _>>().unwrap();
    let dirs: Vec<&str> = steps.iter().map(|(d, _, _)| d.path.as_str()).collect();
    assert_eq!(dirs, ["", "a", "a/b", "c"]);
    let (_, subdirs, files) = &steps[1];
    assert_eq!(subdirs.len(), 1);
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].path, "a/f1");
}
