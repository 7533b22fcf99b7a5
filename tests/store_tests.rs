//! Store tests: add/read round-trips, modes, updates, removal, aggregates.

use std::path::PathBuf;

use barecat::{Barecat, BarecatOptions, Error};
use tempfile::TempDir;

fn archive_path(dir: &TempDir) -> PathBuf {
    dir.path().join("test.barecat")
}

fn create_store(dir: &TempDir) -> Barecat {
    Barecat::create(archive_path(dir)).unwrap()
}

#[test]
fn test_add_read_roundtrip_after_reopen() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);
    bc.add("a.txt", b"hello").unwrap();
    bc.add("dir/b.txt", b"world!").unwrap();
    bc.close().unwrap();

    let bc = Barecat::open(archive_path(&dir)).unwrap();
    assert_eq!(bc.read("a.txt").unwrap(), b"hello");
    assert_eq!(bc.read("dir/b.txt").unwrap(), b"world!");

    let root = bc.index().lookup_dir("").unwrap();
    assert_eq!(root.num_files_tree, 2);
    assert_eq!(root.size_tree, 11);
    assert_eq!(root.num_files, 1);
    assert_eq!(root.num_subdirs, 1);
}

#[test]
fn test_empty_archive() {
    let dir = TempDir::new().unwrap();
    let bc = create_store(&dir);
    assert_eq!(bc.num_files().unwrap(), 0);
    assert_eq!(bc.total_size().unwrap(), 0);
    assert!(bc.isdir("").unwrap());
    assert!(bc.verify_integrity(false).unwrap());
}

#[test]
fn test_empty_file() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);
    bc.add("empty", b"").unwrap();
    assert_eq!(bc.read("empty").unwrap(), b"");
    let finfo = bc.index().lookup_file("empty").unwrap();
    assert_eq!(finfo.size, 0);
    assert_eq!(finfo.crc32c, Some(crc32c::crc32c(b"")));
}

#[test]
fn test_path_escaping_root_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);
    assert!(matches!(
        bc.add("../../etc/passwd", b"nope"),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        bc.read("../x"),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        bc.mkdir("../d", 0o755, false),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(bc.num_files().unwrap(), 0);
    assert_eq!(bc.total_physical_size().unwrap(), 0);
}

#[test]
fn test_add_duplicate_fails() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);
    bc.add("x", b"1").unwrap();
    assert!(matches!(bc.add("x", b"2"), Err(Error::FileExists(_))));
    // The failed add must not have appended anything.
    assert_eq!(bc.total_physical_size().unwrap(), 1);
}

#[test]
fn test_add_path_that_is_a_directory() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);
    bc.add("d/f", b"x").unwrap();
    assert!(matches!(bc.add("d", b"y"), Err(Error::IsADirectory(_))));
}

#[test]
fn test_file_of_exactly_shard_size_limit() {
    let dir = TempDir::new().unwrap();
    let mut bc = Barecat::with_options(
        archive_path(&dir),
        &BarecatOptions {
            readonly: false,
            shard_size_limit: Some(100),
            ..Default::default()
        },
    )
    .unwrap();
    bc.add("full", &[7u8; 100]).unwrap();
    let finfo = bc.index().lookup_file("full").unwrap();
    assert_eq!((finfo.shard, finfo.offset), (0, 0));

    // The next write must start a new shard.
    bc.add("next", b"x").unwrap();
    let finfo = bc.index().lookup_file("next").unwrap();
    assert_eq!((finfo.shard, finfo.offset), (1, 0));
}

#[test]
fn test_file_too_large_rejected_before_write() {
    let dir = TempDir::new().unwrap();
    let mut bc = Barecat::with_options(
        archive_path(&dir),
        &BarecatOptions {
            readonly: false,
            shard_size_limit: Some(500),
            ..Default::default()
        },
    )
    .unwrap();
    bc.add("ok", b"fits").unwrap();
    let before = bc.total_physical_size().unwrap();
    let err = bc.add("big.bin", &[0u8; 1000]).unwrap_err();
    assert!(matches!(err, Error::FileTooLarge { size: 1000, limit: 500 }));
    assert_eq!(bc.total_physical_size().unwrap(), before);
    assert_eq!(bc.num_files().unwrap(), 1);
}

#[test]
fn test_update_same_size_in_place() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);
    bc.add("f", b"hello").unwrap();
    let before = bc.index().lookup_file("f").unwrap();
    bc.update("f", b"HELLO").unwrap();
    let after = bc.index().lookup_file("f").unwrap();
    assert_eq!((before.shard, before.offset), (after.shard, after.offset));
    assert_eq!(after.crc32c, Some(crc32c::crc32c(b"HELLO")));
    assert_eq!(bc.read("f").unwrap(), b"HELLO");
}

#[test]
fn test_update_smaller_leaves_tail_gap() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);
    bc.add("f", b"0123456789").unwrap();
    bc.add("g", b"zz").unwrap();
    bc.update("f", b"abc").unwrap();
    assert_eq!(bc.read("f").unwrap(), b"abc");
    assert_eq!(bc.read("g").unwrap(), b"zz");
    assert!(bc.total_physical_size().unwrap() > bc.total_logical_size().unwrap());
}

#[test]
fn test_update_larger_relocates() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);
    bc.add("f", b"small").unwrap();
    bc.add("g", b"block").unwrap();
    let before = bc.index().lookup_file("f").unwrap();
    bc.update("f", b"much larger content").unwrap();
    let after = bc.index().lookup_file("f").unwrap();
    assert_ne!((before.shard, before.offset), (after.shard, after.offset));
    assert_eq!(bc.read("f").unwrap(), b"much larger content");
    assert_eq!(bc.read("g").unwrap(), b"block");
    // Root aggregates track the size change.
    assert_eq!(bc.total_size().unwrap(), 5 + 19);
}

#[test]
fn test_remove_last_file_truncates_shard() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);
    bc.add("a", b"aaaaa").unwrap();
    bc.add("b", b"bbb").unwrap();
    bc.remove("b").unwrap();
    assert_eq!(bc.total_physical_size().unwrap(), 5);
    assert_eq!(bc.num_files().unwrap(), 1);
}

#[test]
fn test_remove_middle_file_leaves_gap() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);
    bc.add("a", b"aaaaa").unwrap();
    bc.add("b", b"bbb").unwrap();
    bc.remove("a").unwrap();
    assert_eq!(bc.total_physical_size().unwrap(), 8);
    assert_eq!(bc.total_logical_size().unwrap(), 3);
    assert_eq!(bc.read("b").unwrap(), b"bbb");
}

#[test]
fn test_remove_of_directory_fails() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);
    bc.add("d/f", b"x").unwrap();
    assert!(matches!(bc.remove("d"), Err(Error::IsADirectory(_))));
    assert!(matches!(bc.remove("nope"), Err(Error::FileNotFound(_))));
}

#[test]
fn test_rmdir_and_rmtree() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);
    bc.add("d/sub/f1", b"11").unwrap();
    bc.add("d/sub/f2", b"222").unwrap();
    bc.add("keep", b"k").unwrap();

    assert!(matches!(bc.rmdir("d"), Err(Error::DirectoryNotEmpty(_))));
    bc.rmtree("d").unwrap();
    assert!(!bc.exists("d").unwrap());
    assert!(!bc.isfile("d/sub/f1").unwrap());
    let root = bc.index().lookup_dir("").unwrap();
    assert_eq!(root.num_files_tree, 1);
    assert_eq!(root.size_tree, 1);
    assert_eq!(root.num_subdirs, 0);

    bc.mkdir("lone", 0o755, false).unwrap();
    bc.rmdir("lone").unwrap();
    assert!(!bc.exists("lone").unwrap());
}

#[test]
fn test_rename_subtree() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);
    bc.add("a/b/c.txt", b"x").unwrap();
    bc.add("a/b/d.txt", b"y").unwrap();
    bc.rename("a/b", "a/e").unwrap();

    assert_eq!(bc.read("a/e/c.txt").unwrap(), b"x");
    assert_eq!(bc.read("a/e/d.txt").unwrap(), b"y");
    assert!(bc.index().lookup_dir("a/b").is_err());
    let e = bc.index().lookup_dir("a/e").unwrap();
    assert_eq!(e.num_files, 2);
    assert_eq!(e.size_tree, 2);
    assert!(bc.verify_integrity(false).unwrap());
}

#[test]
fn test_rename_file_between_directories() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);
    bc.add("src/f", b"data").unwrap();
    bc.rename("src/f", "dst/g").unwrap();
    assert_eq!(bc.read("dst/g").unwrap(), b"data");
    assert_eq!(bc.index().lookup_dir("src").unwrap().num_files, 0);
    assert_eq!(bc.index().lookup_dir("dst").unwrap().size_tree, 4);
    assert!(bc.verify_integrity(false).unwrap());
}

#[test]
fn test_readonly_mode_rejects_writes() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);
    bc.add("f", b"x").unwrap();
    bc.close().unwrap();

    let mut bc = Barecat::open(archive_path(&dir)).unwrap();
    assert!(matches!(bc.add("g", b"y"), Err(Error::ReadOnly)));
    assert!(matches!(bc.remove("f"), Err(Error::ReadOnly)));
}

#[test]
fn test_append_only_mode() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);
    bc.add("f", b"x").unwrap();
    bc.close().unwrap();

    let mut bc = Barecat::with_options(
        archive_path(&dir),
        &BarecatOptions {
            readonly: false,
            append_only: true,
            ..Default::default()
        },
    )
    .unwrap();
    bc.add("g", b"y").unwrap();
    assert!(matches!(bc.remove("f"), Err(Error::AppendOnly)));
    assert!(matches!(bc.rename("f", "h"), Err(Error::AppendOnly)));
    assert!(matches!(bc.update("f", b"z"), Err(Error::AppendOnly)));
    assert_eq!(bc.read("g").unwrap(), b"y");
}

#[test]
fn test_second_writer_is_locked_out() {
    let dir = TempDir::new().unwrap();
    let bc = create_store(&dir);
    let err = Barecat::create(archive_path(&dir)).unwrap_err();
    assert!(matches!(err, Error::Locked(_)));
    drop(bc);
    Barecat::create(archive_path(&dir)).unwrap();
}

#[test]
fn test_get_and_read_into() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);
    bc.add("f", b"abcdefgh").unwrap();
    assert_eq!(bc.get("f").unwrap().unwrap(), b"abcdefgh");
    assert!(bc.get("missing").unwrap().is_none());

    let mut buf = [0u8; 4];
    let n = bc.read_into("f", &mut buf, 2).unwrap();
    assert_eq!(n, 4);
    assert_eq!(&buf, b"cdef");

    // Reading past the end is short, not an error.
    let n = bc.read_into("f", &mut buf, 6).unwrap();
    assert_eq!(n, 2);
    assert_eq!(&buf[..2], b"gh");
}

#[test]
fn test_listdir_and_walk() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);
    bc.add("a/x", b"1").unwrap();
    bc.add("a/y", b"2").unwrap();
    bc.add("a/sub/z", b"3").unwrap();
    bc.add("top", b"4").unwrap();

    let mut names = bc.listdir("a").unwrap();
    names.sort();
    assert_eq!(names, ["sub", "x", "y"]);
    assert!(matches!(bc.listdir("a/x"), Err(Error::FileNotFound(_))));

    let walked: Vec<_> = bc
        .walk("")
        .unwrap()
        .map(|step| step.unwrap().0.path)
        .collect();
    assert_eq!(walked, ["", "a", "a/sub"]);
}

#[test]
fn test_verify_integrity_detects_corruption() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);
    bc.add("f", b"precious data").unwrap();
    assert!(bc.verify_integrity(false).unwrap());
    bc.close().unwrap();

    // Flip one payload byte behind the index's back.
    let shard0 = dir.path().join("test.barecat-shard-00000");
    let mut bytes = std::fs::read(&shard0).unwrap();
    bytes[0] ^= 0xff;
    std::fs::write(&shard0, &bytes).unwrap();

    let bc = Barecat::open(archive_path(&dir)).unwrap();
    assert!(!bc.verify_integrity(false).unwrap());
    assert!(!bc.verify_integrity(true).unwrap());
    assert!(matches!(bc.read("f"), Err(Error::Integrity(_))));
}

#[test]
fn test_chmod_chown_mtime() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);
    bc.add("f", b"x").unwrap();
    bc.chmod("f", 0o600).unwrap();
    bc.chown("f", 1000, 1000).unwrap();
    bc.set_mtime("f", 123_456_789_000).unwrap();
    let finfo = bc.index().lookup_file("f").unwrap();
    assert_eq!(finfo.mode, Some(0o600));
    assert_eq!(finfo.uid, Some(1000));
    assert_eq!(finfo.gid, Some(1000));
    assert_eq!(finfo.mtime_ns, Some(123_456_789_000));
    assert!(matches!(
        bc.chmod("missing", 0o600),
        Err(Error::FileNotFound(_))
    ));
}

#[test]
fn test_add_stream() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);
    let data = vec![42u8; 10_000];
    let mut cursor = std::io::Cursor::new(data.clone());
    let finfo = barecat::FileInfo::new("streamed").unwrap();
    bc.add_stream(finfo, &mut cursor, 10_000).unwrap();
    assert_eq!(bc.read("streamed").unwrap(), data);
}

#[test]
fn test_remove_archive_cleans_everything() {
    let dir = TempDir::new().unwrap();
    let mut bc = Barecat::with_options(
        archive_path(&dir),
        &BarecatOptions {
            readonly: false,
            shard_size_limit: Some(10),
            ..Default::default()
        },
    )
    .unwrap();
    bc.add("a", &[1u8; 8]).unwrap();
    bc.add("b", &[2u8; 8]).unwrap();
    bc.close().unwrap();

    assert!(Barecat::archive_exists(&archive_path(&dir)));
    Barecat::remove_archive(&archive_path(&dir)).unwrap();
    assert!(!Barecat::archive_exists(&archive_path(&dir)));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
