//! File handle tests: slice reads, in-place writes, spillover growth,
//! truncation and holes.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use barecat::{Barecat, BarecatOptions, Error, WriteMode};
use tempfile::TempDir;

fn archive_path(dir: &TempDir) -> PathBuf {
    dir.path().join("fileobj.barecat")
}

fn create_store(dir: &TempDir) -> Barecat {
    Barecat::create(archive_path(dir)).unwrap()
}

#[test]
fn test_reader_read_and_seek() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);
    bc.add("f", b"abcdefghij").unwrap();

    let mut r = bc.open_reader("f").unwrap();
    assert_eq!(r.len(), 10);
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"abcd");

    r.seek(SeekFrom::Start(6)).unwrap();
    let mut rest = Vec::new();
    r.read_to_end(&mut rest).unwrap();
    assert_eq!(rest, b"ghij");

    r.seek(SeekFrom::End(-2)).unwrap();
    let mut tail = Vec::new();
    r.read_to_end(&mut tail).unwrap();
    assert_eq!(tail, b"ij");

    // Seeking past the end is allowed; reads return nothing.
    r.seek(SeekFrom::Start(100)).unwrap();
    assert_eq!(r.read(&mut buf).unwrap(), 0);

    assert!(r.seek(SeekFrom::Current(-200)).is_err());
}

#[test]
fn test_writer_in_place_overwrite() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);
    bc.add("f", b"hello world").unwrap();
    bc.add("anchor", b"xx").unwrap();
    let before = bc.index().lookup_file("f").unwrap();

    let mut w = bc.open_writer("f", WriteMode::ReadWrite).unwrap();
    w.write_all(b"HELLO").unwrap();
    w.close().unwrap();

    assert_eq!(bc.read("f").unwrap(), b"HELLO world");
    assert_eq!(bc.read("anchor").unwrap(), b"xx");
    let after = bc.index().lookup_file("f").unwrap();
    // Same size: the payload stayed in place and the checksum was redone.
    assert_eq!((before.shard, before.offset), (after.shard, after.offset));
    assert_eq!(after.crc32c, Some(crc32c::crc32c(b"HELLO world")));
}

#[test]
fn test_writer_growth_spills_and_relocates() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);
    bc.add("f", b"12345").unwrap();
    bc.add("anchor", b"yy").unwrap();

    let mut w = bc.open_writer("f", WriteMode::Append).unwrap();
    w.write_all(b"6789").unwrap();
    w.close().unwrap();

    assert_eq!(bc.read("f").unwrap(), b"123456789");
    assert_eq!(bc.read("anchor").unwrap(), b"yy");
    assert!(bc.verify_integrity(false).unwrap());
}

#[test]
fn test_writer_read_back_mixed_regions() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);
    bc.add("f", b"abcde").unwrap();

    let mut w = bc.open_writer("f", WriteMode::ReadWrite).unwrap();
    w.seek(SeekFrom::End(0)).unwrap();
    w.write_all(b"fgh").unwrap();
    w.seek(SeekFrom::Start(0)).unwrap();
    let mut all = Vec::new();
    w.read_to_end(&mut all).unwrap();
    assert_eq!(all, b"abcdefgh");
    w.close().unwrap();
    assert_eq!(bc.read("f").unwrap(), b"abcdefgh");
}

#[test]
fn test_writer_truncate_mode_empties_file() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);
    bc.add("f", b"old content").unwrap();

    let w = bc.open_writer("f", WriteMode::Truncate).unwrap();
    w.close().unwrap();
    assert_eq!(bc.read("f").unwrap(), b"");
    assert_eq!(bc.index().lookup_file("f").unwrap().size, 0);
}

#[test]
fn test_writer_truncate_shrinks_and_grows() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);
    bc.add("f", b"0123456789").unwrap();

    let mut w = bc.open_writer("f", WriteMode::ReadWrite).unwrap();
    w.truncate(4).unwrap();
    w.close().unwrap();
    assert_eq!(bc.read("f").unwrap(), b"0123");

    let mut w = bc.open_writer("f", WriteMode::ReadWrite).unwrap();
    w.truncate(6).unwrap();
    w.close().unwrap();
    assert_eq!(bc.read("f").unwrap(), b"0123\0\0");
}

#[test]
fn test_writer_seek_past_end_zero_fills() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);

    let mut w = bc.open_writer("sparse", WriteMode::Truncate).unwrap();
    w.seek(SeekFrom::Start(3)).unwrap();
    w.write_all(b"x").unwrap();
    w.close().unwrap();
    assert_eq!(bc.read("sparse").unwrap(), b"\0\0\0x");
}

#[test]
fn test_writer_create_new_semantics() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);
    bc.add("existing", b"x").unwrap();

    assert!(matches!(
        bc.open_writer("existing", WriteMode::CreateNew),
        Err(Error::FileExists(_))
    ));
    assert!(matches!(
        bc.open_writer("missing", WriteMode::ReadWrite),
        Err(Error::FileNotFound(_))
    ));

    let mut w = bc.open_writer("fresh", WriteMode::CreateNew).unwrap();
    w.write_all(b"new").unwrap();
    w.close().unwrap();
    assert_eq!(bc.read("fresh").unwrap(), b"new");
}

#[test]
fn test_writer_clean_close_is_noop() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);
    bc.add("f", b"stable").unwrap();
    let before = bc.index().lookup_file("f").unwrap();

    let w = bc.open_writer("f", WriteMode::ReadWrite).unwrap();
    w.close().unwrap();
    assert_eq!(bc.index().lookup_file("f").unwrap(), before);
}

#[test]
fn test_writer_refused_on_readonly_and_append_only() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);
    bc.add("f", b"x").unwrap();
    bc.close().unwrap();

    let mut bc = Barecat::open(archive_path(&dir)).unwrap();
    assert!(matches!(
        bc.open_writer("f", WriteMode::ReadWrite),
        Err(Error::ReadOnly)
    ));
    drop(bc);

    let mut bc = Barecat::with_options(
        archive_path(&dir),
        &BarecatOptions {
            readonly: false,
            append_only: true,
            ..Default::default()
        },
    )
    .unwrap();
    assert!(matches!(
        bc.open_writer("f", WriteMode::ReadWrite),
        Err(Error::AppendOnly)
    ));
}

#[test]
fn test_writer_drop_commits() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_store(&dir);
    bc.add("f", b"abc").unwrap();
    {
        let mut w = bc.open_writer("f", WriteMode::Append).unwrap();
        w.write_all(b"def").unwrap();
        // Dropped without close: best-effort commit.
    }
    assert_eq!(bc.read("f").unwrap(), b"abcdef");
}
