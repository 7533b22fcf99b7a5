//! Maintenance tests: defrag modes, reshard, merges, schema upgrade.

use std::path::PathBuf;
use std::time::Duration;

use barecat::{
    Barecat, BarecatOptions, DefragMode, Error, GlobRule, MergeOptions, SHARD_SIZE_UNLIMITED,
};
use tempfile::TempDir;

fn path_of(dir: &TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

fn create_at(dir: &TempDir, name: &str) -> Barecat {
    Barecat::create(path_of(dir, name)).unwrap()
}

#[test]
fn test_full_defrag_reclaims_gap() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_at(&dir, "a.barecat");
    let content_a = vec![b'A'; 10];
    let content_c = vec![b'C'; 30];
    bc.add("A", &content_a).unwrap();
    bc.add("B", &[b'B'; 20]).unwrap();
    bc.add("C", &content_c).unwrap();
    bc.remove("B").unwrap();

    assert_eq!(bc.total_physical_size().unwrap(), 60);
    assert_eq!(bc.total_logical_size().unwrap(), 40);

    let reclaimed = bc.defrag(DefragMode::Full).unwrap();
    assert_eq!(reclaimed, 20);
    assert_eq!(bc.total_physical_size().unwrap(), 40);

    let a = bc.index().lookup_file("A").unwrap();
    let c = bc.index().lookup_file("C").unwrap();
    assert_eq!((a.shard, a.offset), (0, 0));
    assert_eq!((c.shard, c.offset), (0, 10));
    assert_eq!(bc.read("A").unwrap(), content_a);
    assert_eq!(bc.read("C").unwrap(), content_c);
    assert!(bc.verify_integrity(false).unwrap());

    // Defrag is idempotent: a second run finds nothing to do.
    assert_eq!(bc.defrag(DefragMode::Full).unwrap(), 0);
}

#[test]
fn test_smart_defrag_equivalent_outcome() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_at(&dir, "a.barecat");
    for i in 0..8 {
        bc.add(&format!("f{i}"), &vec![i as u8; 50]).unwrap();
    }
    bc.remove("f2").unwrap();
    bc.remove("f5").unwrap();

    bc.defrag(DefragMode::Smart).unwrap();
    assert_eq!(
        bc.total_physical_size().unwrap(),
        bc.total_logical_size().unwrap()
    );
    for i in [0usize, 1, 3, 4, 6, 7] {
        assert_eq!(bc.read(&format!("f{i}")).unwrap(), vec![i as u8; 50]);
    }
    assert!(bc.verify_integrity(false).unwrap());
}

#[test]
fn test_full_defrag_respects_shard_limit() {
    let dir = TempDir::new().unwrap();
    let mut bc = Barecat::with_options(
        path_of(&dir, "a.barecat"),
        &BarecatOptions {
            readonly: false,
            shard_size_limit: Some(100),
            ..Default::default()
        },
    )
    .unwrap();
    for i in 0..6 {
        bc.add(&format!("f{i}"), &vec![i as u8; 40]).unwrap();
    }
    // Three shards of two files each; free the first file of each pair.
    bc.remove("f0").unwrap();
    bc.remove("f2").unwrap();
    bc.defrag(DefragMode::Full).unwrap();

    for shard in 0..bc.index().num_used_shards().unwrap() {
        assert!(bc.logical_shard_end(shard).unwrap() <= 100);
    }
    for i in [1usize, 3, 4, 5] {
        assert_eq!(bc.read(&format!("f{i}")).unwrap(), vec![i as u8; 40]);
    }
    assert!(bc.verify_integrity(false).unwrap());
}

#[test]
fn test_quick_defrag_moves_tail_into_gaps() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_at(&dir, "a.barecat");
    bc.add("a", &[b'a'; 10]).unwrap();
    bc.add("b", &[b'b'; 20]).unwrap();
    bc.add("c", &[b'c'; 30]).unwrap();
    bc.add("d", &[b'd'; 5]).unwrap();
    bc.remove("b").unwrap();

    let reclaimed = bc
        .defrag(DefragMode::Quick { budget: Duration::from_secs(5) })
        .unwrap();
    assert!(reclaimed > 0);
    assert_eq!(bc.read("a").unwrap(), vec![b'a'; 10]);
    assert_eq!(bc.read("c").unwrap(), vec![b'c'; 30]);
    assert_eq!(bc.read("d").unwrap(), vec![b'd'; 5]);
    assert!(bc.verify_integrity(false).unwrap());
}

#[test]
fn test_gap_stats() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_at(&dir, "a.barecat");
    bc.add("a", &[1u8; 10]).unwrap();
    bc.add("b", &[2u8; 10]).unwrap();
    bc.add("c", &[3u8; 10]).unwrap();
    bc.remove("b").unwrap();

    let stats = bc.gap_stats().unwrap();
    assert_eq!(stats.num_gaps, 1);
    assert_eq!(stats.total_gap_size, 10);
    assert_eq!(stats.physical_size, 30);
    assert_eq!(stats.logical_size, 20);
    assert!(stats.fragmentation_ratio > 1.0);
}

#[test]
fn test_reshard_split() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_at(&dir, "a.barecat");
    let mut contents = Vec::new();
    for i in 0..10 {
        let data = vec![i as u8; 150_000];
        bc.add(&format!("file{i:02}"), &data).unwrap();
        contents.push(data);
    }
    assert_eq!(bc.index().num_used_shards().unwrap(), 1);
    let crcs_before: Vec<_> = (0..10)
        .map(|i| bc.index().lookup_file(&format!("file{i:02}")).unwrap().crc32c)
        .collect();

    bc.reshard(500_000).unwrap();

    assert_eq!(bc.shard_size_limit().unwrap(), 500_000);
    let num_shards = bc.index().num_used_shards().unwrap();
    assert_eq!(num_shards, 4);
    for shard in 0..num_shards {
        assert!(bc.physical_shard_end(shard).unwrap() <= 500_000);
    }
    for (i, data) in contents.iter().enumerate() {
        assert_eq!(&bc.read(&format!("file{i:02}")).unwrap(), data);
        let finfo = bc.index().lookup_file(&format!("file{i:02}")).unwrap();
        assert_eq!(finfo.crc32c, crcs_before[i]);
    }
    assert!(bc.verify_integrity(false).unwrap());
}

#[test]
fn test_reshard_rejects_oversized_file() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_at(&dir, "a.barecat");
    bc.add("big", &[0u8; 1000]).unwrap();
    let err = bc.reshard(500).unwrap_err();
    assert!(matches!(err, Error::FileTooLarge { size: 1000, limit: 500 }));
    // Nothing moved.
    assert_eq!(bc.shard_size_limit().unwrap(), SHARD_SIZE_UNLIMITED);
    assert_eq!(bc.read("big").unwrap(), vec![0u8; 1000]);
}

#[test]
fn test_reshard_merge_back_to_one_shard() {
    let dir = TempDir::new().unwrap();
    let mut bc = Barecat::with_options(
        path_of(&dir, "a.barecat"),
        &BarecatOptions {
            readonly: false,
            shard_size_limit: Some(100),
            ..Default::default()
        },
    )
    .unwrap();
    for i in 0..6 {
        bc.add(&format!("f{i}"), &vec![i as u8; 60]).unwrap();
    }
    assert!(bc.index().num_used_shards().unwrap() > 1);

    bc.reshard(SHARD_SIZE_UNLIMITED).unwrap();
    assert_eq!(bc.index().num_used_shards().unwrap(), 1);
    for i in 0..6 {
        assert_eq!(bc.read(&format!("f{i}")).unwrap(), vec![i as u8; 60]);
    }
    assert!(bc.verify_integrity(false).unwrap());
}

#[test]
fn test_merge_with_prefix() {
    let dir = TempDir::new().unwrap();
    let mut source = create_at(&dir, "source.barecat");
    source.add("file.txt", b"abcde").unwrap();
    source.add("dir/nested.txt", b"fghijk").unwrap();
    source.close().unwrap();

    let mut target = create_at(&dir, "target.barecat");
    target.add("existing.txt", b"xy").unwrap();
    target
        .merge_from(
            &path_of(&dir, "source.barecat"),
            &MergeOptions { prefix: "pref".into(), ..Default::default() },
        )
        .unwrap();

    assert_eq!(target.read("existing.txt").unwrap(), b"xy");
    assert_eq!(target.read("pref/file.txt").unwrap(), b"abcde");
    assert_eq!(target.read("pref/dir/nested.txt").unwrap(), b"fghijk");

    let root = target.index().lookup_dir("").unwrap();
    assert_eq!(root.size_tree, 13);
    assert_eq!(root.num_files_tree, 3);
    let pref = target.index().lookup_dir("pref").unwrap();
    assert_eq!(pref.size_tree, 11);
    assert_eq!(pref.num_files_tree, 2);
    assert!(target.verify_integrity(false).unwrap());
}

#[test]
fn test_merge_detects_conflicts() {
    let dir = TempDir::new().unwrap();
    let mut source = create_at(&dir, "source.barecat");
    source.add("clash", b"file-in-source").unwrap();
    source.close().unwrap();

    let mut target = create_at(&dir, "target.barecat");
    target.add("clash/inner", b"dir-in-target").unwrap();
    let err = target
        .merge_from(&path_of(&dir, "source.barecat"), &MergeOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::IsADirectory(_)));
    // The failed merge changed nothing.
    assert_eq!(target.num_files().unwrap(), 1);
}

#[test]
fn test_merge_ignore_duplicates() {
    let dir = TempDir::new().unwrap();
    let mut source = create_at(&dir, "source.barecat");
    source.add("shared", b"from-source").unwrap();
    source.add("only-in-source", b"s").unwrap();
    source.close().unwrap();

    let mut target = create_at(&dir, "target.barecat");
    target.add("shared", b"from-target").unwrap();

    let err = target
        .merge_from(&path_of(&dir, "source.barecat"), &MergeOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::FileExists(_)));

    target
        .merge_from(
            &path_of(&dir, "source.barecat"),
            &MergeOptions { ignore_duplicates: true, ..Default::default() },
        )
        .unwrap();
    // The target's copy wins; stats are exact after the recompute.
    assert_eq!(target.read("shared").unwrap(), b"from-target");
    assert_eq!(target.read("only-in-source").unwrap(), b"s");
    let root = target.index().lookup_dir("").unwrap();
    assert_eq!(root.num_files_tree, 2);
    assert_eq!(root.size_tree, 12);
    assert!(target.index().verify_integrity().unwrap().is_empty());
}

#[test]
fn test_merge_respects_shard_limit() {
    let dir = TempDir::new().unwrap();
    let mut source = create_at(&dir, "source.barecat");
    for i in 0..4 {
        source.add(&format!("s{i}"), &vec![i as u8; 40]).unwrap();
    }
    source.close().unwrap();

    let mut target = Barecat::with_options(
        path_of(&dir, "target.barecat"),
        &BarecatOptions {
            readonly: false,
            shard_size_limit: Some(100),
            ..Default::default()
        },
    )
    .unwrap();
    target.add("t0", &[9u8; 50]).unwrap();
    target
        .merge_from(&path_of(&dir, "source.barecat"), &MergeOptions::default())
        .unwrap();

    for shard in 0..target.index().num_used_shards().unwrap() {
        assert!(target.logical_shard_end(shard).unwrap() <= 100);
    }
    for i in 0..4 {
        assert_eq!(target.read(&format!("s{i}")).unwrap(), vec![i as u8; 40]);
    }
    assert!(target.verify_integrity(false).unwrap());
}

#[test]
fn test_filtered_merge_with_pattern() {
    let dir = TempDir::new().unwrap();
    let mut source = create_at(&dir, "source.barecat");
    source.add("imgs/1.jpg", b"jpeg1").unwrap();
    source.add("imgs/2.jpg", b"jpeg2").unwrap();
    source.add("notes/readme", b"text").unwrap();
    source.close().unwrap();

    let mut target = create_at(&dir, "target.barecat");
    target
        .merge_from(
            &path_of(&dir, "source.barecat"),
            &MergeOptions {
                pattern: Some("imgs/*.jpg".into()),
                ..Default::default()
            },
        )
        .unwrap();

    assert_eq!(target.read("imgs/1.jpg").unwrap(), b"jpeg1");
    assert_eq!(target.read("imgs/2.jpg").unwrap(), b"jpeg2");
    assert!(!target.exists("notes/readme").unwrap());
    assert_eq!(target.num_files().unwrap(), 2);
    assert!(target.verify_integrity(false).unwrap());
}

#[test]
fn test_filtered_merge_with_rules() {
    let dir = TempDir::new().unwrap();
    let mut source = create_at(&dir, "source.barecat");
    source.add("keep/a.bin", b"aa").unwrap();
    source.add("keep/skip.log", b"ll").unwrap();
    source.add("other/b.bin", b"bb").unwrap();
    source.close().unwrap();

    let mut target = create_at(&dir, "target.barecat");
    target
        .merge_from(
            &path_of(&dir, "source.barecat"),
            &MergeOptions {
                filter_rules: vec![
                    GlobRule::exclude("**/*.log"),
                    GlobRule::include("keep/**"),
                    GlobRule::exclude("**"),
                ],
                ..Default::default()
            },
        )
        .unwrap();

    assert_eq!(target.read("keep/a.bin").unwrap(), b"aa");
    assert!(!target.exists("keep/skip.log").unwrap());
    assert!(!target.exists("other/b.bin").unwrap());
    assert!(target.verify_integrity(false).unwrap());
}

#[test]
fn test_index_only_merge_with_relocated_shards() {
    let dir = TempDir::new().unwrap();
    let mut source = create_at(&dir, "source.barecat");
    source.add("x.txt", b"xxxx").unwrap();
    source.add("sub/y.txt", b"yyyyy").unwrap();
    source.close().unwrap();

    let mut target = create_at(&dir, "target.barecat");
    target.add("a.txt", b"aaa").unwrap();
    target.close().unwrap();

    // Simulate the symlink arrangement: the source's shard becomes the
    // target's next shard file.
    std::fs::copy(
        path_of(&dir, "source.barecat-shard-00000"),
        path_of(&dir, "target.barecat-shard-00001"),
    )
    .unwrap();

    let target_store = Barecat::with_options(
        path_of(&dir, "target.barecat"),
        &BarecatOptions { readonly: false, ..Default::default() },
    )
    .unwrap();
    target_store
        .index()
        .merge_index_only(
            &path_of(&dir, "source.barecat"),
            false,
            "",
            true,
        )
        .unwrap();

    assert_eq!(target_store.read("a.txt").unwrap(), b"aaa");
    assert_eq!(target_store.read("x.txt").unwrap(), b"xxxx");
    assert_eq!(target_store.read("sub/y.txt").unwrap(), b"yyyyy");
    let x = target_store.index().lookup_file("x.txt").unwrap();
    assert_eq!(x.shard, 1);
    let root = target_store.index().lookup_dir("").unwrap();
    assert_eq!(root.num_files_tree, 3);
    assert_eq!(root.size_tree, 12);
    assert!(target_store.verify_integrity(false).unwrap());
}

#[test]
fn test_upgrade_noop_on_current_schema() {
    let dir = TempDir::new().unwrap();
    let mut bc = create_at(&dir, "a.barecat");
    bc.add("f", b"data").unwrap();
    bc.close().unwrap();

    barecat::upgrade(&path_of(&dir, "a.barecat")).unwrap();
    let bc = Barecat::open(path_of(&dir, "a.barecat")).unwrap();
    assert_eq!(bc.read("f").unwrap(), b"data");
}

#[test]
fn test_merge_into_append_only_target() {
    let dir = TempDir::new().unwrap();
    let mut source = create_at(&dir, "source.barecat");
    source.add("s", b"source-data").unwrap();
    source.close().unwrap();

    let mut target = create_at(&dir, "target.barecat");
    target.add("t", b"target-data").unwrap();
    target.close().unwrap();

    let mut target = Barecat::with_options(
        path_of(&dir, "target.barecat"),
        &BarecatOptions {
            readonly: false,
            append_only: true,
            ..Default::default()
        },
    )
    .unwrap();
    target
        .merge_from(&path_of(&dir, "source.barecat"), &MergeOptions::default())
        .unwrap();
    assert_eq!(target.read("t").unwrap(), b"target-data");
    assert_eq!(target.read("s").unwrap(), b"source-data");
}
