//! End-to-end behavior through the public API.

use std::fs;
use std::path::Path;

use bytes::Bytes;
use stratumdb::{Database, Options, ReadOptions, WriteBatch, WriteOptions};
use tempfile::TempDir;

fn wo() -> WriteOptions {
    WriteOptions::default()
}

fn sync_wo() -> WriteOptions {
    let mut options = WriteOptions::default();
    options.sync = true;
    options
}

fn ro() -> ReadOptions {
    ReadOptions::new()
}

fn small_buffer_options() -> Options {
    let mut options = Options::default();
    options.write_buffer_size = 64 * 1024;
    options
}

/// Copy a database directory byte-for-byte, standing in for the state a
/// crashed process leaves behind (the source is never closed cleanly
/// before the copy).
fn copy_db_dir(from: &Path, to: &Path) {
    fs::create_dir_all(to).unwrap();
    for entry in fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        let name = entry.file_name();
        if name == "LOCK" {
            continue;
        }
        fs::copy(entry.path(), to.join(name)).unwrap();
    }
}

#[test]
fn basic_put_get_delete() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path()).unwrap();

    db.put(&wo(), b"a", b"1").unwrap();
    db.put(&wo(), b"b", b"2").unwrap();
    assert_eq!(db.get(&ro(), b"a").unwrap(), Some(Bytes::from("1")));

    db.delete(&wo(), b"a").unwrap();
    assert_eq!(db.get(&ro(), b"a").unwrap(), None);
    assert_eq!(db.get(&ro(), b"b").unwrap(), Some(Bytes::from("2")));
}

#[test]
fn snapshot_isolation() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path()).unwrap();

    db.put(&wo(), b"k", b"v1").unwrap();
    let snapshot = db.snapshot();
    db.put(&wo(), b"k", b"v2").unwrap();

    assert_eq!(db.get(&ro(), b"k").unwrap(), Some(Bytes::from("v2")));

    let mut at_snapshot = ReadOptions::new();
    at_snapshot.snapshot = Some(snapshot.clone());
    assert_eq!(db.get(&at_snapshot, b"k").unwrap(), Some(Bytes::from("v1")));

    // Releasing the snapshot frees the pinned history.
    drop(at_snapshot);
    drop(snapshot);
    assert_eq!(db.get(&ro(), b"k").unwrap(), Some(Bytes::from("v2")));
}

#[test]
fn flush_ordering_produces_level0_and_sorted_scan() {
    let dir = TempDir::new().unwrap();
    let db = Database::open_with_options(dir.path(), small_buffer_options()).unwrap();

    // Well past the write buffer: 10,000 distinct 100-byte values.
    let value = vec![b'v'; 100];
    for i in 0..10_000u32 {
        let key = format!("key{:08}", i);
        db.put(&wo(), key.as_bytes(), &value).unwrap();
    }
    db.flush().unwrap();

    // The flush produced table files; depending on how far background
    // compaction has run they sit at level 0 or below.
    let total: usize = (0..7)
        .map(|l| {
            db.property(&format!("num-files-at-level{}", l))
                .unwrap()
                .parse::<usize>()
                .unwrap()
        })
        .sum();
    assert!(total >= 1, "flushes must have produced table files");

    // The full scan yields every pair, in user-key order.
    let mut count = 0u32;
    let mut previous: Option<Bytes> = None;
    for (key, val) in db.iter(&ro()).unwrap() {
        if let Some(prev) = &previous {
            assert!(prev < &key, "scan out of order");
        }
        assert_eq!(val.len(), 100);
        previous = Some(key);
        count += 1;
    }
    assert_eq!(count, 10_000);
}

#[test]
fn crash_recovery_replays_synced_writes() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("db");
    let crashed_path = dir.path().join("crashed");

    let db = Database::open(&db_path).unwrap();
    for i in 0..1000u32 {
        let key = format!("key{:06}", i);
        let value = format!("value{}", i);
        db.put(&sync_wo(), key.as_bytes(), value.as_bytes()).unwrap();
    }

    // Snapshot the on-disk state while the database is still open: the
    // copy sees exactly what a crash would leave.
    copy_db_dir(&db_path, &crashed_path);
    drop(db);

    let recovered = Database::open(&crashed_path).unwrap();
    for i in 0..1000u32 {
        let key = format!("key{:06}", i);
        let expected = format!("value{}", i);
        assert_eq!(
            recovered.get(&ro(), key.as_bytes()).unwrap(),
            Some(Bytes::from(expected)),
            "missing {}",
            key
        );
    }

    // Sequences keep growing from where the crash left off.
    recovered.put(&wo(), b"after", b"crash").unwrap();
    assert_eq!(
        recovered.get(&ro(), b"after").unwrap(),
        Some(Bytes::from("crash"))
    );
}

#[test]
fn compaction_drops_shadowed_versions() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path()).unwrap();

    db.put(&wo(), b"key", b"v1").unwrap();
    db.put(&wo(), b"key", b"v2").unwrap();
    db.put(&wo(), b"key", b"v3").unwrap();

    db.compact_range(Some(b"a"), Some(b"z")).unwrap();

    // Only the newest version survives a full compaction with no
    // snapshots pinning history.
    assert_eq!(db.get(&ro(), b"key").unwrap(), Some(Bytes::from("v3")));
    let entries: Vec<_> = db.iter(&ro()).unwrap().collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0.as_ref(), b"key");
    assert_eq!(entries[0].1.as_ref(), b"v3");
}

#[test]
fn compaction_honors_live_snapshots() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path()).unwrap();

    db.put(&wo(), b"key", b"old").unwrap();
    let snapshot = db.snapshot();
    db.put(&wo(), b"key", b"new").unwrap();

    db.compact_range(None, None).unwrap();

    // The pinned version must still be readable after compaction.
    let mut at_snapshot = ReadOptions::new();
    at_snapshot.snapshot = Some(snapshot);
    assert_eq!(
        db.get(&at_snapshot, b"key").unwrap(),
        Some(Bytes::from("old"))
    );
    assert_eq!(db.get(&ro(), b"key").unwrap(), Some(Bytes::from("new")));
}

#[test]
fn tombstones_disappear_after_full_compaction() {
    let dir = TempDir::new().unwrap();
    let db = Database::open_with_options(dir.path(), small_buffer_options()).unwrap();

    for i in 0..500u32 {
        db.put(&wo(), format!("k{:05}", i).as_bytes(), b"v").unwrap();
    }
    db.flush().unwrap();
    for i in 0..500u32 {
        db.delete(&wo(), format!("k{:05}", i).as_bytes()).unwrap();
    }
    db.compact_range(None, None).unwrap();

    assert_eq!(db.iter(&ro()).unwrap().count(), 0);
    for i in (0..500u32).step_by(83) {
        assert_eq!(db.get(&ro(), format!("k{:05}", i).as_bytes()).unwrap(), None);
    }
}

#[test]
fn batched_writes_commit_atomically() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path()).unwrap();

    let mut batch = WriteBatch::new();
    for i in 0..100u32 {
        batch.put(format!("batch{:04}", i).as_bytes(), b"v");
    }
    batch.delete(b"batch0050");
    db.write(&wo(), batch).unwrap();

    assert_eq!(db.iter(&ro()).unwrap().count(), 99);
    assert_eq!(db.get(&ro(), b"batch0050").unwrap(), None);
}

#[test]
fn reopen_preserves_exact_mapping() {
    let dir = TempDir::new().unwrap();

    let mut expected: Vec<(String, String)> = (0..500u32)
        .map(|i| (format!("key{:05}", i), format!("value{}", i * 7)))
        .collect();
    expected.sort();

    {
        let db = Database::open_with_options(dir.path(), small_buffer_options()).unwrap();
        // Interleave puts with deletions of a disjoint key space.
        for (k, v) in &expected {
            db.put(&wo(), k.as_bytes(), v.as_bytes()).unwrap();
            db.put(&wo(), format!("temp-{}", k).as_bytes(), b"x").unwrap();
        }
        for (k, _) in &expected {
            db.delete(&wo(), format!("temp-{}", k).as_bytes()).unwrap();
        }
        db.flush().unwrap();
    }

    let db = Database::open(dir.path()).unwrap();
    let scanned: Vec<(String, String)> = db
        .iter(&ro())
        .unwrap()
        .map(|(k, v)| {
            (
                String::from_utf8(k.to_vec()).unwrap(),
                String::from_utf8(v.to_vec()).unwrap(),
            )
        })
        .collect();
    assert_eq!(scanned, expected);
}

#[test]
fn iterators_keep_reading_while_db_advances() {
    let dir = TempDir::new().unwrap();
    let db = Database::open_with_options(dir.path(), small_buffer_options()).unwrap();

    for i in 0..1000u32 {
        db.put(&wo(), format!("k{:05}", i).as_bytes(), &[b'v'; 64])
            .unwrap();
    }

    let mut iter = db.iter(&ro()).unwrap();
    iter.seek_to_first();

    // Push the database forward while the iterator holds its view.
    for i in 0..1000u32 {
        db.put(&wo(), format!("k{:05}", i).as_bytes(), b"overwritten")
            .unwrap();
    }
    db.compact_range(None, None).unwrap();

    let mut count = 0;
    while iter.valid() {
        assert_eq!(iter.value(), &[b'v'; 64][..], "iterator view changed");
        count += 1;
        iter.next();
    }
    assert_eq!(count, 1000);
    iter.status().unwrap();
}

#[test]
fn range_bounds_via_seek() {
    let dir = TempDir::new().unwrap();
    let db = Database::open(dir.path()).unwrap();

    for key in ["a", "b", "c", "d", "e"] {
        db.put(&wo(), key.as_bytes(), key.as_bytes()).unwrap();
    }

    let mut iter = db.iter(&ro()).unwrap();
    iter.seek(b"b");
    let mut collected = Vec::new();
    while iter.valid() && iter.key() < b"e".as_slice() {
        collected.push(iter.key().to_vec());
        iter.next();
    }
    assert_eq!(collected, vec![b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
}
