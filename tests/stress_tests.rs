//! Concurrency and volume tests.

use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use rand::{rngs::StdRng, Rng, SeedableRng};
use stratumdb::{Database, Options, ReadOptions, WriteOptions};
use tempfile::TempDir;

fn wo() -> WriteOptions {
    WriteOptions::default()
}

fn ro() -> ReadOptions {
    ReadOptions::new()
}

fn small_buffer_options() -> Options {
    let mut options = Options::default();
    options.write_buffer_size = 64 * 1024;
    options
}

#[test]
fn stress_concurrent_writers() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::open_with_options(dir.path(), small_buffer_options()).unwrap());

    let num_threads = 8;
    let keys_per_thread = 500;

    let handles: Vec<_> = (0..num_threads)
        .map(|t| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for i in 0..keys_per_thread {
                    let key = format!("thread{:02}_key{:05}", t, i);
                    let value = format!("value_{}", i);
                    db.put(&wo(), key.as_bytes(), value.as_bytes()).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for t in 0..num_threads {
        for i in 0..keys_per_thread {
            let key = format!("thread{:02}_key{:05}", t, i);
            let expected = format!("value_{}", i);
            assert_eq!(
                db.get(&ro(), key.as_bytes()).unwrap(),
                Some(Bytes::from(expected)),
                "missing {}",
                key
            );
        }
    }
}

#[test]
fn stress_readers_during_writes() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::open_with_options(dir.path(), small_buffer_options()).unwrap());

    // Seed some stable data.
    for i in 0..500 {
        db.put(&wo(), format!("stable{:05}", i).as_bytes(), b"fixed")
            .unwrap();
    }

    let writer = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            for i in 0..3000 {
                db.put(&wo(), format!("hot{:06}", i % 100).as_bytes(), &[b'w'; 64])
                    .unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|r| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(r as u64);
                for _ in 0..2000 {
                    let i: usize = rng.gen_range(0..500);
                    let key = format!("stable{:05}", i);
                    assert_eq!(
                        db.get(&ro(), key.as_bytes()).unwrap(),
                        Some(Bytes::from("fixed")),
                        "stable key disappeared under concurrent writes"
                    );
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
}

#[test]
fn stress_snapshot_holds_view_under_churn() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::open_with_options(dir.path(), small_buffer_options()).unwrap());

    for i in 0..200 {
        db.put(&wo(), format!("k{:04}", i).as_bytes(), b"generation-1")
            .unwrap();
    }
    let snapshot = db.snapshot();

    // Overwrite everything several times and compact.
    for generation in 2..5 {
        let value = format!("generation-{}", generation);
        for i in 0..200 {
            db.put(&wo(), format!("k{:04}", i).as_bytes(), value.as_bytes())
                .unwrap();
        }
    }
    db.compact_range(None, None).unwrap();

    let mut at_snapshot = ReadOptions::new();
    at_snapshot.snapshot = Some(snapshot);
    for i in 0..200 {
        assert_eq!(
            db.get(&at_snapshot, format!("k{:04}", i).as_bytes()).unwrap(),
            Some(Bytes::from("generation-1"))
        );
    }
    for i in 0..200 {
        assert_eq!(
            db.get(&ro(), format!("k{:04}", i).as_bytes()).unwrap(),
            Some(Bytes::from("generation-4"))
        );
    }
}

#[test]
fn stress_random_workload_with_reopen() {
    let dir = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    let mut model = std::collections::BTreeMap::new();
    {
        let db = Database::open_with_options(dir.path(), small_buffer_options()).unwrap();
        for _ in 0..5000 {
            let key = format!("key{:05}", rng.gen_range(0..2000u32));
            if rng.gen_bool(0.25) {
                db.delete(&wo(), key.as_bytes()).unwrap();
                model.remove(&key);
            } else {
                let value = format!("v{}", rng.gen::<u32>());
                db.put(&wo(), key.as_bytes(), value.as_bytes()).unwrap();
                model.insert(key, value);
            }
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
    let expected: Vec<(String, String)> = model.into_iter().collect();
    assert_eq!(scanned, expected);
}
