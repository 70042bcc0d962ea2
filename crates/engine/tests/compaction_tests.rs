//! Space reclamation: manual compaction, the background ticker, and
//! recovery of interrupted swaps.

use std::time::Duration;
use tempfile::TempDir;
use vellum_core::record::LogRecord;
use vellum_engine::{Db, Error, Options};
use vellum_wal::{Wal, WalOptions};

/// Small segments so compaction has several files to chew through.
fn small_options(dir: &TempDir) -> Options {
    Options::new(dir.path()).with_segment_size(16 * 1024)
}

fn key(i: usize) -> Vec<u8> {
    format!("key-{:06}", i).into_bytes()
}

fn value(i: usize) -> Vec<u8> {
    format!("value-{:06}-{}", i, "x".repeat(100)).into_bytes()
}

#[test]
fn test_compact_reclaims_space() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(small_options(&dir)).unwrap();

    for i in 0..1000 {
        db.put(&key(i), &value(i)).unwrap();
    }
    for i in 0..500 {
        db.delete(&key(i)).unwrap();
    }

    let before = db.stat().unwrap();
    let stats = db.compact().unwrap();
    let after = db.stat().unwrap();

    assert!(
        after.disk_size < before.disk_size,
        "disk size must shrink: {} -> {}",
        before.disk_size,
        after.disk_size
    );
    assert_eq!(stats.records_rewritten, 500);
    assert!(stats.records_discarded >= 1500, "500 superseded + 500 tombstones + sentinels");
    assert!(stats.reclaimed_bytes > 0);

    for i in 0..500 {
        assert!(matches!(db.get(&key(i)), Err(Error::KeyNotFound)));
    }
    for i in 500..1000 {
        assert_eq!(db.get(&key(i)).unwrap(), value(i), "survivor {}", i);
    }
    db.close().unwrap();
}

#[test]
fn test_compact_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(small_options(&dir)).unwrap();

    for i in 0..200 {
        db.put(&key(i), &value(i)).unwrap();
    }
    for i in 0..100 {
        db.delete(&key(i)).unwrap();
    }

    db.compact().unwrap();
    let first = db.stat().unwrap();
    let second_stats = db.compact().unwrap();
    let second = db.stat().unwrap();

    assert_eq!(second_stats.records_rewritten, 100);
    assert_eq!(first.key_count, second.key_count);
    for i in 100..200 {
        assert_eq!(db.get(&key(i)).unwrap(), value(i));
    }
    db.close().unwrap();
}

#[test]
fn test_compacted_data_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let db = Db::open(small_options(&dir)).unwrap();
        for i in 0..300 {
            db.put(&key(i), &value(i)).unwrap();
        }
        for i in 0..150 {
            db.delete(&key(i)).unwrap();
        }
        db.compact().unwrap();
        db.close().unwrap();
    }

    let db = Db::open(small_options(&dir)).unwrap();
    assert_eq!(db.stat().unwrap().key_count, 150);
    for i in 150..300 {
        assert_eq!(db.get(&key(i)).unwrap(), value(i));
    }
    for i in 0..150 {
        assert!(matches!(db.get(&key(i)), Err(Error::KeyNotFound)));
    }
    db.close().unwrap();
}

#[test]
fn test_compact_drops_expired_records() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(small_options(&dir)).unwrap();

    db.put(b"keeper", b"v").unwrap();
    db.put_with_ttl(b"ephemeral", b"v", Duration::from_millis(50)).unwrap();
    std::thread::sleep(Duration::from_millis(150));

    let stats = db.compact().unwrap();
    assert_eq!(stats.records_rewritten, 1);

    assert_eq!(db.get(b"keeper").unwrap(), b"v");
    assert!(matches!(db.get(b"ephemeral"), Err(Error::KeyNotFound)));
    assert_eq!(db.stat().unwrap().key_count, 1);
    db.close().unwrap();
}

#[test]
fn test_compact_empty_db() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(Options::new(dir.path())).unwrap();

    let stats = db.compact().unwrap();
    assert_eq!(stats.records_rewritten, 0);

    db.put(b"after", b"1").unwrap();
    assert_eq!(db.get(b"after").unwrap(), b"1");
    db.close().unwrap();
}

#[test]
fn test_writes_proceed_after_compaction() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(small_options(&dir)).unwrap();

    for i in 0..100 {
        db.put(&key(i), &value(i)).unwrap();
    }
    db.compact().unwrap();

    for i in 100..200 {
        db.put(&key(i), &value(i)).unwrap();
    }
    for i in 0..200 {
        assert_eq!(db.get(&key(i)).unwrap(), value(i));
    }
    db.close().unwrap();
}

#[test]
fn test_gc_ticker_reclaims_in_background() {
    let dir = TempDir::new().unwrap();
    let options = small_options(&dir)
        .with_gc_interval(Duration::from_millis(200))
        .with_gc_ratio(0.00001);
    let db = Db::open(options).unwrap();

    let mut deleted = Vec::new();
    for i in 0..2000 {
        db.put(&key(i), &value(i)).unwrap();
    }
    for i in (0..2000).step_by(2) {
        db.delete(&key(i)).unwrap();
        deleted.push(i);
    }

    let before = db.stat().unwrap().disk_size;
    std::thread::sleep(Duration::from_secs(1));
    let after = db.stat().unwrap().disk_size;

    assert!(
        after < before,
        "background gc must shrink the log: {} -> {}",
        before,
        after
    );
    for i in deleted {
        assert!(matches!(db.get(&key(i)), Err(Error::KeyNotFound)));
    }
    for i in (1..2000).step_by(2) {
        assert_eq!(db.get(&key(i)).unwrap(), value(i));
    }
    db.close().unwrap();
}

#[test]
fn test_gc_ticker_skips_below_ratio() {
    let dir = TempDir::new().unwrap();
    // Threshold of 1.0 is unreachable; the ticker must never rewrite
    let options = small_options(&dir)
        .with_gc_interval(Duration::from_millis(50))
        .with_gc_ratio(1.0);
    let db = Db::open(options).unwrap();

    for i in 0..100 {
        db.put(&key(i), &value(i)).unwrap();
    }
    for i in 0..50 {
        db.delete(&key(i)).unwrap();
    }

    let before = db.stat().unwrap().disk_size;
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(db.stat().unwrap().disk_size, before);
    db.close().unwrap();
}

// ========================================
// Interrupted swap recovery
// ========================================

#[test]
fn test_unsealed_staging_dir_discarded_at_open() {
    let dir = TempDir::new().unwrap();
    {
        let db = Db::open(Options::new(dir.path())).unwrap();
        db.put(b"real", b"v").unwrap();
        db.close().unwrap();
    }

    // A partial rewrite that crashed before sealing
    let gc_dir = dir.path().join("gc");
    {
        let mut wal = Wal::open(&gc_dir, WalOptions::default()).unwrap();
        let mut record = LogRecord::normal(b"phantom".to_vec(), b"x".to_vec());
        record.batch_id = 99;
        wal.write(&record.encode()).unwrap();
        wal.sync().unwrap();
    }

    let db = Db::open(Options::new(dir.path())).unwrap();
    assert!(!gc_dir.exists(), "unsealed staging dir must be discarded");
    assert_eq!(db.get(b"real").unwrap(), b"v");
    assert!(matches!(db.get(b"phantom"), Err(Error::KeyNotFound)));
    db.close().unwrap();
}

#[test]
fn test_sealed_staging_dir_completes_swap_at_open() {
    let dir = TempDir::new().unwrap();
    {
        let db = Db::open(Options::new(dir.path())).unwrap();
        db.put(b"stale", b"old-generation").unwrap();
        db.close().unwrap();
    }

    // A rewrite that finished (sealed) but crashed before the swap
    let gc_dir = dir.path().join("gc");
    {
        let mut wal = Wal::open(&gc_dir, WalOptions::default()).unwrap();
        let mut record = LogRecord::normal(b"compacted".to_vec(), b"new-generation".to_vec());
        record.batch_id = 50;
        wal.write(&record.encode()).unwrap();
        wal.write(&LogRecord::batch_finished(50).encode()).unwrap();
        wal.sync().unwrap();
    }
    std::fs::File::create(gc_dir.join("SEALED")).unwrap();

    let db = Db::open(Options::new(dir.path())).unwrap();
    assert!(!gc_dir.exists(), "completed swap must clean up staging");
    assert_eq!(db.get(b"compacted").unwrap(), b"new-generation");
    assert!(
        matches!(db.get(b"stale"), Err(Error::KeyNotFound)),
        "old generation must be gone after the swap completes"
    );
    db.close().unwrap();
}
