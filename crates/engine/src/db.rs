//! The engine top-level: open, replay, direct operations, close.

use crate::batch::Batch;
use crate::gc;
use crate::index::{Index, ShardedIndex};
use crate::options::{BatchOptions, Options};
use crate::shutdown::Shutdown;
use crate::watcher::{self, Event, Watcher};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};
use vellum_core::record::{decode_record, LogRecord, RecordType};
use vellum_core::{Error, Result};
use vellum_wal::{ChunkPosition, Wal};

pub(crate) struct DbInner {
    /// The log behind the engine's writer lock. Read batches share it,
    /// write batches and GC hold it exclusively.
    pub(crate) wal: RwLock<Wal>,
    pub(crate) index: Box<dyn Index>,
    pub(crate) options: Options,
    pub(crate) closed: AtomicBool,
    /// Next batch id; seeded past the largest id seen during replay.
    pub(crate) batch_seq: AtomicU64,
    pub(crate) watcher: Option<Arc<Watcher>>,
    shutdown: Arc<Shutdown>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// A point-in-time summary of the engine's footprint.
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    /// Number of live keys in the index.
    pub key_count: usize,
    /// Total bytes of log segments on disk.
    pub disk_size: u64,
    /// Bytes occupied by the chunks the index points at.
    pub live_bytes: u64,
    /// Estimated fraction of the log occupied by dead records.
    pub dead_ratio: f64,
}

/// An embedded key-value store over a segmented write-ahead log.
///
/// `Db` is a cheaply cloneable handle; clones share the same engine. All
/// direct operations behave exactly like a single-record batch that is
/// immediately committed.
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

impl Db {
    /// Open (or create) a database at `options.dir_path`.
    ///
    /// Replays the log to rebuild the index: records are staged per batch
    /// id and applied only when their `BatchFinished` sentinel is reached,
    /// so half-committed batches from a crash vanish here. Background
    /// threads (GC ticker, watch drain) start according to the options.
    pub fn open(options: Options) -> Result<Db> {
        options.validate()?;
        std::fs::create_dir_all(&options.dir_path)?;

        // A crash during a compaction swap leaves either a sealed staging
        // directory (finish the swap) or an unsealed one (discard it).
        gc::recover_interrupted_swap(&options.dir_path)?;

        let wal = Wal::open(&options.dir_path, options.wal_options())?;
        let index: Box<dyn Index> = Box::new(ShardedIndex::new());
        let max_batch_id = replay(&wal, index.as_ref())?;

        let watcher = if options.watch_queue_size > 0 {
            Some(Arc::new(Watcher::new(options.watch_queue_size)))
        } else {
            None
        };

        let inner = Arc::new(DbInner {
            wal: RwLock::new(wal),
            index,
            options,
            closed: AtomicBool::new(false),
            batch_seq: AtomicU64::new(max_batch_id + 1),
            watcher: watcher.clone(),
            shutdown: Arc::new(Shutdown::new()),
            threads: Mutex::new(Vec::new()),
        });

        let mut threads = Vec::new();
        if let Some(interval) = inner.options.gc_interval {
            threads.push(gc::spawn_ticker(
                Arc::downgrade(&inner),
                Arc::clone(&inner.shutdown),
                interval,
            ));
        }
        if let Some(watcher) = watcher {
            threads.push(watcher::spawn_drain(watcher));
        }
        *inner.threads.lock() = threads;

        Ok(Db { inner })
    }

    /// Start a batch, taking the engine lock (shared if read-only,
    /// exclusive otherwise) until the batch commits, rolls back, or drops.
    pub fn new_batch(&self, options: BatchOptions) -> Result<Batch<'_>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::DbClosed);
        }
        Ok(Batch::new(&self.inner, options))
    }

    /// Write `key` → `value`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = self.new_batch(BatchOptions::default())?;
        if let Err(e) = batch.put(key, value) {
            let _ = batch.rollback();
            return Err(e);
        }
        batch.commit()
    }

    /// Write `key` → `value`, expiring `ttl` from now.
    pub fn put_with_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> Result<()> {
        let mut batch = self.new_batch(BatchOptions::default())?;
        if let Err(e) = batch.put_with_ttl(key, value, ttl) {
            let _ = batch.rollback();
            return Err(e);
        }
        batch.commit()
    }

    /// Read the value of `key`.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let mut batch = self.new_batch(BatchOptions::default().with_read_only(true))?;
        let value = batch.get(key);
        batch.commit()?;
        value
    }

    /// Delete `key`.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let mut batch = self.new_batch(BatchOptions::default())?;
        if let Err(e) = batch.delete(key) {
            let _ = batch.rollback();
            return Err(e);
        }
        batch.commit()
    }

    /// Whether `key` has a live record.
    pub fn exist(&self, key: &[u8]) -> Result<bool> {
        let mut batch = self.new_batch(BatchOptions::default().with_read_only(true))?;
        let present = batch.exist(key);
        batch.commit()?;
        present
    }

    /// Set the TTL of an existing key to `ttl` from now.
    pub fn expire(&self, key: &[u8], ttl: Duration) -> Result<()> {
        let mut batch = self.new_batch(BatchOptions::default())?;
        if let Err(e) = batch.expire(key, ttl) {
            let _ = batch.rollback();
            return Err(e);
        }
        batch.commit()
    }

    /// Remaining time to live of `key` (`None` = no expiry).
    pub fn ttl(&self, key: &[u8]) -> Result<Option<Duration>> {
        let mut batch = self.new_batch(BatchOptions::default().with_read_only(true))?;
        let ttl = batch.ttl(key);
        batch.commit()?;
        ttl
    }

    /// Force an fsync of the log.
    pub fn sync(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::DbClosed);
        }
        self.inner.wal.write().sync()
    }

    /// Summarize the engine's current footprint.
    pub fn stat(&self) -> Result<Stat> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::DbClosed);
        }
        let wal = self.inner.wal.read();
        let disk_size = wal.total_size()?;

        let mut live_bytes = 0u64;
        self.inner.index.for_each(&mut |_, pos| {
            live_bytes += pos.frame_len();
            true
        });

        let dead_ratio = if disk_size == 0 {
            0.0
        } else {
            1.0 - (live_bytes as f64 / disk_size as f64)
        };

        Ok(Stat {
            key_count: self.inner.index.len(),
            disk_size,
            live_bytes,
            dead_ratio,
        })
    }

    /// Run one compaction cycle now, regardless of the dead-ratio
    /// threshold, and return what it did.
    pub fn compact(&self) -> Result<gc::GcStats> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::DbClosed);
        }
        gc::run_cycle(&self.inner)
    }

    /// Subscribe to committed changes.
    ///
    /// Fails with `InvalidConfig` when the watcher is disabled
    /// (`watch_queue_size == 0`).
    pub fn watch(&self) -> Result<mpsc::Receiver<Event>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::DbClosed);
        }
        match &self.inner.watcher {
            Some(watcher) => Ok(watcher.subscribe()),
            None => Err(Error::InvalidConfig(
                "watcher disabled: set watch_queue_size > 0".to_string(),
            )),
        }
    }

    /// Close the database: stop background threads, fsync the log.
    ///
    /// Waits for an in-flight writer batch to finish (the final fsync needs
    /// the writer lock). Idempotent; all subsequent operations fail with
    /// `DbClosed`.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.inner.shutdown.signal();
        if let Some(watcher) = &self.inner.watcher {
            watcher.close();
        }
        let handles: Vec<JoinHandle<()>> = self.inner.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }

        self.inner.wal.write().sync()
    }
}

/// Rebuild the index from the log.
///
/// Records are staged per batch id; a batch is applied only when its
/// `BatchFinished` sentinel shows up. Whatever is still staged at the end
/// of the log belongs to batches that never committed — it is discarded.
///
/// Returns the largest batch id seen, for seeding the id counter.
fn replay(wal: &Wal, index: &dyn Index) -> Result<u64> {
    let mut staged: HashMap<u64, Vec<(LogRecord, ChunkPosition)>> = HashMap::new();
    let mut max_batch_id = 0u64;
    let mut applied = 0usize;
    let mut batches = 0usize;

    for item in wal.iter()? {
        let (chunk, pos) = item?;
        let record = decode_record(&chunk)?;
        max_batch_id = max_batch_id.max(record.batch_id);

        match record.record_type {
            RecordType::BatchFinished => {
                if let Some(records) = staged.remove(&record.batch_id) {
                    for (staged_record, staged_pos) in records {
                        match staged_record.record_type {
                            RecordType::Normal => {
                                index.put(staged_record.key, staged_pos);
                            }
                            RecordType::Deleted => {
                                index.delete(&staged_record.key);
                            }
                            RecordType::BatchFinished => {
                                unreachable!("sentinels are never staged")
                            }
                        }
                        applied += 1;
                    }
                }
                batches += 1;
            }
            _ => staged
                .entry(record.batch_id)
                .or_default()
                .push((record, pos)),
        }
    }

    if !staged.is_empty() {
        warn!(
            target: "vellum::recovery",
            discarded_batches = staged.len(),
            discarded_records = staged.values().map(Vec::len).sum::<usize>(),
            "discarding records of batches that never committed"
        );
    }
    info!(
        target: "vellum::recovery",
        batches,
        records_applied = applied,
        keys = index.len(),
        "log replay finished"
    );

    Ok(max_batch_id)
}

impl Drop for DbInner {
    fn drop(&mut self) {
        // Close() is the clean path; this covers handles dropped without
        // it. Ticker threads hold only a Weak reference and exit on their
        // own once the signal fires or the upgrade fails.
        self.shutdown.signal();
        if let Some(watcher) = &self.watcher {
            watcher.close();
        }
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }
}
