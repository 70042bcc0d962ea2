//! Atomic write batches.
//!
//! A batch buffers a write set and commits it as one unit: every buffered
//! record is appended to the log under a shared batch id, then a
//! `BatchFinished` sentinel seals the batch. The sentinel is the commit
//! point — replay ignores records whose sentinel never made it to disk, so
//! a crash mid-commit leaves the pre-batch state intact.
//!
//! A batch holds the engine lock for its whole lifetime (shared if
//! read-only, exclusive otherwise) and releases it on commit, rollback, or
//! drop. Batches guarantee atomicity and durability (with `sync`), not
//! isolation from other committed batches.

use crate::db::DbInner;
use crate::now_nanos;
use crate::options::BatchOptions;
use crate::watcher::{Event, WatchAction};
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Duration;
use vellum_core::record::{decode_record, LogRecord, RecordType};
use vellum_core::{Error, Result};
use vellum_wal::{ChunkPosition, Wal};

/// The engine lock held by a batch.
enum WalGuard<'a> {
    Shared(RwLockReadGuard<'a, Wal>),
    Exclusive(RwLockWriteGuard<'a, Wal>),
}

impl WalGuard<'_> {
    fn wal(&self) -> &Wal {
        match self {
            WalGuard::Shared(guard) => guard,
            WalGuard::Exclusive(guard) => guard,
        }
    }
}

/// A buffered set of writes committed atomically.
///
/// Created by [`Db::new_batch`](crate::Db::new_batch). Dropping an
/// uncommitted batch releases the lock and discards the buffer, like
/// [`rollback`](Batch::rollback) without the lifecycle bookkeeping.
pub struct Batch<'a> {
    db: &'a DbInner,
    guard: Option<WalGuard<'a>>,
    pending: HashMap<Vec<u8>, LogRecord>,
    options: BatchOptions,
    committed: bool,
    rolled_back: bool,
}

impl<'a> Batch<'a> {
    pub(crate) fn new(db: &'a DbInner, options: BatchOptions) -> Self {
        let guard = if options.read_only {
            WalGuard::Shared(db.wal.read())
        } else {
            WalGuard::Exclusive(db.wal.write())
        };
        Batch {
            db,
            guard: Some(guard),
            pending: HashMap::new(),
            options,
            committed: false,
            rolled_back: false,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.db.closed.load(Ordering::Acquire) {
            return Err(Error::DbClosed);
        }
        if self.committed {
            return Err(Error::BatchCommitted);
        }
        if self.rolled_back {
            return Err(Error::BatchRolledBack);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if self.options.read_only {
            return Err(Error::ReadOnlyBatch);
        }
        Ok(())
    }

    fn wal(&self) -> &Wal {
        self.guard
            .as_ref()
            .expect("open batch holds the engine lock")
            .wal()
    }

    /// Buffer a write of `key` → `value`.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::KeyIsEmpty);
        }
        self.check_writable()?;

        self.pending
            .insert(key.to_vec(), LogRecord::normal(key.to_vec(), value.to_vec()));
        Ok(())
    }

    /// Buffer a write of `key` → `value` expiring `ttl` from now.
    pub fn put_with_ttl(&mut self, key: &[u8], value: &[u8], ttl: Duration) -> Result<()> {
        if key.is_empty() {
            return Err(Error::KeyIsEmpty);
        }
        self.check_writable()?;

        let mut record = LogRecord::normal(key.to_vec(), value.to_vec());
        record.expire = now_nanos() + ttl.as_nanos() as i64;
        self.pending.insert(key.to_vec(), record);
        Ok(())
    }

    /// Read `key`, consulting the batch's own buffer before the database.
    ///
    /// # Panics
    ///
    /// Panics if the index points at a tombstone — the commit and replay
    /// paths never publish one, so that state means the engine itself is
    /// broken.
    pub fn get(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        if key.is_empty() {
            return Err(Error::KeyIsEmpty);
        }
        self.check_open()?;

        let now = now_nanos();
        if let Some(record) = self.pending.get(key) {
            if record.record_type == RecordType::Deleted || record.is_expired(now) {
                return Err(Error::KeyNotFound);
            }
            return Ok(record.value.clone());
        }

        let pos = self.db.index.get(key).ok_or(Error::KeyNotFound)?;
        let chunk = self.wal().read(&pos)?;
        let record = decode_record(&chunk)?;

        if record.record_type == RecordType::Deleted {
            panic!("index points at a tombstone; the index must never hold deleted keys");
        }
        if record.is_expired(now) {
            self.db.index.delete(&record.key);
            return Err(Error::KeyNotFound);
        }
        Ok(record.value)
    }

    /// Buffer a delete of `key`.
    ///
    /// A key that only exists in this batch's buffer is simply un-buffered:
    /// nothing about it reaches the log at commit.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::KeyIsEmpty);
        }
        self.check_writable()?;

        if self.db.index.get(key).is_some() {
            self.pending.insert(key.to_vec(), LogRecord::deleted(key.to_vec()));
        } else {
            self.pending.remove(key);
        }
        Ok(())
    }

    /// Whether `key` has a live record, by the same rules as [`get`](Batch::get).
    pub fn exist(&mut self, key: &[u8]) -> Result<bool> {
        if key.is_empty() {
            return Err(Error::KeyIsEmpty);
        }
        self.check_open()?;

        let now = now_nanos();
        if let Some(record) = self.pending.get(key) {
            return Ok(record.record_type != RecordType::Deleted && !record.is_expired(now));
        }

        let Some(pos) = self.db.index.get(key) else {
            return Ok(false);
        };
        let chunk = self.wal().read(&pos)?;
        let record = decode_record(&chunk)?;

        if record.record_type == RecordType::Deleted || record.is_expired(now) {
            self.db.index.delete(&record.key);
            return Ok(false);
        }
        Ok(true)
    }

    /// Set the TTL of an existing key to `ttl` from now.
    ///
    /// Fails with `KeyNotFound` if nothing live exists for `key`.
    pub fn expire(&mut self, key: &[u8], ttl: Duration) -> Result<()> {
        if key.is_empty() {
            return Err(Error::KeyIsEmpty);
        }
        self.check_writable()?;

        let now = now_nanos();
        if let Some(record) = self.pending.get_mut(key) {
            record.expire = now + ttl.as_nanos() as i64;
            return Ok(());
        }

        let pos = self.db.index.get(key).ok_or(Error::KeyNotFound)?;
        let chunk = self.wal().read(&pos)?;
        let mut record = decode_record(&chunk)?;

        if record.record_type == RecordType::Deleted || record.is_expired(now) {
            self.db.index.delete(key);
            return Err(Error::KeyNotFound);
        }
        record.expire = now + ttl.as_nanos() as i64;
        self.pending.insert(key.to_vec(), record);
        Ok(())
    }

    /// Remaining time to live of `key`.
    ///
    /// `Ok(None)` means the key never expires; `Err(KeyNotFound)` means no
    /// live record exists.
    pub fn ttl(&mut self, key: &[u8]) -> Result<Option<Duration>> {
        if key.is_empty() {
            return Err(Error::KeyIsEmpty);
        }
        self.check_open()?;

        let now = now_nanos();
        if let Some(record) = self.pending.get(key) {
            if record.expire == 0 {
                return Ok(None);
            }
            if record.record_type == RecordType::Deleted || record.is_expired(now) {
                return Err(Error::KeyNotFound);
            }
            return Ok(Some(Duration::from_nanos((record.expire - now) as u64)));
        }

        let pos = self.db.index.get(key).ok_or(Error::KeyNotFound)?;
        let chunk = self.wal().read(&pos)?;
        let record = decode_record(&chunk)?;

        if record.record_type == RecordType::Deleted {
            return Err(Error::KeyNotFound);
        }
        if record.is_expired(now) {
            self.db.index.delete(key);
            return Err(Error::KeyNotFound);
        }

        if record.expire > 0 {
            return Ok(Some(Duration::from_nanos((record.expire - now) as u64)));
        }
        Ok(None)
    }

    /// Commit the batch and release the lock.
    ///
    /// Appends every buffered record under a fresh batch id, seals them with
    /// the `BatchFinished` sentinel, optionally fsyncs, then publishes the
    /// new positions to the index and emits watch events. Committing a
    /// read-only or empty batch just releases the lock.
    pub fn commit(&mut self) -> Result<()> {
        let result = self.commit_inner();
        self.guard = None;
        result
    }

    fn commit_inner(&mut self) -> Result<()> {
        if self.db.closed.load(Ordering::Acquire) {
            return Err(Error::DbClosed);
        }
        if self.options.read_only || self.pending.is_empty() {
            return Ok(());
        }
        if self.committed {
            return Err(Error::BatchCommitted);
        }
        if self.rolled_back {
            return Err(Error::BatchRolledBack);
        }

        let batch_id = self.db.batch_seq.fetch_add(1, Ordering::SeqCst);
        let now = now_nanos();

        let wal = match self.guard.as_mut() {
            Some(WalGuard::Exclusive(guard)) => &mut **guard,
            _ => unreachable!("a writable batch holds the lock exclusively"),
        };

        let mut positions: HashMap<Vec<u8>, ChunkPosition> =
            HashMap::with_capacity(self.pending.len());
        for (key, record) in self.pending.iter_mut() {
            record.batch_id = batch_id;
            let pos = wal.write(&record.encode())?;
            positions.insert(key.clone(), pos);
        }

        // The sentinel is the commit point: without it, replay discards
        // everything appended above.
        wal.write(&LogRecord::batch_finished(batch_id).encode())?;

        if self.options.sync && !self.db.options.sync {
            wal.sync()?;
        }

        for (key, record) in self.pending.iter() {
            if record.record_type == RecordType::Deleted || record.is_expired(now) {
                self.db.index.delete(key);
            } else {
                self.db.index.put(key.clone(), positions[key]);
            }

            if let Some(watcher) = &self.db.watcher {
                let action = if record.record_type == RecordType::Deleted {
                    WatchAction::Delete
                } else {
                    WatchAction::Put
                };
                watcher.put_event(Event {
                    action,
                    key: record.key.clone(),
                    value: record.value.clone(),
                    batch_id,
                });
            }
        }

        self.committed = true;
        Ok(())
    }

    /// Discard the buffer and release the lock.
    pub fn rollback(&mut self) -> Result<()> {
        let result = self.rollback_inner();
        self.guard = None;
        result
    }

    fn rollback_inner(&mut self) -> Result<()> {
        if self.db.closed.load(Ordering::Acquire) {
            return Err(Error::DbClosed);
        }
        if self.committed {
            return Err(Error::BatchCommitted);
        }
        if self.rolled_back {
            return Err(Error::BatchRolledBack);
        }

        if !self.options.read_only {
            self.pending.clear();
        }
        self.rolled_back = true;
        Ok(())
    }
}
