//! Background garbage collection.
//!
//! Reclaims log space held by superseded, deleted, and expired records by
//! rewriting the survivors into a fresh log generation and swapping it in.
//!
//! # Cycle
//!
//! Under the exclusive engine lock:
//!
//! 1. Build a fresh log in the `gc` staging directory.
//! 2. Scan every chunk of the live log. A record survives iff it is
//!    `Normal`, non-expired, and the index maps its key to exactly this
//!    position (that position check is the tie-break when a key has
//!    several `Normal` records on disk).
//! 3. Re-append survivors under one fresh batch id and seal them with a
//!    single `BatchFinished` sentinel, so a rewritten log replays through
//!    the ordinary staging path.
//! 4. Fsync the new log, then create the fsynced `SEALED` marker — the
//!    commit point of the swap.
//! 5. Delete the old segments, move the new ones in, reopen, repoint the
//!    index at the recorded new positions.
//!
//! A crash before the marker leaves the old log authoritative (the staging
//! directory is discarded at the next open); a crash after it is finished
//! by [`recover_interrupted_swap`] at the next open. Cycle errors are
//! logged and the ticker retries next tick — they never reach user
//! operations.

use crate::db::DbInner;
use crate::now_nanos;
use crate::shutdown::Shutdown;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use vellum_core::record::{decode_record, LogRecord, RecordType};
use vellum_core::Result;
use vellum_wal::{ChunkPosition, Wal};

/// Staging directory for the rewritten log, inside the database directory.
const GC_DIR: &str = "gc";

/// Marker file whose presence commits the swap.
const SEALED_MARKER: &str = "SEALED";

/// What one compaction cycle accomplished.
#[derive(Debug, Clone, Copy)]
pub struct GcStats {
    /// Bytes of log space freed (zero if the log grew, which only happens
    /// on a log that was already fully live).
    pub reclaimed_bytes: u64,
    /// Live records carried into the new log generation.
    pub records_rewritten: usize,
    /// Dead records (superseded, deleted, expired, sentinels) left behind.
    pub records_discarded: usize,
    /// Segment count before the cycle.
    pub segments_before: usize,
    /// Segment count after the cycle.
    pub segments_after: usize,
    /// Wall-clock duration of the cycle.
    pub duration: Duration,
}

/// Finish or discard a swap interrupted by a crash. Runs at open, before
/// the log itself is opened.
pub(crate) fn recover_interrupted_swap(dir: &Path) -> Result<()> {
    let gc_dir = dir.join(GC_DIR);
    if !gc_dir.exists() {
        return Ok(());
    }

    let marker = gc_dir.join(SEALED_MARKER);
    if marker.exists() {
        info!(target: "vellum::gc", "finishing compaction swap interrupted by restart");
        Wal::remove_segments(dir)?;
        Wal::move_segments(&gc_dir, dir)?;
        std::fs::remove_file(&marker)?;
        std::fs::remove_dir_all(&gc_dir)?;
    } else {
        warn!(target: "vellum::gc", "discarding unsealed compaction staging directory");
        std::fs::remove_dir_all(&gc_dir)?;
    }
    Ok(())
}

/// Run a cycle if the estimated dead ratio clears the configured threshold.
pub(crate) fn maybe_run_cycle(inner: &DbInner) -> Result<Option<GcStats>> {
    let mut wal = inner.wal.write();
    if inner.closed.load(Ordering::Acquire) {
        return Ok(None);
    }

    let total = wal.total_size()?;
    if total == 0 {
        return Ok(None);
    }
    let mut live = 0u64;
    inner.index.for_each(&mut |_, pos| {
        live += pos.frame_len();
        true
    });
    let dead_ratio = 1.0 - (live as f64 / total as f64);
    if dead_ratio < inner.options.gc_ratio {
        return Ok(None);
    }

    run_cycle_locked(inner, &mut wal).map(Some)
}

/// Run a cycle unconditionally (the `Db::compact` path).
pub(crate) fn run_cycle(inner: &DbInner) -> Result<GcStats> {
    let mut wal = inner.wal.write();
    run_cycle_locked(inner, &mut wal)
}

fn run_cycle_locked(inner: &DbInner, wal: &mut Wal) -> Result<GcStats> {
    let start = Instant::now();
    let gc_dir = wal.dir().join(GC_DIR);
    if gc_dir.exists() {
        std::fs::remove_dir_all(&gc_dir)?;
    }

    // Phase 1 ends with the SEALED marker. Failures before it discard the
    // staging directory; the old log stays authoritative.
    let rewrite = match rewrite_into(inner, wal, &gc_dir) {
        Ok(rewrite) => rewrite,
        Err(e) => {
            let _ = std::fs::remove_dir_all(&gc_dir);
            return Err(e);
        }
    };

    // Phase 2: past the marker the staging directory is the truth. It must
    // survive a failure here so open-time recovery can finish the swap.
    swap_in(inner, wal, &gc_dir, rewrite, start)
}

struct Rewrite {
    moves: Vec<(Vec<u8>, ChunkPosition)>,
    discarded: usize,
    size_before: u64,
    segments_before: usize,
}

fn rewrite_into(inner: &DbInner, wal: &Wal, gc_dir: &Path) -> Result<Rewrite> {
    let size_before = wal.total_size()?;
    let segments_before = wal.segment_ids()?.len();

    let mut new_wal = Wal::open(gc_dir, inner.options.wal_options())?;
    let batch_id = inner.batch_seq.fetch_add(1, Ordering::SeqCst);
    let now = now_nanos();

    let mut moves: Vec<(Vec<u8>, ChunkPosition)> = Vec::new();
    let mut discarded = 0usize;

    for item in wal.iter()? {
        let (chunk, pos) = item?;
        let mut record = decode_record(&chunk)?;

        let indexed_here = record.record_type == RecordType::Normal
            && inner.index.get(&record.key) == Some(pos);
        if !indexed_here {
            discarded += 1;
            continue;
        }

        if record.is_expired(now) {
            // The chunk is not carried forward, so the entry must go now —
            // it would otherwise dangle into the deleted generation
            inner.index.delete(&record.key);
            discarded += 1;
            continue;
        }

        record.batch_id = batch_id;
        let new_pos = new_wal.write(&record.encode())?;
        moves.push((record.key, new_pos));
    }

    new_wal.write(&LogRecord::batch_finished(batch_id).encode())?;
    new_wal.sync()?;

    // Commit point of the swap
    let marker = gc_dir.join(SEALED_MARKER);
    std::fs::File::create(&marker)?.sync_all()?;

    Ok(Rewrite {
        moves,
        discarded,
        size_before,
        segments_before,
    })
}

fn swap_in(
    inner: &DbInner,
    wal: &mut Wal,
    gc_dir: &Path,
    rewrite: Rewrite,
    start: Instant,
) -> Result<GcStats> {
    let dir = wal.dir().to_path_buf();

    Wal::remove_segments(&dir)?;
    Wal::move_segments(gc_dir, &dir)?;
    *wal = Wal::open(&dir, inner.options.wal_options())?;
    std::fs::remove_file(gc_dir.join(SEALED_MARKER))?;
    std::fs::remove_dir_all(gc_dir)?;

    // No reader can observe the window between the swap and this repoint:
    // the exclusive lock is held throughout
    let records_rewritten = rewrite.moves.len();
    for (key, new_pos) in rewrite.moves {
        inner.index.put(key, new_pos);
    }

    let size_after = wal.total_size()?;
    Ok(GcStats {
        reclaimed_bytes: rewrite.size_before.saturating_sub(size_after),
        records_rewritten,
        records_discarded: rewrite.discarded,
        segments_before: rewrite.segments_before,
        segments_after: wal.segment_ids()?.len(),
        duration: start.elapsed(),
    })
}

/// Spawn the ticker thread driving periodic cycles.
///
/// The thread holds only a weak reference to the engine: it exits when the
/// shutdown signal fires or the engine is gone.
pub(crate) fn spawn_ticker(
    inner: Weak<DbInner>,
    shutdown: Arc<Shutdown>,
    interval: Duration,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("vellum-gc".to_string())
        .spawn(move || loop {
            if shutdown.wait_for(interval) {
                break;
            }
            let Some(inner) = inner.upgrade() else { break };

            match maybe_run_cycle(&inner) {
                Ok(Some(stats)) => info!(
                    target: "vellum::gc",
                    reclaimed_bytes = stats.reclaimed_bytes,
                    records_rewritten = stats.records_rewritten,
                    records_discarded = stats.records_discarded,
                    duration_ms = stats.duration.as_millis() as u64,
                    "compaction cycle finished"
                ),
                Ok(None) => {}
                Err(e) => warn!(
                    target: "vellum::gc",
                    error = %e,
                    "compaction cycle failed, retrying next tick"
                ),
            }
        })
        .expect("failed to spawn gc ticker thread")
}
