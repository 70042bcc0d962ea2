//! The VellumDB engine.
//!
//! Orchestrates the pieces of a Bitcask-style store: a segmented
//! write-ahead log ([`vellum_wal`]), an in-memory sharded index from key
//! bytes to log positions, atomic write batches sealed by a batch-finished
//! sentinel, per-key TTL, a background garbage collector, and an optional
//! watch-event stream.
//!
//! Entry point is [`Db::open`]; everything else hangs off the handle.

mod batch;
mod db;
mod gc;
mod index;
mod options;
mod shutdown;
mod watcher;

pub use batch::Batch;
pub use db::{Db, Stat};
pub use gc::GcStats;
pub use index::{Index, ShardedIndex};
pub use options::{BatchOptions, Options};
pub use watcher::{Event, WatchAction};

pub use vellum_core::{Error, Result};
pub use vellum_wal::ChunkPosition;

/// Nanoseconds since the Unix epoch.
///
/// Expiry timestamps are stored in this form; a clock before the epoch
/// degrades to "no TTL support" rather than failing writes.
pub(crate) fn now_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
