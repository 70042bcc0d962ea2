//! # VellumDB
//!
//! An embedded key-value store built on a segmented write-ahead log with an
//! in-memory index — Bitcask-style, extended with atomic write batches,
//! per-key TTL, and background space reclamation.
//!
//! # Quick Start
//!
//! ```no_run
//! use vellumdb::{Db, Options};
//!
//! fn main() -> vellumdb::Result<()> {
//!     let db = Db::open(Options::new("./my-data"))?;
//!
//!     db.put(b"user:name", b"alice")?;
//!     assert_eq!(db.get(b"user:name")?, b"alice");
//!
//!     // TTL: the key disappears once the duration elapses
//!     db.put_with_ttl(b"session:42", b"token", std::time::Duration::from_secs(60))?;
//!
//!     // Atomic batches: all or nothing, sealed at commit
//!     let mut batch = db.new_batch(Default::default())?;
//!     batch.put(b"a", b"1")?;
//!     batch.put(b"b", b"2")?;
//!     batch.commit()?;
//!
//!     db.close()?;
//!     Ok(())
//! }
//! ```
//!
//! # Durability
//!
//! Writes are durable once their batch's sentinel record is on disk:
//! replay applies a batch only if its sentinel is present, so a crash
//! mid-commit rolls the whole batch back. Set `Options::sync` (or
//! `BatchOptions::sync` per batch) to fsync eagerly.

pub use vellum_engine::{
    Batch, BatchOptions, ChunkPosition, Db, Error, Event, GcStats, Index, Options, Result,
    ShardedIndex, Stat, WatchAction,
};
