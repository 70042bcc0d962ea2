//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;
use vellum_core::{Error, Result};
use vellum_wal::WalOptions;

/// Minimum accepted segment roll threshold (1 KiB).
const MIN_SEGMENT_SIZE: u64 = 1024;

/// Configuration for a [`Db`](crate::Db) instance.
///
/// # Example
///
/// ```ignore
/// let options = Options::new("/var/lib/vellum")
///     .with_sync(true)
///     .with_gc_interval(Duration::from_secs(600))
///     .with_gc_ratio(0.4);
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory holding the log segments.
    pub dir_path: PathBuf,

    /// Fsync after every write (default: false).
    ///
    /// When set, per-batch `sync` requests are no-ops — every append is
    /// already durable.
    pub sync: bool,

    /// Segment roll threshold in bytes (default: 1 GiB).
    pub segment_size: u64,

    /// Interval between garbage-collection ticks; `None` disables the
    /// background collector (default). `Db::compact` works either way.
    pub gc_interval: Option<Duration>,

    /// Dead-space ratio in `[0, 1]` a GC tick must estimate before it
    /// rewrites the log (default: 0.5).
    pub gc_ratio: f64,

    /// Capacity of the watch event queue; `0` disables the watcher
    /// (default). When the queue is full the oldest event is dropped.
    pub watch_queue_size: usize,
}

impl Options {
    /// Default options rooted at `dir_path`.
    pub fn new(dir_path: impl Into<PathBuf>) -> Self {
        Options {
            dir_path: dir_path.into(),
            sync: false,
            segment_size: 1024 * 1024 * 1024,
            gc_interval: None,
            gc_ratio: 0.5,
            watch_queue_size: 0,
        }
    }

    /// Set per-write fsync (builder pattern).
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// Set the segment roll threshold (builder pattern).
    pub fn with_segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    /// Enable the background collector with the given tick interval
    /// (builder pattern).
    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = Some(interval);
        self
    }

    /// Set the dead-space ratio threshold (builder pattern).
    pub fn with_gc_ratio(mut self, ratio: f64) -> Self {
        self.gc_ratio = ratio;
        self
    }

    /// Enable the watcher with the given queue capacity (builder pattern).
    pub fn with_watch_queue_size(mut self, size: usize) -> Self {
        self.watch_queue_size = size;
        self
    }

    /// Validate the bundle.
    pub fn validate(&self) -> Result<()> {
        if self.segment_size < MIN_SEGMENT_SIZE {
            return Err(Error::InvalidConfig(format!(
                "segment_size must be at least {} bytes, got {}",
                MIN_SEGMENT_SIZE, self.segment_size
            )));
        }
        if !self.gc_ratio.is_finite() || !(0.0..=1.0).contains(&self.gc_ratio) {
            return Err(Error::InvalidConfig(format!(
                "gc_ratio must be within [0, 1], got {}",
                self.gc_ratio
            )));
        }
        if let Some(interval) = self.gc_interval {
            if interval.is_zero() {
                return Err(Error::InvalidConfig(
                    "gc_interval must be non-zero; omit it to disable GC".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn wal_options(&self) -> WalOptions {
        WalOptions::default()
            .with_segment_size(self.segment_size)
            .with_sync_on_write(self.sync)
    }
}

/// Per-batch configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOptions {
    /// The batch may only read; mutating operations fail with
    /// `ReadOnlyBatch`, and commit is a no-op release.
    pub read_only: bool,

    /// Fsync at commit, overriding a `false` engine-level `sync` for this
    /// batch only.
    pub sync: bool,
}

impl BatchOptions {
    /// Set read-only mode (builder pattern).
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Request fsync at commit (builder pattern).
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }
}
