//! Error types for VellumDB.
//!
//! A single `Error` enum is shared by every crate in the workspace. We use
//! `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Two classes of failure are worth telling apart when reading the log:
//! `Corruption` means bytes on disk fail their checksum or cannot be decoded,
//! while a partial record at the tail of the last segment is *not* an error
//! at all — the WAL reader treats it as end-of-valid-data, the expected
//! residue of a crash mid-write.

use std::io;
use thiserror::Error;

/// Result type alias for VellumDB operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the VellumDB engine.
#[derive(Debug, Error)]
pub enum Error {
    /// An empty key was passed to an operation.
    #[error("key is empty")]
    KeyIsEmpty,

    /// No live record exists for the key.
    #[error("key not found in database")]
    KeyNotFound,

    /// The database has been closed.
    #[error("the database is closed")]
    DbClosed,

    /// A mutating operation was attempted on a read-only batch.
    #[error("the batch is read-only")]
    ReadOnlyBatch,

    /// The batch has already been committed.
    #[error("the batch has been committed")]
    BatchCommitted,

    /// The batch has already been rolled back.
    #[error("the batch has been rolled back")]
    BatchRolledBack,

    /// I/O error propagated from the WAL or filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Data on disk failed a checksum or could not be decoded.
    #[error("corrupt record: {context}")]
    Corruption {
        /// Where and how the corruption was detected.
        context: String,
    },

    /// An option bundle failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Create a `Corruption` error with context.
    pub fn corruption(context: impl Into<String>) -> Self {
        Error::Corruption {
            context: context.into(),
        }
    }

    /// Whether this error means the requested key has no live record.
    ///
    /// Callers that treat "absent" as a normal outcome match on this
    /// instead of the variant.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KeyNotFound)
    }

    /// Whether this error indicates on-disk damage.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_key_not_found() {
        let err = Error::KeyNotFound;
        assert!(err.to_string().contains("not found"));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_display_corruption() {
        let err = Error::corruption("segment 3 offset 128: crc mismatch");
        let msg = err.to_string();
        assert!(msg.contains("corrupt record"));
        assert!(msg.contains("offset 128"));
        assert!(err.is_corruption());
    }

    #[test]
    fn test_from_io() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_lifecycle_errors_are_distinct() {
        assert!(!Error::BatchCommitted.is_not_found());
        assert!(!Error::BatchRolledBack.is_corruption());
        assert!(!Error::ReadOnlyBatch.is_not_found());
    }
}
