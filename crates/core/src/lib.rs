//! Shared types for VellumDB.
//!
//! This crate holds the pieces every other layer depends on: the unified
//! error type, the on-disk log-record codec, and the varint helpers the
//! codec is built from. It has no I/O of its own.

pub mod error;
pub mod record;
pub mod varint;

pub use error::{Error, Result};
pub use record::{decode_record, LogRecord, RecordType};
