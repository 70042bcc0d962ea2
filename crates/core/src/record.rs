//! Log-record types and the on-disk codec.
//!
//! Every chunk stored in the WAL is one encoded `LogRecord`. The chunk
//! boundary (length + checksum) is supplied by the WAL frame, so the codec
//! only has to be self-delimiting *within* a chunk.
//!
//! # Record Layout
//!
//! ```text
//! ┌─────────┬──────────────┬──────────────┬──────────────┬──────────────┬─────┬───────┐
//! │ type (1)│ batch_id (v) │ key_size (v) │ value_size(v)│ expire (zz-v)│ key │ value │
//! └─────────┴──────────────┴──────────────┴──────────────┴──────────────┴─────┴───────┘
//! ```
//!
//! `(v)` fields are unsigned LEB128 varints; `expire` is zig-zag encoded
//! because it is a signed nanosecond timestamp (`0` = no expiry).

use crate::error::{Error, Result};
use crate::varint;

/// The kind of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// A live key-value write.
    Normal = 0,
    /// A tombstone marking the key deleted.
    Deleted = 1,
    /// Sentinel sealing all preceding records of the same batch id.
    ///
    /// Its presence in the log is the commit point of a batch: replay
    /// applies a batch to the index only after seeing this record.
    BatchFinished = 2,
}

impl RecordType {
    /// Convert from the on-disk byte, `None` for unknown values.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(RecordType::Normal),
            1 => Some(RecordType::Deleted),
            2 => Some(RecordType::BatchFinished),
            _ => None,
        }
    }
}

/// One record of the write-ahead log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Key bytes. Non-empty for `Normal`/`Deleted`; carries the batch id in
    /// big-endian for `BatchFinished`.
    pub key: Vec<u8>,
    /// Value bytes. May be empty; always empty for tombstones and sentinels.
    pub value: Vec<u8>,
    /// What this record represents.
    pub record_type: RecordType,
    /// Expiry as nanoseconds since the Unix epoch; `0` means no expiry.
    pub expire: i64,
    /// The batch this record was committed under.
    pub batch_id: u64,
}

impl LogRecord {
    /// A `Normal` record with no expiry.
    pub fn normal(key: Vec<u8>, value: Vec<u8>) -> Self {
        LogRecord {
            key,
            value,
            record_type: RecordType::Normal,
            expire: 0,
            batch_id: 0,
        }
    }

    /// A tombstone for `key`.
    pub fn deleted(key: Vec<u8>) -> Self {
        LogRecord {
            key,
            value: Vec::new(),
            record_type: RecordType::Deleted,
            expire: 0,
            batch_id: 0,
        }
    }

    /// The sentinel sealing `batch_id`.
    pub fn batch_finished(batch_id: u64) -> Self {
        LogRecord {
            key: batch_id.to_be_bytes().to_vec(),
            value: Vec::new(),
            record_type: RecordType::BatchFinished,
            expire: 0,
            batch_id,
        }
    }

    /// Whether the record has expired as of `now` (nanoseconds since epoch).
    pub fn is_expired(&self, now: i64) -> bool {
        self.expire != 0 && self.expire <= now
    }

    /// Encode into a chunk payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 4 * varint::MAX_VARINT_LEN + self.key.len() + self.value.len());
        buf.push(self.record_type as u8);
        varint::encode_u64(&mut buf, self.batch_id);
        varint::encode_u64(&mut buf, self.key.len() as u64);
        varint::encode_u64(&mut buf, self.value.len() as u64);
        varint::encode_i64(&mut buf, self.expire);
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);
        buf
    }
}

/// Decode a chunk payload produced by [`LogRecord::encode`].
///
/// # Errors
///
/// Returns `Corruption` if the header is malformed, the sizes exceed the
/// chunk, or the chunk carries trailing bytes.
pub fn decode_record(chunk: &[u8]) -> Result<LogRecord> {
    let (&type_byte, rest) = chunk
        .split_first()
        .ok_or_else(|| Error::corruption("empty chunk"))?;
    let record_type = RecordType::from_u8(type_byte)
        .ok_or_else(|| Error::corruption(format!("unknown record type {}", type_byte)))?;

    let mut offset = 0usize;
    let (batch_id, n) = varint::decode_u64(&rest[offset..])?;
    offset += n;
    let (key_size, n) = varint::decode_u64(&rest[offset..])?;
    offset += n;
    let (value_size, n) = varint::decode_u64(&rest[offset..])?;
    offset += n;
    let (expire, n) = varint::decode_i64(&rest[offset..])?;
    offset += n;

    let body = &rest[offset..];
    let key_size = usize::try_from(key_size)
        .map_err(|_| Error::corruption("key size exceeds address space"))?;
    let value_size = usize::try_from(value_size)
        .map_err(|_| Error::corruption("value size exceeds address space"))?;
    if key_size
        .checked_add(value_size)
        .map_or(true, |total| total != body.len())
    {
        return Err(Error::corruption(format!(
            "record body length mismatch: header says {} + {}, chunk has {}",
            key_size,
            value_size,
            body.len()
        )));
    }

    Ok(LogRecord {
        key: body[..key_size].to_vec(),
        value: body[key_size..].to_vec(),
        record_type,
        expire,
        batch_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_normal() {
        let record = LogRecord {
            key: b"user:42".to_vec(),
            value: b"alice".to_vec(),
            record_type: RecordType::Normal,
            expire: 1_700_000_000_000_000_000,
            batch_id: 9,
        };
        let decoded = decode_record(&record.encode()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_encode_decode_tombstone() {
        let mut record = LogRecord::deleted(b"gone".to_vec());
        record.batch_id = 3;
        let decoded = decode_record(&record.encode()).unwrap();
        assert_eq!(decoded.record_type, RecordType::Deleted);
        assert_eq!(decoded.key, b"gone");
        assert!(decoded.value.is_empty());
        assert_eq!(decoded.batch_id, 3);
    }

    #[test]
    fn test_sentinel_carries_batch_id_in_key() {
        let record = LogRecord::batch_finished(0xDEAD_BEEF);
        let decoded = decode_record(&record.encode()).unwrap();
        assert_eq!(decoded.record_type, RecordType::BatchFinished);
        assert_eq!(decoded.batch_id, 0xDEAD_BEEF);
        assert_eq!(
            u64::from_be_bytes(decoded.key.as_slice().try_into().unwrap()),
            0xDEAD_BEEF
        );
    }

    #[test]
    fn test_empty_value_allowed() {
        let record = LogRecord::normal(b"k".to_vec(), Vec::new());
        let decoded = decode_record(&record.encode()).unwrap();
        assert!(decoded.value.is_empty());
        assert_eq!(decoded.key, b"k");
    }

    #[test]
    fn test_expiry_rule() {
        let mut record = LogRecord::normal(b"k".to_vec(), b"v".to_vec());
        assert!(!record.is_expired(i64::MAX), "expire=0 never expires");

        record.expire = 100;
        assert!(record.is_expired(100), "boundary counts as expired");
        assert!(record.is_expired(101));
        assert!(!record.is_expired(99));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut chunk = LogRecord::normal(b"k".to_vec(), b"v".to_vec()).encode();
        chunk[0] = 0x7f;
        assert!(decode_record(&chunk).unwrap_err().is_corruption());
    }

    #[test]
    fn test_truncated_chunk_rejected() {
        let chunk = LogRecord::normal(b"key".to_vec(), b"value".to_vec()).encode();
        for cut in [0, 1, chunk.len() / 2, chunk.len() - 1] {
            assert!(
                decode_record(&chunk[..cut]).is_err(),
                "prefix of {} bytes must not decode",
                cut
            );
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut chunk = LogRecord::normal(b"k".to_vec(), b"v".to_vec()).encode();
        chunk.push(0x00);
        assert!(decode_record(&chunk).unwrap_err().is_corruption());
    }

    #[test]
    fn test_large_key_value_roundtrip() {
        let record = LogRecord::normal(vec![0xab; 4096], vec![0xcd; 1 << 16]);
        let decoded = decode_record(&record.encode()).unwrap();
        assert_eq!(decoded.key.len(), 4096);
        assert_eq!(decoded.value.len(), 1 << 16);
    }
}
