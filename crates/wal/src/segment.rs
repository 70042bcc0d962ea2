//! Segment files and chunk framing.
//!
//! Segments are named `NNNNNNNNN.seg` (zero-padded segment id) and begin
//! with a fixed 16-byte header. Everything after the header is a sequence
//! of framed chunks.
//!
//! # Chunk Frame
//!
//! ```text
//! ┌──────────────────┬───────────────────┬────────────────┐
//! │ payload_len (u32)│ payload (variable)│ crc32 (u32)    │
//! └──────────────────┴───────────────────┴────────────────┘
//! ```
//!
//! The CRC covers the payload only. A frame that runs past the end of the
//! file is reported as `Incomplete`, distinct from a CRC failure: the former
//! is the expected residue of a crash mid-append, the latter is damage.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes identifying a VellumDB segment file.
pub const SEGMENT_MAGIC: [u8; 4] = *b"VWAL";

/// Current segment format version.
pub const SEGMENT_FORMAT_VERSION: u32 = 1;

/// Size of the segment header in bytes.
pub const SEGMENT_HEADER_SIZE: usize = 16;

/// Bytes of framing around each chunk payload: length (4) + crc32 (4).
pub const CHUNK_FRAME_OVERHEAD: u64 = 8;

/// Locator for one chunk in the log.
///
/// Identifies the byte range of a chunk's frame inside a segment. Positions
/// are compared for equality only; they carry no ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPosition {
    /// Segment the chunk lives in.
    pub segment_id: u64,
    /// Byte offset of the frame start within the segment file.
    pub offset: u64,
    /// Payload length in bytes (excluding framing).
    pub length: u32,
}

impl ChunkPosition {
    /// Total bytes the chunk occupies on disk, framing included.
    pub fn frame_len(&self) -> u64 {
        u64::from(self.length) + CHUNK_FRAME_OVERHEAD
    }
}

/// Path of segment `segment_id` under `dir`.
pub(crate) fn segment_path(dir: &Path, segment_id: u64) -> PathBuf {
    dir.join(format!("{:09}.seg", segment_id))
}

/// Parse a segment id out of a file name, `None` for foreign files.
pub(crate) fn parse_segment_id(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(".seg")?;
    if stem.len() != 9 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Fixed header at the start of every segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SegmentHeader {
    pub magic: [u8; 4],
    pub format_version: u32,
    pub segment_id: u64,
}

impl SegmentHeader {
    pub fn new(segment_id: u64) -> Self {
        SegmentHeader {
            magic: SEGMENT_MAGIC,
            format_version: SEGMENT_FORMAT_VERSION,
            segment_id,
        }
    }

    pub fn to_bytes(self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut bytes = [0u8; SEGMENT_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4..8].copy_from_slice(&self.format_version.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.segment_id.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; SEGMENT_HEADER_SIZE]) -> Self {
        SegmentHeader {
            magic: bytes[0..4].try_into().expect("slice length is fixed"),
            format_version: u32::from_le_bytes(bytes[4..8].try_into().expect("slice length is fixed")),
            segment_id: u64::from_le_bytes(bytes[8..16].try_into().expect("slice length is fixed")),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == SEGMENT_MAGIC && self.format_version == SEGMENT_FORMAT_VERSION
    }
}

/// Validate the header of an opened segment file.
fn read_header(file: &mut File, expected_id: u64) -> std::io::Result<()> {
    let mut header_bytes = [0u8; SEGMENT_HEADER_SIZE];
    file.read_exact(&mut header_bytes)?;
    let header = SegmentHeader::from_bytes(&header_bytes);
    if !header.is_valid() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "invalid segment header",
        ));
    }
    if header.segment_id != expected_id {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "segment id mismatch: file named {}, header says {}",
                expected_id, header.segment_id
            ),
        ));
    }
    Ok(())
}

/// The writable end of the log: a single open segment file.
///
/// Only the active segment is ever written; rolled segments are immutable.
pub(crate) struct Segment {
    file: File,
    segment_id: u64,
    write_position: u64,
}

impl Segment {
    /// Create a fresh segment and write its header.
    pub fn create(dir: &Path, segment_id: u64) -> std::io::Result<Self> {
        let path = segment_path(dir, segment_id);
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        file.write_all(&SegmentHeader::new(segment_id).to_bytes())?;

        Ok(Segment {
            file,
            segment_id,
            write_position: SEGMENT_HEADER_SIZE as u64,
        })
    }

    /// Open an existing segment for appending, positioned at its end.
    pub fn open_append(dir: &Path, segment_id: u64) -> std::io::Result<Self> {
        let path = segment_path(dir, segment_id);
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        read_header(&mut file, segment_id)?;
        let write_position = file.seek(SeekFrom::End(0))?;

        Ok(Segment {
            file,
            segment_id,
            write_position,
        })
    }

    /// Append one framed chunk, returning its position.
    pub fn append(&mut self, payload: &[u8]) -> std::io::Result<ChunkPosition> {
        let offset = self.write_position;

        let mut frame = Vec::with_capacity(payload.len() + CHUNK_FRAME_OVERHEAD as usize);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());

        self.file.write_all(&frame)?;
        self.write_position += frame.len() as u64;

        Ok(ChunkPosition {
            segment_id: self.segment_id,
            offset,
            length: payload.len() as u32,
        })
    }

    /// Current size of the segment in bytes.
    pub fn size(&self) -> u64 {
        self.write_position
    }

    pub fn id(&self) -> u64 {
        self.segment_id
    }

    /// Flush and fsync the segment file.
    pub fn sync(&mut self) -> std::io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()
    }
}

/// Outcome of decoding one frame from an in-memory segment buffer.
pub(crate) enum FrameOutcome {
    /// A complete, checksum-valid chunk: payload plus bytes consumed.
    Chunk { payload: Vec<u8>, consumed: u64 },
    /// The buffer ends before the frame does (torn write at the tail).
    Incomplete,
    /// The frame is complete but its checksum does not match.
    BadCrc { expected: u32, actual: u32 },
}

/// Decode the frame starting at `buf[0]`.
pub(crate) fn decode_frame(buf: &[u8]) -> FrameOutcome {
    if buf.len() < 4 {
        return FrameOutcome::Incomplete;
    }
    let payload_len = u32::from_le_bytes(buf[0..4].try_into().expect("slice length is fixed")) as usize;
    let frame_len = 4 + payload_len + 4;
    if buf.len() < frame_len {
        return FrameOutcome::Incomplete;
    }

    let payload = &buf[4..4 + payload_len];
    let expected = u32::from_le_bytes(
        buf[4 + payload_len..frame_len]
            .try_into()
            .expect("slice length is fixed"),
    );
    let actual = crc32fast::hash(payload);
    if actual != expected {
        return FrameOutcome::BadCrc { expected, actual };
    }

    FrameOutcome::Chunk {
        payload: payload.to_vec(),
        consumed: frame_len as u64,
    }
}
