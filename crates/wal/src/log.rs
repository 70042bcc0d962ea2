//! The segmented log: rotation, positional reads, write-order scans.

use crate::segment::{
    decode_frame, parse_segment_id, segment_path, FrameOutcome, Segment, SegmentHeader,
    ChunkPosition, CHUNK_FRAME_OVERHEAD, SEGMENT_HEADER_SIZE,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::warn;
use vellum_core::{Error, Result};

/// Configuration for the segmented log.
#[derive(Debug, Clone)]
pub struct WalOptions {
    /// Segment roll threshold in bytes (default: 1 GiB).
    ///
    /// A chunk larger than the threshold still gets written — into a
    /// segment of its own.
    pub segment_size: u64,

    /// Fsync after every write (default: false).
    pub sync_on_write: bool,
}

impl Default for WalOptions {
    fn default() -> Self {
        WalOptions {
            segment_size: 1024 * 1024 * 1024,
            sync_on_write: false,
        }
    }
}

impl WalOptions {
    /// Set the segment roll threshold (builder pattern).
    pub fn with_segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    /// Set per-write fsync (builder pattern).
    pub fn with_sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }
}

/// A segmented append-only log of opaque chunks.
///
/// Appends go to the active segment; rolled segments are immutable. Reads
/// by position go through a cache of read-only handles, so any number of
/// shared-access readers can fetch chunks while a writer holds the log
/// exclusively between appends.
pub struct Wal {
    dir: PathBuf,
    options: WalOptions,
    active: Segment,
    readers: Mutex<HashMap<u64, File>>,
}

impl Wal {
    /// Open the log in `dir`, creating the directory and the first segment
    /// if nothing exists yet. An existing latest segment is reopened for
    /// appending.
    pub fn open(dir: impl AsRef<Path>, options: WalOptions) -> Result<Wal> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let ids = list_segment_ids(&dir)?;
        let active = match ids.last() {
            Some(&last) => {
                repair_tail(&dir, last)?;
                Segment::open_append(&dir, last)?
            }
            None => Segment::create(&dir, 1)?,
        };

        Ok(Wal {
            dir,
            options,
            active,
            readers: Mutex::new(HashMap::new()),
        })
    }

    /// Append one chunk, rolling the active segment first if the chunk
    /// would push it past the configured threshold.
    pub fn write(&mut self, payload: &[u8]) -> Result<ChunkPosition> {
        let frame_len = payload.len() as u64 + CHUNK_FRAME_OVERHEAD;
        if self.active.size() + frame_len > self.options.segment_size
            && self.active.size() > SEGMENT_HEADER_SIZE as u64
        {
            self.rotate()?;
        }

        let pos = self.active.append(payload)?;
        if self.options.sync_on_write {
            self.active.sync()?;
        }
        Ok(pos)
    }

    fn rotate(&mut self) -> Result<()> {
        self.active.sync()?;
        let next = self.active.id() + 1;
        self.active = Segment::create(&self.dir, next)?;
        Ok(())
    }

    /// Read back the chunk at `pos`.
    ///
    /// # Errors
    ///
    /// `Corruption` if the frame at the position does not match it (wrong
    /// length or checksum failure) — a position handed out by `write` can
    /// only fail this way if the file was damaged afterwards.
    pub fn read(&self, pos: &ChunkPosition) -> Result<Vec<u8>> {
        let mut frame = vec![0u8; pos.frame_len() as usize];
        {
            let mut readers = self.readers.lock();
            let file = match readers.entry(pos.segment_id) {
                std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::hash_map::Entry::Vacant(e) => {
                    e.insert(File::open(segment_path(&self.dir, pos.segment_id))?)
                }
            };
            file.seek(SeekFrom::Start(pos.offset))?;
            file.read_exact(&mut frame)?;
        }

        match decode_frame(&frame) {
            FrameOutcome::Chunk { payload, .. } if payload.len() == pos.length as usize => {
                Ok(payload)
            }
            FrameOutcome::Chunk { payload, .. } => Err(Error::corruption(format!(
                "segment {} offset {}: frame length {} does not match position length {}",
                pos.segment_id,
                pos.offset,
                payload.len(),
                pos.length
            ))),
            FrameOutcome::Incomplete => Err(Error::corruption(format!(
                "segment {} offset {}: truncated frame",
                pos.segment_id, pos.offset
            ))),
            FrameOutcome::BadCrc { expected, actual } => Err(Error::corruption(format!(
                "segment {} offset {}: crc mismatch (expected {:08x}, got {:08x})",
                pos.segment_id, pos.offset, expected, actual
            ))),
        }
    }

    /// Force durability of everything written so far.
    pub fn sync(&mut self) -> Result<()> {
        self.active.sync()?;
        Ok(())
    }

    /// Iterate every chunk in write order across all segments.
    ///
    /// The iterator works from a snapshot of the current segment list; it
    /// must not run concurrently with appends.
    pub fn iter(&self) -> Result<WalIterator> {
        WalIterator::new(self.dir.clone(), list_segment_ids(&self.dir)?)
    }

    /// Directory the log lives in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Sorted ids of all segments on disk.
    pub fn segment_ids(&self) -> Result<Vec<u64>> {
        list_segment_ids(&self.dir)
    }

    /// Total bytes across all segment files.
    pub fn total_size(&self) -> Result<u64> {
        let mut total = 0u64;
        for id in list_segment_ids(&self.dir)? {
            total += std::fs::metadata(segment_path(&self.dir, id))?.len();
        }
        Ok(total)
    }

    /// Delete every segment file under `dir`. Foreign files are left alone.
    pub fn remove_segments(dir: &Path) -> Result<()> {
        for id in list_segment_ids(dir)? {
            std::fs::remove_file(segment_path(dir, id))?;
        }
        Ok(())
    }

    /// Move every segment file from `src` into `dst`, keeping names.
    pub fn move_segments(src: &Path, dst: &Path) -> Result<()> {
        for id in list_segment_ids(src)? {
            std::fs::rename(segment_path(src, id), segment_path(dst, id))?;
        }
        Ok(())
    }
}

/// Cut the residue of a torn append off the end of the last segment.
///
/// Appending after garbage would strand the new records behind it — scans
/// stop at the first bad frame — so the tail must be clean before the
/// segment is reopened for writing. A file too short to even hold its
/// header (crash during segment creation) is recreated empty.
fn repair_tail(dir: &Path, segment_id: u64) -> Result<()> {
    let path = segment_path(dir, segment_id);
    let bytes = std::fs::read(&path)?;

    if bytes.len() < SEGMENT_HEADER_SIZE {
        warn!(
            target: "vellum::recovery",
            segment = segment_id,
            "segment file shorter than its header, recreating"
        );
        std::fs::remove_file(&path)?;
        Segment::create(dir, segment_id)?;
        return Ok(());
    }

    let mut valid_end = SEGMENT_HEADER_SIZE;
    while valid_end < bytes.len() {
        match decode_frame(&bytes[valid_end..]) {
            FrameOutcome::Chunk { consumed, .. } => valid_end += consumed as usize,
            FrameOutcome::Incomplete | FrameOutcome::BadCrc { .. } => break,
        }
    }

    if valid_end < bytes.len() {
        warn!(
            target: "vellum::recovery",
            segment = segment_id,
            truncated_bytes = bytes.len() - valid_end,
            "truncating torn tail of last segment"
        );
        let file = std::fs::OpenOptions::new().write(true).open(&path)?;
        file.set_len(valid_end as u64)?;
        file.sync_all()?;
    }
    Ok(())
}

fn list_segment_ids(dir: &Path) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    if !dir.exists() {
        return Ok(ids);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(id) = parse_segment_id(&entry.file_name().to_string_lossy()) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Write-order scan over every chunk of the log.
///
/// A framing or checksum failure in the *final* segment marks the end of
/// valid data — the residue of a crash mid-append is silently cut off (with
/// a warning). The same failure in any earlier segment is real damage and
/// surfaces as `Corruption`.
pub struct WalIterator {
    dir: PathBuf,
    segments: Vec<u64>,
    /// Index into `segments` of the segment currently buffered.
    current: usize,
    /// Chunk area of the current segment (header stripped).
    buf: Vec<u8>,
    /// Offset of the next frame within `buf`.
    buf_pos: usize,
    done: bool,
}

impl WalIterator {
    fn new(dir: PathBuf, segments: Vec<u64>) -> Result<Self> {
        let mut iter = WalIterator {
            dir,
            segments,
            current: 0,
            buf: Vec::new(),
            buf_pos: 0,
            done: false,
        };
        if iter.segments.is_empty() {
            iter.done = true;
        } else {
            iter.load_current()?;
        }
        Ok(iter)
    }

    fn is_last_segment(&self) -> bool {
        self.current + 1 == self.segments.len()
    }

    fn load_current(&mut self) -> Result<()> {
        let id = self.segments[self.current];
        let bytes = std::fs::read(segment_path(&self.dir, id))?;

        if bytes.len() < SEGMENT_HEADER_SIZE {
            if self.is_last_segment() {
                // Crash while creating the segment; nothing valid in it
                self.buf.clear();
                self.buf_pos = 0;
                return Ok(());
            }
            return Err(Error::corruption(format!(
                "segment {}: file shorter than header",
                id
            )));
        }

        let header_bytes: [u8; SEGMENT_HEADER_SIZE] = bytes[..SEGMENT_HEADER_SIZE]
            .try_into()
            .expect("slice length is fixed");
        let header = SegmentHeader::from_bytes(&header_bytes);
        if !header.is_valid() || header.segment_id != id {
            return Err(Error::corruption(format!("segment {}: invalid header", id)));
        }

        self.buf = bytes;
        self.buf_pos = SEGMENT_HEADER_SIZE;
        Ok(())
    }

    /// Move to the next segment, or finish.
    fn advance_segment(&mut self) -> Result<()> {
        if self.is_last_segment() {
            self.done = true;
        } else {
            self.current += 1;
            self.load_current()?;
        }
        Ok(())
    }
}

impl Iterator for WalIterator {
    type Item = Result<(Vec<u8>, ChunkPosition)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            if self.buf_pos >= self.buf.len() {
                if let Err(e) = self.advance_segment() {
                    self.done = true;
                    return Some(Err(e));
                }
                continue;
            }

            let segment_id = self.segments[self.current];
            match decode_frame(&self.buf[self.buf_pos..]) {
                FrameOutcome::Chunk { payload, consumed } => {
                    let pos = ChunkPosition {
                        segment_id,
                        offset: self.buf_pos as u64,
                        length: payload.len() as u32,
                    };
                    self.buf_pos += consumed as usize;
                    return Some(Ok((payload, pos)));
                }
                FrameOutcome::Incomplete => {
                    if self.is_last_segment() {
                        warn!(
                            target: "vellum::recovery",
                            segment = segment_id,
                            offset = self.buf_pos,
                            "partial chunk at log tail, treating as end of data"
                        );
                        self.done = true;
                        return None;
                    }
                    self.done = true;
                    return Some(Err(Error::corruption(format!(
                        "segment {} offset {}: truncated frame in non-final segment",
                        segment_id, self.buf_pos
                    ))));
                }
                FrameOutcome::BadCrc { expected, actual } => {
                    if self.is_last_segment() {
                        warn!(
                            target: "vellum::recovery",
                            segment = segment_id,
                            offset = self.buf_pos,
                            "checksum failure at log tail, treating as end of data"
                        );
                        self.done = true;
                        return None;
                    }
                    self.done = true;
                    return Some(Err(Error::corruption(format!(
                        "segment {} offset {}: crc mismatch (expected {:08x}, got {:08x})",
                        segment_id, self.buf_pos, expected, actual
                    ))));
                }
            }
        }
    }
}
