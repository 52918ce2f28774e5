// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Append-only segment files.
//!
//! ## Segment Layout
//!
//! ```text
//! ┌────────────┬──────────────┬───────────────┬─────────┬─────────┬─────┐
//! │ magic (4B) │ version (4B) │ segment id 8B │ frame 0 │ frame 1 │ ... │
//! │ "SPQS"     │ little-endian│ little-endian │         │         │     │
//! └────────────┴──────────────┴───────────────┴─────────┴─────────┴─────┘
//! ```
//!
//! A segment only grows while it is active. Its length on disk is the end
//! of its last complete frame except after a crash, where recovery cuts the
//! partial tail off with [`truncate`].

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use snafu::{ResultExt, ensure};
use tracing::{debug, warn};

use crate::{
    Result,
    codec::{self, FRAME_LENGTH_SIZE, FrameError},
    error::{
        CorruptSegmentSnafu, IoSnafu, SegmentFullSnafu, UnsupportedSegmentVersionSnafu,
        write_error,
    },
    path::{segment_path, sync_dir},
    position::SegmentId,
    record::Record,
};

/// Magic bytes identifying a segment file: "SPQS".
pub const SEGMENT_MAGIC: [u8; 4] = *b"SPQS";

/// Current segment format version.
pub const SEGMENT_VERSION: u32 = 1;

/// Size of the segment header; the first frame starts here.
pub const SEGMENT_HEADER_LEN: u64 = 16;

fn encode_header(id: SegmentId) -> [u8; SEGMENT_HEADER_LEN as usize] {
    let mut header = [0u8; SEGMENT_HEADER_LEN as usize];
    header[0..4].copy_from_slice(&SEGMENT_MAGIC);
    header[4..8].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
    header[8..16].copy_from_slice(&id.get().to_le_bytes());
    header
}

/// Reads and validates the header at the start of `file`.
fn read_header(file: &mut File, path: &Path) -> Result<SegmentId> {
    let len = file.metadata().context(IoSnafu { path })?.len();
    ensure!(
        len >= SEGMENT_HEADER_LEN,
        CorruptSegmentSnafu {
            path,
            reason: format!("file is {len} bytes, shorter than the header"),
        }
    );

    let mut header = [0u8; SEGMENT_HEADER_LEN as usize];
    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.read_exact(&mut header))
        .context(IoSnafu { path })?;

    ensure!(
        header[0..4] == SEGMENT_MAGIC,
        CorruptSegmentSnafu {
            path,
            reason: "bad magic".to_string(),
        }
    );
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    ensure!(
        version == SEGMENT_VERSION,
        UnsupportedSegmentVersionSnafu { path, version }
    );

    let mut id_bytes = [0u8; 8];
    id_bytes.copy_from_slice(&header[8..16]);
    Ok(SegmentId(u64::from_le_bytes(id_bytes)))
}

/// The active segment: the only file that receives appends.
#[derive(Debug)]
pub struct SegmentWriter {
    id:           SegmentId,
    path:         PathBuf,
    file:         File,
    /// End of the last complete frame; the next append goes here.
    len:          u64,
    max_size:     u64,
    record_count: u64,
    opened_at:    Instant,
}

impl SegmentWriter {
    /// Create a new, empty segment in `dir` and make it durable.
    pub fn create(dir: &Path, id: SegmentId, max_size: u64) -> Result<Self> {
        let path = segment_path(dir, id);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| write_error(&path, e))?;

        file.write_all(&encode_header(id))
            .and_then(|()| file.sync_all())
            .map_err(|e| write_error(&path, e))?;
        sync_dir(dir)?;

        debug!(segment = %id, path = ?path, "Created segment");

        Ok(Self {
            id,
            path,
            file,
            len: SEGMENT_HEADER_LEN,
            max_size,
            record_count: 0,
            opened_at: Instant::now(),
        })
    }

    /// Reopen a recovered segment so appends continue after its last valid
    /// frame.
    ///
    /// `len` must be the validated end of data; recovery has already cut off
    /// anything after it.
    pub fn open_for_append(
        path: &Path,
        len: u64,
        record_count: u64,
        max_size: u64,
    ) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .context(IoSnafu { path })?;
        let id = read_header(&mut file, path)?;
        file.seek(SeekFrom::Start(len)).context(IoSnafu { path })?;

        Ok(Self {
            id,
            path: path.to_path_buf(),
            file,
            len,
            max_size,
            record_count,
            opened_at: Instant::now(),
        })
    }

    /// Append one encoded frame, returning the offset it was written at.
    pub fn append(&mut self, frame: &[u8]) -> Result<u64> {
        let frame_len = frame.len() as u64;
        ensure!(
            self.fits(frame_len),
            SegmentFullSnafu {
                segment: self.id,
                len: self.len,
                frame_len,
                max: self.max_size,
            }
        );

        let offset = self.len;
        if let Err(e) = self.file.write_all(frame) {
            self.rollback();
            return Err(write_error(&self.path, e));
        }

        self.len += frame_len;
        self.record_count += 1;
        Ok(offset)
    }

    /// Cut a partially written frame off so the next append starts on a
    /// frame boundary.
    fn rollback(&mut self) {
        let len = self.len;
        if let Err(e) = self.cut_to(len) {
            warn!(segment = %self.id, len, error = %e, "Failed to roll back partial frame");
        }
    }

    /// Drop the frame most recently appended at `offset`, as if the append
    /// never happened. The next append reuses `offset`.
    pub fn discard_last(&mut self, offset: u64) -> Result<()> {
        debug_assert!(offset >= SEGMENT_HEADER_LEN && offset < self.len);
        self.len = offset;
        self.record_count = self.record_count.saturating_sub(1);
        self.cut_to(offset).map_err(|e| write_error(&self.path, e))
    }

    fn cut_to(&mut self, len: u64) -> std::io::Result<()> {
        self.file.set_len(len)?;
        self.file.seek(SeekFrom::Start(len))?;
        Ok(())
    }

    /// Force appended frames to stable storage.
    pub fn flush(&mut self) -> Result<()> {
        self.file.sync_data().map_err(|e| write_error(&self.path, e))
    }

    /// Whether a frame of `frame_len` bytes still fits under the size cap.
    pub const fn fits(&self, frame_len: u64) -> bool { self.len + frame_len <= self.max_size }

    pub const fn id(&self) -> SegmentId { self.id }

    pub fn path(&self) -> &Path { &self.path }

    pub const fn len(&self) -> u64 { self.len }

    /// True while no frame has been appended.
    pub const fn is_empty(&self) -> bool { self.len == SEGMENT_HEADER_LEN }

    pub const fn record_count(&self) -> u64 { self.record_count }

    /// Time since this writer opened the segment.
    pub fn age(&self) -> Duration { self.opened_at.elapsed() }
}

/// Outcome of reading one frame.
#[derive(Debug)]
pub enum FrameRead {
    Frame { record: Record, len: u64 },
    /// The offset is at the read limit.
    End,
    /// Bytes are present but do not form a valid frame.
    Corrupt(FrameError),
}

/// Read handle on a segment, sealed or active.
#[derive(Debug)]
pub struct SegmentReader {
    id:   SegmentId,
    path: PathBuf,
    file: File,
    buf:  Vec<u8>,
}

impl SegmentReader {
    /// Open a segment and validate its header.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path).context(IoSnafu { path })?;
        let id = read_header(&mut file, path)?;
        Ok(Self {
            id,
            path: path.to_path_buf(),
            file,
            buf: Vec::new(),
        })
    }

    pub const fn id(&self) -> SegmentId { self.id }

    /// Current length of the file on disk.
    pub fn file_len(&self) -> Result<u64> {
        Ok(self
            .file
            .metadata()
            .context(IoSnafu { path: &self.path })?
            .len())
    }

    /// Read the frame starting at `offset`, looking no further than `limit`.
    pub fn read_frame(&mut self, offset: u64, limit: u64) -> Result<FrameRead> {
        if offset >= limit {
            return Ok(FrameRead::End);
        }
        let available = limit - offset;

        let mut prefix = [0u8; FRAME_LENGTH_SIZE];
        let want = available.min(FRAME_LENGTH_SIZE as u64);
        if !self.read_exact_at(offset, &mut prefix[..want as usize])? {
            return Ok(truncated(FRAME_LENGTH_SIZE as u64, 0));
        }
        if want < FRAME_LENGTH_SIZE as u64 {
            return Ok(truncated(FRAME_LENGTH_SIZE as u64, available));
        }

        let body_len = u64::from(u32::from_le_bytes(prefix));
        let total = codec::FRAME_OVERHEAD as u64 + body_len;
        let to_read = total.min(available);

        self.buf.clear();
        self.buf.resize(to_read as usize, 0);
        let mut buf = std::mem::take(&mut self.buf);
        let complete = self.read_exact_at(offset, &mut buf)?;
        let outcome = if complete {
            match codec::decode(&buf) {
                Ok((record, len)) => FrameRead::Frame {
                    record,
                    len: len as u64,
                },
                Err(e) => FrameRead::Corrupt(e),
            }
        } else {
            truncated(total, 0)
        };
        self.buf = buf;
        Ok(outcome)
    }

    /// Read the record at `offset`, or `None` when no further valid frame
    /// exists before `limit`.
    pub fn read_at(&mut self, offset: u64, limit: u64) -> Result<Option<(Record, u64)>> {
        match self.read_frame(offset, limit)? {
            FrameRead::Frame { record, len } => Ok(Some((record, offset + len))),
            FrameRead::End | FrameRead::Corrupt(_) => Ok(None),
        }
    }

    /// Iterate frames from `offset` to the current end of the file.
    pub fn scan_from(&mut self, offset: u64) -> Result<SegmentScan<'_>> {
        let limit = self.file_len()?;
        Ok(self.scan_range(offset, limit))
    }

    /// Iterate frames in `offset..limit`.
    pub const fn scan_range(&mut self, offset: u64, limit: u64) -> SegmentScan<'_> {
        SegmentScan {
            reader: self,
            offset,
            limit,
            done: false,
        }
    }

    /// Returns `false` if the file ended before `buf` was filled.
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<bool> {
        let result = self
            .file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.read_exact(buf));
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(e).context(IoSnafu { path: &self.path }),
        }
    }
}

const fn truncated(needed: u64, available: u64) -> FrameRead {
    FrameRead::Corrupt(FrameError::Truncated { needed, available })
}

/// One step of a [`SegmentScan`].
#[derive(Debug)]
pub enum ScanItem {
    Frame {
        offset: u64,
        len:    u64,
        record: Record,
    },
    /// The first invalid frame; the scan ends after it.
    Corrupt { offset: u64, error: FrameError },
}

/// Finite iterator over the frames of a segment.
///
/// A scan can be resumed from any frame boundary it reported by starting a
/// new one at that offset.
pub struct SegmentScan<'a> {
    reader: &'a mut SegmentReader,
    offset: u64,
    limit:  u64,
    done:   bool,
}

impl SegmentScan<'_> {
    /// Offset of the next frame the scan will read.
    pub const fn offset(&self) -> u64 { self.offset }
}

impl Iterator for SegmentScan<'_> {
    type Item = Result<ScanItem>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let offset = self.offset;
        match self.reader.read_frame(offset, self.limit) {
            Ok(FrameRead::Frame { record, len }) => {
                self.offset += len;
                Some(Ok(ScanItem::Frame {
                    offset,
                    len,
                    record,
                }))
            }
            Ok(FrameRead::End) => {
                self.done = true;
                None
            }
            Ok(FrameRead::Corrupt(error)) => {
                self.done = true;
                Some(Ok(ScanItem::Corrupt { offset, error }))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Shorten a segment file to `len` bytes and make the change durable.
pub fn truncate(path: &Path, len: u64) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .context(IoSnafu { path })?;
    file.set_len(len)
        .and_then(|()| file.sync_all())
        .context(IoSnafu { path })
}

/// Rewrite a segment whose header never made it to disk as an empty segment.
pub fn reinitialize(path: &Path, id: SegmentId) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .context(IoSnafu { path })?;
    file.write_all(&encode_header(id))
        .and_then(|()| file.sync_all())
        .map_err(|e| write_error(path, e))
}
