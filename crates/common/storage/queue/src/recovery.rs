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

//! Crash recovery for the queue directory.
//!
//! Runs once when a [`Queue`](crate::Queue) is opened:
//! 1. List segment files by id
//! 2. Load the checkpoint, or start at the earliest segment
//! 3. Delete segments wholly before the checkpoint
//! 4. Scan the remaining segments frame by frame and cut off any tail that
//!    is not a complete, checksum-valid frame
//! 5. Reopen the last segment for appends; its valid end is the write
//!    position
//! 6. Pull the read position back onto the last frame boundary at or
//!    before it, and never past the write position
//!
//! A checkpoint pointing into a segment that is gone, or a segment whose
//! header cannot be trusted, stops recovery: continuing would silently drop
//! committed or uncommitted records.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::Serialize;
use snafu::{ResultExt, ensure};
use tracing::{debug, info, warn};

use crate::{
    QueueConfig, Result,
    checkpoint::{CheckpointStore, is_checkpoint_file},
    directory::{SegmentDirectory, SegmentMeta},
    error::{CorruptSegmentSnafu, IoSnafu, RecoveryFatalSnafu},
    path::{scan_segments, sync_dir},
    position::{Position, SegmentId},
    segment::{self, SEGMENT_HEADER_LEN, ScanItem, SegmentReader, SegmentWriter},
};

/// What recovery found and repaired.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub segments_scanned:       usize,
    pub frames_found:           u64,
    /// Bytes cut off segment tails that did not hold complete frames.
    pub bytes_truncated:        u64,
    /// Segments deleted because the checkpoint was already past them.
    pub segments_retired:       usize,
    /// Segments whose header was torn and were reset to empty.
    pub segments_reinitialized: usize,
    pub unknown_files:          usize,
    pub read_position:          Position,
    pub write_position:         Position,
    /// The checkpoint pointed past valid data or inside a frame and was
    /// pulled back.
    pub read_clamped:           bool,
}

/// State handed to the queue after recovery.
#[derive(Debug)]
pub(crate) struct Recovered {
    pub directory:      SegmentDirectory,
    pub active:         SegmentWriter,
    pub checkpoints:    CheckpointStore,
    pub read_position:  Position,
    pub write_position: Position,
    pub report:         RecoveryReport,
}

pub(crate) fn recover(config: &QueueConfig) -> Result<Recovered> {
    let dir = config.dir.as_path();
    info!(path = ?dir, "Starting queue recovery");
    fs::create_dir_all(dir).context(IoSnafu { path: dir })?;

    let mut report = RecoveryReport::default();

    let listing = scan_segments(dir, is_checkpoint_file)?;
    for path in &listing.unknown {
        warn!(path = ?path, "Ignoring unknown file in queue directory");
    }
    report.unknown_files = listing.unknown.len();

    let checkpoints = CheckpointStore::open(dir)?;
    let mut read_position = match checkpoints.current() {
        Some(checkpoint) => resolve_checkpoint(checkpoint, &listing.segments)?,
        None => Position::new(
            listing
                .segments
                .first()
                .map_or(SegmentId::FIRST, |(id, _)| *id),
            SEGMENT_HEADER_LEN,
        ),
    };

    let (consumed, live): (Vec<_>, Vec<_>) = listing
        .segments
        .into_iter()
        .partition(|(id, _)| *id < read_position.segment);
    for (id, path) in &consumed {
        remove_segment(path)?;
        debug!(segment = %id, "Removed consumed segment");
    }
    if !consumed.is_empty() {
        sync_dir(dir)?;
        report.segments_retired = consumed.len();
    }

    let mut segments = Vec::with_capacity(live.len() + 1);
    let mut last = None;
    let live_count = live.len();
    for (index, (id, path)) in live.into_iter().enumerate() {
        let read_offset = (id == read_position.segment).then_some(read_position.offset);
        let RecoveredSegment {
            valid_len,
            frames,
            read_boundary,
        } = recover_segment(id, &path, read_offset, &mut report)?;
        if let Some(boundary) = read_boundary.filter(|b| *b != read_position.offset) {
            warn!(
                checkpoint = %read_position,
                boundary,
                "Checkpoint is not on a frame boundary, moving it back"
            );
            read_position.offset = boundary;
            report.read_clamped = true;
        }
        if index + 1 == live_count {
            last = Some((path, valid_len, frames));
        } else {
            segments.push((id, SegmentMeta::sealed(valid_len)));
        }
    }

    let active = match last {
        Some((path, valid_len, frames)) => {
            SegmentWriter::open_for_append(&path, valid_len, frames, config.max_segment_size)?
        }
        None => SegmentWriter::create(dir, read_position.segment, config.max_segment_size)?,
    };
    segments.push((active.id(), SegmentMeta::active(active.len())));
    let write_position = Position::new(active.id(), active.len());

    let clamped = clamp_read_position(read_position, &segments, write_position);
    if clamped != read_position {
        warn!(
            checkpoint = %read_position,
            clamped = %clamped,
            "Checkpoint is past valid data, clamping read position"
        );
        read_position = clamped;
        report.read_clamped = true;
    }

    let directory = SegmentDirectory::new(dir.to_path_buf(), config.max_segment_size);
    for (id, meta) in segments {
        directory.register(id, meta);
    }

    report.read_position = read_position;
    report.write_position = write_position;
    info!(
        segments_scanned = report.segments_scanned,
        frames_found = report.frames_found,
        bytes_truncated = report.bytes_truncated,
        segments_retired = report.segments_retired,
        %read_position,
        %write_position,
        "Queue recovery complete"
    );

    Ok(Recovered {
        directory,
        active,
        checkpoints,
        read_position,
        write_position,
        report,
    })
}

/// Map a persisted checkpoint onto the segments that exist.
fn resolve_checkpoint(checkpoint: Position, segments: &[(SegmentId, PathBuf)]) -> Result<Position> {
    if segments.iter().any(|(id, _)| *id == checkpoint.segment) {
        return Ok(checkpoint);
    }

    ensure!(
        checkpoint.offset <= SEGMENT_HEADER_LEN,
        RecoveryFatalSnafu {
            reason: format!(
                "checkpoint {checkpoint} points into segment {} which no longer exists",
                checkpoint.segment
            ),
        }
    );

    // Nothing of the missing segment was consumed, so the next one is where
    // reading continues.
    let resumed = segments
        .iter()
        .map(|(id, _)| *id)
        .find(|id| *id > checkpoint.segment)
        .unwrap_or(checkpoint.segment);
    if resumed != checkpoint.segment {
        info!(checkpoint = %checkpoint, resumed = %resumed, "Checkpoint segment missing, resuming at next segment");
    }
    Ok(Position::new(resumed, SEGMENT_HEADER_LEN))
}

struct RecoveredSegment {
    valid_len:     u64,
    frames:        u64,
    /// Last frame boundary at or before the requested read offset.
    read_boundary: Option<u64>,
}

/// Validate one segment and cut off its invalid tail.
///
/// When `read_offset` is given, also finds the frame boundary a reader
/// starting there has to resume from.
fn recover_segment(
    id: SegmentId,
    path: &Path,
    read_offset: Option<u64>,
    report: &mut RecoveryReport,
) -> Result<RecoveredSegment> {
    report.segments_scanned += 1;
    let mut read_boundary = read_offset.map(|_| SEGMENT_HEADER_LEN);

    let file_len = fs::metadata(path).context(IoSnafu { path })?.len();
    if file_len < SEGMENT_HEADER_LEN {
        warn!(segment = %id, path = ?path, file_len, "Segment header incomplete, reinitializing");
        segment::reinitialize(path, id)?;
        report.segments_reinitialized += 1;
        return Ok(RecoveredSegment {
            valid_len: SEGMENT_HEADER_LEN,
            frames: 0,
            read_boundary,
        });
    }

    let mut reader = SegmentReader::open(path)?;
    ensure!(
        reader.id() == id,
        CorruptSegmentSnafu {
            path,
            reason: format!("header names segment {}", reader.id()),
        }
    );

    let mut valid_len = SEGMENT_HEADER_LEN;
    let mut frames = 0u64;
    for item in reader.scan_range(SEGMENT_HEADER_LEN, file_len) {
        match item? {
            ScanItem::Frame { offset, len, .. } => {
                frames += 1;
                valid_len = offset + len;
                if read_offset.is_some_and(|read| valid_len <= read) {
                    read_boundary = Some(valid_len);
                }
            }
            ScanItem::Corrupt { offset, error } => {
                warn!(
                    segment = %id,
                    offset,
                    bytes = file_len - offset,
                    %error,
                    "Truncating incomplete segment tail"
                );
                break;
            }
        }
    }

    if valid_len < file_len {
        segment::truncate(path, valid_len)?;
        report.bytes_truncated += file_len - valid_len;
    }
    report.frames_found += frames;

    debug!(segment = %id, frames, valid_len, "Segment recovered");
    Ok(RecoveredSegment {
        valid_len,
        frames,
        read_boundary,
    })
}

/// Keep the read position inside the valid data of its segment and never
/// past the write position.
fn clamp_read_position(
    read: Position,
    segments: &[(SegmentId, SegmentMeta)],
    write: Position,
) -> Position {
    let end = if read.segment == write.segment {
        write.offset
    } else {
        segments
            .iter()
            .find(|(id, _)| *id == read.segment)
            .map_or(SEGMENT_HEADER_LEN, |(_, meta)| meta.len)
    };
    Position::new(read.segment, read.offset.clamp(SEGMENT_HEADER_LEN, end)).min(write)
}

fn remove_segment(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e).context(IoSnafu { path }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::{QueueError, Record, codec::encode, path::segment_path};

    fn config(dir: &Path) -> QueueConfig {
        QueueConfig {
            dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    /// Write a segment holding `count` records and return its length.
    fn write_segment(dir: &Path, id: u64, count: usize) -> u64 {
        let mut writer = SegmentWriter::create(dir, SegmentId(id), 1024 * 1024).unwrap();
        for i in 0..count {
            writer
                .append(&encode(&Record::new(format!("{id}-{i}"))).unwrap())
                .unwrap();
        }
        writer.flush().unwrap();
        writer.len()
    }

    fn persist_checkpoint(dir: &Path, position: Position) {
        CheckpointStore::open(dir).unwrap().persist(position).unwrap();
    }

    #[test]
    fn test_fresh_directory() {
        let temp_dir = TempDir::new().unwrap();
        let recovered = recover(&config(temp_dir.path())).unwrap();

        let start = Position::new(SegmentId::FIRST, SEGMENT_HEADER_LEN);
        assert_eq!(recovered.read_position, start);
        assert_eq!(recovered.write_position, start);
        assert_eq!(recovered.report.segments_scanned, 0);
        assert!(segment_path(temp_dir.path(), SegmentId::FIRST).exists());
    }

    #[test]
    fn test_resumes_at_end_of_last_segment() {
        let temp_dir = TempDir::new().unwrap();
        write_segment(temp_dir.path(), 1, 3);
        let len = write_segment(temp_dir.path(), 2, 2);

        let recovered = recover(&config(temp_dir.path())).unwrap();
        assert_eq!(recovered.write_position, Position::new(SegmentId(2), len));
        assert_eq!(recovered.read_position, Position::new(SegmentId(1), SEGMENT_HEADER_LEN));
        assert_eq!(recovered.report.frames_found, 5);
        assert_eq!(recovered.active.record_count(), 2);
        assert!(recovered.directory.sealed_len(SegmentId(1)).is_some());
    }

    #[test]
    fn test_truncates_torn_tail() {
        let temp_dir = TempDir::new().unwrap();
        let len = write_segment(temp_dir.path(), 1, 3);
        let path = segment_path(temp_dir.path(), SegmentId(1));
        let frame_len = encode(&Record::new("1-0")).unwrap().len() as u64;
        segment::truncate(&path, len - 5).unwrap();

        let recovered = recover(&config(temp_dir.path())).unwrap();
        assert_eq!(recovered.report.frames_found, 2);
        assert_eq!(recovered.report.bytes_truncated, frame_len - 5);
        assert_eq!(fs::metadata(&path).unwrap().len(), len - frame_len);
        assert_eq!(recovered.write_position.offset, len - frame_len);
    }

    #[test]
    fn test_truncates_garbage_after_valid_frames() {
        let temp_dir = TempDir::new().unwrap();
        let len = write_segment(temp_dir.path(), 1, 2);
        let path = segment_path(temp_dir.path(), SegmentId(1));
        let mut bytes = fs::read(&path).unwrap();
        bytes.extend_from_slice(&[0u8; 64]);
        fs::write(&path, bytes).unwrap();

        let recovered = recover(&config(temp_dir.path())).unwrap();
        assert_eq!(recovered.report.bytes_truncated, 64);
        assert_eq!(recovered.write_position.offset, len);
    }

    #[test]
    fn test_reinitializes_torn_header() {
        let temp_dir = TempDir::new().unwrap();
        write_segment(temp_dir.path(), 1, 1);
        fs::write(segment_path(temp_dir.path(), SegmentId(2)), b"SPQ").unwrap();

        let recovered = recover(&config(temp_dir.path())).unwrap();
        assert_eq!(recovered.report.segments_reinitialized, 1);
        assert_eq!(
            recovered.write_position,
            Position::new(SegmentId(2), SEGMENT_HEADER_LEN)
        );
    }

    #[test]
    fn test_deletes_segments_before_checkpoint() {
        let temp_dir = TempDir::new().unwrap();
        write_segment(temp_dir.path(), 1, 1);
        write_segment(temp_dir.path(), 2, 1);
        write_segment(temp_dir.path(), 3, 1);
        persist_checkpoint(temp_dir.path(), Position::new(SegmentId(3), SEGMENT_HEADER_LEN));

        let recovered = recover(&config(temp_dir.path())).unwrap();
        assert_eq!(recovered.report.segments_retired, 2);
        assert!(!segment_path(temp_dir.path(), SegmentId(1)).exists());
        assert!(!segment_path(temp_dir.path(), SegmentId(2)).exists());
        assert_eq!(recovered.directory.snapshot()[0].0, SegmentId(3));
    }

    #[test]
    fn test_checkpoint_into_missing_segment_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        write_segment(temp_dir.path(), 3, 1);
        persist_checkpoint(temp_dir.path(), Position::new(SegmentId(2), 100));

        let err = recover(&config(temp_dir.path())).unwrap_err();
        assert!(matches!(err, QueueError::RecoveryFatal { .. }));
    }

    #[test]
    fn test_checkpoint_at_start_of_missing_segment_resumes_later() {
        let temp_dir = TempDir::new().unwrap();
        write_segment(temp_dir.path(), 3, 1);
        persist_checkpoint(temp_dir.path(), Position::new(SegmentId(2), SEGMENT_HEADER_LEN));

        let recovered = recover(&config(temp_dir.path())).unwrap();
        assert_eq!(
            recovered.read_position,
            Position::new(SegmentId(3), SEGMENT_HEADER_LEN)
        );
    }

    #[test]
    fn test_checkpoint_past_all_segments_creates_it() {
        let temp_dir = TempDir::new().unwrap();
        write_segment(temp_dir.path(), 1, 1);
        persist_checkpoint(temp_dir.path(), Position::new(SegmentId(2), SEGMENT_HEADER_LEN));

        let recovered = recover(&config(temp_dir.path())).unwrap();
        assert_eq!(recovered.active.id(), SegmentId(2));
        assert_eq!(recovered.read_position, recovered.write_position);
        assert!(!segment_path(temp_dir.path(), SegmentId(1)).exists());
    }

    #[test]
    fn test_checkpoint_beyond_data_is_clamped() {
        let temp_dir = TempDir::new().unwrap();
        let len = write_segment(temp_dir.path(), 1, 2);
        persist_checkpoint(temp_dir.path(), Position::new(SegmentId(1), len + 500));

        let recovered = recover(&config(temp_dir.path())).unwrap();
        assert!(recovered.report.read_clamped);
        assert_eq!(recovered.read_position, Position::new(SegmentId(1), len));
    }

    #[test]
    fn test_checkpoint_inside_frame_moves_to_frame_start() {
        let temp_dir = TempDir::new().unwrap();
        write_segment(temp_dir.path(), 1, 3);
        let frame_len = encode(&Record::new("1-0")).unwrap().len() as u64;
        let second = SEGMENT_HEADER_LEN + frame_len;
        persist_checkpoint(temp_dir.path(), Position::new(SegmentId(1), second + 5));

        let recovered = recover(&config(temp_dir.path())).unwrap();
        assert!(recovered.report.read_clamped);
        assert_eq!(recovered.read_position, Position::new(SegmentId(1), second));
        assert_eq!(recovered.report.bytes_truncated, 0);
        drop(recovered);

        let mut queue = crate::QueueBuilder::new(temp_dir.path()).build().unwrap();
        let mut seen = Vec::new();
        while let Some(entry) = queue.reader().next().unwrap() {
            seen.push(entry.record.data);
        }
        assert_eq!(seen, ["1-1", "1-2"]);
    }

    #[test]
    fn test_checkpoint_on_boundary_is_kept() {
        let temp_dir = TempDir::new().unwrap();
        write_segment(temp_dir.path(), 1, 3);
        let frame_len = encode(&Record::new("1-0")).unwrap().len() as u64;
        let third = Position::new(SegmentId(1), SEGMENT_HEADER_LEN + 2 * frame_len);
        persist_checkpoint(temp_dir.path(), third);

        let recovered = recover(&config(temp_dir.path())).unwrap();
        assert!(!recovered.report.read_clamped);
        assert_eq!(recovered.read_position, third);
    }

    #[test]
    fn test_bad_magic_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(segment_path(temp_dir.path(), SegmentId(1)), [0x55u8; 64]).unwrap();

        let err = recover(&config(temp_dir.path())).unwrap_err();
        assert!(matches!(err, QueueError::CorruptSegment { .. }));
    }

    #[test]
    fn test_mismatched_header_id_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        write_segment(temp_dir.path(), 4, 1);
        fs::rename(
            segment_path(temp_dir.path(), SegmentId(4)),
            segment_path(temp_dir.path(), SegmentId(5)),
        )
        .unwrap();

        let err = recover(&config(temp_dir.path())).unwrap_err();
        assert!(matches!(err, QueueError::CorruptSegment { .. }));
    }

    #[test]
    fn test_unknown_files_are_ignored() {
        let temp_dir = TempDir::new().unwrap();
        write_segment(temp_dir.path(), 1, 1);
        fs::write(temp_dir.path().join("notes.txt"), b"hello").unwrap();

        let recovered = recover(&config(temp_dir.path())).unwrap();
        assert_eq!(recovered.report.unknown_files, 1);
        assert!(temp_dir.path().join("notes.txt").exists());
    }
}
