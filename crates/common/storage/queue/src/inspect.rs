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

//! Read-only inspection of a queue directory.
//!
//! Unlike recovery, inspection never truncates, deletes or creates files, so
//! it is safe to run against a directory another process has open.

use std::path::{Path, PathBuf};

use serde::Serialize;
use snafu::{ResultExt, ensure};

use crate::{
    QueueError, Result,
    checkpoint::{self, is_checkpoint_file},
    error::{InvalidPathSnafu, IoSnafu},
    path::scan_segments,
    position::{Position, SegmentId},
    segment::{SEGMENT_HEADER_LEN, ScanItem, SegmentReader},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Corruption {
    /// Offset of the first byte that is not part of a valid frame.
    pub offset: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentReport {
    pub id:         SegmentId,
    pub path:       PathBuf,
    pub file_len:   u64,
    /// End of the last valid frame.
    pub valid_len:  u64,
    pub frames:     u64,
    pub corruption: Option<Corruption>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueReport {
    pub dir:              PathBuf,
    pub segments:         Vec<SegmentReport>,
    pub checkpoint:       Option<Position>,
    pub checkpoint_error: Option<String>,
    pub unknown_files:    Vec<PathBuf>,
}

impl QueueReport {
    /// True when every segment and the checkpoint are intact.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.checkpoint_error.is_none() && self.segments.iter().all(|s| s.corruption.is_none())
    }

    #[must_use]
    pub fn total_frames(&self) -> u64 { self.segments.iter().map(|s| s.frames).sum() }

    #[must_use]
    pub fn total_bytes(&self) -> u64 { self.segments.iter().map(|s| s.file_len).sum() }
}

/// Walk every segment in `dir` and report what a recovery would find.
pub fn inspect<P: AsRef<Path>>(dir: P) -> Result<QueueReport> {
    let dir = dir.as_ref();
    ensure!(dir.is_dir(), InvalidPathSnafu { path: dir });

    let listing = scan_segments(dir, is_checkpoint_file)?;
    let segments = listing
        .segments
        .into_iter()
        .map(|(id, path)| inspect_segment(id, path))
        .collect::<Result<Vec<_>>>()?;

    let (checkpoint, checkpoint_error) = match checkpoint::load(dir) {
        Ok(cp) => (cp.map(|cp| cp.position), None),
        Err(e @ QueueError::CheckpointCorrupted { .. }) => (None, Some(e.to_string())),
        Err(e) => return Err(e),
    };

    Ok(QueueReport {
        dir: dir.to_path_buf(),
        segments,
        checkpoint,
        checkpoint_error,
        unknown_files: listing.unknown,
    })
}

fn inspect_segment(id: SegmentId, path: PathBuf) -> Result<SegmentReport> {
    let file_len = std::fs::metadata(&path)
        .context(IoSnafu { path: &path })?
        .len();
    let mut report = SegmentReport {
        id,
        path,
        file_len,
        valid_len: 0,
        frames: 0,
        corruption: None,
    };

    let mut reader = match SegmentReader::open(&report.path) {
        Ok(reader) => reader,
        Err(e @ (QueueError::CorruptSegment { .. } | QueueError::UnsupportedSegmentVersion { .. })) => {
            report.corruption = Some(Corruption {
                offset: 0,
                reason: e.to_string(),
            });
            return Ok(report);
        }
        Err(e) => return Err(e),
    };
    if reader.id() != id {
        report.corruption = Some(Corruption {
            offset: 0,
            reason: format!("header names segment {}", reader.id()),
        });
        return Ok(report);
    }

    report.valid_len = SEGMENT_HEADER_LEN;
    for item in reader.scan_range(SEGMENT_HEADER_LEN, report.file_len) {
        match item? {
            ScanItem::Frame { offset, len, .. } => {
                report.frames += 1;
                report.valid_len = offset + len;
            }
            ScanItem::Corrupt { offset, error } => {
                report.corruption = Some(Corruption {
                    offset,
                    reason: error.to_string(),
                });
            }
        }
    }
    Ok(report)
}
