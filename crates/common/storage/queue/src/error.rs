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

use std::{io, path::PathBuf};

use snafu::{IntoError, Snafu};

use crate::{
    codec::EncodeError,
    position::{Position, SegmentId},
};

/// Queue operation errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum QueueError {
    /// Filesystem I/O failure.
    #[snafu(display("I/O error on {}", path.display()))]
    Io {
        path:   PathBuf,
        source: io::Error,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    /// The filesystem holding the queue directory ran out of space.
    #[snafu(display("Disk full while writing {}", path.display()))]
    DiskFull {
        path:   PathBuf,
        source: io::Error,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    /// The record could not be framed.
    #[snafu(display("Failed to encode record"))]
    Encode {
        source: EncodeError,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    /// The encoded record exceeds the configured maximum record size.
    #[snafu(display("Record of {size} bytes exceeds maximum record size of {max} bytes"))]
    RecordTooLarge { size: u64, max: u64 },

    /// Appending would grow the queue past its configured total size.
    #[snafu(display("Queue full: {current} bytes on disk, {needed} more requested, limit {max}"))]
    QueueFull { current: u64, needed: u64, max: u64 },

    /// The frame does not fit in the remaining capacity of the segment.
    #[snafu(display(
        "Segment {segment} full: {len} bytes used, {frame_len} byte frame, limit {max}"
    ))]
    SegmentFull {
        segment:   SegmentId,
        len:       u64,
        frame_len: u64,
        max:       u64,
    },

    /// A segment file header is unreadable or inconsistent.
    #[snafu(display("Corrupted segment {}: {reason}", path.display()))]
    CorruptSegment { path: PathBuf, reason: String },

    /// A segment was written by a different on-disk format version.
    #[snafu(display("Segment {} has unsupported format version {version}", path.display()))]
    UnsupportedSegmentVersion { path: PathBuf, version: u32 },

    /// Both checkpoint slots exist but neither is valid.
    #[snafu(display("Checkpoint corrupted: {reason}"))]
    CheckpointCorrupted { reason: String },

    /// Startup cannot proceed without risking committed data.
    #[snafu(display("Recovery failed: {reason}"))]
    RecoveryFatal { reason: String },

    /// A commit named a position outside `checkpoint..=cursor`.
    #[snafu(display(
        "Commit position {position} out of range (checkpoint {checkpoint}, cursor {cursor})"
    ))]
    CommitOutOfRange {
        position:   Position,
        checkpoint: Position,
        cursor:     Position,
    },

    /// The configuration cannot describe a working queue.
    #[snafu(display("Invalid configuration: {reason}"))]
    InvalidConfig { reason: String },

    /// Invalid or inaccessible file path.
    #[snafu(display("Invalid file path: {}", path.display()))]
    InvalidPath { path: PathBuf },
}

impl QueueError {
    /// Returns `true` when the producer may retry the enqueue later.
    ///
    /// Capacity errors clear once the consumer commits and segments are
    /// retired; everything else needs the caller or an operator to act.
    #[must_use]
    pub const fn is_capacity(&self) -> bool {
        matches!(self, Self::QueueFull { .. } | Self::DiskFull { .. })
    }
}

/// Wraps an I/O error for `path`, mapping `ENOSPC` to [`QueueError::DiskFull`].
pub(crate) fn write_error(path: impl Into<PathBuf>, source: io::Error) -> QueueError {
    let path = path.into();
    if source.kind() == io::ErrorKind::StorageFull {
        DiskFullSnafu { path }.into_error(source)
    } else {
        IoSnafu { path }.into_error(source)
    }
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_full_maps_to_disk_full() {
        let err = write_error("/q/1.seg", io::Error::from(io::ErrorKind::StorageFull));
        assert!(matches!(err, QueueError::DiskFull { .. }));
        assert!(err.is_capacity());
    }

    #[test]
    fn test_other_io_errors_stay_io() {
        let err = write_error("/q/1.seg", io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, QueueError::Io { .. }));
        assert!(!err.is_capacity());
    }
}
