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

//! Queue instance and lifecycle management.
//!
//! The [`Queue`] is the entry point of the library. Opening one:
//! - Validates the configuration
//! - Runs recovery over the queue directory
//! - Wires the single [`Writer`] and single [`Reader`] to shared state
//!
//! ## Usage
//!
//! ```ignore
//! let queue = QueueBuilder::new("/var/lib/agent/queue").build()?;
//! let (mut writer, mut reader) = queue.split();
//!
//! writer.enqueue(&Record::new("payload").with_label("tenant", "a"))?;
//!
//! while let Some(entry) = reader.next()? {
//!     forward(&entry.record)?;
//!     reader.commit(entry.next)?;
//! }
//! ```
//!
//! Every instance owns its own state; any number of queues over different
//! directories can live in one process.

use std::{sync::Arc, time::Duration};

use crossbeam::{
    atomic::AtomicCell,
    channel::{self, Receiver, Sender},
};
use serde::Serialize;
use tracing::info;

use crate::{
    QueueConfig, Result,
    directory::{SegmentDirectory, SegmentMeta},
    position::{Position, SegmentId},
    reader::Reader,
    recovery::{self, Recovered, RecoveryReport},
    writer::Writer,
};

/// State shared by the writer and the reader of one queue.
pub(crate) struct Shared {
    pub(crate) config:    QueueConfig,
    pub(crate) directory: SegmentDirectory,
    /// End of the last frame the writer published.
    write_position:       AtomicCell<Position>,
    wake_tx:              Sender<()>,
    wake_rx:              Receiver<()>,
}

impl Shared {
    fn new(config: QueueConfig, directory: SegmentDirectory, write_position: Position) -> Self {
        // One pending token is enough to wake the reader.
        let (wake_tx, wake_rx) = channel::bounded(1);
        Self {
            config,
            directory,
            write_position: AtomicCell::new(write_position),
            wake_tx,
            wake_rx,
        }
    }

    pub(crate) fn write_position(&self) -> Position { self.write_position.load() }

    /// Make frames up to `position` visible to the reader and wake it.
    pub(crate) fn publish(&self, position: Position) {
        self.write_position.store(position);
        let _ = self.wake_tx.try_send(());
    }

    /// Wait up to `timeout` for the writer to publish. Returns `false` on
    /// timeout.
    pub(crate) fn wait(&self, timeout: Duration) -> bool { self.wake_rx.recv_timeout(timeout).is_ok() }
}

/// Point-in-time view of a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub write_position: Position,
    pub checkpoint:     Position,
    pub cursor:         Position,
    /// Segments on disk, oldest first.
    pub segments:       Vec<(SegmentId, SegmentMeta)>,
    /// Bytes of all segment files on disk.
    pub total_bytes:    u64,
    /// Bytes of frames not yet committed.
    pub pending_bytes:  u64,
}

/// A durable file-backed queue with one producer and one consumer.
#[derive(Debug)]
pub struct Queue {
    writer: Writer,
    reader: Reader,
    report: RecoveryReport,
}

impl Queue {
    /// Open the queue in `config.dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidConfig`] for an unusable configuration, and the
    /// recovery errors ([`RecoveryFatal`], [`CheckpointCorrupted`],
    /// [`CorruptSegment`], [`UnsupportedSegmentVersion`], I/O) when the
    /// directory cannot be brought back to a consistent state.
    ///
    /// [`InvalidConfig`]: crate::QueueError::InvalidConfig
    /// [`RecoveryFatal`]: crate::QueueError::RecoveryFatal
    /// [`CheckpointCorrupted`]: crate::QueueError::CheckpointCorrupted
    /// [`CorruptSegment`]: crate::QueueError::CorruptSegment
    /// [`UnsupportedSegmentVersion`]: crate::QueueError::UnsupportedSegmentVersion
    pub fn open(config: QueueConfig) -> Result<Self> {
        config.validate()?;

        let Recovered {
            directory,
            active,
            checkpoints,
            read_position,
            write_position,
            report,
        } = recovery::recover(&config)?;

        let dir = config.dir.clone();
        let shared = Arc::new(Shared::new(config, directory, write_position));
        let writer = Writer::new(Arc::clone(&shared), active);
        let reader = Reader::new(shared, checkpoints, read_position);

        info!(
            path = ?dir,
            %write_position,
            %read_position,
            "Queue opened"
        );

        Ok(Self {
            writer,
            reader,
            report,
        })
    }

    /// Separate the two halves so producer and consumer can run on
    /// different threads.
    #[must_use]
    pub fn split(self) -> (Writer, Reader) { (self.writer, self.reader) }

    pub const fn writer(&mut self) -> &mut Writer { &mut self.writer }

    pub const fn reader(&mut self) -> &mut Reader { &mut self.reader }

    /// What recovery found when this queue was opened.
    pub const fn recovery_report(&self) -> &RecoveryReport { &self.report }

    #[must_use]
    pub fn stats(&self) -> QueueStats { self.reader.stats() }

    /// Sync and seal the active segment.
    ///
    /// The committed checkpoint is already durable; records read but not
    /// committed are delivered again by the next open.
    pub fn shutdown(self) -> Result<()> {
        let Self { writer, .. } = self;
        writer.close()?;
        info!("Queue shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::{QueueBuilder, Record, segment::SEGMENT_HEADER_LEN};

    #[test]
    fn test_open_creates_directory_and_first_segment() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("nested").join("queue");

        let queue = QueueBuilder::new(&dir).build().unwrap();
        let stats = queue.stats();

        assert!(dir.join("00000000000000000001.seg").exists());
        assert_eq!(stats.segments.len(), 1);
        assert_eq!(stats.total_bytes, SEGMENT_HEADER_LEN);
        assert_eq!(stats.write_position, stats.checkpoint);
        assert_eq!(stats.pending_bytes, 0);
    }

    #[test]
    fn test_stats_track_pending_bytes() {
        let temp_dir = TempDir::new().unwrap();
        let mut queue = QueueBuilder::new(temp_dir.path()).build().unwrap();

        queue.writer().enqueue(&Record::new("one")).unwrap();
        queue.writer().enqueue(&Record::new("two")).unwrap();
        let pending = queue.stats().pending_bytes;
        assert!(pending > 0);

        let entry = queue.reader().next().unwrap().unwrap();
        queue.reader().commit(entry.next).unwrap();

        let stats = queue.stats();
        assert_eq!(stats.checkpoint, entry.next);
        assert_eq!(stats.pending_bytes, pending - (entry.next.offset - entry.position.offset));
    }

    #[test]
    fn test_independent_instances() {
        let first_dir = TempDir::new().unwrap();
        let second_dir = TempDir::new().unwrap();
        let mut first = QueueBuilder::new(first_dir.path()).build().unwrap();
        let mut second = QueueBuilder::new(second_dir.path()).build().unwrap();

        first.writer().enqueue(&Record::new("first")).unwrap();

        assert!(second.reader().next().unwrap().is_none());
        assert_eq!(
            first.reader().next().unwrap().unwrap().record.data,
            "first"
        );
    }

    #[test]
    fn test_invalid_config_refused() {
        let temp_dir = TempDir::new().unwrap();
        let err = QueueBuilder::new(temp_dir.path())
            .max_segment_size(8)
            .build()
            .unwrap_err();
        assert!(matches!(err, crate::QueueError::InvalidConfig { .. }));
    }

    #[test]
    fn test_shutdown_then_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let mut queue = QueueBuilder::new(temp_dir.path()).build().unwrap();
        queue.writer().enqueue(&Record::new("kept")).unwrap();
        queue.shutdown().unwrap();

        let mut queue = QueueBuilder::new(temp_dir.path()).build().unwrap();
        assert_eq!(queue.recovery_report().frames_found, 1);
        assert_eq!(queue.reader().next().unwrap().unwrap().record.data, "kept");
    }
}
