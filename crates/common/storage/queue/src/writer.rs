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

//! Producer side of the queue.
//!
//! The [`Writer`] owns the active segment. Each `enqueue` call:
//! - Rejects records larger than `max_record_size`
//! - Enforces `max_total_size` before touching the disk
//! - Rotates to a fresh segment when the frame does not fit or the roll
//!   strategy fires
//! - Appends the frame, applies the flush mode and publishes the new write
//!   position to the reader
//!
//! ## Concurrency
//!
//! There is exactly one writer per queue. It never waits on the reader; the
//! only lock it takes is the directory lock during rotation.

use std::{sync::Arc, time::Instant};

use snafu::{ResultExt, ensure};
use tracing::{debug, info, warn};

use crate::{
    FlushMode, Result,
    codec,
    error::{EncodeSnafu, QueueFullSnafu, RecordTooLargeSnafu},
    position::{Position, SegmentId},
    queue::Shared,
    record::Record,
    segment::{SEGMENT_HEADER_LEN, SegmentWriter},
};

/// Appends records to the queue.
pub struct Writer {
    shared:     Arc<Shared>,
    /// The active segment.
    segment:    SegmentWriter,
    /// Appends since the last fsync.
    unflushed:  u64,
    last_flush: Instant,
    closed:     bool,
}

impl Writer {
    pub(crate) fn new(shared: Arc<Shared>, segment: SegmentWriter) -> Self {
        Self {
            shared,
            segment,
            unflushed: 0,
            last_flush: Instant::now(),
            closed: false,
        }
    }

    /// Append one record and return the position it was written at.
    ///
    /// Blocks only on local disk I/O. The record is visible to the reader
    /// when this returns; it is durable once the flush mode has synced it.
    ///
    /// # Errors
    ///
    /// - [`RecordTooLarge`] and [`Encode`] when the record cannot be framed;
    ///   nothing is written.
    /// - [`QueueFull`] when the configured total size would be exceeded.
    /// - [`DiskFull`] and [`Io`] on local storage failures. A partially
    ///   written frame is rolled back and the queue stays usable. When the
    ///   append succeeds but the flush mode's sync fails, the frame is
    ///   removed again: the record was not enqueued and the reader never
    ///   sees it.
    ///
    /// [`RecordTooLarge`]: crate::QueueError::RecordTooLarge
    /// [`Encode`]: crate::QueueError::Encode
    /// [`QueueFull`]: crate::QueueError::QueueFull
    /// [`DiskFull`]: crate::QueueError::DiskFull
    /// [`Io`]: crate::QueueError::Io
    pub fn enqueue(&mut self, record: &Record) -> Result<Position> {
        let config = &self.shared.config;
        let frame_len = codec::size_estimate(record);
        ensure!(
            frame_len <= config.max_record_size,
            RecordTooLargeSnafu {
                size: frame_len,
                max:  config.max_record_size,
            }
        );

        let rotate = self.should_rotate(frame_len);
        let needed = frame_len + if rotate { SEGMENT_HEADER_LEN } else { 0 };
        if let Some(max) = config.max_total_size {
            let current = self.shared.directory.total_bytes();
            ensure!(
                current + needed <= max,
                QueueFullSnafu {
                    current,
                    needed,
                    max
                }
            );
        }

        if rotate {
            self.rotate()?;
        }

        let frame = codec::encode(record).context(EncodeSnafu)?;
        let offset = self.segment.append(&frame)?;
        self.shared.directory.add_bytes(frame.len() as u64);
        self.unflushed += 1;

        if let Err(e) = self.apply_flush_mode() {
            self.undo_append(offset, frame.len() as u64);
            return Err(e);
        }

        self.shared
            .publish(Position::new(self.segment.id(), self.segment.len()));
        Ok(Position::new(self.segment.id(), offset))
    }

    /// Append records one by one. Not atomic: on error, the records before
    /// the failing one stay enqueued.
    pub fn enqueue_batch<'a, I>(&mut self, records: I) -> Result<Vec<Position>>
    where
        I: IntoIterator<Item = &'a Record>,
    {
        records.into_iter().map(|record| self.enqueue(record)).collect()
    }

    /// Force everything appended so far to stable storage.
    pub fn flush(&mut self) -> Result<()> {
        self.segment.flush()?;
        if self.unflushed > 0 {
            debug!(segment = %self.segment.id(), records = self.unflushed, "Flushed segment");
        }
        self.unflushed = 0;
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Flush pending appends whose batch interval has expired.
    ///
    /// Call this periodically when the producer goes idle; `enqueue` only
    /// checks the interval when a record arrives.
    pub fn maybe_flush(&mut self) -> Result<()> {
        if let FlushMode::Batch { interval, .. } = self.shared.config.flush_mode {
            if self.unflushed > 0 && self.last_flush.elapsed() >= interval {
                return self.flush();
            }
        }
        Ok(())
    }

    /// Sync and seal the active segment.
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        self.shared
            .directory
            .seal(self.segment.id(), self.segment.len());
        self.closed = true;
        info!(
            segment = %self.segment.id(),
            len = self.segment.len(),
            "Writer closed"
        );
        Ok(())
    }

    /// Position just past the last appended frame.
    pub fn write_position(&self) -> Position { Position::new(self.segment.id(), self.segment.len()) }

    pub const fn active_segment(&self) -> SegmentId { self.segment.id() }

    fn should_rotate(&self, frame_len: u64) -> bool {
        if self.segment.is_empty() {
            return false;
        }
        !self.segment.fits(frame_len)
            || self.shared.config.roll_strategy.should_roll(
                self.segment.len(),
                self.segment.age(),
                self.segment.record_count(),
            )
    }

    /// Seal the active segment and continue in a new one.
    fn rotate(&mut self) -> Result<()> {
        self.segment.flush()?;
        self.unflushed = 0;
        self.last_flush = Instant::now();

        let sealed = (self.segment.id(), self.segment.len());
        let next = self.shared.directory.allocate_new_active(Some(sealed))?;
        let previous = std::mem::replace(&mut self.segment, next);

        self.shared
            .publish(Position::new(self.segment.id(), self.segment.len()));
        info!(
            sealed = %previous.id(),
            len = previous.len(),
            records = previous.record_count(),
            active = %self.segment.id(),
            "Rotated segment"
        );
        Ok(())
    }

    fn apply_flush_mode(&mut self) -> Result<()> {
        match self.shared.config.flush_mode {
            FlushMode::Sync => self.flush(),
            FlushMode::Async => Ok(()),
            FlushMode::Batch { records, interval } => {
                if self.unflushed >= records || self.last_flush.elapsed() >= interval {
                    self.flush()
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Take back an append that was never published.
    fn undo_append(&mut self, offset: u64, frame_len: u64) {
        if let Err(e) = self.segment.discard_last(offset) {
            warn!(segment = %self.segment.id(), offset, error = %e, "Failed to discard unsynced frame");
        }
        self.shared.directory.sub_bytes(frame_len);
        self.unflushed = self.unflushed.saturating_sub(1);
    }

    #[cfg(test)]
    pub(crate) const fn unflushed(&self) -> u64 { self.unflushed }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if self.closed || self.unflushed == 0 {
            return;
        }
        if let Err(e) = self.segment.flush() {
            warn!(segment = %self.segment.id(), error = %e, "Failed to flush segment on drop");
        }
    }
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("segment", &self.segment.id())
            .field("len", &self.segment.len())
            .field("unflushed", &self.unflushed)
            .finish_non_exhaustive()
    }
}
