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

//! Consumer side of the queue.
//!
//! The [`Reader`] keeps two positions:
//! - the cursor, advanced by [`next`](Reader::next) and kept in memory only
//! - the checkpoint, advanced by [`commit`](Reader::commit) and persisted
//!
//! Everything between the two is delivered again after a restart, which is
//! what makes delivery at-least-once.
//!
//! Reads never go past what the writer has published: a sealed segment is
//! read up to its sealed length and the active segment up to the write
//! position, so a frame being appended is never observed half written.

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use snafu::ensure;
use tracing::{debug, warn};

use crate::{
    Result,
    checkpoint::CheckpointStore,
    error::CommitOutOfRangeSnafu,
    position::{Position, SegmentId},
    queue::{QueueStats, Shared},
    record::Entry,
    segment::{FrameRead, SEGMENT_HEADER_LEN, SegmentReader},
};

/// Reads records in FIFO order and commits delivered ones.
pub struct Reader {
    shared:      Arc<Shared>,
    checkpoints: CheckpointStore,
    /// Start of the first record not yet committed.
    checkpoint:  Position,
    /// Start of the next record `next` returns.
    cursor:      Position,
    /// Ends of the records delivered since the checkpoint, oldest first.
    /// These are the only positions a commit may name.
    delivered:   VecDeque<Position>,
    /// Open handle on the cursor's segment.
    segment:     Option<SegmentReader>,
}

impl Reader {
    pub(crate) fn new(
        shared: Arc<Shared>,
        checkpoints: CheckpointStore,
        checkpoint: Position,
    ) -> Self {
        Self {
            shared,
            checkpoints,
            checkpoint,
            cursor: checkpoint,
            delivered: VecDeque::new(),
            segment: None,
        }
    }

    /// Read the next record and advance the cursor past it.
    ///
    /// Returns `Ok(None)` when the reader has caught up with the writer.
    /// The checkpoint is untouched; call [`commit`](Self::commit) with
    /// [`Entry::next`] once the record has been delivered.
    ///
    /// A frame that fails to decode ends the readable data: it is logged
    /// and `None` is returned with the cursor left on it. Recovery at the
    /// next open truncates the segment there.
    pub fn next(&mut self) -> Result<Option<Entry>> {
        loop {
            let segment = self.cursor.segment;
            let (limit, sealed) = self.read_limit(segment);
            if self.cursor.offset >= limit {
                if !sealed {
                    return Ok(None);
                }
                match self.shared.directory.next_after(segment) {
                    Some(next) => {
                        debug!(from = %segment, to = %next, "Reader moved to next segment");
                        self.move_cursor(Position::new(next, SEGMENT_HEADER_LEN));
                        continue;
                    }
                    None => return Ok(None),
                }
            }

            let offset = self.cursor.offset;
            match self.segment_reader(segment)?.read_frame(offset, limit)? {
                FrameRead::Frame { record, len } => {
                    let position = self.cursor;
                    self.cursor.offset += len;
                    self.delivered.push_back(self.cursor);
                    return Ok(Some(Entry {
                        record,
                        position,
                        next: self.cursor,
                    }));
                }
                FrameRead::End => return Ok(None),
                FrameRead::Corrupt(error) => {
                    warn!(%segment, offset, %error, "Unreadable frame, treating as end of data");
                    return Ok(None);
                }
            }
        }
    }

    /// Like [`next`](Self::next), but waits up to `timeout` for the writer
    /// when the reader has caught up.
    pub fn next_timeout(&mut self, timeout: Duration) -> Result<Option<Entry>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(entry) = self.next()? {
                return Ok(Some(entry));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !self.shared.wait(remaining) {
                return self.next();
            }
        }
    }

    /// Acknowledge every record before `position` as delivered.
    ///
    /// Persists the checkpoint and then deletes segments that lie entirely
    /// before it. Committing the current checkpoint again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CommitOutOfRange`] unless `checkpoint <= position <=
    /// cursor` and `position` is the [`Entry::next`] of a delivered record.
    /// A position inside a frame is never persisted. I/O errors leave the
    /// previous checkpoint in effect.
    ///
    /// [`CommitOutOfRange`]: crate::QueueError::CommitOutOfRange
    pub fn commit(&mut self, position: Position) -> Result<()> {
        let target = self.normalize(position);
        let cursor = self.normalize(self.cursor);
        ensure!(
            self.checkpoint <= target && target <= cursor,
            CommitOutOfRangeSnafu {
                position,
                checkpoint: self.checkpoint,
                cursor: self.cursor,
            }
        );
        if target == self.checkpoint {
            return Ok(());
        }
        let Some(boundary) = self
            .delivered
            .iter()
            .position(|end| self.normalize(*end) == target)
        else {
            return CommitOutOfRangeSnafu {
                position,
                checkpoint: self.checkpoint,
                cursor: self.cursor,
            }
            .fail();
        };

        self.checkpoints.persist(target)?;
        self.checkpoint = target;
        self.delivered.drain(..=boundary);
        if self.cursor < target {
            // The cursor sat at the end of a sealed segment.
            self.move_cursor(target);
        }

        let retired = self.shared.directory.retire_if_fully_consumed(target)?;
        debug!(checkpoint = %target, retired = retired.len(), "Committed");
        Ok(())
    }

    /// Move the cursor back to the checkpoint so uncommitted records are
    /// read again.
    pub fn rewind(&mut self) {
        if self.cursor != self.checkpoint {
            debug!(from = %self.cursor, to = %self.checkpoint, "Rewound reader");
            self.move_cursor(self.checkpoint);
        }
        self.delivered.clear();
    }

    pub const fn checkpoint(&self) -> Position { self.checkpoint }

    pub const fn cursor(&self) -> Position { self.cursor }

    /// Bytes of published frames the cursor has not reached yet.
    pub fn lag_bytes(&self) -> u64 {
        self.shared
            .directory
            .bytes_between(self.cursor, self.shared.write_position())
    }

    pub(crate) fn stats(&self) -> QueueStats {
        let directory = &self.shared.directory;
        let write_position = self.shared.write_position();
        QueueStats {
            write_position,
            checkpoint: self.checkpoint,
            cursor: self.cursor,
            segments: directory.snapshot(),
            total_bytes: directory.total_bytes(),
            pending_bytes: directory.bytes_between(self.checkpoint, write_position),
        }
    }

    /// How far the cursor may read in `segment`, and whether that bound is
    /// final.
    fn read_limit(&self, segment: SegmentId) -> (u64, bool) {
        // Load the write position first: once it names a later segment, this
        // one is guaranteed to be sealed.
        let write_position = self.shared.write_position();
        if let Some(len) = self.shared.directory.sealed_len(segment) {
            return (len, true);
        }
        if write_position.segment == segment {
            (write_position.offset, false)
        } else {
            (SEGMENT_HEADER_LEN, false)
        }
    }

    /// A position at the very end of a sealed segment is the same point as
    /// the start of the following one.
    fn normalize(&self, position: Position) -> Position {
        let directory = &self.shared.directory;
        match directory.sealed_len(position.segment) {
            Some(len) if position.offset >= len => directory
                .next_after(position.segment)
                .map_or(position, |next| Position::new(next, SEGMENT_HEADER_LEN)),
            _ => position,
        }
    }

    fn move_cursor(&mut self, position: Position) {
        if position.segment != self.cursor.segment {
            self.segment = None;
        }
        self.cursor = position;
    }

    fn segment_reader(&mut self, id: SegmentId) -> Result<&mut SegmentReader> {
        match self.segment.take() {
            Some(reader) if reader.id() == id => Ok(self.segment.insert(reader)),
            _ => {
                let path = self.shared.directory.segment_path(id);
                Ok(self.segment.insert(SegmentReader::open(&path)?))
            }
        }
    }
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("checkpoint", &self.checkpoint)
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}
