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

//! The ordered set of segments shared by the writer and the reader.
//!
//! The directory is populated once by recovery and afterwards changes only
//! through explicit calls: the writer allocates and seals, the reader
//! retires. Its mutex is the only lock the two sides share, and it is held
//! for bookkeeping plus at most one file creation or deletion.

use std::{
    collections::BTreeMap,
    io,
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;
use serde::Serialize;
use snafu::ResultExt;
use tracing::{debug, info};

use crate::{
    Result,
    error::IoSnafu,
    path::{segment_path, sync_dir},
    position::{Position, SegmentId},
    segment::{SEGMENT_HEADER_LEN, SegmentWriter},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    /// Receiving appends. At most one segment is active.
    Active,
    /// Fixed length, read only.
    Sealed,
    /// Fully consumed and being deleted.
    Retired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SegmentMeta {
    pub state: SegmentState,
    /// File length. Exact once sealed; for the active segment, the length
    /// when it was registered, since its growth is tracked by the write
    /// position instead.
    pub len:   u64,
}

impl SegmentMeta {
    pub const fn active(len: u64) -> Self {
        Self {
            state: SegmentState::Active,
            len,
        }
    }

    pub const fn sealed(len: u64) -> Self {
        Self {
            state: SegmentState::Sealed,
            len,
        }
    }
}

#[derive(Debug)]
struct DirectoryState {
    segments: BTreeMap<SegmentId, SegmentMeta>,
    next_id:  SegmentId,
}

#[derive(Debug)]
pub struct SegmentDirectory {
    dir:              PathBuf,
    max_segment_size: u64,
    state:            Mutex<DirectoryState>,
    /// Bytes of all segment files on disk, the active tail included.
    total_bytes:      AtomicU64,
}

impl SegmentDirectory {
    /// An empty directory. Recovery registers what it finds on disk.
    pub(crate) fn new(dir: PathBuf, max_segment_size: u64) -> Self {
        Self {
            dir,
            max_segment_size,
            state: Mutex::new(DirectoryState {
                segments: BTreeMap::new(),
                next_id:  SegmentId::FIRST,
            }),
            total_bytes: AtomicU64::new(0),
        }
    }

    pub fn segment_path(&self, id: SegmentId) -> PathBuf { segment_path(&self.dir, id) }

    /// Track a segment that already exists on disk.
    pub fn register(&self, id: SegmentId, meta: SegmentMeta) {
        let mut state = self.state.lock();
        if let Some(previous) = state.segments.insert(id, meta) {
            self.sub_bytes(previous.len);
        }
        if state.next_id <= id {
            state.next_id = id.next();
        }
        self.add_bytes(meta.len);
    }

    /// Create the next segment and make it the active one.
    ///
    /// `sealing` names the outgoing active segment and its final length. It
    /// is sealed in the same critical section that publishes the new
    /// segment, so a reader never sees two active segments.
    pub fn allocate_new_active(&self, sealing: Option<(SegmentId, u64)>) -> Result<SegmentWriter> {
        let mut state = self.state.lock();
        let id = state.next_id;
        let writer = SegmentWriter::create(&self.dir, id, self.max_segment_size)?;

        if let Some((sealed, len)) = sealing {
            if let Some(meta) = state.segments.get_mut(&sealed) {
                *meta = SegmentMeta::sealed(len);
            }
        }
        state.segments.insert(id, SegmentMeta::active(SEGMENT_HEADER_LEN));
        state.next_id = id.next();
        self.add_bytes(SEGMENT_HEADER_LEN);

        debug!(segment = %id, "Allocated active segment");
        Ok(writer)
    }

    /// Fix the length of a segment that will receive no more appends.
    pub fn seal(&self, id: SegmentId, len: u64) {
        if let Some(meta) = self.state.lock().segments.get_mut(&id) {
            *meta = SegmentMeta::sealed(len);
        }
    }

    /// Length of `id` if it is sealed.
    pub fn sealed_len(&self, id: SegmentId) -> Option<u64> {
        self.state
            .lock()
            .segments
            .get(&id)
            .filter(|meta| meta.state == SegmentState::Sealed)
            .map(|meta| meta.len)
    }

    /// The first live segment after `id`.
    pub fn next_after(&self, id: SegmentId) -> Option<SegmentId> {
        self.state
            .lock()
            .segments
            .range(id.next()..)
            .find(|(_, meta)| meta.state != SegmentState::Retired)
            .map(|(id, _)| *id)
    }

    /// Delete one sealed segment and make the deletion durable.
    ///
    /// Active segments and unknown ids are left alone. Returns whether a
    /// segment was removed.
    pub fn retire(&self, id: SegmentId) -> Result<bool> {
        let mut state = self.state.lock();
        let Some(meta) = state.segments.get_mut(&id) else {
            return Ok(false);
        };
        if meta.state != SegmentState::Sealed {
            return Ok(false);
        }
        meta.state = SegmentState::Retired;
        let len = meta.len;

        let path = segment_path(&self.dir, id);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                if let Some(meta) = state.segments.get_mut(&id) {
                    meta.state = SegmentState::Sealed;
                }
                return Err(e).context(IoSnafu { path });
            }
        }
        state.segments.remove(&id);
        drop(state);

        self.sub_bytes(len);
        sync_dir(&self.dir)?;
        debug!(segment = %id, len, "Deleted segment");
        Ok(true)
    }

    /// Delete every sealed segment strictly before the checkpoint's segment.
    ///
    /// The caller must already have persisted `checkpoint`.
    pub fn retire_if_fully_consumed(&self, checkpoint: Position) -> Result<Vec<SegmentId>> {
        let consumed: Vec<SegmentId> = self
            .state
            .lock()
            .segments
            .range(..checkpoint.segment)
            .filter(|(_, meta)| meta.state == SegmentState::Sealed)
            .map(|(id, _)| *id)
            .collect();

        let mut retired = Vec::with_capacity(consumed.len());
        for id in consumed {
            if self.retire(id)? {
                retired.push(id);
            }
        }
        if !retired.is_empty() {
            info!(
                segments = ?retired,
                total_bytes = self.total_bytes(),
                "Retired consumed segments"
            );
        }
        Ok(retired)
    }

    /// Bytes of frames between two positions, `from` inclusive.
    pub fn bytes_between(&self, from: Position, to: Position) -> u64 {
        if to <= from {
            return 0;
        }
        let state = self.state.lock();
        state
            .segments
            .range(from.segment..=to.segment)
            .map(|(id, meta)| {
                let start = if *id == from.segment { from.offset } else { SEGMENT_HEADER_LEN };
                let end = if *id == to.segment { to.offset } else { meta.len };
                end.saturating_sub(start)
            })
            .sum()
    }

    pub(crate) fn add_bytes(&self, n: u64) { self.total_bytes.fetch_add(n, Ordering::AcqRel); }

    pub(crate) fn sub_bytes(&self, n: u64) {
        let _ = self
            .total_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(n)));
    }

    /// Bytes of all segment files on disk.
    pub fn total_bytes(&self) -> u64 { self.total_bytes.load(Ordering::Acquire) }

    /// Copy of the segment map, oldest first.
    pub fn snapshot(&self) -> Vec<(SegmentId, SegmentMeta)> {
        self.state
            .lock()
            .segments
            .iter()
            .map(|(id, meta)| (*id, *meta))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::{codec::encode, record::Record};

    fn empty_directory(temp_dir: &TempDir) -> SegmentDirectory {
        SegmentDirectory::new(temp_dir.path().to_path_buf(), 4096)
    }

    #[test]
    fn test_allocate_assigns_increasing_ids() {
        let temp_dir = TempDir::new().unwrap();
        let directory = empty_directory(&temp_dir);

        let first = directory.allocate_new_active(None).unwrap();
        let second = directory
            .allocate_new_active(Some((first.id(), first.len())))
            .unwrap();

        assert_eq!(first.id(), SegmentId(1));
        assert_eq!(second.id(), SegmentId(2));
        assert_eq!(directory.sealed_len(first.id()), Some(SEGMENT_HEADER_LEN));
        assert_eq!(directory.sealed_len(second.id()), None);
        assert_eq!(directory.total_bytes(), 2 * SEGMENT_HEADER_LEN);
    }

    #[test]
    fn test_ids_never_reused_after_retirement() {
        let temp_dir = TempDir::new().unwrap();
        let directory = empty_directory(&temp_dir);

        let first = directory.allocate_new_active(None).unwrap();
        let second = directory
            .allocate_new_active(Some((first.id(), first.len())))
            .unwrap();
        directory.retire(first.id()).unwrap();

        let third = directory
            .allocate_new_active(Some((second.id(), second.len())))
            .unwrap();
        assert_eq!(third.id(), SegmentId(3));
        let ids: Vec<SegmentId> = directory.snapshot().iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![SegmentId(2), SegmentId(3)]);
    }

    #[test]
    fn test_allocation_continues_after_highest_registered_id() {
        let temp_dir = TempDir::new().unwrap();
        let directory = empty_directory(&temp_dir);
        directory.register(SegmentId(4), SegmentMeta::sealed(100));
        directory.register(SegmentId(9), SegmentMeta::active(60));

        assert_eq!(directory.total_bytes(), 160);
        assert_eq!(directory.next_after(SegmentId(4)), Some(SegmentId(9)));
        assert_eq!(directory.next_after(SegmentId(9)), None);

        let writer = directory.allocate_new_active(Some((SegmentId(9), 60))).unwrap();
        assert_eq!(writer.id(), SegmentId(10));
        assert_eq!(directory.sealed_len(SegmentId(9)), Some(60));
    }

    #[test]
    fn test_register_tracks_existing_segment() {
        let temp_dir = TempDir::new().unwrap();
        let directory = empty_directory(&temp_dir);

        directory.register(SegmentId(5), SegmentMeta::sealed(500));
        assert_eq!(directory.sealed_len(SegmentId(5)), Some(500));
        assert_eq!(directory.total_bytes(), 500);

        let writer = directory.allocate_new_active(None).unwrap();
        assert_eq!(writer.id(), SegmentId(6));
    }

    #[test]
    fn test_retire_if_fully_consumed_deletes_only_older_sealed() {
        let temp_dir = TempDir::new().unwrap();
        let directory = empty_directory(&temp_dir);

        let mut active = directory.allocate_new_active(None).unwrap();
        for _ in 0..3 {
            let frame = encode(&Record::new("x")).unwrap();
            active.append(&frame).unwrap();
            directory.add_bytes(frame.len() as u64);
            active = directory
                .allocate_new_active(Some((active.id(), active.len())))
                .unwrap();
        }
        // Segments 1..=3 sealed, 4 active.
        let retired = directory
            .retire_if_fully_consumed(Position::new(SegmentId(3), SEGMENT_HEADER_LEN))
            .unwrap();

        assert_eq!(retired, vec![SegmentId(1), SegmentId(2)]);
        assert!(!directory.segment_path(SegmentId(1)).exists());
        assert!(!directory.segment_path(SegmentId(2)).exists());
        assert!(directory.segment_path(SegmentId(3)).exists());
        let ids: Vec<SegmentId> = directory.snapshot().iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![SegmentId(3), SegmentId(4)]);
        assert_eq!(directory.total_bytes(), directory.sealed_len(SegmentId(3)).unwrap() + SEGMENT_HEADER_LEN);

        // The active segment is never retired, even when the position is past it.
        let retired = directory
            .retire_if_fully_consumed(Position::new(SegmentId(9), SEGMENT_HEADER_LEN))
            .unwrap();
        assert_eq!(retired, vec![SegmentId(3)]);
        assert!(directory.segment_path(active.id()).exists());
    }

    #[test]
    fn test_bytes_between_spans_segments() {
        let temp_dir = TempDir::new().unwrap();
        let directory = empty_directory(&temp_dir);
        directory.register(SegmentId(1), SegmentMeta::sealed(116));
        directory.register(SegmentId(2), SegmentMeta::sealed(216));
        directory.register(SegmentId(3), SegmentMeta::active(SEGMENT_HEADER_LEN));

        let from = Position::new(SegmentId(1), 66);
        let to = Position::new(SegmentId(3), 26);
        assert_eq!(directory.bytes_between(from, to), 50 + 200 + 10);
        assert_eq!(directory.bytes_between(to, from), 0);
    }
}
