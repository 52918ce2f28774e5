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

//! Persisted read position using a dual-slot strategy.
//!
//! Two slot files are written alternately and every slot carries a
//! generation number and a checksum, so at any crash point at least one
//! slot holds the previous complete checkpoint.

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use snafu::{ResultExt, ensure};
use tracing::{debug, warn};

use crate::{
    Result,
    error::{CheckpointCorruptedSnafu, IoSnafu, write_error},
    path::sync_dir,
    position::{Position, SegmentId},
};

const CHECKPOINT_1: &str = "checkpoint.1";
const CHECKPOINT_2: &str = "checkpoint.2";

const CHECKPOINT_MAGIC: [u8; 4] = *b"SPCK";
const CHECKPOINT_VERSION: u32 = 1;
const CHECKPOINT_LEN: usize = 36;

/// A checkpoint as stored in one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    /// Increases by one on every write; the higher valid generation wins.
    pub generation: u64,
    pub position:   Position,
}

impl Checkpoint {
    fn serialize(&self) -> [u8; CHECKPOINT_LEN] {
        let mut buf = [0u8; CHECKPOINT_LEN];
        buf[0..4].copy_from_slice(&CHECKPOINT_MAGIC);
        buf[4..8].copy_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.generation.to_le_bytes());
        buf[16..24].copy_from_slice(&self.position.segment.get().to_le_bytes());
        buf[24..32].copy_from_slice(&self.position.offset.to_le_bytes());
        let crc = crc32fast::hash(&buf[..32]);
        buf[32..36].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn deserialize(data: &[u8]) -> std::result::Result<Self, String> {
        if data.len() != CHECKPOINT_LEN {
            return Err(format!("expected {CHECKPOINT_LEN} bytes, found {}", data.len()));
        }
        if data[0..4] != CHECKPOINT_MAGIC {
            return Err("bad magic".to_string());
        }

        let u32_at = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let u64_at = |at: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[at..at + 8]);
            u64::from_le_bytes(bytes)
        };

        let stored = u32_at(32);
        let actual = crc32fast::hash(&data[..32]);
        if stored != actual {
            return Err(format!("checksum mismatch: stored {stored:#010x}, computed {actual:#010x}"));
        }
        let version = u32_at(4);
        if version != CHECKPOINT_VERSION {
            return Err(format!("unsupported version {version}"));
        }

        Ok(Self {
            generation: u64_at(8),
            position:   Position::new(SegmentId(u64_at(16)), u64_at(24)),
        })
    }
}

/// Whether `path` is one of the checkpoint slot files.
pub fn is_checkpoint_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name == CHECKPOINT_1 || name == CHECKPOINT_2)
}

/// Reads and writes the checkpoint slots of one queue directory.
#[derive(Debug)]
pub(crate) struct CheckpointStore {
    dir:    PathBuf,
    latest: Option<Checkpoint>,
}

impl CheckpointStore {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let latest = load(&dir)?;
        Ok(Self { dir, latest })
    }

    /// The last checkpoint written or loaded.
    pub fn current(&self) -> Option<Position> { self.latest.map(|cp| cp.position) }

    /// Durably record `position` in the slot not holding the latest
    /// checkpoint.
    pub fn persist(&mut self, position: Position) -> Result<Checkpoint> {
        let checkpoint = Checkpoint {
            generation: self.latest.map_or(1, |cp| cp.generation + 1),
            position,
        };
        let path = slot_path(&self.dir, checkpoint.generation);
        let created = !path.exists();

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| write_error(&path, e))?;
        file.write_all(&checkpoint.serialize())
            .and_then(|()| file.sync_all())
            .map_err(|e| write_error(&path, e))?;
        if created {
            sync_dir(&self.dir)?;
        }

        self.latest = Some(checkpoint);
        debug!(generation = checkpoint.generation, %position, path = ?path, "Checkpoint written");
        Ok(checkpoint)
    }
}

/// Odd generations go to slot 1, even ones to slot 2.
fn slot_path(dir: &Path, generation: u64) -> PathBuf {
    if generation % 2 == 1 {
        dir.join(CHECKPOINT_1)
    } else {
        dir.join(CHECKPOINT_2)
    }
}

/// Load the newest valid checkpoint in `dir`.
///
/// Returns `None` when neither slot exists. A single damaged slot is skipped
/// with a warning; two damaged slots are [`CheckpointCorrupted`].
///
/// [`CheckpointCorrupted`]: crate::QueueError::CheckpointCorrupted
pub fn load(dir: &Path) -> Result<Option<Checkpoint>> {
    let mut present = 0;
    let mut failures = Vec::new();
    let mut best: Option<Checkpoint> = None;

    for name in [CHECKPOINT_1, CHECKPOINT_2] {
        let path = dir.join(name);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).context(IoSnafu { path: &path }),
        };
        present += 1;

        match Checkpoint::deserialize(&data) {
            Ok(cp) => {
                if best.is_none_or(|b| cp.generation > b.generation) {
                    best = Some(cp);
                }
            }
            Err(reason) => {
                warn!(path = ?path, %reason, "Ignoring damaged checkpoint slot");
                failures.push(format!("{name}: {reason}"));
            }
        }
    }

    ensure!(
        present == 0 || best.is_some(),
        CheckpointCorruptedSnafu {
            reason: failures.join("; "),
        }
    );
    Ok(best)
}
