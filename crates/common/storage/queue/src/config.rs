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

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use snafu::ensure;

use crate::{
    Result,
    codec::{FRAME_OVERHEAD, MIN_BODY_LEN},
    error::InvalidConfigSnafu,
    segment::SEGMENT_HEADER_LEN,
};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SmartDefault)]
#[serde(default)]
pub struct QueueConfig {
    /// Directory holding segment files and the checkpoint.
    #[default(_code = "PathBuf::from(\"./queue_data\")")]
    pub dir:              PathBuf,
    /// Hard cap on a segment file, header included.
    #[default(_code = "64 * MIB")]
    pub max_segment_size: u64,
    /// Largest encoded record accepted by `enqueue`.
    #[default(_code = "16 * MIB")]
    pub max_record_size:  u64,
    /// Cap on the bytes of all segment files together. `None` is unbounded.
    pub max_total_size:   Option<u64>,
    /// Extra rotation triggers on top of the segment size cap.
    pub roll_strategy:    RollStrategy,
    pub flush_mode:       FlushMode,
}

impl QueueConfig {
    pub fn validate(&self) -> Result<()> {
        let smallest_frame = (FRAME_OVERHEAD + MIN_BODY_LEN) as u64;

        ensure!(
            self.max_segment_size >= SEGMENT_HEADER_LEN + smallest_frame,
            InvalidConfigSnafu {
                reason: format!(
                    "max_segment_size {} cannot hold a single frame",
                    self.max_segment_size
                ),
            }
        );
        ensure!(
            self.max_record_size >= smallest_frame
                && self.max_record_size <= self.max_segment_size - SEGMENT_HEADER_LEN,
            InvalidConfigSnafu {
                reason: format!(
                    "max_record_size {} must be between {smallest_frame} and {}",
                    self.max_record_size,
                    self.max_segment_size - SEGMENT_HEADER_LEN
                ),
            }
        );
        if let Some(total) = self.max_total_size {
            // A full, fully committed active segment is never retired, so a
            // rotation needs one more segment of headroom next to it.
            let floor = self.max_segment_size.saturating_mul(2);
            ensure!(
                total >= floor,
                InvalidConfigSnafu {
                    reason: format!(
                        "max_total_size {total} is smaller than two segments ({floor})"
                    ),
                }
            );
        }
        self.roll_strategy.validate()?;
        self.flush_mode.validate()
    }
}

/// When the writer seals the active segment before it is full.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollStrategy {
    BySize(u64),
    ByTime(Duration),
    ByCount(u64),
    Combined(Vec<RollStrategy>),
}

impl Default for RollStrategy {
    fn default() -> Self { Self::BySize(64 * MIB) }
}

impl RollStrategy {
    pub fn should_roll(&self, current_size: u64, elapsed: Duration, count: u64) -> bool {
        match self {
            Self::BySize(size) => current_size >= *size,
            Self::ByTime(duration) => elapsed >= *duration,
            Self::ByCount(max_count) => count >= *max_count,
            Self::Combined(strategies) => strategies
                .iter()
                .any(|s| s.should_roll(current_size, elapsed, count)),
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::BySize(0) | Self::ByCount(0) => InvalidConfigSnafu {
                reason: format!("roll strategy {self:?} would roll on every record"),
            }
            .fail(),
            Self::ByTime(duration) if duration.is_zero() => InvalidConfigSnafu {
                reason: "roll strategy by_time needs a non-zero duration".to_string(),
            }
            .fail(),
            Self::Combined(strategies) => strategies.iter().try_for_each(Self::validate),
            _ => Ok(()),
        }
    }
}

/// When appended frames are forced to stable storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Never fsync on the write path; the OS writes pages back on its own.
    Async,
    /// fsync after every append.
    Sync,
    /// fsync once `records` appends are pending or `interval` has passed.
    Batch { records: u64, interval: Duration },
}

impl Default for FlushMode {
    fn default() -> Self {
        Self::Batch {
            records:  64,
            interval: Duration::from_secs(1),
        }
    }
}

impl FlushMode {
    fn validate(&self) -> Result<()> {
        if let Self::Batch { records: 0, .. } = self {
            return InvalidConfigSnafu {
                reason: "flush mode batch needs records > 0".to_string(),
            }
            .fail();
        }
        Ok(())
    }
}
