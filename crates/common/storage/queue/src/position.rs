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

//! Segment identifiers and byte positions inside the queue.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a segment file.
///
/// Ids are allocated in strictly increasing order and never reused, so the
/// id alone orders segments.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SegmentId(pub u64);

impl SegmentId {
    /// The id given to the first segment of a fresh queue.
    pub const FIRST: Self = Self(1);

    #[must_use]
    pub const fn get(self) -> u64 { self.0 }

    #[must_use]
    pub const fn next(self) -> Self { Self(self.0 + 1) }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

impl From<u64> for SegmentId {
    fn from(value: u64) -> Self { Self(value) }
}

/// A byte position in the queue: a segment and an offset inside its file.
///
/// Positions order first by segment, then by offset, which matches the
/// order records were appended in.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Position {
    pub segment: SegmentId,
    pub offset:  u64,
}

impl Position {
    #[must_use]
    pub const fn new(segment: SegmentId, offset: u64) -> Self { Self { segment, offset } }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.segment, self.offset)
    }
}
