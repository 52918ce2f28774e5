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

//! Record types handed between producers, the queue and the forwarder.
//!
//! - [`Record`]: what a producer enqueues: a label mapping plus an opaque
//!   payload the queue never interprets
//! - [`Entry`]: what the [`Reader`](crate::Reader) yields: the record plus
//!   the positions needed to commit it

use std::collections::HashMap;

use bytes::Bytes;

use crate::position::Position;

/// One queued unit of telemetry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    /// Producer-supplied context such as identifying labels. Keys are unique
    /// and iteration order carries no meaning.
    pub meta: HashMap<String, String>,

    /// The payload, stored and returned byte-for-byte.
    pub data: Bytes,
}

impl Record {
    /// Create a record with no metadata.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            meta: HashMap::new(),
            data: data.into(),
        }
    }

    pub fn with_meta(meta: HashMap<String, String>, data: impl Into<Bytes>) -> Self {
        Self {
            meta,
            data: data.into(),
        }
    }

    /// Add one metadata entry, replacing any previous value for `key`.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn label(&self, key: &str) -> Option<&str> { self.meta.get(key).map(String::as_str) }
}

/// A record read from the queue together with where it lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub record:   Record,
    /// Position of the frame holding this record.
    pub position: Position,
    /// Position just past this record. Committing it acknowledges this entry
    /// and everything before it.
    pub next:     Position,
}
