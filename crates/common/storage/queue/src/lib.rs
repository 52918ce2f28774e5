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

//! Durable file-backed queue for telemetry records.
//!
//! Producers append [`Record`]s through a [`Writer`]; a forwarder drains them
//! through a [`Reader`] and commits each record once the remote end has
//! acknowledged it. Records live in append-only segment files under one
//! directory, and the committed read position survives restarts, so
//! acknowledged records are never lost and unacknowledged ones are delivered
//! again.
//!
//! ## On-disk layout
//!
//! ```text
//! queue_data/
//! ├── 00000000000000000007.seg   sealed
//! ├── 00000000000000000008.seg   active
//! ├── checkpoint.1
//! └── checkpoint.2
//! ```

mod builder;
mod checkpoint;
pub mod codec;
mod config;
mod directory;
mod error;
mod inspect;
mod path;
mod position;
mod queue;
mod reader;
mod record;
mod recovery;
pub mod segment;
mod writer;

pub use builder::QueueBuilder;
pub use config::{FlushMode, QueueConfig, RollStrategy};
pub use directory::{SegmentMeta, SegmentState};
pub use error::{QueueError, Result};
pub use inspect::{Corruption, QueueReport, SegmentReport, inspect};
pub use position::{Position, SegmentId};
pub use queue::{Queue, QueueStats};
pub use reader::Reader;
pub use record::{Entry, Record};
pub use recovery::RecoveryReport;
pub use writer::Writer;
