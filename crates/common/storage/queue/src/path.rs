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

use std::path::{Path, PathBuf};

use snafu::ResultExt;

use crate::{Result, error::IoSnafu, position::SegmentId};

/// Extension of segment files.
pub const SEGMENT_EXTENSION: &str = "seg";

/// Generates a segment file name: `NNNNNNNNNNNNNNNNNNNN.seg`.
///
/// Zero padding keeps lexical and numeric order identical.
pub fn segment_file_name(id: SegmentId) -> String { format!("{:020}.{SEGMENT_EXTENSION}", id.get()) }

/// Returns the full path of a segment inside the queue directory.
pub fn segment_path<P: AsRef<Path>>(dir: P, id: SegmentId) -> PathBuf {
    dir.as_ref().join(segment_file_name(id))
}

/// Extracts the segment id from a segment file path, if it is one.
pub fn parse_segment_id(path: &Path) -> Option<SegmentId> {
    if path.extension().and_then(|s| s.to_str()) != Some(SEGMENT_EXTENSION) {
        return None;
    }
    let stem = path.file_stem().and_then(|s| s.to_str())?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok().map(SegmentId)
}

/// Files found in a queue directory.
#[derive(Debug, Default)]
pub struct DirListing {
    /// Segment files sorted by id.
    pub segments: Vec<(SegmentId, PathBuf)>,
    /// Entries that are neither segments nor accepted by the caller.
    pub unknown:  Vec<PathBuf>,
}

/// Lists segment files in `dir`, sorted by id.
///
/// `is_known` lets the caller claim non-segment files (such as checkpoint
/// slots) so they are not reported as unknown.
pub fn scan_segments(dir: &Path, is_known: impl Fn(&Path) -> bool) -> Result<DirListing> {
    let mut listing = DirListing::default();
    if !dir.exists() {
        return Ok(listing);
    }

    for entry in std::fs::read_dir(dir).context(IoSnafu { path: dir })? {
        let path = entry.context(IoSnafu { path: dir })?.path();
        if path.is_dir() {
            listing.unknown.push(path);
        } else if let Some(id) = parse_segment_id(&path) {
            listing.segments.push((id, path));
        } else if !is_known(&path) {
            listing.unknown.push(path);
        }
    }

    listing.segments.sort_by_key(|(id, _)| *id);
    Ok(listing)
}

/// Makes creations, renames and deletions inside `dir` durable.
#[cfg(unix)]
pub fn sync_dir(dir: &Path) -> Result<()> {
    std::fs::File::open(dir)
        .and_then(|f| f.sync_all())
        .context(IoSnafu { path: dir })
}

/// Directory handles cannot be synced on this platform.
#[cfg(not(unix))]
pub fn sync_dir(_dir: &Path) -> Result<()> { Ok(()) }
