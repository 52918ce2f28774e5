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

#![allow(clippy::cast_possible_truncation)]

//! Frame encoding for queued records.
//!
//! ## On-Disk Frame Format (version 1)
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────────────┬─────────────┐
//! │ body_len (4B)│ body (body_len bytes)                    │ CRC32 (4B)  │
//! │ little-endian│                                          │ little-end. │
//! └──────────────┴──────────────────────────────────────────┴─────────────┘
//!
//! body:
//! ┌─────────┬────────────────┬─────────────────────────────┬───────────────┐
//! │ ver (1B)│ meta_count (4B)│ meta_count × (klen k vlen v)│ dlen (4B) data│
//! └─────────┴────────────────┴─────────────────────────────┴───────────────┘
//! ```
//!
//! - **body_len** lets a scanner skip to the next frame without parsing
//! - **CRC32** covers the length prefix and the body
//! - **ver** is checked after the checksum, so a frame from another format
//!   version is reported as such rather than as corruption
//!
//! All integers are little-endian `u32` apart from the version byte; string
//! lengths are byte lengths of UTF-8 text.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc32fast::Hasher;
use snafu::{OptionExt, Snafu, ensure};

use crate::record::Record;

/// Size of the length prefix in bytes.
pub const FRAME_LENGTH_SIZE: usize = 4;

/// Size of the trailing CRC32 in bytes.
pub const FRAME_CRC_SIZE: usize = 4;

/// Bytes a frame adds around its body.
pub const FRAME_OVERHEAD: usize = FRAME_LENGTH_SIZE + FRAME_CRC_SIZE;

/// Frame format written by this build.
pub const FRAME_VERSION: u8 = 1;

/// Smallest valid body: version, meta count and data length.
pub const MIN_BODY_LEN: usize = 1 + 4 + 4;

/// Errors raised while framing a record.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EncodeError {
    #[snafu(display("Frame body of {len} bytes does not fit a 32-bit length"))]
    TooLarge { len: u64 },
}

/// Why a byte range is not a valid frame.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FrameError {
    /// Fewer bytes are present than the prefix or the declared length needs.
    #[snafu(display("Truncated frame: need {needed} bytes, have {available}"))]
    Truncated { needed: u64, available: u64 },

    #[snafu(display("Checksum mismatch: stored {expected:#010x}, computed {actual:#010x}"))]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[snafu(display("Unsupported frame version {version}"))]
    UnsupportedVersion { version: u8 },

    /// Checksum-valid bytes that do not describe a record.
    #[snafu(display("Malformed frame: {reason}"))]
    Malformed { reason: String },
}

impl FrameError {
    /// A truncated frame is what an interrupted append leaves behind.
    #[must_use]
    pub const fn is_truncation(&self) -> bool { matches!(self, Self::Truncated { .. }) }
}

/// Exact encoded length of `record` for the current format version.
///
/// Integers are fixed width, so this is both a fast upper bound and the
/// real size; it never allocates.
#[must_use]
pub fn size_estimate(record: &Record) -> u64 {
    let meta: usize = record
        .meta
        .iter()
        .map(|(key, value)| 4 + key.len() + 4 + value.len())
        .sum();
    (FRAME_OVERHEAD + MIN_BODY_LEN + meta + record.data.len()) as u64
}

/// Encode `record` into one self-describing frame.
pub fn encode(record: &Record) -> Result<Bytes, EncodeError> {
    let total = size_estimate(record);
    let body_len = total - FRAME_OVERHEAD as u64;
    // Every inner length and the meta count are smaller than the body.
    ensure!(
        u32::try_from(body_len).is_ok() && usize::try_from(total).is_ok(),
        TooLargeSnafu { len: body_len }
    );

    let mut buf = BytesMut::with_capacity(total as usize);
    buf.put_u32_le(body_len as u32);
    buf.put_u8(FRAME_VERSION);
    buf.put_u32_le(record.meta.len() as u32);
    for (key, value) in &record.meta {
        put_chunk(&mut buf, key.as_bytes());
        put_chunk(&mut buf, value.as_bytes());
    }
    put_chunk(&mut buf, &record.data);

    let crc = frame_checksum(body_len as u32, &buf[FRAME_LENGTH_SIZE..]);
    buf.put_u32_le(crc);

    debug_assert_eq!(buf.len() as u64, total);
    Ok(buf.freeze())
}

/// Decode the frame at the start of `buf`.
///
/// Returns the record and the number of bytes the frame occupies. Bytes past
/// the frame are ignored.
pub fn decode(buf: &[u8]) -> Result<(Record, usize), FrameError> {
    ensure!(
        buf.len() >= FRAME_LENGTH_SIZE,
        TruncatedSnafu {
            needed:    FRAME_LENGTH_SIZE as u64,
            available: buf.len() as u64,
        }
    );

    let body_len = (&buf[..FRAME_LENGTH_SIZE]).get_u32_le();
    ensure!(
        body_len as usize >= MIN_BODY_LEN,
        MalformedSnafu {
            reason: format!("body length {body_len} below minimum {MIN_BODY_LEN}"),
        }
    );

    let body_end = FRAME_LENGTH_SIZE + body_len as usize;
    let total = body_end + FRAME_CRC_SIZE;
    ensure!(
        buf.len() >= total,
        TruncatedSnafu {
            needed:    total as u64,
            available: buf.len() as u64,
        }
    );

    let body = &buf[FRAME_LENGTH_SIZE..body_end];
    let stored = (&buf[body_end..total]).get_u32_le();
    let actual = frame_checksum(body_len, body);
    ensure!(
        stored == actual,
        ChecksumMismatchSnafu {
            expected: stored,
            actual,
        }
    );

    Ok((decode_body(body)?, total))
}

fn decode_body(mut body: &[u8]) -> Result<Record, FrameError> {
    let version = body.get_u8();
    ensure!(version == FRAME_VERSION, UnsupportedVersionSnafu { version });

    let meta_count = body.get_u32_le() as usize;
    // Each entry needs at least its two length prefixes.
    ensure!(
        meta_count <= body.remaining() / 8,
        MalformedSnafu {
            reason: format!("meta count {meta_count} exceeds body"),
        }
    );

    let mut meta = HashMap::with_capacity(meta_count);
    for _ in 0..meta_count {
        let key = take_str(&mut body, "meta key")?;
        let value = take_str(&mut body, "meta value")?;
        if meta.contains_key(&key) {
            return MalformedSnafu {
                reason: format!("duplicate meta key {key:?}"),
            }
            .fail();
        }
        meta.insert(key, value);
    }

    let data = Bytes::copy_from_slice(take_chunk(&mut body, "data")?);
    ensure!(
        body.is_empty(),
        MalformedSnafu {
            reason: format!("{} trailing bytes in body", body.len()),
        }
    );

    Ok(Record { meta, data })
}

/// CRC-32 over the little-endian length prefix followed by the body, so a
/// damaged prefix is caught like a damaged body.
fn frame_checksum(body_len: u32, body: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&body_len.to_le_bytes());
    hasher.update(body);
    hasher.finalize()
}

fn put_chunk(buf: &mut BytesMut, chunk: &[u8]) {
    buf.put_u32_le(chunk.len() as u32);
    buf.put_slice(chunk);
}

fn take_chunk<'a>(body: &mut &'a [u8], what: &str) -> Result<&'a [u8], FrameError> {
    ensure!(
        body.remaining() >= 4,
        MalformedSnafu {
            reason: format!("missing {what} length"),
        }
    );
    let len = body.get_u32_le() as usize;
    let rest: &'a [u8] = *body;
    let chunk = rest.get(..len).context(MalformedSnafu {
        reason: format!("{what} length {len} exceeds body"),
    })?;
    *body = &rest[len..];
    Ok(chunk)
}

fn take_str(body: &mut &[u8], what: &str) -> Result<String, FrameError> {
    let chunk = take_chunk(body, what)?;
    String::from_utf8(chunk.to_vec()).map_err(|_| FrameError::Malformed {
        reason: format!("{what} is not valid UTF-8"),
    })
}
