//! On-disk layout of one WAL entry:
//!
//! ```text
//! | payload len: u32 LE | crc32c: u32 LE | commit ts: u64 LE | payload |
//! ```
//!
//! The checksum covers the commit ts and the payload. Decoding works over the
//! whole log loaded in memory, so a bad length never drives an allocation.

use crc32c::{crc32c, crc32c_append};
use thiserror::Error;

pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024 * 1024;
pub const HEADER_BYTES: usize = 4 + 4 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry<'a> {
    pub commit_ts: u64,
    pub payload: &'a [u8],
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The log ends inside an entry: a write that never completed.
    #[error("torn entry at offset {offset}")]
    Torn { offset: usize },
    #[error("corrupt entry at offset {offset}: {reason}")]
    Corrupt { offset: usize, reason: &'static str },
}

fn checksum(commit_ts: u64, payload: &[u8]) -> u32 {
    crc32c_append(crc32c(&commit_ts.to_le_bytes()), payload)
}

/// Appends one encoded entry to `out`.
pub fn encode_into(out: &mut Vec<u8>, commit_ts: u64, payload: &[u8]) -> Result<(), FrameError> {
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(FrameError::Corrupt {
            offset: out.len(),
            reason: "payload exceeds entry limit",
        });
    }
    let len = payload.len() as u32;
    out.reserve(HEADER_BYTES + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&checksum(commit_ts, payload).to_le_bytes());
    out.extend_from_slice(&commit_ts.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

/// Walks encoded entries in log order, tracking the end of the last intact one.
pub struct Entries<'a> {
    log: &'a [u8],
    offset: usize,
}

impl<'a> Entries<'a> {
    pub fn new(log: &'a [u8]) -> Self {
        Self { log, offset: 0 }
    }

    /// Byte length of the intact prefix decoded so far.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn next_entry(&mut self) -> Result<Option<Entry<'a>>, FrameError> {
        let offset = self.offset;
        let rest = &self.log[offset..];
        if rest.is_empty() {
            return Ok(None);
        }
        let Some((header, body)) = rest.split_first_chunk::<HEADER_BYTES>() else {
            return Err(FrameError::Torn { offset });
        };
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let stored_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&header[8..]);
        let commit_ts = u64::from_le_bytes(ts);
        if len > MAX_PAYLOAD_BYTES {
            return Err(FrameError::Corrupt {
                offset,
                reason: "length exceeds entry limit",
            });
        }
        let Some(payload) = body.get(..len) else {
            return Err(FrameError::Torn { offset });
        };
        if checksum(commit_ts, payload) != stored_crc {
            return Err(FrameError::Corrupt {
                offset,
                reason: "checksum mismatch",
            });
        }
        self.offset = offset + HEADER_BYTES + len;
        Ok(Some(Entry { commit_ts, payload }))
    }
}
