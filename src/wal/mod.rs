pub mod frame;

use crate::error::{ShiftError, decode_err, encode_err};
use crate::wal::frame::{Entries, FrameError, encode_into};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const WAL_FILE_NAME: &str = "shiftdb.wal";

/// One committed write batch. `None` values are deletions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub writes: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub frames: u64,
    pub last_commit_ts: u64,
    pub truncated_tail: bool,
}

/// Append-only log file; each commit is encoded into `buf` and written with
/// a single `write_all`.
pub struct WalWriter {
    file: File,
    buf: Vec<u8>,
    sync: bool,
}

impl WalWriter {
    pub fn open(dir: &Path, sync: bool) -> Result<Self, ShiftError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(wal_path(dir))?;
        Ok(Self {
            file,
            buf: Vec::new(),
            sync,
        })
    }

    pub fn append(&mut self, commit_ts: u64, record: &CommitRecord) -> Result<(), ShiftError> {
        let payload = rmp_serde::to_vec(record).map_err(encode_err)?;
        self.buf.clear();
        encode_into(&mut self.buf, commit_ts, &payload).map_err(frame_err)?;
        self.file.write_all(&self.buf)?;
        if self.sync {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

pub fn wal_path(dir: &Path) -> PathBuf {
    dir.join(WAL_FILE_NAME)
}

/// Replays every intact entry in commit order. A torn final entry is cut off
/// so later appends start on an entry boundary; corruption anywhere else fails.
pub fn replay(
    dir: &Path,
    mut apply: impl FnMut(u64, CommitRecord),
) -> Result<ReplaySummary, ShiftError> {
    let path = wal_path(dir);
    let mut summary = ReplaySummary::default();
    if !path.exists() {
        return Ok(summary);
    }
    let log = std::fs::read(&path)?;
    let mut entries = Entries::new(&log);
    loop {
        match entries.next_entry() {
            Ok(Some(entry)) => {
                let record: CommitRecord =
                    rmp_serde::from_slice(entry.payload).map_err(decode_err)?;
                summary.frames += 1;
                summary.last_commit_ts = entry.commit_ts;
                apply(entry.commit_ts, record);
            }
            Ok(None) => break,
            Err(FrameError::Torn { offset }) => {
                warn!(
                    path = %path.display(),
                    offset,
                    dropped_bytes = log.len() - offset,
                    "wal tail torn; discarding partial entry"
                );
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(offset as u64)?;
                file.sync_data()?;
                summary.truncated_tail = true;
                break;
            }
            Err(e) => return Err(frame_err(e)),
        }
    }
    info!(
        frames = summary.frames,
        last_commit_ts = summary.last_commit_ts,
        "wal replay complete"
    );
    Ok(summary)
}

fn frame_err(e: FrameError) -> ShiftError {
    ShiftError::Corruption {
        message: e.to_string(),
    }
}
