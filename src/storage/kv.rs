use crate::error::ShiftError;
use crate::storage::oracle::{LocalOracle, Timestamp, TimestampOracle};
use crate::wal::{self, CommitRecord, WalWriter};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    Put(Vec<u8>),
    Delete,
}

/// Transactional key-value store with snapshot reads.
///
/// `commit` applies a write batch atomically and fails with
/// [`ShiftError::Conflict`] if any written key was committed by someone else
/// after `start_ts`.
pub trait KvStore: Send + Sync {
    fn current_ts(&self) -> Timestamp;

    fn get(&self, key: &[u8], ts: Timestamp) -> Result<Option<Vec<u8>>, ShiftError>;

    /// Keys in `[start, end)` visible at `ts`, ascending. An empty `end` is unbounded.
    fn scan(
        &self,
        start: &[u8],
        end: &[u8],
        ts: Timestamp,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ShiftError>;

    fn commit(
        &self,
        start_ts: Timestamp,
        writes: Vec<(Vec<u8>, Mutation)>,
    ) -> Result<Timestamp, ShiftError>;
}

#[derive(Debug, Clone)]
struct Version {
    commit_ts: Timestamp,
    value: Option<Vec<u8>>,
}

type VersionMap = BTreeMap<Vec<u8>, Vec<Version>>;

/// Multi-version in-memory store, optionally backed by a write-ahead log.
pub struct MemKvStore {
    oracle: Arc<dyn TimestampOracle>,
    data: RwLock<VersionMap>,
    wal: Option<Mutex<WalWriter>>,
}

impl MemKvStore {
    pub fn new() -> Self {
        Self::with_oracle(Arc::new(LocalOracle::new()))
    }

    pub fn with_oracle(oracle: Arc<dyn TimestampOracle>) -> Self {
        Self {
            oracle,
            data: RwLock::new(BTreeMap::new()),
            wal: None,
        }
    }

    /// Opens a store whose commits are logged under `dir`, replaying prior commits.
    pub fn open_dir(dir: &Path, sync_commits: bool) -> Result<Self, ShiftError> {
        std::fs::create_dir_all(dir)?;
        let oracle = Arc::new(LocalOracle::new());
        let mut data = VersionMap::new();
        let summary = wal::replay(dir, |commit_ts, record| {
            apply_record(&mut data, commit_ts, record.writes);
        })?;
        oracle.advance_to(summary.last_commit_ts);
        Ok(Self {
            oracle,
            data: RwLock::new(data),
            wal: Some(Mutex::new(WalWriter::open(dir, sync_commits)?)),
        })
    }

    pub fn oracle(&self) -> &Arc<dyn TimestampOracle> {
        &self.oracle
    }

    /// Drops versions no snapshot at or after `safe_ts` can observe.
    pub fn compact(&self, safe_ts: Timestamp) -> usize {
        let mut data = self.data.write();
        let mut dropped = 0usize;
        data.retain(|_, versions| {
            let keep_from = versions
                .iter()
                .rposition(|v| v.commit_ts <= safe_ts)
                .unwrap_or(0);
            dropped += keep_from;
            versions.drain(..keep_from);
            let tombstone_only =
                versions.len() == 1 && versions[0].value.is_none() && versions[0].commit_ts <= safe_ts;
            if tombstone_only {
                dropped += 1;
            }
            !tombstone_only
        });
        dropped
    }
}

impl Default for MemKvStore {
    fn default() -> Self {
        Self::new()
    }
}

fn visible(versions: &[Version], ts: Timestamp) -> Option<&Version> {
    versions.iter().rev().find(|v| v.commit_ts <= ts)
}

fn apply_record(data: &mut VersionMap, commit_ts: Timestamp, writes: Vec<(Vec<u8>, Option<Vec<u8>>)>) {
    for (key, value) in writes {
        data.entry(key)
            .or_default()
            .push(Version { commit_ts, value });
    }
}

impl KvStore for MemKvStore {
    fn current_ts(&self) -> Timestamp {
        self.oracle.current_ts()
    }

    fn get(&self, key: &[u8], ts: Timestamp) -> Result<Option<Vec<u8>>, ShiftError> {
        let data = self.data.read();
        Ok(data
            .get(key)
            .and_then(|versions| visible(versions, ts))
            .and_then(|v| v.value.clone()))
    }

    fn scan(
        &self,
        start: &[u8],
        end: &[u8],
        ts: Timestamp,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ShiftError> {
        let data = self.data.read();
        let upper = if end.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(end)
        };
        let mut out = Vec::new();
        for (key, versions) in data.range::<[u8], _>((Bound::Included(start), upper)) {
            if out.len() >= limit {
                break;
            }
            if let Some(value) = visible(versions, ts).and_then(|v| v.value.as_ref()) {
                out.push((key.clone(), value.clone()));
            }
        }
        Ok(out)
    }

    fn commit(
        &self,
        start_ts: Timestamp,
        writes: Vec<(Vec<u8>, Mutation)>,
    ) -> Result<Timestamp, ShiftError> {
        if writes.is_empty() {
            return Ok(start_ts);
        }
        let mut data = self.data.write();
        for (key, _) in &writes {
            let latest = data.get(key).and_then(|versions| versions.last());
            if latest.is_some_and(|v| v.commit_ts > start_ts) {
                debug!(start_ts, key = %String::from_utf8_lossy(key), "write conflict");
                return Err(ShiftError::conflict(key));
            }
        }
        // Allocated under the write lock so no snapshot can observe the
        // timestamp before the batch is visible.
        let commit_ts = self.oracle.next_ts();
        let record: Vec<(Vec<u8>, Option<Vec<u8>>)> = writes
            .into_iter()
            .map(|(k, m)| match m {
                Mutation::Put(v) => (k, Some(v)),
                Mutation::Delete => (k, None),
            })
            .collect();
        if let Some(wal) = &self.wal {
            let record = CommitRecord { writes: record };
            wal.lock().append(commit_ts, &record)?;
            apply_record(&mut data, commit_ts, record.writes);
        } else {
            apply_record(&mut data, commit_ts, record);
        }
        Ok(commit_ts)
    }
}
