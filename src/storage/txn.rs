use crate::config::ShiftConfig;
use crate::error::ShiftError;
use crate::storage::kv::{KvStore, Mutation};
use crate::storage::oracle::Timestamp;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Snapshot-isolated transaction: reads at `start_ts` and buffers writes.
/// Commit fails with `Conflict` only when a key it writes was committed by
/// someone else after `start_ts`; keys that were only read are not checked,
/// so callers that depend on a value (the owner fence, id counters) write it.
pub struct Transaction {
    store: Arc<dyn KvStore>,
    start_ts: Timestamp,
    writes: BTreeMap<Vec<u8>, Mutation>,
}

impl Transaction {
    pub fn begin(store: &Arc<dyn KvStore>) -> Self {
        let start_ts = store.current_ts();
        Self::at(store, start_ts)
    }

    /// Read-only view pinned at `ts`; committing it with writes is still allowed.
    pub fn at(store: &Arc<dyn KvStore>, ts: Timestamp) -> Self {
        Self {
            store: Arc::clone(store),
            start_ts: ts,
            writes: BTreeMap::new(),
        }
    }

    pub fn start_ts(&self) -> Timestamp {
        self.start_ts
    }

    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ShiftError> {
        match self.writes.get(key) {
            Some(Mutation::Put(v)) => Ok(Some(v.clone())),
            Some(Mutation::Delete) => Ok(None),
            None => self.store.get(key, self.start_ts),
        }
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.writes.insert(key, Mutation::Put(value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.writes.insert(key, Mutation::Delete);
    }

    /// Merged view of committed data and this transaction's own writes.
    pub fn scan(
        &self,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ShiftError> {
        let upper = if end.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(end)
        };
        let local: Vec<(&Vec<u8>, &Mutation)> = self
            .writes
            .range::<[u8], _>((Bound::Included(start), upper))
            .collect();
        // Each local delete can hide at most one committed key.
        let committed = self
            .store
            .scan(start, end, self.start_ts, limit.saturating_add(local.len()))?;

        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = committed.into_iter().collect();
        for (key, mutation) in local {
            match mutation {
                Mutation::Put(v) => {
                    merged.insert(key.clone(), v.clone());
                }
                Mutation::Delete => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().take(limit).collect())
    }

    pub fn commit(self) -> Result<Timestamp, ShiftError> {
        let writes: Vec<(Vec<u8>, Mutation)> = self.writes.into_iter().collect();
        self.store.commit(self.start_ts, writes)
    }
}

/// Bounded exponential backoff for transient transaction failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ShiftConfig) -> Self {
        Self {
            max_retries: config.max_txn_retries,
            base: Duration::from_millis(config.retry_backoff_base_ms),
            max: Duration::from_millis(config.retry_backoff_max_ms),
        }
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Runs `f` in a fresh transaction and commits it, retrying retryable failures.
pub async fn run_in_new_txn<T, F>(
    store: &Arc<dyn KvStore>,
    policy: RetryPolicy,
    mut f: F,
) -> Result<T, ShiftError>
where
    F: FnMut(&mut Transaction) -> Result<T, ShiftError>,
{
    let mut attempt = 0u32;
    loop {
        let mut txn = Transaction::begin(store);
        let result = f(&mut txn).and_then(|value| txn.commit().map(|_| value));
        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                debug!(attempt, error = %e, "retrying transaction");
                tokio::time::sleep(policy.backoff(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
