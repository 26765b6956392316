//! Deferred removal of index data that no schema version references anymore.

use crate::catalog::schema::{IndexId, TableId};
use crate::error::ShiftError;
use crate::job::JobId;
use crate::meta::Meta;
use crate::storage::codec::index_range;
use crate::storage::kv::KvStore;
use crate::storage::txn::{RetryPolicy, run_in_new_txn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRange {
    pub job_id: JobId,
    pub seq: u32,
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

/// Records the key ranges of `indexes` for removal once `job_id` is archived.
pub fn schedule_index_ranges(
    meta: &mut Meta<'_>,
    job_id: JobId,
    table_id: TableId,
    indexes: &[IndexId],
) -> Result<(), ShiftError> {
    let base = meta
        .list_delete_ranges(usize::MAX)?
        .iter()
        .filter(|r| r.job_id == job_id)
        .map(|r| r.seq + 1)
        .max()
        .unwrap_or(0);
    for (i, index_id) in indexes.iter().enumerate() {
        let (start, end) = index_range(table_id, *index_id);
        meta.put_delete_range(&DeleteRange {
            job_id,
            seq: base + i as u32,
            start,
            end,
        })?;
    }
    Ok(())
}

/// Drains every recorded range in batches of `batch_size` keys. Returns the
/// number of keys removed.
pub async fn drain(
    store: &Arc<dyn KvStore>,
    policy: RetryPolicy,
    batch_size: usize,
) -> Result<usize, ShiftError> {
    let mut removed = 0;
    loop {
        let step = run_in_new_txn(store, policy, |txn| {
            let meta = Meta::new(txn);
            let Some(range) = meta.list_delete_ranges(1)?.into_iter().next() else {
                return Ok(None);
            };
            drop(meta);
            let keys = txn.scan(&range.start, &range.end, batch_size)?;
            let count = keys.len();
            for (key, _) in keys {
                txn.delete(key);
            }
            if count < batch_size {
                Meta::new(txn).remove_delete_range(&range);
            }
            Ok(Some((range, count)))
        })
        .await?;
        match step {
            None => break,
            Some((range, count)) => {
                debug!(job_id = range.job_id, seq = range.seq, keys = count, "delete range batch");
                removed += count;
            }
        }
    }
    if removed > 0 {
        info!(keys = removed, "delete ranges drained");
    }
    Ok(removed)
}
