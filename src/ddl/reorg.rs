use crate::catalog::schema::{TableId, TableSchema};
use crate::error::ShiftError;
use crate::job::JobId;
use crate::storage::codec::record_range;
use serde::{Deserialize, Serialize};

/// Persisted backfill progress of one job.
///
/// A partitioned table is walked one physical table at a time; the current
/// one is `[start_key, end_key)` and the rest wait in `remaining_partitions`.
/// `current_key` is the first key not yet processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgInfo {
    pub job_id: JobId,
    pub physical_table_id: TableId,
    pub remaining_partitions: Vec<TableId>,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub current_key: Vec<u8>,
    /// Existing rows are discovered through a snapshot at this timestamp.
    pub snapshot_ts: u64,
    /// Record keys read from the snapshot so far.
    pub scanned_rows: u64,
    /// Rows actually rewritten; rows deleted since the snapshot are skipped.
    pub added_rows: u64,
    pub warnings: u64,
}

/// Counters of one backfill round or range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundProgress {
    pub scanned: u64,
    pub added: u64,
    pub warnings: u64,
}

impl RoundProgress {
    pub fn merge(&mut self, other: RoundProgress) {
        self.scanned += other.scanned;
        self.added += other.added;
        self.warnings += other.warnings;
    }
}

impl ReorgInfo {
    /// Progress record for a job entering reorganization, positioned at the
    /// start of the first physical table. No rows are read here; the walk
    /// happens chunk by chunk in the backfill.
    pub fn begin(job_id: JobId, table: &TableSchema, snapshot_ts: u64) -> Self {
        let mut partitions = table.physical_ids().into_iter();
        let first = partitions.next().unwrap_or(table.id);
        let (start_key, end_key) = record_range(first);
        Self {
            job_id,
            physical_table_id: first,
            remaining_partitions: partitions.collect(),
            current_key: start_key.clone(),
            start_key,
            end_key,
            snapshot_ts,
            scanned_rows: 0,
            added_rows: 0,
            warnings: 0,
        }
    }

    /// Moves the checkpoint forward. A key behind the checkpoint is ignored.
    pub fn advance(&mut self, next_key: Vec<u8>, progress: RoundProgress) {
        if next_key > self.current_key {
            self.current_key = next_key.min(self.end_key.clone());
        }
        self.scanned_rows += progress.scanned;
        self.added_rows += progress.added;
        self.warnings += progress.warnings;
    }

    pub fn partition_done(&self) -> bool {
        self.current_key >= self.end_key
    }

    /// Switches to the next physical table. Returns `false` when none is left.
    pub fn next_partition(&mut self) -> bool {
        if self.remaining_partitions.is_empty() {
            return false;
        }
        let next = self.remaining_partitions.remove(0);
        let (start_key, end_key) = record_range(next);
        self.physical_table_id = next;
        self.current_key = start_key.clone();
        self.start_key = start_key;
        self.end_key = end_key;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::{ReorgInfo, RoundProgress};
    use crate::catalog::schema::{SchemaState, TableSchema};
    use crate::config::SqlMode;
    use crate::storage::codec::record_key;
    use crate::storage::kv::{KvStore, MemKvStore};
    use crate::storage::txn::Transaction;
    use std::sync::Arc;

    fn partitioned() -> TableSchema {
        TableSchema {
            id: 10,
            schema_id: 1,
            name: "t".into(),
            columns: Vec::new(),
            indexes: Vec::new(),
            primary_key: None,
            partitions: vec![11, 12],
            sql_mode: SqlMode::Strict,
            state: SchemaState::Public,
            update_version: 1,
        }
    }

    #[test]
    fn checkpoint_only_moves_forward_across_partitions() {
        let store: Arc<dyn KvStore> = Arc::new(MemKvStore::new());
        let mut txn = Transaction::begin(&store);
        txn.put(record_key(11, 1), vec![0x80]);
        txn.put(record_key(12, 2), vec![0x80]);
        txn.commit().expect("commit");

        let snapshot_ts = store.current_ts();
        let mut info = ReorgInfo::begin(7, &partitioned(), snapshot_ts);
        assert_eq!(info.physical_table_id, 11);
        assert_eq!(info.snapshot_ts, snapshot_ts);
        assert_eq!((info.scanned_rows, info.added_rows), (0, 0));

        let round = |scanned, added, warnings| RoundProgress {
            scanned,
            added,
            warnings,
        };
        info.advance(record_key(11, 5), round(5, 4, 1));
        info.advance(record_key(11, 2), round(1, 1, 0));
        assert_eq!(info.current_key, record_key(11, 5));
        assert_eq!((info.scanned_rows, info.added_rows, info.warnings), (6, 5, 1));
        assert!(!info.partition_done());

        info.advance(info.end_key.clone(), RoundProgress::default());
        assert!(info.partition_done());
        assert!(info.next_partition());
        assert_eq!(info.physical_table_id, 12);
        assert_eq!(info.current_key, info.start_key);
        assert!(!info.next_partition());
    }
}
