//! Persisted metadata layout. Every accessor works inside a caller-owned
//! [`Transaction`], so a job step's metadata, job record and schema version
//! commit together or not at all.

use crate::catalog::schema::{SchemaId, SchemaInfo, TableId, TableSchema};
use crate::ddl::delete_range::DeleteRange;
use crate::ddl::reorg::ReorgInfo;
use crate::error::{ResourceType, ShiftError, decode_err, encode_err};
use crate::job::{Job, JobId};
use crate::storage::codec::prefix_successor;
use crate::storage::txn::Transaction;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

const NEXT_GLOBAL_ID_KEY: &[u8] = b"m/next_global_id";
const SCHEMA_VERSION_KEY: &[u8] = b"m/schema_version";
const OWNER_EPOCH_KEY: &[u8] = b"m/owner_epoch";
const SCHEMA_PREFIX: &str = "m/db/";
const TABLE_PREFIX: &str = "m/tbl/";
const DIFF_PREFIX: &str = "m/diff/";
const QUEUE_PREFIX: &str = "m/job_queue/";
const HISTORY_PREFIX: &str = "m/job_history/";
const REORG_PREFIX: &str = "m/reorg/";
const CANCEL_PREFIX: &str = "m/cancel/";
const DELETE_RANGE_PREFIX: &str = "m/gc_range/";
const AUTO_ID_PREFIX: &str = "m/autoid/";

/// Record of what one schema version changed, used to refresh cached catalogs
/// incrementally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDiff {
    pub version: u64,
    pub job_id: JobId,
    pub schema_id: SchemaId,
    pub table_ids: Vec<TableId>,
}

pub struct Meta<'a> {
    txn: &'a mut Transaction,
}

fn id_key(prefix: &str, id: i64) -> Vec<u8> {
    format!("{prefix}{id:020}").into_bytes()
}

fn table_key(schema_id: SchemaId, table_id: TableId) -> Vec<u8> {
    format!("{TABLE_PREFIX}{schema_id:020}/{table_id:020}").into_bytes()
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ShiftError> {
    rmp_serde::to_vec_named(value).map_err(encode_err)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ShiftError> {
    rmp_serde::from_slice(bytes).map_err(decode_err)
}

impl<'a> Meta<'a> {
    pub fn new(txn: &'a mut Transaction) -> Self {
        Self { txn }
    }

    pub fn start_ts(&self) -> u64 {
        self.txn.start_ts()
    }

    fn get_value<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>, ShiftError> {
        self.txn.get(key)?.map(|bytes| decode(&bytes)).transpose()
    }

    fn put_value<T: Serialize>(&mut self, key: Vec<u8>, value: &T) -> Result<(), ShiftError> {
        self.txn.put(key, encode(value)?);
        Ok(())
    }

    fn get_i64(&self, key: &[u8]) -> Result<i64, ShiftError> {
        Ok(self.get_value::<i64>(key)?.unwrap_or(0))
    }

    fn list_prefix<T: DeserializeOwned>(
        &self,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<T>, ShiftError> {
        let start = prefix.as_bytes();
        let end = prefix_successor(start).unwrap_or_default();
        self.txn
            .scan(start, &end, limit)?
            .into_iter()
            .map(|(_, v)| decode(&v))
            .collect()
    }

    pub fn gen_global_ids(&mut self, count: usize) -> Result<Vec<i64>, ShiftError> {
        let first = self.get_i64(NEXT_GLOBAL_ID_KEY)? + 1;
        let last = first + count as i64 - 1;
        self.put_value(NEXT_GLOBAL_ID_KEY.to_vec(), &last)?;
        Ok((first..=last).collect())
    }

    pub fn gen_global_id(&mut self) -> Result<i64, ShiftError> {
        Ok(self.gen_global_ids(1)?[0])
    }

    pub fn schema_version(&self) -> Result<u64, ShiftError> {
        Ok(self.get_value::<u64>(SCHEMA_VERSION_KEY)?.unwrap_or(0))
    }

    pub fn bump_schema_version(&mut self) -> Result<u64, ShiftError> {
        let next = self.schema_version()? + 1;
        self.put_value(SCHEMA_VERSION_KEY.to_vec(), &next)?;
        Ok(next)
    }

    pub fn put_schema_diff(&mut self, diff: &SchemaDiff) -> Result<(), ShiftError> {
        self.put_value(id_key(DIFF_PREFIX, diff.version as i64), diff)
    }

    pub fn schema_diff(&self, version: u64) -> Result<Option<SchemaDiff>, ShiftError> {
        self.get_value(&id_key(DIFF_PREFIX, version as i64))
    }

    /// Fails with `OwnershipLost` unless `epoch` is the recorded owner epoch,
    /// and rewrites the fence so a concurrent owner's commit conflicts.
    pub fn check_owner(&mut self, epoch: u64) -> Result<(), ShiftError> {
        let current = self.owner_epoch()?;
        if current != epoch {
            return Err(ShiftError::OwnershipLost);
        }
        self.put_value(OWNER_EPOCH_KEY.to_vec(), &epoch)
    }

    pub fn owner_epoch(&self) -> Result<u64, ShiftError> {
        Ok(self.get_value::<u64>(OWNER_EPOCH_KEY)?.unwrap_or(0))
    }

    pub fn set_owner_epoch(&mut self, epoch: u64) -> Result<(), ShiftError> {
        self.put_value(OWNER_EPOCH_KEY.to_vec(), &epoch)
    }

    pub fn put_schema(&mut self, info: &SchemaInfo) -> Result<(), ShiftError> {
        self.put_value(id_key(SCHEMA_PREFIX, info.id), info)
    }

    pub fn schema(&self, id: SchemaId) -> Result<Option<SchemaInfo>, ShiftError> {
        self.get_value(&id_key(SCHEMA_PREFIX, id))
    }

    pub fn list_schemas(&self) -> Result<Vec<SchemaInfo>, ShiftError> {
        self.list_prefix(SCHEMA_PREFIX, usize::MAX)
    }

    pub fn put_table(&mut self, table: &TableSchema) -> Result<(), ShiftError> {
        if self.schema(table.schema_id)?.is_none() {
            return Err(ShiftError::NotFound {
                resource_type: ResourceType::Schema,
                resource_id: table.schema_id.to_string(),
            });
        }
        self.put_value(table_key(table.schema_id, table.id), table)
    }

    pub fn table(&self, schema_id: SchemaId, table_id: TableId) -> Result<Option<TableSchema>, ShiftError> {
        self.get_value(&table_key(schema_id, table_id))
    }

    pub fn require_table(&self, schema_id: SchemaId, table_id: TableId) -> Result<TableSchema, ShiftError> {
        self.table(schema_id, table_id)?
            .ok_or_else(|| ShiftError::NotFound {
                resource_type: ResourceType::Table,
                resource_id: table_id.to_string(),
            })
    }

    pub fn list_tables(&self, schema_id: SchemaId) -> Result<Vec<TableSchema>, ShiftError> {
        self.list_prefix(&format!("{TABLE_PREFIX}{schema_id:020}/"), usize::MAX)
    }

    pub fn put_queued_job(&mut self, job: &Job) -> Result<(), ShiftError> {
        self.put_value(id_key(QUEUE_PREFIX, job.id), job)
    }

    pub fn queued_job(&self, id: JobId) -> Result<Option<Job>, ShiftError> {
        self.get_value(&id_key(QUEUE_PREFIX, id))
    }

    pub fn remove_queued_job(&mut self, id: JobId) {
        self.txn.delete(id_key(QUEUE_PREFIX, id));
    }

    /// Queued jobs in submission order.
    pub fn list_queue(&self) -> Result<Vec<Job>, ShiftError> {
        self.list_prefix(QUEUE_PREFIX, usize::MAX)
    }

    pub fn put_history_job(&mut self, job: &Job) -> Result<(), ShiftError> {
        self.put_value(id_key(HISTORY_PREFIX, job.id), job)
    }

    pub fn history_job(&self, id: JobId) -> Result<Option<Job>, ShiftError> {
        self.get_value(&id_key(HISTORY_PREFIX, id))
    }

    pub fn list_history(&self, limit: usize) -> Result<Vec<Job>, ShiftError> {
        self.list_prefix(HISTORY_PREFIX, limit)
    }

    pub fn put_reorg(&mut self, info: &ReorgInfo) -> Result<(), ShiftError> {
        self.put_value(id_key(REORG_PREFIX, info.job_id), info)
    }

    pub fn reorg(&self, job_id: JobId) -> Result<Option<ReorgInfo>, ShiftError> {
        self.get_value(&id_key(REORG_PREFIX, job_id))
    }

    pub fn remove_reorg(&mut self, job_id: JobId) {
        self.txn.delete(id_key(REORG_PREFIX, job_id));
    }

    pub fn request_cancel(&mut self, job_id: JobId) -> Result<(), ShiftError> {
        self.put_value(id_key(CANCEL_PREFIX, job_id), &true)
    }

    pub fn cancel_requested(&self, job_id: JobId) -> Result<bool, ShiftError> {
        Ok(self
            .get_value::<bool>(&id_key(CANCEL_PREFIX, job_id))?
            .unwrap_or(false))
    }

    pub fn clear_cancel(&mut self, job_id: JobId) {
        self.txn.delete(id_key(CANCEL_PREFIX, job_id));
    }

    pub fn put_delete_range(&mut self, range: &DeleteRange) -> Result<(), ShiftError> {
        let key = format!("{DELETE_RANGE_PREFIX}{:020}/{:06}", range.job_id, range.seq);
        self.put_value(key.into_bytes(), range)
    }

    pub fn remove_delete_range(&mut self, range: &DeleteRange) {
        let key = format!("{DELETE_RANGE_PREFIX}{:020}/{:06}", range.job_id, range.seq);
        self.txn.delete(key.into_bytes());
    }

    pub fn list_delete_ranges(&self, limit: usize) -> Result<Vec<DeleteRange>, ShiftError> {
        self.list_prefix(DELETE_RANGE_PREFIX, limit)
    }

    /// Reserves `step` row handles for a table. Returns `[start, end)`.
    pub fn alloc_auto_ids(&mut self, table_id: TableId, step: i64) -> Result<(i64, i64), ShiftError> {
        let key = id_key(AUTO_ID_PREFIX, table_id);
        let base = self.get_i64(&key)?;
        let end = base + step;
        self.put_value(key, &end)?;
        Ok((base + 1, end + 1))
    }

    /// Moves the allocator past an explicitly supplied handle.
    pub fn rebase_auto_id(&mut self, table_id: TableId, handle: i64) -> Result<(), ShiftError> {
        let key = id_key(AUTO_ID_PREFIX, table_id);
        if handle > self.get_i64(&key)? {
            self.put_value(key, &handle)?;
        }
        Ok(())
    }
}
