pub mod store;

use crate::catalog::schema::{
    ColumnDef, ColumnId, IndexDef, IndexId, SchemaId, SchemaInfo, SchemaState, TableId,
    TableSchema,
};
use crate::error::JobError;
use serde::{Deserialize, Serialize};

pub use store::JobStore;

pub type JobId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Running,
    RollingBack,
    Cancelling,
    Done,
    Cancelled,
    RollbackDone,
    /// A done job whose final schema version the whole cluster has observed.
    Synced,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Done | JobState::Cancelled | JobState::RollbackDone | JobState::Synced
        )
    }

    pub fn is_reverting(self) -> bool {
        matches!(self, JobState::RollingBack | JobState::Cancelling)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::RollingBack => "rolling back",
            JobState::Cancelling => "cancelling",
            JobState::Done => "done",
            JobState::Cancelled => "cancelled",
            JobState::RollbackDone => "rollback done",
            JobState::Synced => "synced",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a column modification is carried out, fixed at the job's first step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModifyPath {
    MetadataOnly,
    Rewrite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifyColumnArgs {
    pub old_name: String,
    /// Target definition. Its id becomes the shadow column's id.
    pub new_column: ColumnDef,
    pub path: Option<ModifyPath>,
    /// The original column as it was before the job touched it.
    pub origin: Option<ColumnDef>,
    /// `(original index, shadow index)` pairs rebuilt alongside the column.
    pub changing_indexes: Vec<(IndexId, IndexId)>,
}

impl ModifyColumnArgs {
    pub fn changing_column(&self) -> Option<ColumnId> {
        match self.path {
            Some(ModifyPath::Rewrite) => Some(self.new_column.id),
            _ => None,
        }
    }
}

/// Operation payload. Ids are allocated when the job is submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobKind {
    CreateSchema { schema: SchemaInfo },
    CreateTable { table: TableSchema },
    AddColumn { column: ColumnDef },
    DropColumn { column: String },
    ModifyColumn(ModifyColumnArgs),
    AddIndex { index: IndexDef },
    DropIndex { index: String },
}

impl JobKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            JobKind::CreateSchema { .. } => "create schema",
            JobKind::CreateTable { .. } => "create table",
            JobKind::AddColumn { .. } => "add column",
            JobKind::DropColumn { .. } => "drop column",
            JobKind::ModifyColumn(_) => "modify column",
            JobKind::AddIndex { .. } => "add index",
            JobKind::DropIndex { .. } => "drop index",
        }
    }

    /// Jobs that may run a backfill and are served by the reorg worker.
    pub fn needs_reorg_worker(&self) -> bool {
        matches!(self, JobKind::ModifyColumn(_) | JobKind::AddIndex { .. })
    }

    fn is_drop(&self) -> bool {
        matches!(self, JobKind::DropColumn { .. } | JobKind::DropIndex { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub schema_id: SchemaId,
    pub table_id: TableId,
    pub state: JobState,
    pub schema_state: SchemaState,
    pub query: String,
    pub error: Option<JobError>,
    pub error_count: u64,
    /// Times the error ceiling has been crossed.
    pub ceiling_hits: u32,
    pub warning_count: u64,
    pub row_count: u64,
    /// Snapshot timestamp backfill reads existing keys at.
    pub start_ts: u64,
    pub dependency_job_id: Option<JobId>,
    /// Schema version published by the job's last metadata change.
    pub schema_version: u64,
    /// Epoch of the owner executing the current step; 0 between steps.
    pub owner_epoch: u64,
    pub created_at_ms: i64,
}

impl Job {
    pub fn new(
        id: JobId,
        kind: JobKind,
        schema_id: SchemaId,
        table_id: TableId,
        query: impl Into<String>,
    ) -> Self {
        Self {
            id,
            kind,
            schema_id,
            table_id,
            state: JobState::Queued,
            schema_state: SchemaState::None,
            query: query.into(),
            error: None,
            error_count: 0,
            ceiling_hits: 0,
            warning_count: 0,
            row_count: 0,
            start_ts: 0,
            dependency_job_id: None,
            schema_version: 0,
            owner_epoch: 0,
            created_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Whether the job can still be reverted without leaving the table changed.
    pub fn is_rollbackable(&self) -> bool {
        match self.state {
            JobState::Queued => true,
            JobState::Running => {
                if self.kind.is_drop() {
                    self.schema_state == SchemaState::None
                } else {
                    self.schema_state < SchemaState::Public
                }
            }
            _ => false,
        }
    }

    /// A successor at the given visibility state.
    pub fn advanced(&self, schema_state: SchemaState) -> Job {
        Job {
            state: JobState::Running,
            schema_state,
            ..self.clone()
        }
    }

    pub fn finished(&self, state: JobState, schema_state: SchemaState) -> Job {
        Job {
            state,
            schema_state,
            ..self.clone()
        }
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            id: self.id,
            state: self.state,
            schema_state: self.schema_state,
            error: self.error.clone(),
        }
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ID:{}, Type:{}, State:{}, SchemaState:{}, SchemaID:{}, TableID:{}, RowCount:{}, ErrorCount:{}",
            self.id,
            self.kind.type_name(),
            self.state,
            self.schema_state,
            self.schema_id,
            self.table_id,
            self.row_count,
            self.error_count
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: JobId,
    pub state: JobState,
    pub schema_state: SchemaState,
    pub error: Option<JobError>,
}
