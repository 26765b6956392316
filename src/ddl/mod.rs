//! Online schema change engine.
//!
//! Requests become persisted [`Job`]s. The elected owner ([`owner`]) runs
//! them one state-machine step at a time ([`worker`]), each step committing
//! the metadata change, the schema version bump and the rewritten job record
//! together, then waiting for the cluster to observe the new version.

pub mod backfill;
pub mod column;
pub mod delete_range;
pub mod governor;
pub mod index;
pub mod lease;
pub mod observer;
pub mod owner;
pub mod reorg;
pub mod rollback;
pub mod table;
pub mod worker;

use crate::cast::{TypeCoercion, coerce_literal};
use crate::catalog::schema::{ColumnDef, SchemaInfo, SchemaState, TableSchema};
use crate::catalog::types::{ColumnType, Datum};
use crate::config::{ShiftConfig, SqlMode};
use crate::error::{ResourceType, ShiftError};
use crate::job::{Job, JobId, JobStatus, JobStore};
use crate::meta::Meta;
use crate::publisher::{SchemaSyncer, SchemaVersionPublisher};
use crate::storage::kv::KvStore;
use crate::storage::txn::{RetryPolicy, Transaction, run_in_new_txn};
use observer::DdlObserver;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::info;

/// Services shared by submitters, the owner and its workers on one node.
pub struct DdlContext {
    pub store: Arc<dyn KvStore>,
    pub config: Arc<ShiftConfig>,
    pub publisher: Arc<SchemaVersionPublisher>,
    pub syncer: Arc<SchemaSyncer>,
    pub coercion: Arc<dyn TypeCoercion>,
    pub observer: Arc<dyn DdlObserver>,
    /// Signalled when a job is enqueued or archived.
    pub job_events: Arc<Notify>,
}

impl DdlContext {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_config(&self.config)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub col_type: ColumnType,
    pub nullable: bool,
    pub default: Option<Datum>,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, col_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            col_type,
            nullable: true,
            default: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn default_value(mut self, value: Datum) -> Self {
        self.default = Some(value);
        self
    }
}

impl fmt::Display for ColumnSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.col_type)?;
        if !self.nullable {
            write!(f, " NOT NULL")?;
        }
        if let Some(default) = &self.default {
            write!(f, " DEFAULT '{default}'")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
    /// Integer column whose value becomes the row handle.
    pub primary_key: Option<String>,
    pub indexes: Vec<IndexSpec>,
    /// Number of hash partitions on the row handle; 0 for none.
    pub partitions: usize,
    pub sql_mode: Option<SqlMode>,
}

impl TableSpec {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSpec>) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_key: None,
            indexes: Vec::new(),
            partitions: 0,
            sql_mode: None,
        }
    }

    pub fn primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = Some(column.into());
        self
    }

    pub fn index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn partitions(mut self, count: usize) -> Self {
        self.partitions = count;
        self
    }

    pub fn sql_mode(mut self, mode: SqlMode) -> Self {
        self.sql_mode = Some(mode);
        self
    }
}

/// A schema change as submitted by the statement layer.
#[derive(Debug, Clone, PartialEq)]
pub enum DdlRequest {
    CreateSchema {
        name: String,
    },
    CreateTable {
        schema: String,
        table: TableSpec,
    },
    AddColumn {
        schema: String,
        table: String,
        column: ColumnSpec,
    },
    DropColumn {
        schema: String,
        table: String,
        column: String,
    },
    /// Changes type, nullability or default of `column`; renames it when
    /// `new.name` differs.
    ModifyColumn {
        schema: String,
        table: String,
        column: String,
        new: ColumnSpec,
    },
    AddIndex {
        schema: String,
        table: String,
        index: IndexSpec,
    },
    DropIndex {
        schema: String,
        table: String,
        index: String,
    },
}

impl DdlRequest {
    pub fn modify_column(schema: &str, table: &str, new: ColumnSpec) -> Self {
        DdlRequest::ModifyColumn {
            schema: schema.into(),
            table: table.into(),
            column: new.name.clone(),
            new,
        }
    }
}

impl fmt::Display for DdlRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DdlRequest::CreateSchema { name } => write!(f, "CREATE DATABASE {name}"),
            DdlRequest::CreateTable { schema, table } => {
                let columns: Vec<String> = table.columns.iter().map(ToString::to_string).collect();
                write!(f, "CREATE TABLE {schema}.{} ({})", table.name, columns.join(", "))
            }
            DdlRequest::AddColumn {
                schema,
                table,
                column,
            } => write!(f, "ALTER TABLE {schema}.{table} ADD COLUMN {column}"),
            DdlRequest::DropColumn {
                schema,
                table,
                column,
            } => write!(f, "ALTER TABLE {schema}.{table} DROP COLUMN {column}"),
            DdlRequest::ModifyColumn {
                schema,
                table,
                column,
                new,
            } if *column == new.name => {
                write!(f, "ALTER TABLE {schema}.{table} MODIFY COLUMN {new}")
            }
            DdlRequest::ModifyColumn {
                schema,
                table,
                column,
                new,
            } => write!(f, "ALTER TABLE {schema}.{table} CHANGE COLUMN {column} {new}"),
            DdlRequest::AddIndex {
                schema,
                table,
                index,
            } => {
                let unique = if index.unique { "UNIQUE " } else { "" };
                write!(
                    f,
                    "ALTER TABLE {schema}.{table} ADD {unique}INDEX {}({})",
                    index.name,
                    index.columns.join(", ")
                )
            }
            DdlRequest::DropIndex {
                schema,
                table,
                index,
            } => write!(f, "ALTER TABLE {schema}.{table} DROP INDEX {index}"),
        }
    }
}

pub(crate) fn resolve_schema(meta: &Meta<'_>, name: &str) -> Result<SchemaInfo, ShiftError> {
    meta.list_schemas()?
        .into_iter()
        .find(|s| s.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| ShiftError::NotFound {
            resource_type: ResourceType::Schema,
            resource_id: name.to_string(),
        })
}

pub(crate) fn resolve_table(
    meta: &Meta<'_>,
    schema: &str,
    table: &str,
) -> Result<TableSchema, ShiftError> {
    let info = resolve_schema(meta, schema)?;
    meta.list_tables(info.id)?
        .into_iter()
        .find(|t| t.name.eq_ignore_ascii_case(table))
        .ok_or_else(|| ShiftError::NotFound {
            resource_type: ResourceType::Table,
            resource_id: format!("{schema}.{table}"),
        })
}

/// Builds a column definition from a request, casting its default value.
pub(crate) fn column_from_spec(
    coercion: &dyn TypeCoercion,
    spec: &ColumnSpec,
    id: i64,
    offset: usize,
    state: SchemaState,
) -> Result<ColumnDef, ShiftError> {
    let mut column = ColumnDef {
        id,
        name: spec.name.clone(),
        offset,
        col_type: spec.col_type,
        nullable: spec.nullable,
        default: None,
        origin_default: None,
        prevent_null_insert: false,
        state,
        changing_from: None,
    };
    if let Some(default) = &spec.default {
        if default.is_null() && !spec.nullable {
            return Err(ShiftError::Validation(format!(
                "invalid default value for '{}'",
                spec.name
            )));
        }
        let cast = coerce_literal(coercion, default, &column, SqlMode::Strict).map_err(|_| {
            ShiftError::Validation(format!("invalid default value for '{}'", spec.name))
        })?;
        column.default = Some(cast.value);
    }
    column.origin_default = match &column.default {
        Some(default) => Some(default.clone()),
        None if !column.nullable => Some(column.col_type.zero_value()),
        None => None,
    };
    Ok(column)
}

fn prepare_job(
    meta: &mut Meta<'_>,
    coercion: &dyn TypeCoercion,
    request: &DdlRequest,
    query: &str,
) -> Result<Job, ShiftError> {
    match request {
        DdlRequest::CreateSchema { name } => table::prepare_create_schema(meta, name, query),
        DdlRequest::CreateTable { schema, table } => {
            table::prepare_create_table(meta, coercion, schema, table, query)
        }
        DdlRequest::AddColumn {
            schema,
            table,
            column,
        } => column::prepare_add_column(meta, coercion, schema, table, column, query),
        DdlRequest::DropColumn {
            schema,
            table,
            column,
        } => column::prepare_drop_column(meta, schema, table, column, query),
        DdlRequest::ModifyColumn {
            schema,
            table,
            column,
            new,
        } => column::prepare_modify_column(meta, coercion, schema, table, column, new, query),
        DdlRequest::AddIndex {
            schema,
            table,
            index,
        } => index::prepare_add_index(meta, schema, table, index, query),
        DdlRequest::DropIndex {
            schema,
            table,
            index,
        } => index::prepare_drop_index(meta, schema, table, index, query),
    }
}

/// Validates `request` against the current metadata and enqueues its job.
pub async fn submit(ctx: &DdlContext, request: &DdlRequest) -> Result<JobId, ShiftError> {
    let query = request.to_string();
    let job = run_in_new_txn(&ctx.store, ctx.retry_policy(), |txn| {
        let mut meta = Meta::new(txn);
        let job = prepare_job(&mut meta, ctx.coercion.as_ref(), request, &query)?;
        JobStore::enqueue(&mut meta, job)
    })
    .await?;
    info!(
        job_id = job.id,
        kind = job.kind.type_name(),
        table_id = job.table_id,
        dependency = ?job.dependency_job_id,
        "ddl job submitted"
    );
    ctx.job_events.notify_waiters();
    Ok(job.id)
}

/// Records a cancellation request for the owner to apply at its next step
/// boundary or backfill checkpoint.
pub async fn cancel(ctx: &DdlContext, job_id: JobId) -> Result<(), ShiftError> {
    run_in_new_txn(&ctx.store, ctx.retry_policy(), |txn| {
        let mut meta = Meta::new(txn);
        let Some(job) = meta.queued_job(job_id)? else {
            return match meta.history_job(job_id)? {
                Some(_) => Err(ShiftError::JobAlreadyFinished { job_id }),
                None => Err(ShiftError::NotFound {
                    resource_type: ResourceType::Job,
                    resource_id: job_id.to_string(),
                }),
            };
        };
        if job.state.is_terminal() {
            return Err(ShiftError::JobAlreadyFinished { job_id });
        }
        if job.state.is_reverting() {
            return Err(ShiftError::CannotCancel {
                job_id,
                reason: format!("job is already {}", job.state),
            });
        }
        if !job.is_rollbackable() {
            return Err(ShiftError::CannotCancel {
                job_id,
                reason: format!("{} has reached schema state {}", job.kind.type_name(), job.schema_state),
            });
        }
        meta.request_cancel(job_id)
    })
    .await?;
    info!(job_id, "ddl job cancel requested");
    ctx.job_events.notify_waiters();
    Ok(())
}

pub fn find_job(ctx: &DdlContext, job_id: JobId) -> Result<Job, ShiftError> {
    let mut txn = Transaction::begin(&ctx.store);
    JobStore::find(&Meta::new(&mut txn), job_id)
}

pub fn status(ctx: &DdlContext, job_id: JobId) -> Result<JobStatus, ShiftError> {
    find_job(ctx, job_id).map(|job| job.status())
}

/// Waits until the job is archived and returns its history record.
pub async fn wait_archived(
    ctx: &DdlContext,
    job_id: JobId,
    timeout: Option<Duration>,
) -> Result<Job, ShiftError> {
    let poll = Duration::from_millis(ctx.config.job_poll_interval_ms);
    let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
    loop {
        let notified = ctx.job_events.notified();
        {
            let mut txn = Transaction::begin(&ctx.store);
            let meta = Meta::new(&mut txn);
            if let Some(job) = meta.history_job(job_id)? {
                return Ok(job);
            }
            if meta.queued_job(job_id)?.is_none() {
                return Err(ShiftError::NotFound {
                    resource_type: ResourceType::Job,
                    resource_id: job_id.to_string(),
                });
            }
        }
        if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
            return Err(ShiftError::Timeout(format!("job {job_id} did not finish in time")));
        }
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(poll) => {}
        }
    }
}

/// Maps an archived job to the submitter's result.
pub fn outcome(job: Job) -> Result<Job, ShiftError> {
    use crate::job::JobState;
    match job.state {
        JobState::Done | JobState::Synced => Ok(job),
        _ => {
            let id = job.id;
            let error = job.error.unwrap_or_else(|| crate::error::JobError {
                code: crate::error::ShiftErrorCode::Validation,
                message: format!("job ended in state {}", job.state),
            });
            Err(error.into_error(id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ColumnSpec, DdlRequest, IndexSpec, column_from_spec};
    use crate::cast::SqlCoercion;
    use crate::catalog::schema::SchemaState;
    use crate::catalog::types::{ColumnType, Datum};

    #[test]
    fn requests_render_as_statements() {
        let modify = DdlRequest::modify_column("test", "t", ColumnSpec::new("a", ColumnType::bigint()).not_null());
        assert_eq!(modify.to_string(), "ALTER TABLE test.t MODIFY COLUMN a bigint NOT NULL");
        let rename = DdlRequest::ModifyColumn {
            schema: "test".into(),
            table: "t".into(),
            column: "a".into(),
            new: ColumnSpec::new("b", ColumnType::int()),
        };
        assert_eq!(rename.to_string(), "ALTER TABLE test.t CHANGE COLUMN a b int");
        let index = DdlRequest::AddIndex {
            schema: "test".into(),
            table: "t".into(),
            index: IndexSpec::new("ia", &["a", "b"]).unique(),
        };
        assert_eq!(index.to_string(), "ALTER TABLE test.t ADD UNIQUE INDEX ia(a, b)");
    }

    #[test]
    fn defaults_are_cast_and_become_origin_defaults() {
        let coercion = SqlCoercion::default();
        let spec = ColumnSpec::new("c", ColumnType::int()).default_value(Datum::text("12"));
        let column = column_from_spec(&coercion, &spec, 3, 1, SchemaState::None).expect("column");
        assert_eq!(column.default, Some(Datum::Int(12)));
        assert_eq!(column.origin_default, Some(Datum::Int(12)));

        let not_null = ColumnSpec::new("d", ColumnType::varchar(4)).not_null();
        let column = column_from_spec(&coercion, &not_null, 4, 2, SchemaState::None).expect("column");
        assert_eq!(column.origin_default, Some(Datum::text("")));

        let bad = ColumnSpec::new("e", ColumnType::int()).default_value(Datum::text("x"));
        assert!(column_from_spec(&coercion, &bad, 5, 3, SchemaState::None).is_err());
    }
}
