//! Reverting a job's metadata changes.
//!
//! A reverted job's objects were never public, so its data is simply
//! discarded: hidden columns are removed from the table definition and
//! hidden index entries are scheduled for deletion.

use super::delete_range::schedule_index_ranges;
use super::worker::Transition;
use crate::catalog::schema::{SchemaState, TableSchema};
use crate::error::ShiftError;
use crate::job::{Job, JobKind, JobState, ModifyColumnArgs};
use crate::meta::Meta;
use tracing::info;

/// One step taking a reverting job to `RollbackDone` (or `Cancelled` when
/// the revert was requested by the user) with schema state `None`.
pub(crate) fn on_rollback(meta: &mut Meta<'_>, job: &Job) -> Result<Transition, ShiftError> {
    let outcome = match job.state {
        JobState::Cancelling => JobState::Cancelled,
        JobState::RollingBack => JobState::RollbackDone,
        other => {
            return Err(ShiftError::Validation(format!(
                "job {} is {other} and cannot be rolled back",
                job.id
            )));
        }
    };
    let done = job.finished(outcome, SchemaState::None);
    let table = match &job.kind {
        JobKind::CreateSchema { .. } | JobKind::CreateTable { .. } => None,
        _ => meta.table(job.schema_id, job.table_id)?,
    };
    let Some(mut table) = table else {
        return Ok(Transition::new(done));
    };
    let before = table.clone();
    match &job.kind {
        JobKind::CreateSchema { .. } | JobKind::CreateTable { .. } => {}
        JobKind::AddColumn { column } => table.columns.retain(|c| c.id != column.id),
        JobKind::AddIndex { index } => {
            if table.index(index.id).is_some() {
                table.indexes.retain(|i| i.id != index.id);
                schedule_index_ranges(meta, job.id, table.id, &[index.id])?;
            }
        }
        JobKind::ModifyColumn(args) => revert_modify(meta, job, args, &mut table)?,
        JobKind::DropColumn { column } => {
            if let Some(c) = table.columns.iter_mut().find(|c| c.name.eq_ignore_ascii_case(column)) {
                c.state = SchemaState::Public;
            }
        }
        JobKind::DropIndex { index } => {
            if let Some(i) = table.indexes.iter_mut().find(|i| i.name.eq_ignore_ascii_case(index)) {
                i.state = SchemaState::Public;
            }
        }
    }
    info!(
        job_id = job.id,
        table_id = job.table_id,
        from = %job.schema_state,
        outcome = %outcome,
        "ddl job rolled back"
    );
    if table == before {
        return Ok(Transition::new(done));
    }
    Ok(Transition::new(done).with_table(table))
}

fn revert_modify(
    meta: &mut Meta<'_>,
    job: &Job,
    args: &ModifyColumnArgs,
    table: &mut TableSchema,
) -> Result<(), ShiftError> {
    let Some(origin) = &args.origin else {
        return Ok(());
    };
    if args.changing_column().is_some() {
        table.columns.retain(|c| c.id != args.new_column.id);
        let shadows: Vec<_> = args.changing_indexes.iter().map(|(_, shadow)| *shadow).collect();
        table.indexes.retain(|i| !shadows.contains(&i.id));
        schedule_index_ranges(meta, job.id, table.id, &shadows)?;
    }
    if let Some(column) = table.column_mut(origin.id) {
        *column = origin.clone();
    }
    Ok(())
}
