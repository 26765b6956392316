//! Index jobs. A new index is backfilled during `WriteReorganization`; a
//! dropped index stops being maintained first and its entries are removed
//! through a delete range once the job is archived.

use super::backfill::apply_reorg_totals;
use super::column::{next_add_state, next_drop_state};
use super::delete_range::schedule_index_ranges;
use super::worker::Transition;
use super::{IndexSpec, resolve_table};
use crate::catalog::schema::{IndexDef, SchemaState, TableSchema};
use crate::error::{ResourceType, ShiftError};
use crate::job::{Job, JobKind, JobState};
use crate::meta::Meta;

fn index_exists(name: &str) -> ShiftError {
    ShiftError::AlreadyExists {
        resource_type: ResourceType::Index,
        resource_id: name.to_string(),
    }
}

fn index_not_found(table: &TableSchema, name: &str) -> ShiftError {
    ShiftError::NotFound {
        resource_type: ResourceType::Index,
        resource_id: format!("{}.{name}", table.name),
    }
}

fn unexpected_state(job: &Job) -> ShiftError {
    ShiftError::Validation(format!(
        "{} job {} has unexpected schema state {}",
        job.kind.type_name(),
        job.id,
        job.schema_state
    ))
}

pub(crate) fn prepare_add_index(
    meta: &mut Meta<'_>,
    schema: &str,
    table: &str,
    spec: &IndexSpec,
    query: &str,
) -> Result<Job, ShiftError> {
    let table = resolve_table(meta, schema, table)?;
    if spec.columns.is_empty() {
        return Err(ShiftError::Validation(format!(
            "index '{}' must name at least one column",
            spec.name
        )));
    }
    if table.index_by_name(&spec.name).is_some() {
        return Err(index_exists(&spec.name));
    }
    let mut columns = Vec::with_capacity(spec.columns.len());
    for name in &spec.columns {
        let column = table.public_column(name).ok_or_else(|| ShiftError::NotFound {
            resource_type: ResourceType::Column,
            resource_id: format!("{}.{name}", table.name),
        })?;
        if columns.contains(&column.id) {
            return Err(ShiftError::Validation(format!(
                "duplicate column name '{name}' in index '{}'",
                spec.name
            )));
        }
        columns.push(column.id);
    }
    let ids = meta.gen_global_ids(2)?;
    let index = IndexDef {
        id: ids[1],
        name: spec.name.clone(),
        columns,
        unique: spec.unique,
        state: SchemaState::None,
        changing_from: None,
    };
    Ok(Job::new(
        ids[0],
        JobKind::AddIndex { index },
        table.schema_id,
        table.id,
        query,
    ))
}

pub(crate) fn on_add_index(meta: &mut Meta<'_>, job: &Job) -> Result<Transition, ShiftError> {
    let JobKind::AddIndex { index } = &job.kind else {
        return Err(unexpected_state(job));
    };
    let mut table = meta.require_table(job.schema_id, job.table_id)?;
    let next = next_add_state(job.schema_state).ok_or_else(|| unexpected_state(job))?;
    if job.schema_state == SchemaState::None {
        if table.index_by_name(&index.name).is_some() {
            return Err(index_exists(&index.name));
        }
        if let Some(missing) = index
            .columns
            .iter()
            .find(|id| !table.column(**id).is_some_and(|c| c.is_public()))
        {
            return Err(ShiftError::NotFound {
                resource_type: ResourceType::Column,
                resource_id: format!("{}.#{missing}", table.name),
            });
        }
        table.indexes.push(IndexDef {
            state: next,
            ..index.clone()
        });
        return Ok(Transition::new(job.advanced(next)).with_table(table));
    }

    let added = table
        .index_mut(index.id)
        .ok_or_else(|| ShiftError::Validation(format!("index '{}' vanished", index.name)))?;
    added.state = next;
    if next == SchemaState::Public {
        let mut done = job.finished(JobState::Done, SchemaState::Public);
        apply_reorg_totals(meta, &mut done)?;
        return Ok(Transition::new(done).with_table(table));
    }
    Ok(Transition::new(job.advanced(next)).with_table(table))
}

pub(crate) fn prepare_drop_index(
    meta: &mut Meta<'_>,
    schema: &str,
    table: &str,
    index: &str,
    query: &str,
) -> Result<Job, ShiftError> {
    let table = resolve_table(meta, schema, table)?;
    let target = table
        .index_by_name(index)
        .filter(|i| i.state == SchemaState::Public && i.changing_from.is_none())
        .ok_or_else(|| index_not_found(&table, index))?;
    let id = meta.gen_global_id()?;
    Ok(Job::new(
        id,
        JobKind::DropIndex {
            index: target.name.clone(),
        },
        table.schema_id,
        table.id,
        query,
    ))
}

pub(crate) fn on_drop_index(meta: &mut Meta<'_>, job: &Job) -> Result<Transition, ShiftError> {
    let JobKind::DropIndex { index } = &job.kind else {
        return Err(unexpected_state(job));
    };
    let mut table = meta.require_table(job.schema_id, job.table_id)?;
    let target = table
        .index_by_name(index)
        .cloned()
        .ok_or_else(|| index_not_found(&table, index))?;
    if job.schema_state == SchemaState::None && target.state != SchemaState::Public {
        return Err(index_not_found(&table, index));
    }
    let job = match next_drop_state(job.schema_state) {
        Some(next) => {
            if let Some(i) = table.index_mut(target.id) {
                i.state = next;
            }
            job.advanced(next)
        }
        None if job.schema_state == SchemaState::WriteReorganization => {
            table.indexes.retain(|i| i.id != target.id);
            schedule_index_ranges(meta, job.id, table.id, &[target.id])?;
            job.finished(JobState::Done, SchemaState::None)
        }
        None => return Err(unexpected_state(job)),
    };
    Ok(Transition::new(job).with_table(table))
}
