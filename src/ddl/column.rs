//! Column jobs: add, drop and modify.
//!
//! A rewriting modification never touches the original column's data. It
//! builds a hidden shadow column (and a shadow for every index covering the
//! column) that foreground writes fill from the original value, backfills
//! existing rows into it, and swaps it in when the job reaches `Public`.

use super::backfill::apply_reorg_totals;
use super::delete_range::schedule_index_ranges;
use super::worker::Transition;
use super::{ColumnSpec, column_from_spec, resolve_table};
use crate::cast::{TypeChange, TypeCoercion};
use crate::catalog::schema::{ColumnDef, IndexDef, SchemaState, TableSchema};
use crate::error::{ResourceType, ShiftError};
use crate::job::{Job, JobKind, JobState, ModifyColumnArgs, ModifyPath};
use crate::meta::Meta;

const SHADOW_COLUMN_PREFIX: &str = "_Col$_";
const SHADOW_INDEX_PREFIX: &str = "_Idx$_";

fn column_not_found(table: &TableSchema, name: &str) -> ShiftError {
    ShiftError::NotFound {
        resource_type: ResourceType::Column,
        resource_id: format!("{}.{name}", table.name),
    }
}

fn column_exists(name: &str) -> ShiftError {
    ShiftError::AlreadyExists {
        resource_type: ResourceType::Column,
        resource_id: name.to_string(),
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

/// Successor of `state` on the path of objects being added.
pub(crate) fn next_add_state(state: SchemaState) -> Option<SchemaState> {
    match state {
        SchemaState::None => Some(SchemaState::DeleteOnly),
        SchemaState::DeleteOnly => Some(SchemaState::WriteOnly),
        SchemaState::WriteOnly => Some(SchemaState::WriteReorganization),
        SchemaState::WriteReorganization => Some(SchemaState::Public),
        SchemaState::Public => None,
    }
}

/// Successor of `state` on the path of objects being dropped. `None` from
/// `WriteReorganization` means the object is removed.
pub(crate) fn next_drop_state(state: SchemaState) -> Option<SchemaState> {
    match state {
        SchemaState::None => Some(SchemaState::WriteOnly),
        SchemaState::WriteOnly => Some(SchemaState::DeleteOnly),
        SchemaState::DeleteOnly => Some(SchemaState::WriteReorganization),
        SchemaState::WriteReorganization | SchemaState::Public => None,
    }
}

pub(crate) fn prepare_add_column(
    meta: &mut Meta<'_>,
    coercion: &dyn TypeCoercion,
    schema: &str,
    table: &str,
    spec: &ColumnSpec,
    query: &str,
) -> Result<Job, ShiftError> {
    let table = resolve_table(meta, schema, table)?;
    if table.column_by_name(&spec.name).is_some() {
        return Err(column_exists(&spec.name));
    }
    let ids = meta.gen_global_ids(2)?;
    let column = column_from_spec(coercion, spec, ids[1], 0, SchemaState::None)?;
    Ok(Job::new(
        ids[0],
        JobKind::AddColumn { column },
        table.schema_id,
        table.id,
        query,
    ))
}

pub(crate) fn on_add_column(meta: &mut Meta<'_>, job: &Job) -> Result<Transition, ShiftError> {
    let JobKind::AddColumn { column } = &job.kind else {
        return Err(unexpected_state(job));
    };
    let mut table = meta.require_table(job.schema_id, job.table_id)?;
    let next = next_add_state(job.schema_state).ok_or_else(|| unexpected_state(job))?;
    if job.schema_state == SchemaState::None {
        if table.column_by_name(&column.name).is_some() {
            return Err(column_exists(&column.name));
        }
        let mut added = column.clone();
        added.offset = table.next_offset();
        added.state = next;
        table.columns.push(added);
    } else {
        let added = table
            .column_mut(column.id)
            .ok_or_else(|| ShiftError::Validation(format!("column '{}' vanished", column.name)))?;
        added.state = next;
    }
    let job = if next == SchemaState::Public {
        job.finished(JobState::Done, SchemaState::Public)
    } else {
        job.advanced(next)
    };
    Ok(Transition::new(job).with_table(table))
}

fn check_droppable(table: &TableSchema, column: &ColumnDef) -> Result<(), ShiftError> {
    if table.primary_key == Some(column.id) {
        return Err(ShiftError::Validation(format!(
            "can't drop primary key column '{}'",
            column.name
        )));
    }
    if let Some(index) = table.indexes.iter().find(|i| i.covers(column.id)) {
        return Err(ShiftError::Validation(format!(
            "column '{}' is covered by index '{}'; drop the index first",
            column.name, index.name
        )));
    }
    if table.public_columns().len() <= 1 {
        return Err(ShiftError::Validation(format!(
            "can't drop the only column of table '{}'",
            table.name
        )));
    }
    Ok(())
}

pub(crate) fn prepare_drop_column(
    meta: &mut Meta<'_>,
    schema: &str,
    table: &str,
    column: &str,
    query: &str,
) -> Result<Job, ShiftError> {
    let table = resolve_table(meta, schema, table)?;
    let target = table
        .public_column(column)
        .ok_or_else(|| column_not_found(&table, column))?;
    check_droppable(&table, target)?;
    let id = meta.gen_global_id()?;
    Ok(Job::new(
        id,
        JobKind::DropColumn {
            column: target.name.clone(),
        },
        table.schema_id,
        table.id,
        query,
    ))
}

pub(crate) fn on_drop_column(meta: &mut Meta<'_>, job: &Job) -> Result<Transition, ShiftError> {
    let JobKind::DropColumn { column } = &job.kind else {
        return Err(unexpected_state(job));
    };
    let mut table = meta.require_table(job.schema_id, job.table_id)?;
    let target = table
        .column_by_name(column)
        .cloned()
        .ok_or_else(|| column_not_found(&table, column))?;
    if job.schema_state == SchemaState::None {
        if !target.is_public() {
            return Err(column_not_found(&table, column));
        }
        check_droppable(&table, &target)?;
    }
    let job = match next_drop_state(job.schema_state) {
        Some(next) => {
            if let Some(c) = table.column_mut(target.id) {
                c.state = next;
            }
            job.advanced(next)
        }
        None if job.schema_state == SchemaState::WriteReorganization => {
            table.columns.retain(|c| c.id != target.id);
            job.finished(JobState::Done, SchemaState::None)
        }
        None => return Err(unexpected_state(job)),
    };
    Ok(Transition::new(job).with_table(table))
}

/// How `current` can become `target`, or why it cannot.
fn plan_modify(
    coercion: &dyn TypeCoercion,
    table: &TableSchema,
    current: &ColumnDef,
    target: &ColumnDef,
) -> Result<ModifyPath, ShiftError> {
    let is_primary = table.primary_key == Some(current.id);
    if is_primary && target.nullable {
        return Err(ShiftError::PrimaryCantHaveNull {
            column: current.name.clone(),
        });
    }
    match coercion.check_change(current, target) {
        TypeChange::Reject(reason) => Err(ShiftError::UnsupportedModifyColumn { reason }),
        TypeChange::MetadataOnly => Ok(ModifyPath::MetadataOnly),
        TypeChange::Rewrite if is_primary => Err(ShiftError::UnsupportedModifyColumn {
            reason: "this column has primary key flag".into(),
        }),
        TypeChange::Rewrite => Ok(ModifyPath::Rewrite),
    }
}

fn check_rename(table: &TableSchema, current: &ColumnDef, target: &ColumnDef) -> Result<(), ShiftError> {
    if !target.name.eq_ignore_ascii_case(&current.name) && table.column_by_name(&target.name).is_some() {
        return Err(column_exists(&target.name));
    }
    Ok(())
}

pub(crate) fn prepare_modify_column(
    meta: &mut Meta<'_>,
    coercion: &dyn TypeCoercion,
    schema: &str,
    table: &str,
    column: &str,
    spec: &ColumnSpec,
    query: &str,
) -> Result<Job, ShiftError> {
    let table = resolve_table(meta, schema, table)?;
    let current = table
        .public_column(column)
        .ok_or_else(|| column_not_found(&table, column))?;
    let ids = meta.gen_global_ids(2)?;
    let new_column = column_from_spec(coercion, spec, ids[1], current.offset, SchemaState::None)?;
    check_rename(&table, current, &new_column)?;
    plan_modify(coercion, &table, current, &new_column)?;
    let args = ModifyColumnArgs {
        old_name: current.name.clone(),
        new_column,
        path: None,
        origin: None,
        changing_indexes: Vec::new(),
    };
    Ok(Job::new(
        ids[0],
        JobKind::ModifyColumn(args),
        table.schema_id,
        table.id,
        query,
    ))
}

fn with_args(job: &Job, args: ModifyColumnArgs) -> Job {
    Job {
        kind: JobKind::ModifyColumn(args),
        ..job.clone()
    }
}

pub(crate) fn on_modify_column(
    meta: &mut Meta<'_>,
    job: &Job,
    coercion: &dyn TypeCoercion,
) -> Result<Transition, ShiftError> {
    let JobKind::ModifyColumn(args) = &job.kind else {
        return Err(unexpected_state(job));
    };
    let mut table = meta.require_table(job.schema_id, job.table_id)?;
    match job.schema_state {
        SchemaState::None => start_modify(meta, job, args, table, coercion),
        SchemaState::DeleteOnly | SchemaState::WriteOnly => {
            let next = next_add_state(job.schema_state).ok_or_else(|| unexpected_state(job))?;
            set_shadow_state(&mut table, args, next)?;
            Ok(Transition::new(job.advanced(next)).with_table(table))
        }
        SchemaState::WriteReorganization => {
            let done = promote_shadow(meta, job, args, &mut table)?;
            Ok(Transition::new(done).with_table(table))
        }
        SchemaState::Public => Err(unexpected_state(job)),
    }
}

fn start_modify(
    meta: &mut Meta<'_>,
    job: &Job,
    args: &ModifyColumnArgs,
    mut table: TableSchema,
    coercion: &dyn TypeCoercion,
) -> Result<Transition, ShiftError> {
    let current = table
        .public_column(&args.old_name)
        .cloned()
        .ok_or_else(|| column_not_found(&table, &args.old_name))?;
    let target = &args.new_column;
    check_rename(&table, &current, target)?;
    let path = plan_modify(coercion, &table, &current, target)?;
    let mut next_args = args.clone();
    next_args.path = Some(path);
    next_args.origin = Some(current.clone());

    if path == ModifyPath::MetadataOnly {
        let column = table
            .column_mut(current.id)
            .ok_or_else(|| ShiftError::Validation(format!("column '{}' vanished", current.name)))?;
        column.name = target.name.clone();
        column.col_type = target.col_type;
        column.nullable = target.nullable;
        column.default = target.default.clone();
        let done = with_args(job, next_args).finished(JobState::Done, SchemaState::Public);
        return Ok(Transition::new(done).with_table(table));
    }

    let shadow = ColumnDef {
        name: table.shadow_name(SHADOW_COLUMN_PREFIX, &current.name),
        offset: current.offset,
        prevent_null_insert: false,
        state: SchemaState::DeleteOnly,
        changing_from: Some(current.id),
        ..target.clone()
    };
    let shadow_id = shadow.id;
    table.columns.push(shadow);

    let covering: Vec<IndexDef> = table
        .indexes
        .iter()
        .filter(|i| i.covers(current.id) && i.changing_from.is_none())
        .cloned()
        .collect();
    if !covering.is_empty() {
        let ids = meta.gen_global_ids(covering.len())?;
        for (index, id) in covering.iter().zip(ids) {
            let shadow_index = IndexDef {
                id,
                name: table.shadow_name(SHADOW_INDEX_PREFIX, &index.name),
                columns: index
                    .columns
                    .iter()
                    .map(|c| if *c == current.id { shadow_id } else { *c })
                    .collect(),
                unique: index.unique,
                state: SchemaState::DeleteOnly,
                changing_from: Some(index.id),
            };
            table.indexes.push(shadow_index);
            next_args.changing_indexes.push((index.id, id));
        }
    }

    if current.nullable && !target.nullable {
        if let Some(original) = table.column_mut(current.id) {
            original.prevent_null_insert = true;
        }
    }
    let next = with_args(job, next_args).advanced(SchemaState::DeleteOnly);
    Ok(Transition::new(next).with_table(table))
}

fn set_shadow_state(
    table: &mut TableSchema,
    args: &ModifyColumnArgs,
    state: SchemaState,
) -> Result<(), ShiftError> {
    let shadow = table.column_mut(args.new_column.id).ok_or_else(|| {
        ShiftError::Validation(format!("shadow of column '{}' vanished", args.old_name))
    })?;
    shadow.state = state;
    for (_, shadow_index) in &args.changing_indexes {
        if let Some(index) = table.index_mut(*shadow_index) {
            index.state = state;
        }
    }
    Ok(())
}

/// Swaps the backfilled shadow column and indexes in for the originals.
fn promote_shadow(
    meta: &mut Meta<'_>,
    job: &Job,
    args: &ModifyColumnArgs,
    table: &mut TableSchema,
) -> Result<Job, ShiftError> {
    let origin = args
        .origin
        .as_ref()
        .ok_or_else(|| ShiftError::Validation(format!("job {} lost its original column", job.id)))?;
    let shadow_id = args.new_column.id;
    let mut promoted = table.column(shadow_id).cloned().ok_or_else(|| {
        ShiftError::Validation(format!("shadow of column '{}' vanished", args.old_name))
    })?;
    promoted.name = args.new_column.name.clone();
    promoted.offset = origin.offset;
    promoted.state = SchemaState::Public;
    promoted.changing_from = None;
    promoted.prevent_null_insert = false;
    table.columns.retain(|c| c.id != origin.id && c.id != shadow_id);
    table.columns.push(promoted);

    let mut replaced = Vec::with_capacity(args.changing_indexes.len());
    for (old_id, new_id) in &args.changing_indexes {
        let Some(old) = table.index(*old_id).cloned() else {
            continue;
        };
        table.indexes.retain(|i| i.id != *old_id);
        if let Some(index) = table.index_mut(*new_id) {
            index.name = old.name;
            index.state = SchemaState::Public;
            index.changing_from = None;
        }
        replaced.push(*old_id);
    }
    schedule_index_ranges(meta, job.id, table.id, &replaced)?;

    let mut done = job.finished(JobState::Done, SchemaState::Public);
    apply_reorg_totals(meta, &mut done)?;
    Ok(done)
}
