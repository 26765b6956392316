//! Schema and table creation. Both complete in a single step: the new object
//! becomes public in one version since no session can hold a reference to it.

use super::worker::Transition;
use super::{TableSpec, column_from_spec, resolve_schema};
use crate::cast::TypeCoercion;
use crate::catalog::schema::{ColumnDef, IndexDef, SchemaInfo, SchemaState, TableSchema};
use crate::error::{ResourceType, ShiftError};
use crate::job::{Job, JobKind, JobState};
use crate::meta::Meta;

pub(crate) fn prepare_create_schema(
    meta: &mut Meta<'_>,
    name: &str,
    query: &str,
) -> Result<Job, ShiftError> {
    if name.is_empty() {
        return Err(ShiftError::Validation("schema name must not be empty".into()));
    }
    if resolve_schema(meta, name).is_ok() {
        return Err(ShiftError::AlreadyExists {
            resource_type: ResourceType::Schema,
            resource_id: name.to_string(),
        });
    }
    let ids = meta.gen_global_ids(2)?;
    let schema = SchemaInfo {
        id: ids[1],
        name: name.to_string(),
        state: SchemaState::None,
    };
    Ok(Job::new(ids[0], JobKind::CreateSchema { schema }, ids[1], 0, query))
}

pub(crate) fn prepare_create_table(
    meta: &mut Meta<'_>,
    coercion: &dyn TypeCoercion,
    schema: &str,
    spec: &TableSpec,
    query: &str,
) -> Result<Job, ShiftError> {
    let info = resolve_schema(meta, schema)?;
    if spec.columns.is_empty() {
        return Err(ShiftError::Validation(format!(
            "table '{}' must have at least one column",
            spec.name
        )));
    }
    if meta
        .list_tables(info.id)?
        .iter()
        .any(|t| t.name.eq_ignore_ascii_case(&spec.name))
    {
        return Err(ShiftError::AlreadyExists {
            resource_type: ResourceType::Table,
            resource_id: format!("{schema}.{}", spec.name),
        });
    }

    let ids = meta.gen_global_ids(2 + spec.columns.len() + spec.indexes.len() + spec.partitions)?;
    let (job_id, table_id) = (ids[0], ids[1]);
    let mut next_id = ids[2..].iter().copied();
    let mut alloc = || {
        next_id
            .next()
            .ok_or_else(|| ShiftError::Validation("id allocation exhausted".into()))
    };

    let mut columns: Vec<ColumnDef> = Vec::with_capacity(spec.columns.len());
    for (offset, column_spec) in spec.columns.iter().enumerate() {
        if columns.iter().any(|c| c.name.eq_ignore_ascii_case(&column_spec.name)) {
            return Err(ShiftError::AlreadyExists {
                resource_type: ResourceType::Column,
                resource_id: column_spec.name.clone(),
            });
        }
        let mut column_spec = column_spec.clone();
        if spec
            .primary_key
            .as_deref()
            .is_some_and(|pk| pk.eq_ignore_ascii_case(&column_spec.name))
        {
            column_spec.nullable = false;
        }
        columns.push(column_from_spec(
            coercion,
            &column_spec,
            alloc()?,
            offset,
            SchemaState::Public,
        )?);
    }

    let primary_key = match &spec.primary_key {
        None => None,
        Some(name) => {
            let column = columns
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(name))
                .ok_or_else(|| ShiftError::NotFound {
                    resource_type: ResourceType::Column,
                    resource_id: name.clone(),
                })?;
            if !column.col_type.is_integer() {
                return Err(ShiftError::Validation(format!(
                    "primary key column '{name}' must have an integer type"
                )));
            }
            Some(column.id)
        }
    };

    let mut indexes: Vec<IndexDef> = Vec::with_capacity(spec.indexes.len());
    for index in &spec.indexes {
        if indexes.iter().any(|i| i.name.eq_ignore_ascii_case(&index.name)) {
            return Err(ShiftError::AlreadyExists {
                resource_type: ResourceType::Index,
                resource_id: index.name.clone(),
            });
        }
        let mut column_ids = Vec::with_capacity(index.columns.len());
        for name in &index.columns {
            let column = columns
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(name))
                .ok_or_else(|| ShiftError::NotFound {
                    resource_type: ResourceType::Column,
                    resource_id: name.clone(),
                })?;
            column_ids.push(column.id);
        }
        indexes.push(IndexDef {
            id: alloc()?,
            name: index.name.clone(),
            columns: column_ids,
            unique: index.unique,
            state: SchemaState::Public,
            changing_from: None,
        });
    }

    let mut partitions = Vec::with_capacity(spec.partitions);
    for _ in 0..spec.partitions {
        partitions.push(alloc()?);
    }

    let table = TableSchema {
        id: table_id,
        schema_id: info.id,
        name: spec.name.clone(),
        columns,
        indexes,
        primary_key,
        partitions,
        sql_mode: spec.sql_mode.unwrap_or_default(),
        state: SchemaState::None,
        update_version: 0,
    };
    Ok(Job::new(job_id, JobKind::CreateTable { table }, info.id, table_id, query))
}

pub(crate) fn on_create_schema(meta: &mut Meta<'_>, job: &Job) -> Result<Transition, ShiftError> {
    let JobKind::CreateSchema { schema } = &job.kind else {
        return Err(ShiftError::Validation(format!("job {} is not a create schema job", job.id)));
    };
    if resolve_schema(meta, &schema.name).is_ok() {
        return Err(ShiftError::AlreadyExists {
            resource_type: ResourceType::Schema,
            resource_id: schema.name.clone(),
        });
    }
    let created = SchemaInfo {
        state: SchemaState::Public,
        ..schema.clone()
    };
    Ok(Transition::new(job.finished(JobState::Done, SchemaState::Public)).with_schema(created))
}

pub(crate) fn on_create_table(meta: &mut Meta<'_>, job: &Job) -> Result<Transition, ShiftError> {
    let JobKind::CreateTable { table } = &job.kind else {
        return Err(ShiftError::Validation(format!("job {} is not a create table job", job.id)));
    };
    let schema = meta.schema(job.schema_id)?.ok_or_else(|| ShiftError::NotFound {
        resource_type: ResourceType::Schema,
        resource_id: job.schema_id.to_string(),
    })?;
    if meta
        .list_tables(schema.id)?
        .iter()
        .any(|t| t.name.eq_ignore_ascii_case(&table.name))
    {
        return Err(ShiftError::AlreadyExists {
            resource_type: ResourceType::Table,
            resource_id: format!("{}.{}", schema.name, table.name),
        });
    }
    let created = TableSchema {
        state: SchemaState::Public,
        ..table.clone()
    };
    Ok(Transition::new(job.finished(JobState::Done, SchemaState::Public)).with_table(created))
}
