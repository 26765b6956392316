//! Foreground DML sessions.
//!
//! A session reads through one catalog snapshot per transaction. Autocommit
//! statements refresh the snapshot first; an explicit transaction keeps the
//! snapshot it began with and fails its commit with `SchemaChanged` if a table
//! it wrote was altered in the meantime.

use crate::cast::{TypeCoercion, coerce_literal};
use crate::catalog::Catalog;
use crate::catalog::schema::{ColumnDef, TableId, TableSchema};
use crate::catalog::types::Datum;
use crate::error::{ResourceType, ShiftError};
use crate::meta::Meta;
use crate::publisher::{SchemaSubscriber, SchemaVersionPublisher};
use crate::storage::codec::RowData;
use crate::storage::kv::KvStore;
use crate::storage::txn::Transaction;
use crate::table::{
    self, HandleAllocator, WriteContext, cell_value, project_public, read_row, scan_rows,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

const AUTOCOMMIT_RETRIES: u32 = 8;

/// Node-level services a session writes through.
#[derive(Clone)]
pub struct SessionEnv {
    pub store: Arc<dyn KvStore>,
    pub publisher: Arc<SchemaVersionPublisher>,
    pub coercion: Arc<dyn TypeCoercion>,
    pub handles: Arc<HandleAllocator>,
}

/// Tables written by a transaction and the update version it saw for each.
type WriteSet = HashMap<TableId, (String, u64)>;

struct OpenTxn {
    txn: Transaction,
    written: WriteSet,
}

struct SessionState {
    catalog: Arc<Catalog>,
    open: Option<OpenTxn>,
    warnings: u64,
}

struct SessionInner {
    id: u64,
    env: SessionEnv,
    pinned: AtomicU64,
    state: Mutex<SessionState>,
}

impl SessionInner {
    fn refresh(&self, state: &mut SessionState) -> Result<(), ShiftError> {
        let catalog = self.env.publisher.reload()?;
        self.pinned.store(catalog.version, Ordering::Release);
        state.catalog = catalog;
        Ok(())
    }

    fn check_schema(&self, written: &WriteSet) -> Result<(), ShiftError> {
        if written.is_empty() {
            return Ok(());
        }
        let latest = self.env.publisher.reload()?;
        for (table_id, (name, version)) in written {
            match latest.table(*table_id) {
                Some(table) if table.update_version == *version => {}
                _ => {
                    return Err(ShiftError::SchemaChanged {
                        table: name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl SchemaSubscriber for SessionInner {
    fn pinned_version(&self) -> u64 {
        self.pinned.load(Ordering::Acquire)
    }

    fn try_refresh(&self) -> u64 {
        if let Some(mut state) = self.state.try_lock() {
            if state.open.is_none() && self.refresh(&mut state).is_err() {
                debug!(session = self.id, "schema refresh failed, keeping pinned snapshot");
            }
        }
        self.pinned_version()
    }
}

pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn new(id: u64, env: SessionEnv) -> Self {
        let catalog = env.publisher.latest();
        Self {
            inner: Arc::new(SessionInner {
                id,
                env,
                pinned: AtomicU64::new(catalog.version),
                state: Mutex::new(SessionState {
                    catalog,
                    open: None,
                    warnings: 0,
                }),
            }),
        }
    }

    pub(crate) fn subscriber(&self) -> Weak<dyn SchemaSubscriber> {
        let inner: Arc<dyn SchemaSubscriber> = Arc::clone(&self.inner) as Arc<dyn SchemaSubscriber>;
        Arc::downgrade(&inner)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn pinned_version(&self) -> u64 {
        self.inner.pinned_version()
    }

    /// The snapshot the next statement will read, refreshed unless a
    /// transaction is open.
    pub fn catalog(&self) -> Result<Arc<Catalog>, ShiftError> {
        let mut state = self.inner.state.lock();
        if state.open.is_none() {
            self.inner.refresh(&mut state)?;
        }
        Ok(Arc::clone(&state.catalog))
    }

    pub fn in_transaction(&self) -> bool {
        self.inner.state.lock().open.is_some()
    }

    /// Warnings raised by the last statement.
    pub fn warning_count(&self) -> u64 {
        self.inner.state.lock().warnings
    }

    pub fn begin(&self) -> Result<(), ShiftError> {
        let mut state = self.inner.state.lock();
        if state.open.is_some() {
            return Err(ShiftError::SessionBusy);
        }
        self.inner.refresh(&mut state)?;
        state.open = Some(OpenTxn {
            txn: Transaction::begin(&self.inner.env.store),
            written: WriteSet::new(),
        });
        Ok(())
    }

    pub fn commit(&self) -> Result<(), ShiftError> {
        let mut state = self.inner.state.lock();
        let Some(open) = state.open.take() else {
            return Ok(());
        };
        let result = self
            .inner
            .check_schema(&open.written)
            .and_then(|()| open.txn.commit().map(|_| ()));
        if let Err(e) = &result {
            debug!(session = self.inner.id, error = %e, "transaction aborted");
        }
        // The snapshot is released with the transaction either way.
        self.inner.refresh(&mut state)?;
        result
    }

    pub fn rollback(&self) {
        let mut state = self.inner.state.lock();
        state.open = None;
        let _ = self.inner.refresh(&mut state);
    }

    /// Inserts one row from `(column, value)` pairs and returns its handle.
    pub fn insert(
        &self,
        schema: &str,
        table: &str,
        values: &[(&str, Datum)],
    ) -> Result<i64, ShiftError> {
        let env = self.inner.env.clone();
        self.write(schema, table, |txn, table, warnings| {
            let (row, explicit) = build_insert_row(&env, table, values, warnings)?;
            let handle = match explicit {
                Some(handle) => {
                    Meta::new(txn).rebase_auto_id(table.id, handle)?;
                    handle
                }
                None => env.handles.next(table.id)?,
            };
            *warnings += table::insert_row(txn, write_ctx(&env, table), handle, row, 1)?;
            Ok(handle)
        })
    }

    /// Applies `(column, value)` assignments to the row at `handle`. Returns
    /// whether the row existed.
    pub fn update(
        &self,
        schema: &str,
        table: &str,
        handle: i64,
        values: &[(&str, Datum)],
    ) -> Result<bool, ShiftError> {
        let env = self.inner.env.clone();
        self.write(schema, table, |txn, table, warnings| {
            let Some(old) = read_row(txn, table, handle)? else {
                return Ok(false);
            };
            let mut new = old.clone();
            for (name, value) in values {
                let column = public_column(table, name)?;
                if table.primary_key == Some(column.id) {
                    return Err(ShiftError::Validation(
                        "updating the primary key column is not supported".into(),
                    ));
                }
                let cell = coerce_cell(&env, table, column, value, warnings)?;
                new.set(column.id, cell);
            }
            *warnings += table::update_row(txn, write_ctx(&env, table), handle, &old, new, 1)?;
            Ok(true)
        })
    }

    pub fn delete(&self, schema: &str, table: &str, handle: i64) -> Result<bool, ShiftError> {
        self.write(schema, table, |txn, table, _| {
            let Some(old) = read_row(txn, table, handle)? else {
                return Ok(false);
            };
            table::delete_row(txn, table, handle, &old)?;
            Ok(true)
        })
    }

    /// Public columns of the row at `handle`, in column order.
    pub fn get(
        &self,
        schema: &str,
        table: &str,
        handle: i64,
    ) -> Result<Option<Vec<Datum>>, ShiftError> {
        self.read(schema, table, |txn, table| {
            Ok(read_row(txn, table, handle)?.map(|row| project_public(table, &row)))
        })
    }

    /// All rows ordered by handle, public columns only.
    pub fn select_all(&self, schema: &str, table: &str) -> Result<Vec<Vec<Datum>>, ShiftError> {
        self.read(schema, table, |txn, table| {
            let mut rows = scan_rows(txn, table)?;
            rows.sort_by_key(|(handle, _)| *handle);
            Ok(rows
                .iter()
                .map(|(_, row)| project_public(table, row))
                .collect())
        })
    }

    /// Names of the columns `select_all` returns.
    pub fn column_names(&self, schema: &str, table: &str) -> Result<Vec<String>, ShiftError> {
        let catalog = self.catalog()?;
        let table = catalog.resolve_table(schema, table)?;
        Ok(table
            .public_columns()
            .into_iter()
            .map(|c| c.name.clone())
            .collect())
    }

    fn read<T>(
        &self,
        schema: &str,
        table: &str,
        f: impl FnOnce(&Transaction, &TableSchema) -> Result<T, ShiftError>,
    ) -> Result<T, ShiftError> {
        let mut state = self.inner.state.lock();
        if state.open.is_none() {
            self.inner.refresh(&mut state)?;
        }
        let SessionState { catalog, open, .. } = &mut *state;
        let table = Arc::clone(catalog.resolve_table(schema, table)?);
        match open {
            Some(open) => f(&open.txn, &table),
            None => f(&Transaction::begin(&self.inner.env.store), &table),
        }
    }

    fn write<T>(
        &self,
        schema: &str,
        table: &str,
        mut f: impl FnMut(&mut Transaction, &TableSchema, &mut u64) -> Result<T, ShiftError>,
    ) -> Result<T, ShiftError> {
        let mut state = self.inner.state.lock();
        state.warnings = 0;

        if state.open.is_some() {
            let SessionState {
                catalog,
                open,
                warnings,
            } = &mut *state;
            let table = Arc::clone(catalog.resolve_table(schema, table)?);
            let Some(open) = open.as_mut() else {
                return Err(ShiftError::Validation("transaction vanished".into()));
            };
            let out = f(&mut open.txn, &table, warnings)?;
            open.written
                .entry(table.id)
                .or_insert_with(|| (table.name.clone(), table.update_version));
            return Ok(out);
        }

        let mut attempt = 0;
        loop {
            self.inner.refresh(&mut state)?;
            let table = Arc::clone(state.catalog.resolve_table(schema, table)?);
            let mut txn = Transaction::begin(&self.inner.env.store);
            let mut warnings = 0;
            let out = f(&mut txn, &table, &mut warnings)?;
            let mut written = WriteSet::new();
            written.insert(table.id, (table.name.clone(), table.update_version));
            let committed = self
                .inner
                .check_schema(&written)
                .and_then(|()| txn.commit().map(|_| ()));
            match committed {
                Ok(()) => {
                    state.warnings = warnings;
                    return Ok(out);
                }
                Err(e)
                    if (e.is_retryable() || matches!(e, ShiftError::SchemaChanged { .. }))
                        && attempt < AUTOCOMMIT_RETRIES =>
                {
                    debug!(session = self.inner.id, attempt, error = %e, "retrying autocommit statement");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!(session = self.inner.id, "session closed");
    }
}

fn write_ctx<'a>(env: &'a SessionEnv, table: &'a TableSchema) -> WriteContext<'a> {
    WriteContext {
        table,
        coercion: env.coercion.as_ref(),
        mode: table.sql_mode,
    }
}

fn public_column<'a>(table: &'a TableSchema, name: &str) -> Result<&'a ColumnDef, ShiftError> {
    table
        .public_column(name)
        .ok_or_else(|| ShiftError::NotFound {
            resource_type: ResourceType::Column,
            resource_id: format!("{}.{name}", table.name),
        })
}

fn coerce_cell(
    env: &SessionEnv,
    table: &TableSchema,
    column: &ColumnDef,
    value: &Datum,
    warnings: &mut u64,
) -> Result<Datum, ShiftError> {
    if value.is_null() && column.rejects_null() {
        return Err(ShiftError::BadNull {
            column: column.name.clone(),
        });
    }
    let outcome = coerce_literal(env.coercion.as_ref(), value, column, table.sql_mode)
        .map_err(|e| e.into_shift_error(&column.name, 1))?;
    if outcome.warning.is_some() {
        *warnings += 1;
    }
    Ok(outcome.value)
}

/// Builds the stored row for an insert. Returns the explicit handle when the
/// table has an integer primary key.
fn build_insert_row(
    env: &SessionEnv,
    table: &TableSchema,
    values: &[(&str, Datum)],
    warnings: &mut u64,
) -> Result<(RowData, Option<i64>), ShiftError> {
    let mut row = RowData::default();
    for (name, value) in values {
        let column = public_column(table, name)?;
        let cell = coerce_cell(env, table, column, value, warnings)?;
        row.set(column.id, cell);
    }
    for column in &table.columns {
        let writable = column.is_public() || column.state.is_writable();
        if !writable || column.changing_from.is_some() || row.get(column.id).is_some() {
            continue;
        }
        let value = match &column.default {
            Some(default) => default.clone(),
            None if !column.nullable && !column.is_public() => column.col_type.zero_value(),
            None => Datum::Null,
        };
        if value.is_null() && column.rejects_null() {
            return Err(ShiftError::BadNull {
                column: column.name.clone(),
            });
        }
        row.set(column.id, value);
    }

    let Some(pk) = table.primary_key else {
        return Ok((row, None));
    };
    let handle = table
        .column(pk)
        .map(|c| cell_value(&row, c))
        .and_then(|v| v.as_i128())
        .and_then(|v| i64::try_from(v).ok())
        .ok_or_else(|| ShiftError::Validation(format!(
            "primary key of table '{}' must be an integer value",
            table.name
        )))?;
    Ok((row, Some(handle)))
}
