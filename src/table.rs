//! Row and index mutation shared by foreground writes and backfill.
//!
//! Every write path goes through [`fill_shadow_columns`], so a shadow cell
//! produced by a session's dual write and one produced by the reorg worker
//! come from the same cast of the same original value.

use crate::cast::TypeCoercion;
use crate::catalog::schema::{ColumnDef, IndexDef, TableId, TableSchema};
use crate::catalog::types::Datum;
use crate::config::SqlMode;
use crate::error::ShiftError;
use crate::meta::Meta;
use crate::storage::codec::{
    RowData, decode_handle_value, decode_record_handle, encode_handle_value, index_key,
    record_key, record_range,
};
use crate::storage::kv::KvStore;
use crate::storage::txn::Transaction;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

const PRIMARY_INDEX_NAME: &str = "PRIMARY";
const ALLOC_RETRIES: u32 = 16;

/// Everything a row mutation needs to know about the table it writes.
#[derive(Clone, Copy)]
pub struct WriteContext<'a> {
    pub table: &'a TableSchema,
    pub coercion: &'a dyn TypeCoercion,
    pub mode: SqlMode,
}

/// Value of `column` in a stored row. Rows written before the column existed
/// read its origin default.
pub fn cell_value(row: &RowData, column: &ColumnDef) -> Datum {
    row.get(column.id)
        .cloned()
        .unwrap_or_else(|| column.missing_value())
}

/// Public columns in offset order.
pub fn project_public(table: &TableSchema, row: &RowData) -> Vec<Datum> {
    table
        .public_columns()
        .into_iter()
        .map(|c| cell_value(row, c))
        .collect()
}

pub fn read_row(
    txn: &Transaction,
    table: &TableSchema,
    handle: i64,
) -> Result<Option<RowData>, ShiftError> {
    let key = record_key(table.physical_id_for(handle), handle);
    txn.get(&key)?.map(|bytes| RowData::decode(&bytes)).transpose()
}

/// Every row of the table across its partitions, in handle order per partition.
pub fn scan_rows(
    txn: &Transaction,
    table: &TableSchema,
) -> Result<Vec<(i64, RowData)>, ShiftError> {
    let mut rows = Vec::new();
    for physical_id in table.physical_ids() {
        let (start, end) = record_range(physical_id);
        for (key, value) in txn.scan(&start, &end, usize::MAX)? {
            rows.push((decode_record_handle(&key)?, RowData::decode(&value)?));
        }
    }
    Ok(rows)
}

/// Recomputes every writable shadow column from the column it replaces.
/// Returns the number of lossy conversions.
pub fn fill_shadow_columns(
    ctx: WriteContext<'_>,
    row: &mut RowData,
    row_no: i64,
) -> Result<u64, ShiftError> {
    let mut warnings = 0;
    for shadow in ctx.table.writable_hidden_columns() {
        let Some(origin_id) = shadow.changing_from else {
            continue;
        };
        let Some(origin) = ctx.table.column(origin_id) else {
            continue;
        };
        let value = cell_value(row, origin);
        let outcome = ctx
            .coercion
            .cast(&value, &origin.col_type, shadow, ctx.mode)
            .map_err(|e| e.into_shift_error(&origin.name, row_no))?;
        if outcome.warning.is_some() {
            warnings += 1;
        }
        row.set(shadow.id, outcome.value);
    }
    Ok(warnings)
}

fn index_values(table: &TableSchema, index: &IndexDef, row: &RowData) -> Vec<Datum> {
    index
        .columns
        .iter()
        .map(|id| {
            table
                .column(*id)
                .map(|c| cell_value(row, c))
                .unwrap_or(Datum::Null)
        })
        .collect()
}

fn render_entry(values: &[Datum]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("-")
}

/// Unique entries without NULLs are keyed by value alone and store the handle.
fn is_distinct_key(index: &IndexDef, values: &[Datum]) -> bool {
    index.unique && !values.iter().any(Datum::is_null)
}

pub fn put_index_entry(
    txn: &mut Transaction,
    table: &TableSchema,
    index: &IndexDef,
    row: &RowData,
    handle: i64,
) -> Result<(), ShiftError> {
    let values = index_values(table, index, row);
    if !is_distinct_key(index, &values) {
        txn.put(index_key(table.id, index.id, &values, Some(handle)), Vec::new());
        return Ok(());
    }
    let key = index_key(table.id, index.id, &values, None);
    if let Some(existing) = txn.get(&key)? {
        if decode_handle_value(&existing)? != handle {
            return Err(ShiftError::DuplicateEntry {
                index: index.name.clone(),
                entry: render_entry(&values),
            });
        }
    }
    txn.put(key, encode_handle_value(handle));
    Ok(())
}

pub fn delete_index_entry(
    txn: &mut Transaction,
    table: &TableSchema,
    index: &IndexDef,
    row: &RowData,
    handle: i64,
) -> Result<(), ShiftError> {
    let values = index_values(table, index, row);
    if !is_distinct_key(index, &values) {
        txn.delete(index_key(table.id, index.id, &values, Some(handle)));
        return Ok(());
    }
    let key = index_key(table.id, index.id, &values, None);
    // Another row may own the entry if this row never reached the index.
    if let Some(existing) = txn.get(&key)? {
        if decode_handle_value(&existing)? == handle {
            txn.delete(key);
        }
    }
    Ok(())
}

pub fn insert_row(
    txn: &mut Transaction,
    ctx: WriteContext<'_>,
    handle: i64,
    mut row: RowData,
    row_no: i64,
) -> Result<u64, ShiftError> {
    let key = record_key(ctx.table.physical_id_for(handle), handle);
    if txn.get(&key)?.is_some() {
        return Err(ShiftError::DuplicateEntry {
            index: PRIMARY_INDEX_NAME.into(),
            entry: handle.to_string(),
        });
    }
    let warnings = fill_shadow_columns(ctx, &mut row, row_no)?;
    for index in ctx.table.writable_indexes() {
        put_index_entry(txn, ctx.table, index, &row, handle)?;
    }
    txn.put(key, row.encode()?);
    Ok(warnings)
}

pub fn update_row(
    txn: &mut Transaction,
    ctx: WriteContext<'_>,
    handle: i64,
    old: &RowData,
    mut new: RowData,
    row_no: i64,
) -> Result<u64, ShiftError> {
    let warnings = fill_shadow_columns(ctx, &mut new, row_no)?;
    for index in ctx.table.deletable_indexes() {
        delete_index_entry(txn, ctx.table, index, old, handle)?;
    }
    for index in ctx.table.writable_indexes() {
        put_index_entry(txn, ctx.table, index, &new, handle)?;
    }
    let key = record_key(ctx.table.physical_id_for(handle), handle);
    txn.put(key, new.encode()?);
    Ok(warnings)
}

pub fn delete_row(
    txn: &mut Transaction,
    table: &TableSchema,
    handle: i64,
    old: &RowData,
) -> Result<(), ShiftError> {
    for index in table.deletable_indexes() {
        delete_index_entry(txn, table, index, old, handle)?;
    }
    txn.delete(record_key(table.physical_id_for(handle), handle));
    Ok(())
}

/// Brings one existing row up to date with the reorganization in progress:
/// shadow cells are recomputed and entries of `indexes` are written. The row
/// key is always rewritten so a concurrent foreground write on the same row
/// conflicts with this transaction. Returns `None` when the row is gone.
pub fn backfill_row(
    txn: &mut Transaction,
    ctx: WriteContext<'_>,
    physical_id: TableId,
    handle: i64,
    indexes: &[IndexDef],
    row_no: i64,
) -> Result<Option<u64>, ShiftError> {
    let key = record_key(physical_id, handle);
    let Some(bytes) = txn.get(&key)? else {
        return Ok(None);
    };
    let mut row = RowData::decode(&bytes)?;
    let warnings = fill_shadow_columns(ctx, &mut row, row_no)?;
    for index in indexes {
        put_index_entry(txn, ctx.table, index, &row, handle)?;
    }
    txn.put(key, row.encode()?);
    Ok(Some(warnings))
}

/// Hands out row handles for tables without an integer primary key, reserving
/// them from the persisted allocator in blocks.
pub struct HandleAllocator {
    store: Arc<dyn KvStore>,
    step: i64,
    ranges: Mutex<HashMap<TableId, (i64, i64)>>,
}

impl HandleAllocator {
    pub fn new(store: Arc<dyn KvStore>, step: i64) -> Self {
        Self {
            store,
            step: step.max(1),
            ranges: Mutex::new(HashMap::new()),
        }
    }

    pub fn next(&self, table_id: TableId) -> Result<i64, ShiftError> {
        let mut ranges = self.ranges.lock();
        let range = ranges.entry(table_id).or_insert((0, 0));
        if range.0 >= range.1 {
            *range = self.reserve(table_id)?;
        }
        let handle = range.0;
        range.0 += 1;
        Ok(handle)
    }

    fn reserve(&self, table_id: TableId) -> Result<(i64, i64), ShiftError> {
        let mut attempt = 0;
        loop {
            let mut txn = Transaction::begin(&self.store);
            let reserved = Meta::new(&mut txn).alloc_auto_ids(table_id, self.step)?;
            match txn.commit() {
                Ok(_) => return Ok(reserved),
                Err(e) if e.is_retryable() && attempt < ALLOC_RETRIES => attempt += 1,
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        HandleAllocator, WriteContext, backfill_row, delete_row, insert_row, read_row, scan_rows,
        update_row,
    };
    use crate::cast::SqlCoercion;
    use crate::catalog::schema::{ColumnDef, IndexDef, SchemaState, TableSchema};
    use crate::catalog::types::{ColumnType, Datum};
    use crate::config::SqlMode;
    use crate::error::ShiftError;
    use crate::storage::codec::RowData;
    use crate::storage::kv::{KvStore, MemKvStore};
    use crate::storage::txn::Transaction;
    use std::sync::Arc;

    fn column(id: i64, name: &str, col_type: ColumnType, state: SchemaState) -> ColumnDef {
        ColumnDef {
            id,
            name: name.into(),
            offset: id as usize,
            col_type,
            nullable: true,
            default: None,
            origin_default: None,
            prevent_null_insert: false,
            state,
            changing_from: None,
        }
    }

    fn table_with_shadow(shadow_state: SchemaState) -> TableSchema {
        let mut shadow = column(2, "_Col$_a_0", ColumnType::bigint(), shadow_state);
        shadow.changing_from = Some(1);
        TableSchema {
            id: 100,
            schema_id: 1,
            name: "t".into(),
            columns: vec![column(1, "a", ColumnType::Text, SchemaState::Public), shadow],
            indexes: vec![IndexDef {
                id: 5,
                name: "_Idx$_ia_0".into(),
                columns: vec![2],
                unique: true,
                state: shadow_state,
                changing_from: None,
            }],
            primary_key: None,
            partitions: vec![101, 102],
            sql_mode: SqlMode::Strict,
            state: SchemaState::Public,
            update_version: 1,
        }
    }

    fn row(a: &str) -> RowData {
        let mut row = RowData::default();
        row.set(1, Datum::text(a));
        row
    }

    #[test]
    fn dual_write_fills_shadow_and_checks_unique() {
        let store: Arc<dyn KvStore> = Arc::new(MemKvStore::new());
        let table = table_with_shadow(SchemaState::WriteOnly);
        let coercion = SqlCoercion::default();
        let ctx = WriteContext {
            table: &table,
            coercion: &coercion,
            mode: SqlMode::Strict,
        };
        let mut txn = Transaction::begin(&store);
        insert_row(&mut txn, ctx, 1, row("7"), 1).expect("insert");
        let stored = read_row(&txn, &table, 1).expect("read").expect("row");
        assert_eq!(stored.get(2), Some(&Datum::Int(7)));

        let err = insert_row(&mut txn, ctx, 2, row("7"), 1).expect_err("duplicate shadow key");
        assert!(matches!(err, ShiftError::DuplicateEntry { .. }));

        let err = insert_row(&mut txn, ctx, 3, row("x"), 1).expect_err("cast failure");
        assert_eq!(err.to_string(), "Incorrect integer value: 'x' for column 'a' at row 1");

        update_row(&mut txn, ctx, 1, &stored, row("8"), 1).expect("update");
        insert_row(&mut txn, ctx, 2, row("7"), 1).expect("old key released");
        assert_eq!(scan_rows(&txn, &table).expect("scan").len(), 2);
        let second = read_row(&txn, &table, 2).expect("read").expect("row");
        delete_row(&mut txn, &table, 2, &second).expect("delete");
        assert_eq!(scan_rows(&txn, &table).expect("scan").len(), 1);
    }

    #[test]
    fn delete_only_shadow_is_not_written() {
        let store: Arc<dyn KvStore> = Arc::new(MemKvStore::new());
        let table = table_with_shadow(SchemaState::DeleteOnly);
        let coercion = SqlCoercion::default();
        let ctx = WriteContext {
            table: &table,
            coercion: &coercion,
            mode: SqlMode::Strict,
        };
        let mut txn = Transaction::begin(&store);
        insert_row(&mut txn, ctx, 1, row("not a number"), 1).expect("shadow ignored");
        let stored = read_row(&txn, &table, 1).expect("read").expect("row");
        assert_eq!(stored.get(2), None);
    }

    #[test]
    fn backfill_converts_rows_written_before_the_shadow() {
        let store: Arc<dyn KvStore> = Arc::new(MemKvStore::new());
        let before = table_with_shadow(SchemaState::DeleteOnly);
        let coercion = SqlCoercion::default();
        let mut txn = Transaction::begin(&store);
        let ctx = WriteContext {
            table: &before,
            coercion: &coercion,
            mode: SqlMode::Strict,
        };
        insert_row(&mut txn, ctx, 4, row("42"), 1).expect("insert");
        txn.commit().expect("commit");

        let reorg = table_with_shadow(SchemaState::WriteReorganization);
        let ctx = WriteContext {
            table: &reorg,
            ..ctx
        };
        let mut txn = Transaction::begin(&store);
        let physical = reorg.physical_id_for(4);
        let warnings = backfill_row(&mut txn, ctx, physical, 4, &reorg.indexes, 1)
            .expect("backfill")
            .expect("row exists");
        assert_eq!(warnings, 0);
        assert_eq!(
            backfill_row(&mut txn, ctx, physical, 99, &reorg.indexes, 1).expect("missing row"),
            None
        );
        txn.commit().expect("commit");
        let txn = Transaction::begin(&store);
        let stored = read_row(&txn, &reorg, 4).expect("read").expect("row");
        assert_eq!(stored.get(2), Some(&Datum::Int(42)));
    }

    #[test]
    fn handles_are_reserved_in_blocks() {
        let store: Arc<dyn KvStore> = Arc::new(MemKvStore::new());
        let first = HandleAllocator::new(Arc::clone(&store), 2);
        let second = HandleAllocator::new(Arc::clone(&store), 2);
        assert_eq!(first.next(9).expect("h"), 1);
        assert_eq!(second.next(9).expect("h"), 3);
        assert_eq!(first.next(9).expect("h"), 2);
        assert_eq!(first.next(9).expect("h"), 5);
    }
}
