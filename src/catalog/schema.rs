use crate::catalog::types::{ColumnType, Datum};
use crate::config::SqlMode;
use serde::{Deserialize, Serialize};

pub type SchemaId = i64;
pub type TableId = i64;
pub type ColumnId = i64;
pub type IndexId = i64;

/// Visibility of a schema object while a change rolls out.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum SchemaState {
    #[default]
    None,
    DeleteOnly,
    WriteOnly,
    WriteReorganization,
    Public,
}

impl SchemaState {
    /// Foreground writes must maintain the object.
    pub fn is_writable(self) -> bool {
        self >= SchemaState::WriteOnly
    }

    /// Foreground deletes must remove the object's data.
    pub fn is_deletable(self) -> bool {
        self >= SchemaState::DeleteOnly
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SchemaState::None => "none",
            SchemaState::DeleteOnly => "delete only",
            SchemaState::WriteOnly => "write only",
            SchemaState::WriteReorganization => "write reorganization",
            SchemaState::Public => "public",
        }
    }
}

impl std::fmt::Display for SchemaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaInfo {
    pub id: SchemaId,
    pub name: String,
    pub state: SchemaState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnDef {
    pub id: ColumnId,
    pub name: String,
    pub offset: usize,
    pub col_type: ColumnType,
    pub nullable: bool,
    pub default: Option<Datum>,
    /// Value read for rows written before the column existed.
    pub origin_default: Option<Datum>,
    /// Set on a column being narrowed to NOT NULL so new NULLs are refused early.
    pub prevent_null_insert: bool,
    pub state: SchemaState,
    /// For a shadow column, the column it will replace.
    pub changing_from: Option<ColumnId>,
}

impl ColumnDef {
    pub fn is_public(&self) -> bool {
        self.state == SchemaState::Public
    }

    pub fn rejects_null(&self) -> bool {
        !self.nullable || self.prevent_null_insert
    }

    /// Value of this column in a stored row that has no cell for it.
    pub fn missing_value(&self) -> Datum {
        self.origin_default.clone().unwrap_or(Datum::Null)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexDef {
    pub id: IndexId,
    pub name: String,
    pub columns: Vec<ColumnId>,
    pub unique: bool,
    pub state: SchemaState,
    /// For a shadow index, the index it will replace.
    pub changing_from: Option<IndexId>,
}

impl IndexDef {
    pub fn covers(&self, column: ColumnId) -> bool {
        self.columns.contains(&column)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableSchema {
    pub id: TableId,
    pub schema_id: SchemaId,
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub indexes: Vec<IndexDef>,
    /// Integer column whose value is the row handle.
    pub primary_key: Option<ColumnId>,
    /// Physical ids of hash partitions keyed on the row handle. Empty when unpartitioned.
    pub partitions: Vec<TableId>,
    pub sql_mode: SqlMode,
    pub state: SchemaState,
    /// Schema version of the last change to this table.
    pub update_version: u64,
}

impl TableSchema {
    pub fn public_columns(&self) -> Vec<&ColumnDef> {
        let mut cols: Vec<&ColumnDef> = self.columns.iter().filter(|c| c.is_public()).collect();
        cols.sort_by_key(|c| c.offset);
        cols
    }

    pub fn public_column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns
            .iter()
            .find(|c| c.is_public() && c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_by_name(&self, name: &str) -> Option<&ColumnDef> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column(&self, id: ColumnId) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.id == id)
    }

    pub fn column_mut(&mut self, id: ColumnId) -> Option<&mut ColumnDef> {
        self.columns.iter_mut().find(|c| c.id == id)
    }

    pub fn index(&self, id: IndexId) -> Option<&IndexDef> {
        self.indexes.iter().find(|i| i.id == id)
    }

    pub fn index_mut(&mut self, id: IndexId) -> Option<&mut IndexDef> {
        self.indexes.iter_mut().find(|i| i.id == id)
    }

    pub fn index_by_name(&self, name: &str) -> Option<&IndexDef> {
        self.indexes
            .iter()
            .find(|i| i.name.eq_ignore_ascii_case(name))
    }

    /// Non-public columns that foreground writes must fill.
    pub fn writable_hidden_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns
            .iter()
            .filter(|c| !c.is_public() && c.state.is_writable())
    }

    pub fn writable_indexes(&self) -> impl Iterator<Item = &IndexDef> {
        self.indexes.iter().filter(|i| i.state.is_writable())
    }

    pub fn deletable_indexes(&self) -> impl Iterator<Item = &IndexDef> {
        self.indexes.iter().filter(|i| i.state.is_deletable())
    }

    pub fn physical_ids(&self) -> Vec<TableId> {
        if self.partitions.is_empty() {
            vec![self.id]
        } else {
            self.partitions.clone()
        }
    }

    pub fn physical_id_for(&self, handle: i64) -> TableId {
        if self.partitions.is_empty() {
            return self.id;
        }
        let slot = handle.rem_euclid(self.partitions.len() as i64) as usize;
        self.partitions[slot]
    }

    /// Appends a column at the end of the public offset order.
    pub fn next_offset(&self) -> usize {
        self.columns
            .iter()
            .map(|c| c.offset + 1)
            .max()
            .unwrap_or(0)
    }

    /// Next free shadow name of the form `<prefix><base>_<n>`.
    pub fn shadow_name(&self, prefix: &str, base: &str) -> String {
        let taken = |name: &str| {
            self.column_by_name(name).is_some() || self.index_by_name(name).is_some()
        };
        let mut n = 0u32;
        loop {
            let candidate = format!("{prefix}{base}_{n}");
            if !taken(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}
