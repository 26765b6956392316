pub mod schema;
pub mod types;

use crate::catalog::schema::{SchemaId, SchemaInfo, TableId, TableSchema};
use crate::error::{ResourceType, ShiftError};
use im::HashMap;
use std::sync::Arc;

/// An immutable view of all schema metadata at one schema version.
///
/// Readers hold an `Arc<Catalog>` for the duration of a transaction; a newer
/// version is produced by [`Catalog::apply`], which shares every untouched
/// table with its predecessor.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub version: u64,
    pub schemas: HashMap<SchemaId, Arc<SchemaInfo>>,
    pub tables: HashMap<TableId, Arc<TableSchema>>,
    schema_names: HashMap<String, SchemaId>,
    table_names: HashMap<(SchemaId, String), TableId>,
}

/// One metadata change folded into a catalog snapshot.
#[derive(Debug, Clone)]
pub enum CatalogChange {
    PutSchema(SchemaInfo),
    DropSchema(SchemaId),
    PutTable(TableSchema),
    DropTable(TableId),
}

impl Catalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds the next snapshot. `self` is left untouched.
    pub fn apply(&self, version: u64, changes: Vec<CatalogChange>) -> Catalog {
        let mut next = self.clone();
        next.version = version;
        for change in changes {
            match change {
                CatalogChange::PutSchema(info) => {
                    if let Some(prev) = next.schemas.get(&info.id) {
                        next.schema_names.remove(&prev.name.to_ascii_lowercase());
                    }
                    next.schema_names
                        .insert(info.name.to_ascii_lowercase(), info.id);
                    next.schemas.insert(info.id, Arc::new(info));
                }
                CatalogChange::DropSchema(id) => {
                    if let Some(prev) = next.schemas.remove(&id) {
                        next.schema_names.remove(&prev.name.to_ascii_lowercase());
                    }
                    let doomed: Vec<TableId> = next
                        .tables
                        .values()
                        .filter(|t| t.schema_id == id)
                        .map(|t| t.id)
                        .collect();
                    for tid in doomed {
                        next.remove_table(tid);
                    }
                }
                CatalogChange::PutTable(table) => {
                    next.remove_table(table.id);
                    next.table_names
                        .insert((table.schema_id, table.name.to_ascii_lowercase()), table.id);
                    next.tables.insert(table.id, Arc::new(table));
                }
                CatalogChange::DropTable(id) => next.remove_table(id),
            }
        }
        next
    }

    fn remove_table(&mut self, id: TableId) {
        if let Some(prev) = self.tables.remove(&id) {
            self.table_names
                .remove(&(prev.schema_id, prev.name.to_ascii_lowercase()));
        }
    }

    pub fn schema_by_name(&self, name: &str) -> Option<&Arc<SchemaInfo>> {
        let id = self.schema_names.get(&name.to_ascii_lowercase())?;
        self.schemas.get(id)
    }

    pub fn table(&self, id: TableId) -> Option<&Arc<TableSchema>> {
        self.tables.get(&id)
    }

    pub fn table_by_name(&self, schema: &str, table: &str) -> Option<&Arc<TableSchema>> {
        let schema_id = self.schema_by_name(schema)?.id;
        let id = self
            .table_names
            .get(&(schema_id, table.to_ascii_lowercase()))?;
        self.tables.get(id)
    }

    pub fn resolve_table(&self, schema: &str, table: &str) -> Result<&Arc<TableSchema>, ShiftError> {
        if self.schema_by_name(schema).is_none() {
            return Err(ShiftError::NotFound {
                resource_type: ResourceType::Schema,
                resource_id: schema.to_string(),
            });
        }
        self.table_by_name(schema, table)
            .ok_or_else(|| ShiftError::NotFound {
                resource_type: ResourceType::Table,
                resource_id: format!("{schema}.{table}"),
            })
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }
}
