//! Immutable catalog snapshots and the diff between two of them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use super::{Column, Schema, Table};

static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

/// Point-in-time copy of the catalog. Two snapshots are equal iff they carry
/// the same version; versions strictly increase across the process.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    version: u64,
    tables: HashMap<Uuid, Table>,
    schemas: HashMap<Uuid, Schema>,
    columns: HashMap<Uuid, Column>,
}

impl PartialEq for CatalogSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
    }
}

impl Eq for CatalogSnapshot {}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogDiff {
    pub added_tables: Vec<Table>,
    pub updated_tables: Vec<Table>,
    pub removed_tables: Vec<Table>,
    pub added_schemas: Vec<Schema>,
    pub updated_schemas: Vec<Schema>,
    pub removed_schemas: Vec<Schema>,
    pub added_columns: Vec<Column>,
    pub updated_columns: Vec<Column>,
    pub removed_columns: Vec<Column>,
}

impl CatalogDiff {
    pub fn is_empty(&self) -> bool {
        self.added_tables.is_empty()
            && self.updated_tables.is_empty()
            && self.removed_tables.is_empty()
            && self.added_schemas.is_empty()
            && self.updated_schemas.is_empty()
            && self.removed_schemas.is_empty()
            && self.added_columns.is_empty()
            && self.updated_columns.is_empty()
            && self.removed_columns.is_empty()
    }
}

/// (added, updated, removed), each sorted by id. Updated entries carry the newer value.
fn diff_entries<V: Clone>(
    older: &HashMap<Uuid, V>,
    newer: &HashMap<Uuid, V>,
    same: impl Fn(&V, &V) -> bool,
) -> (Vec<V>, Vec<V>, Vec<V>) {
    let mut added: Vec<(Uuid, V)> = Vec::new();
    let mut updated: Vec<(Uuid, V)> = Vec::new();
    for (id, value) in newer {
        match older.get(id) {
            None => added.push((*id, value.clone())),
            Some(old) if !same(old, value) => updated.push((*id, value.clone())),
            Some(_) => {}
        }
    }
    let removed: Vec<(Uuid, V)> = older
        .iter()
        .filter(|(id, _)| !newer.contains_key(id))
        .map(|(id, v)| (*id, v.clone()))
        .collect();

    let sorted = |mut entries: Vec<(Uuid, V)>| {
        entries.sort_by_key(|(id, _)| *id);
        entries.into_iter().map(|(_, v)| v).collect::<Vec<_>>()
    };
    (sorted(added), sorted(updated), sorted(removed))
}

impl CatalogSnapshot {
    pub fn new(
        tables: HashMap<Uuid, Table>,
        schemas: HashMap<Uuid, Schema>,
        columns: HashMap<Uuid, Column>,
    ) -> Self {
        Self {
            version: NEXT_VERSION.fetch_add(1, Ordering::SeqCst),
            tables,
            schemas,
            columns,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn tables(&self) -> &HashMap<Uuid, Table> {
        &self.tables
    }

    pub fn schemas(&self) -> &HashMap<Uuid, Schema> {
        &self.schemas
    }

    pub fn columns(&self) -> &HashMap<Uuid, Column> {
        &self.columns
    }

    /// Changes from the older of the two snapshots to the newer one, whichever
    /// order they are given in.
    pub fn diff(&self, other: &CatalogSnapshot) -> CatalogDiff {
        let (older, newer) = if self.version <= other.version {
            (self, other)
        } else {
            (other, self)
        };

        let (added_tables, updated_tables, removed_tables) =
            diff_entries(&older.tables, &newer.tables, Table::same_content);
        let (added_schemas, updated_schemas, removed_schemas) =
            diff_entries(&older.schemas, &newer.schemas, |a, b| a == b);
        let (added_columns, updated_columns, removed_columns) =
            diff_entries(&older.columns, &newer.columns, |a, b| a == b);

        CatalogDiff {
            added_tables,
            updated_tables,
            removed_tables,
            added_schemas,
            updated_schemas,
            removed_schemas,
            added_columns,
            updated_columns,
            removed_columns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, ColumnDef};
    use crate::storage::error::StorageResult;
    use crate::storage::value::ValueType;

    fn populated() -> StorageResult<(Catalog, Schema, Table)> {
        let mut catalog = Catalog::new("db");
        let schema = Schema::new("main", "db");
        let table = Table::new(
            schema.id,
            "events",
            vec![
                ColumnDef::new("kind", ValueType::Char),
                ColumnDef::new("at", ValueType::Integer),
            ],
        );
        catalog.add_schema(schema.clone())?;
        catalog.add_table(table.clone())?;
        Ok((catalog, schema, table))
    }

    #[test]
    fn test_versions_increase() {
        let catalog = Catalog::new("db");
        let a = catalog.make_snapshot();
        let b = catalog.make_snapshot();
        assert!(b.version() > a.version());
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert!(a.diff(&b).is_empty());
    }

    #[test]
    fn test_diff_detects_changes() -> StorageResult<()> {
        let (mut catalog, schema, table) = populated()?;
        let before = catalog.make_snapshot();

        let mut bumped = table.clone();
        bumped.last_row_id = 5;
        catalog.update_table(bumped)?;
        let audit = Schema::new("audit", "db");
        catalog.add_schema(audit.clone())?;
        let dropped_column = table.columns[1].id;
        catalog.remove_column(&dropped_column)?;
        let after = catalog.make_snapshot();

        // argument order does not matter
        let diff = after.diff(&before);
        assert_eq!(diff, before.diff(&after));

        assert!(diff.added_tables.is_empty());
        assert_eq!(diff.updated_tables.len(), 1);
        assert_eq!(diff.updated_tables[0].last_row_id, 5);
        assert_eq!(diff.added_schemas, vec![audit]);
        assert!(diff.updated_schemas.is_empty());
        assert_eq!(diff.removed_columns.len(), 1);
        assert_eq!(diff.removed_columns[0].id, dropped_column);
        assert!(catalog.schema(&schema.id).is_some());
        Ok(())
    }

    #[test]
    fn test_nested_column_edit_is_not_a_table_update() -> StorageResult<()> {
        let (mut catalog, _, table) = populated()?;
        let before = catalog.make_snapshot();

        let mut column = table.columns[0].clone();
        column.name = "category".into();
        catalog.update_column(column)?;
        let diff = before.diff(&catalog.make_snapshot());

        assert!(diff.updated_tables.is_empty());
        assert_eq!(diff.updated_columns.len(), 1);
        assert_eq!(diff.updated_columns[0].name, "category");
        Ok(())
    }

    #[test]
    fn test_removed_entities_are_sorted() -> StorageResult<()> {
        let (mut catalog, schema, table) = populated()?;
        let before = catalog.make_snapshot();
        catalog.remove_table(&table.id)?;
        catalog.remove_schema(&schema.id)?;
        let diff = before.diff(&catalog.make_snapshot());

        assert_eq!(diff.removed_tables.len(), 1);
        assert_eq!(diff.removed_schemas.len(), 1);
        let ids: Vec<Uuid> = diff.removed_columns.iter().map(|c| c.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(ids.len(), 2);
        Ok(())
    }
}
