//! Schema, table and column metadata.
//!
//! The catalog keeps three dirty-tracked registries keyed by id. Mutations only
//! touch memory; `flush` applies pending directory removals and renames, then
//! rewrites the `schema.meta` / `table.meta` files of everything dirty.

pub mod column_info;
pub mod schema_info;
pub mod snapshot;
pub mod table_info;

pub use column_info::{Column, ColumnDef, ColumnFlags};
pub use schema_info::Schema;
pub use snapshot::{CatalogDiff, CatalogSnapshot};
pub use table_info::Table;

use crate::storage::buffer::registry::Registry;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::file::{FileManager, SCHEMA_META_FILE, TABLE_META_FILE, WAL_DIR};
use log::{debug, info, warn};
use std::collections::HashSet;
use uuid::Uuid;

/// Longest schema, table or column name accepted.
pub const MAX_NAME_LEN: usize = 4096;

/// Directory work recorded by removals and renames, replayed by `flush`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingChange {
    RemoveSchemaDir { schema: String },
    RemoveTableDir { schema: String, table: String },
    RenameSchemaDir { from: String, to: String },
    RenameTableDir { schema: String, from: String, to: String },
}

fn validate_name(kind: &str, name: &str) -> StorageResult<()> {
    if name.is_empty() {
        return Err(StorageError::integrity(format!("{} name is empty", kind)));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(StorageError::integrity(format!(
            "{} name is longer than {} bytes",
            kind, MAX_NAME_LEN
        )));
    }
    if name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(StorageError::integrity(format!(
            "{} name {:?} is not a valid directory name",
            kind, name
        )));
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct Catalog {
    database: String,
    schemas: Registry<Schema>,
    tables: Registry<Table>,
    columns: Registry<Column>,
    pending: Vec<PendingChange>,
}

impl Catalog {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            ..Default::default()
        }
    }

    /// Read every schema and table meta file of the database.
    pub fn load(files: &FileManager) -> StorageResult<Self> {
        let mut catalog = Catalog::new(files.database());

        for schema_dir in files.list_dirs(&files.database_dir())? {
            if schema_dir == WAL_DIR {
                continue;
            }
            let Some(data) = files.read_blob_if_exists(&files.schema_meta_path(&schema_dir))? else {
                warn!("skipping {:?}: no {}", schema_dir, SCHEMA_META_FILE);
                continue;
            };
            let schema = Schema::deserialize(&data, files.database())?;
            if schema.name != schema_dir {
                return Err(StorageError::corrupt(format!(
                    "schema '{}' is stored in directory '{}'",
                    schema.name, schema_dir
                )));
            }

            for table_dir in files.list_dirs(&files.schema_dir(&schema_dir))? {
                let path = files.table_meta_path(&schema_dir, &table_dir);
                let Some(data) = files.read_blob_if_exists(&path)? else {
                    warn!("skipping {}/{}: no {}", schema_dir, table_dir, TABLE_META_FILE);
                    continue;
                };
                let table = Table::deserialize(&data)?;
                if table.schema_id != schema.id || table.name != table_dir {
                    return Err(StorageError::corrupt(format!(
                        "table meta in {}/{} describes '{}' of schema {}",
                        schema_dir, table_dir, table.name, table.schema_id
                    )));
                }
                for column in &table.columns {
                    catalog.columns.put(column.clone());
                }
                catalog.tables.put(table);
            }
            catalog.schemas.put(schema);
        }

        info!(
            "loaded catalog of '{}': {} schemas, {} tables",
            catalog.database,
            catalog.schemas.len(),
            catalog.tables.len()
        );
        Ok(catalog)
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn schema(&self, id: &Uuid) -> Option<&Schema> {
        self.schemas.get(id)
    }

    pub fn table(&self, id: &Uuid) -> Option<&Table> {
        self.tables.get(id)
    }

    pub fn column(&self, id: &Uuid) -> Option<&Column> {
        self.columns.get(id)
    }

    pub(crate) fn table_mut(&mut self, id: &Uuid) -> Option<&mut Table> {
        self.tables.get_mut(id)
    }

    /// Flag a table whose row counter moved so its meta gets rewritten.
    pub(crate) fn mark_table_dirty(&mut self, id: &Uuid) -> bool {
        self.tables.mark_dirty(id)
    }

    pub fn schema_by_name(&self, name: &str) -> Option<&Schema> {
        self.schemas.iter().find(|s| s.name == name)
    }

    pub fn table_by_name(&self, schema_id: &Uuid, name: &str) -> Option<&Table> {
        self.tables
            .iter()
            .find(|t| t.schema_id == *schema_id && t.name == name)
    }

    /// Tables of a schema, ordered by name.
    pub fn tables_in_schema(&self, schema_id: &Uuid) -> Vec<&Table> {
        let mut tables: Vec<&Table> = self
            .tables
            .iter()
            .filter(|t| t.schema_id == *schema_id)
            .collect();
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        tables
    }

    /// All schemas, ordered by name.
    pub fn schemas(&self) -> Vec<&Schema> {
        let mut schemas: Vec<&Schema> = self.schemas.iter().collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn is_dirty(&self) -> bool {
        !self.pending.is_empty()
            || self.schemas.dirty_count() > 0
            || self.tables.dirty_count() > 0
            || self.columns.dirty_count() > 0
    }

    pub fn add_schema(&mut self, schema: Schema) -> StorageResult<()> {
        validate_name("schema", &schema.name)?;
        if schema.name == WAL_DIR {
            return Err(StorageError::integrity(format!(
                "schema name '{}' is reserved",
                WAL_DIR
            )));
        }
        if self.schemas.contains(&schema.id) {
            return Err(StorageError::integrity(format!(
                "schema id {} already exists",
                schema.id
            )));
        }
        if self.schema_by_name(&schema.name).is_some() {
            return Err(StorageError::integrity(format!(
                "schema '{}' already exists in database '{}'",
                schema.name, self.database
            )));
        }
        self.schemas.put_dirty(schema);
        Ok(())
    }

    /// Register a table and all of its columns.
    pub fn add_table(&mut self, table: Table) -> StorageResult<()> {
        validate_name("table", &table.name)?;
        if !self.schemas.contains(&table.schema_id) {
            return Err(StorageError::integrity(format!(
                "table '{}' refers to unknown schema {}",
                table.name, table.schema_id
            )));
        }
        if self.tables.contains(&table.id) {
            return Err(StorageError::integrity(format!(
                "table id {} already exists",
                table.id
            )));
        }
        if self.table_by_name(&table.schema_id, &table.name).is_some() {
            return Err(StorageError::integrity(format!(
                "table '{}' already exists",
                table.name
            )));
        }
        self.check_columns(&table, None)?;

        for column in &table.columns {
            self.columns.put_dirty(column.clone());
        }
        self.tables.put_dirty(table);
        Ok(())
    }

    /// Append a column to an existing table.
    pub fn add_column(&mut self, column: Column) -> StorageResult<()> {
        validate_name("column", &column.name)?;
        if self.columns.contains(&column.id) {
            return Err(StorageError::integrity(format!(
                "column id {} already exists",
                column.id
            )));
        }
        let table = self.tables.get_mut(&column.table_id).ok_or_else(|| {
            StorageError::integrity(format!(
                "column '{}' refers to unknown table {}",
                column.name, column.table_id
            ))
        })?;
        if table.column_index(&column.name).is_some() {
            return Err(StorageError::integrity(format!(
                "column '{}.{}' already exists",
                table.name, column.name
            )));
        }
        table.columns.push(column.clone());
        let table_id = table.id;
        self.tables.mark_dirty(&table_id);
        self.columns.put_dirty(column);
        Ok(())
    }

    /// Validate the columns embedded in `table`. Ids already owned by
    /// `existing` (the table being updated) may be reused.
    fn check_columns(&self, table: &Table, existing: Option<&Table>) -> StorageResult<()> {
        let mut names = HashSet::new();
        let mut ids = HashSet::new();
        for column in &table.columns {
            validate_name("column", &column.name)?;
            if column.table_id != table.id {
                return Err(StorageError::integrity(format!(
                    "column '{}' belongs to table {} not {}",
                    column.name, column.table_id, table.id
                )));
            }
            if !names.insert(column.name.as_str()) {
                return Err(StorageError::integrity(format!(
                    "column '{}.{}' is defined twice",
                    table.name, column.name
                )));
            }
            if !ids.insert(column.id) {
                return Err(StorageError::integrity(format!(
                    "column id {} is used twice in table '{}'",
                    column.id, table.name
                )));
            }
            let owned = existing.is_some_and(|t| t.columns.iter().any(|c| c.id == column.id));
            if !owned && self.columns.contains(&column.id) {
                return Err(StorageError::integrity(format!(
                    "column id {} already exists",
                    column.id
                )));
            }
        }
        if table.columns.iter().filter(|c| c.flags.contains(ColumnFlags::PK)).count() > 1 {
            return Err(StorageError::integrity(format!(
                "table '{}' declares more than one primary key",
                table.name
            )));
        }
        Ok(())
    }

    pub fn update_schema(&mut self, schema: Schema) -> StorageResult<()> {
        let current = self.schemas.get(&schema.id).ok_or_else(|| {
            StorageError::integrity(format!("schema {} does not exist", schema.id))
        })?;
        if current.name != schema.name {
            validate_name("schema", &schema.name)?;
            if schema.name == WAL_DIR || self.schema_by_name(&schema.name).is_some() {
                return Err(StorageError::integrity(format!(
                    "cannot rename schema '{}' to '{}': name is taken",
                    current.name, schema.name
                )));
            }
            self.pending.push(PendingChange::RenameSchemaDir {
                from: current.name.clone(),
                to: schema.name.clone(),
            });
        }
        self.schemas.put_dirty(schema);
        Ok(())
    }

    /// Replace a table, upserting its columns and dropping the ones it no longer lists.
    pub fn update_table(&mut self, table: Table) -> StorageResult<()> {
        let current = self.tables.get(&table.id).ok_or_else(|| {
            StorageError::integrity(format!("table {} does not exist", table.id))
        })?;
        if current.schema_id != table.schema_id {
            return Err(StorageError::integrity(format!(
                "table '{}' cannot move to another schema",
                current.name
            )));
        }
        self.check_columns(&table, Some(current))?;

        let rename = if current.name != table.name {
            validate_name("table", &table.name)?;
            if self.table_by_name(&table.schema_id, &table.name).is_some() {
                return Err(StorageError::integrity(format!(
                    "cannot rename table '{}' to '{}': name is taken",
                    current.name, table.name
                )));
            }
            let schema = self.schema_name(&table.schema_id)?;
            Some(PendingChange::RenameTableDir {
                schema,
                from: current.name.clone(),
                to: table.name.clone(),
            })
        } else {
            None
        };

        let dropped: Vec<Uuid> = current
            .columns
            .iter()
            .filter(|old| !table.columns.iter().any(|c| c.id == old.id))
            .map(|c| c.id)
            .collect();
        for id in dropped {
            self.columns.remove(&id);
        }
        for column in &table.columns {
            if self.columns.get(&column.id) != Some(column) {
                self.columns.put_dirty(column.clone());
            }
        }
        self.pending.extend(rename);
        self.tables.put_dirty(table);
        Ok(())
    }

    pub fn update_column(&mut self, column: Column) -> StorageResult<()> {
        let current = self.columns.get(&column.id).ok_or_else(|| {
            StorageError::integrity(format!("column {} does not exist", column.id))
        })?;
        if current.table_id != column.table_id {
            return Err(StorageError::integrity(format!(
                "column '{}' cannot move to another table",
                current.name
            )));
        }
        validate_name("column", &column.name)?;

        let table = self.tables.get_mut(&column.table_id).ok_or(StorageError::CacheMiss {
            kind: "table",
            id: column.table_id,
        })?;
        if table.columns.iter().any(|c| c.name == column.name && c.id != column.id) {
            return Err(StorageError::integrity(format!(
                "column '{}.{}' already exists",
                table.name, column.name
            )));
        }
        if let Some(slot) = table.columns.iter_mut().find(|c| c.id == column.id) {
            *slot = column.clone();
        }
        let table_id = table.id;
        self.tables.mark_dirty(&table_id);
        self.columns.put_dirty(column);
        Ok(())
    }

    pub fn remove_column(&mut self, id: &Uuid) -> StorageResult<Column> {
        let column = self
            .columns
            .remove(id)
            .ok_or_else(|| StorageError::integrity(format!("column {} does not exist", id)))?;
        if let Some(table) = self.tables.get_mut(&column.table_id) {
            table.columns.retain(|c| c.id != column.id);
            let table_id = table.id;
            self.tables.mark_dirty(&table_id);
        }
        Ok(column)
    }

    /// Drop a table and its columns; its directory goes away on the next flush.
    pub fn remove_table(&mut self, id: &Uuid) -> StorageResult<Table> {
        let table = self
            .tables
            .get(id)
            .ok_or_else(|| StorageError::integrity(format!("table {} does not exist", id)))?;
        let schema = self.schema_name(&table.schema_id)?;
        let column_ids: Vec<Uuid> = table.columns.iter().map(|c| c.id).collect();

        for column_id in &column_ids {
            self.columns.remove(column_id);
        }
        let table = self.tables.remove(id).ok_or(StorageError::CacheMiss { kind: "table", id: *id })?;
        self.pending.push(PendingChange::RemoveTableDir {
            schema,
            table: table.name.clone(),
        });
        Ok(table)
    }

    pub fn remove_schema(&mut self, id: &Uuid) -> StorageResult<Schema> {
        let name = self.schema_name(id)?;
        let tables = self.tables.iter().filter(|t| t.schema_id == *id).count();
        if tables > 0 {
            return Err(StorageError::SchemaNotEmpty { name, tables });
        }
        let schema = self
            .schemas
            .remove(id)
            .ok_or(StorageError::CacheMiss { kind: "schema", id: *id })?;
        self.pending.push(PendingChange::RemoveSchemaDir { schema: name });
        Ok(schema)
    }

    /// True while the directory of `schema`/`table` waits to be removed by
    /// the next flush. Whatever is stored there belongs to a dropped entity.
    pub(crate) fn dir_pending_removal(&self, schema: &str, table: &str) -> bool {
        self.pending.iter().any(|change| match change {
            PendingChange::RemoveSchemaDir { schema: dropped } => dropped == schema,
            PendingChange::RemoveTableDir {
                schema: dropped_schema,
                table: dropped,
            } => dropped_schema == schema && dropped == table,
            _ => false,
        })
    }

    fn schema_name(&self, id: &Uuid) -> StorageResult<String> {
        self.schemas
            .get(id)
            .map(|s| s.name.clone())
            .ok_or_else(|| StorageError::integrity(format!("schema {} does not exist", id)))
    }

    /// Persist pending directory changes and dirty metadata. Returns the
    /// number of meta files written.
    pub fn flush(&mut self, files: &FileManager) -> StorageResult<usize> {
        while let Some(change) = self.pending.first() {
            match change {
                PendingChange::RemoveSchemaDir { schema } => {
                    files.remove_dir(&files.schema_dir(schema))?;
                }
                PendingChange::RemoveTableDir { schema, table } => {
                    files.remove_dir(&files.table_dir(schema, table))?;
                }
                PendingChange::RenameSchemaDir { from, to } => {
                    files.rename_dir(&files.schema_dir(from), &files.schema_dir(to))?;
                }
                PendingChange::RenameTableDir { schema, from, to } => {
                    files.rename_dir(&files.table_dir(schema, from), &files.table_dir(schema, to))?;
                }
            }
            debug!("applied {:?}", change);
            self.pending.remove(0);
        }

        let mut written = 0;
        for id in self.schemas.dirty_keys() {
            let Some(schema) = self.schemas.get(&id) else {
                continue;
            };
            files.write_blob(&files.schema_meta_path(&schema.name), &schema.serialize())?;
            self.schemas.clear_dirty(&id);
            written += 1;
        }

        for id in self.tables.dirty_keys() {
            let Some(table) = self.tables.get(&id) else {
                continue;
            };
            let schema = self.schema_name(&table.schema_id)?;
            files.write_blob(&files.table_meta_path(&schema, &table.name), &table.serialize())?;
            self.tables.clear_dirty(&id);
            written += 1;
        }
        // columns are embedded in their table's meta
        self.columns.clear_all_dirty();

        if written > 0 {
            debug!("catalog flush wrote {} meta files", written);
        }
        Ok(written)
    }

    pub fn make_snapshot(&self) -> CatalogSnapshot {
        CatalogSnapshot::new(
            self.tables.entries().clone(),
            self.schemas.entries().clone(),
            self.columns.entries().clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::value::ValueType;
    use tempfile::tempdir;

    fn orders(schema_id: Uuid) -> Table {
        Table::new(
            schema_id,
            "orders",
            vec![
                ColumnDef::new("id", ValueType::Integer).with_flags(ColumnFlags::PK | ColumnFlags::AI),
                ColumnDef::new("total", ValueType::Real),
            ],
        )
    }

    #[test]
    fn test_add_and_lookup() -> StorageResult<()> {
        let mut catalog = Catalog::new("shop");
        let schema = Schema::new("sales", "shop");
        let table = orders(schema.id);
        catalog.add_schema(schema.clone())?;
        catalog.add_table(table.clone())?;

        assert_eq!(catalog.schema_by_name("sales"), Some(&schema));
        assert_eq!(catalog.table_by_name(&schema.id, "orders"), Some(&table));
        for column in &table.columns {
            assert_eq!(catalog.column(&column.id), Some(column));
        }
        assert_eq!(catalog.tables_in_schema(&schema.id).len(), 1);
        Ok(())
    }

    #[test]
    fn test_referential_integrity() -> StorageResult<()> {
        let mut catalog = Catalog::new("shop");
        let schema = Schema::new("sales", "shop");

        // unknown schema
        assert!(matches!(
            catalog.add_table(orders(schema.id)),
            Err(StorageError::IntegrityViolation(_))
        ));

        catalog.add_schema(schema.clone())?;
        assert!(catalog.add_schema(Schema::new("sales", "shop")).is_err());
        assert!(catalog.add_schema(schema.clone()).is_err());
        assert!(catalog.add_schema(Schema::new("wal", "shop")).is_err());
        assert!(catalog.add_schema(Schema::new("a/b", "shop")).is_err());

        catalog.add_table(orders(schema.id))?;
        assert!(catalog.add_table(orders(schema.id)).is_err());

        let mut twice = Table::new(schema.id, "twice", vec![ColumnDef::new("c", ValueType::Bool)]);
        twice.columns.push(twice.columns[0].clone());
        assert!(catalog.add_table(twice).is_err());
        Ok(())
    }

    #[test]
    fn test_remove_schema_requires_empty() -> StorageResult<()> {
        let mut catalog = Catalog::new("shop");
        let schema = Schema::new("sales", "shop");
        let table = orders(schema.id);
        catalog.add_schema(schema.clone())?;
        catalog.add_table(table.clone())?;

        assert!(matches!(
            catalog.remove_schema(&schema.id),
            Err(StorageError::SchemaNotEmpty { tables: 1, .. })
        ));

        catalog.remove_table(&table.id)?;
        assert!(table.columns.iter().all(|c| catalog.column(&c.id).is_none()));
        catalog.remove_schema(&schema.id)?;
        assert!(catalog.schemas().is_empty());
        Ok(())
    }

    #[test]
    fn test_column_add_update_remove() -> StorageResult<()> {
        let mut catalog = Catalog::new("shop");
        let schema = Schema::new("sales", "shop");
        let table = orders(schema.id);
        catalog.add_schema(schema)?;
        catalog.add_table(table.clone())?;

        let note = Column::new(table.id, ColumnDef::new("note", ValueType::String));
        catalog.add_column(note.clone())?;
        assert_eq!(catalog.table(&table.id).unwrap().column_count(), 3);
        assert!(catalog
            .add_column(Column::new(table.id, ColumnDef::new("note", ValueType::Bool)))
            .is_err());

        let mut renamed = note.clone();
        renamed.name = "memo".into();
        catalog.update_column(renamed)?;
        assert!(catalog.table(&table.id).unwrap().column_index("memo").is_some());

        let mut clash = note.clone();
        clash.name = "total".into();
        assert!(catalog.update_column(clash).is_err());

        catalog.remove_column(&note.id)?;
        assert_eq!(catalog.table(&table.id).unwrap().column_count(), 2);
        assert!(catalog.remove_column(&note.id).is_err());
        Ok(())
    }

    #[test]
    fn test_flush_and_load() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let files = FileManager::open(dir.path(), "shop")?;
        let mut catalog = Catalog::new("shop");
        let schema = Schema::new("sales", "shop");
        let mut table = orders(schema.id);
        catalog.add_schema(schema.clone())?;
        catalog.add_table(table.clone())?;

        assert_eq!(catalog.flush(&files)?, 2);
        assert!(!catalog.is_dirty());
        assert_eq!(catalog.flush(&files)?, 0);

        table.last_row_id = 17;
        catalog.update_table(table.clone())?;
        catalog.flush(&files)?;

        let loaded = Catalog::load(&files)?;
        assert_eq!(loaded.schema(&schema.id), Some(&schema));
        assert_eq!(loaded.table(&table.id), Some(&table));
        assert_eq!(loaded.table(&table.id).unwrap().last_row_id, 17);
        assert!(!loaded.is_dirty());
        Ok(())
    }

    #[test]
    fn test_flush_applies_renames_and_removals() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let files = FileManager::open(dir.path(), "shop")?;
        let mut catalog = Catalog::new("shop");
        let mut schema = Schema::new("sales", "shop");
        let mut table = orders(schema.id);
        catalog.add_schema(schema.clone())?;
        catalog.add_table(table.clone())?;
        catalog.flush(&files)?;

        schema.name = "revenue".into();
        catalog.update_schema(schema.clone())?;
        table.name = "invoices".into();
        catalog.update_table(table.clone())?;
        catalog.flush(&files)?;

        assert!(!files.schema_dir("sales").exists());
        assert!(files.table_meta_path("revenue", "invoices").is_file());
        assert!(!files.table_dir("revenue", "orders").exists());

        catalog.remove_table(&table.id)?;
        catalog.remove_schema(&schema.id)?;
        catalog.flush(&files)?;
        assert!(files.list_dirs(&files.database_dir())?.is_empty());
        assert!(Catalog::load(&files)?.schemas().is_empty());
        Ok(())
    }

    #[test]
    fn test_dir_pending_removal_until_flush() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let files = FileManager::open(dir.path(), "shop")?;
        let mut catalog = Catalog::new("shop");
        let schema = Schema::new("sales", "shop");
        let table = orders(schema.id);
        catalog.add_schema(schema.clone())?;
        catalog.add_table(table.clone())?;
        assert!(!catalog.dir_pending_removal("sales", "orders"));

        catalog.remove_table(&table.id)?;
        assert!(catalog.dir_pending_removal("sales", "orders"));
        assert!(!catalog.dir_pending_removal("sales", "invoices"));

        catalog.remove_schema(&schema.id)?;
        assert!(catalog.dir_pending_removal("sales", "invoices"));

        catalog.flush(&files)?;
        assert!(!catalog.dir_pending_removal("sales", "orders"));
        Ok(())
    }

    #[test]
    fn test_rename_collision_rejected() -> StorageResult<()> {
        let mut catalog = Catalog::new("shop");
        let schema = Schema::new("sales", "shop");
        catalog.add_schema(schema.clone())?;
        catalog.add_schema(Schema::new("hr", "shop"))?;

        let mut clash = schema.clone();
        clash.name = "hr".into();
        assert!(catalog.update_schema(clash).is_err());
        assert!(catalog.update_schema(Schema::new("ghost", "shop")).is_err());
        Ok(())
    }
}
