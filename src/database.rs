use crate::catalog::{Catalog, CatalogSnapshot, ColumnDef, Schema, Table};
use crate::config::DatabaseConfig;
use crate::filter::DataFilter;
use crate::recovery::{replay, CheckpointManager, CheckpointMeta, CheckpointTarget};
use crate::storage::buffer::PageBuffer;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::file::FileManager;
use crate::storage::page::RowUpdate;
use crate::storage::row::{Row, RowId};
use crate::storage::value::Value;
use crate::storage::wal::{WalManager, LSN};
use crate::worker::{ShutdownToken, WorkerPool};
use log::{error, info};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

struct StorageState {
    catalog: Catalog,
    pages: PageBuffer,
}

/// Catalog and page cache behind the single writer lock.
struct Storage {
    files: Arc<FileManager>,
    state: Mutex<StorageState>,
}

impl CheckpointTarget for Storage {
    fn flush_storage(&self) -> StorageResult<usize> {
        let mut state = self.state.lock();
        let StorageState { catalog, pages } = &mut *state;
        // directory moves and removals land before any page is written
        let mut written = catalog.flush(&self.files)?;
        written += pages.flush(&self.files, catalog)?;
        Ok(written)
    }
}

fn resolve_schema(catalog: &Catalog, schema: &str) -> StorageResult<Uuid> {
    catalog
        .schema_by_name(schema)
        .map(|s| s.id)
        .ok_or_else(|| StorageError::integrity(format!("schema '{}' does not exist", schema)))
}

fn resolve_table(catalog: &Catalog, schema: &str, table: &str) -> StorageResult<Uuid> {
    let schema_id = resolve_schema(catalog, schema)?;
    catalog
        .table_by_name(&schema_id, table)
        .map(|t| t.id)
        .ok_or_else(|| {
            StorageError::integrity(format!("table '{}.{}' does not exist", schema, table))
        })
}

fn table_of(catalog: &Catalog, table_id: Uuid) -> StorageResult<&Table> {
    catalog.table(&table_id).ok_or(StorageError::CacheMiss {
        kind: "table",
        id: table_id,
    })
}

/// Encoded form of a row as it is now stored, for the WAL.
fn stored_row_bytes(state: &StorageState, table_id: Uuid, row_id: RowId) -> StorageResult<Vec<u8>> {
    let column_count = table_of(&state.catalog, table_id)?.column_count();
    let row = state
        .pages
        .find_row(&table_id, row_id)
        .ok_or(StorageError::RowNotFound { row_id })?;
    row.to_bytes(column_count)
}

/// Rows of a table matching `filter`, all of them when it is `None`.
fn matching_rows(
    state: &mut StorageState,
    files: &FileManager,
    table_id: Uuid,
    filter: Option<&DataFilter>,
) -> StorageResult<Vec<Row>> {
    let rows = state.pages.scan(files, &mut state.catalog, table_id)?;
    let Some(filter) = filter else {
        return Ok(rows);
    };
    let table = table_of(&state.catalog, table_id)?;
    let mut matched = Vec::new();
    for row in rows {
        if filter.matches(table, &row)? {
            matched.push(row);
        }
    }
    Ok(matched)
}

/// Two rows of one update batch must not end up with the same unique value.
fn check_batch_unique(table: &Table, rows: &[Row]) -> StorageResult<()> {
    for (index, column) in table.columns.iter().enumerate() {
        if !column.flags.requires_unique() {
            continue;
        }
        let mut seen: Vec<&Value> = Vec::new();
        for value in rows.iter().filter_map(|r| r.values.get(index)) {
            if value.is_null() {
                continue;
            }
            if seen.contains(&value) {
                return Err(StorageError::integrity(format!(
                    "update would give several rows the value {} in unique column '{}.{}'",
                    value, table.name, column.name
                )));
            }
            seen.push(value);
        }
    }
    Ok(())
}

/// High-level database handle tying the catalog, the page cache, the WAL and
/// the background jobs together.
///
/// Every mutation takes the storage lock, applies the change to the cache and
/// queues its WAL record before the lock is released. A checkpoint can
/// therefore never write a page whose change is missing from the log.
pub struct Database {
    config: DatabaseConfig,
    storage: Arc<Storage>,
    wal: Arc<WalManager>,
    checkpointer: Arc<CheckpointManager>,
    pool: Option<WorkerPool>,
    shutdown: ShutdownToken,
    closed: AtomicBool,
}

impl Database {
    /// Open (or create) the database described by `config`, replaying any
    /// WAL records newer than the last checkpoint.
    pub fn open(config: DatabaseConfig) -> StorageResult<Self> {
        config.validate()?;
        let files = Arc::new(FileManager::open(&config.data_root, &config.database)?);
        let mut catalog = Catalog::load(&files)?;
        let (wal, records) = WalManager::open(config.wal_config(&files))?;
        let wal = Arc::new(wal);

        let from = CheckpointMeta::read(&files)?
            .map(|meta| meta.lsn)
            .unwrap_or_default();
        wal.advance_to(from);
        let mut pages = PageBuffer::new(config.max_page_size);
        let stats = replay(&records, from, &mut catalog, &mut pages, &files)?;

        let storage = Arc::new(Storage {
            files: Arc::clone(&files),
            state: Mutex::new(StorageState { catalog, pages }),
        });
        let checkpointer = Arc::new(CheckpointManager::new(
            Arc::clone(&wal),
            Arc::clone(&storage) as Arc<dyn CheckpointTarget>,
            Arc::clone(&files),
        )?);
        if stats.last_lsn > from {
            checkpointer.checkpoint()?;
        }

        let shutdown = ShutdownToken::new();
        let pool = WorkerPool::new(config.worker_threads)?;
        {
            let wal = Arc::clone(&wal);
            let shutdown = shutdown.clone();
            let interval = config.wal_flush_interval;
            pool.execute(move || wal.run_writer(&shutdown, interval))?;
        }
        {
            let checkpointer = Arc::clone(&checkpointer);
            let shutdown = shutdown.clone();
            let interval = config.checkpoint_interval;
            pool.execute(move || checkpointer.run(&shutdown, interval))?;
        }

        info!(
            "database '{}' opened at {} (checkpoint {}, {} records replayed)",
            config.database,
            config.data_root.display(),
            from,
            stats.applied
        );
        Ok(Database {
            config,
            storage,
            wal,
            checkpointer,
            pool: Some(pool),
            shutdown,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Stop the background jobs, flush the WAL and, if configured, take a
    /// final checkpoint. Calling it again is a no-op.
    pub fn close(&mut self) -> StorageResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();
        if let Some(mut pool) = self.pool.take() {
            pool.shutdown();
        }
        self.wal.flush()?;
        if self.config.checkpoint_on_close {
            self.checkpointer.checkpoint()?;
        }
        info!("database '{}' closed", self.config.database);
        Ok(())
    }

    fn with_storage<T>(
        &self,
        f: impl FnOnce(&mut StorageState, &FileManager) -> StorageResult<T>,
    ) -> StorageResult<T> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Shutdown);
        }
        let mut state = self.storage.state.lock();
        f(&mut state, &self.storage.files)
    }

    pub fn create_schema(&self, name: &str) -> StorageResult<Uuid> {
        let schema = Schema::new(name, self.config.database.clone());
        let schema_id = schema.id;
        let bytes = schema.serialize();
        self.with_storage(|state, _| {
            state.catalog.add_schema(schema)?;
            self.wal.push_create_schema(schema_id, bytes);
            Ok(schema_id)
        })
    }

    /// Drop an empty schema.
    pub fn drop_schema(&self, name: &str) -> StorageResult<()> {
        self.with_storage(|state, _| {
            let schema_id = resolve_schema(&state.catalog, name)?;
            state.catalog.remove_schema(&schema_id)?;
            self.wal.push_drop_schema(schema_id);
            Ok(())
        })
    }

    pub fn create_table(&self, schema: &str, name: &str, columns: Vec<ColumnDef>) -> StorageResult<Uuid> {
        self.with_storage(|state, _| {
            let schema_id = resolve_schema(&state.catalog, schema)?;
            let table = Table::new(schema_id, name, columns);
            let table_id = table.id;
            let bytes = table.serialize();
            state.catalog.add_table(table)?;
            self.wal.push_create_table(table_id, bytes);
            Ok(table_id)
        })
    }

    /// Drop a table together with its rows.
    pub fn drop_table(&self, schema: &str, name: &str) -> StorageResult<()> {
        self.with_storage(|state, _| {
            let table_id = resolve_table(&state.catalog, schema, name)?;
            state.catalog.remove_table(&table_id)?;
            state.pages.drop_table(&table_id);
            self.wal.push_drop_table(table_id);
            Ok(())
        })
    }

    pub fn insert(&self, schema: &str, table: &str, values: Vec<Value>) -> StorageResult<RowId> {
        self.with_storage(|state, files| {
            let table_id = resolve_table(&state.catalog, schema, table)?;
            let row_id = state
                .pages
                .insert_row(files, &mut state.catalog, table_id, Row::new(values))?;
            let bytes = stored_row_bytes(state, table_id, row_id)?;
            self.wal.push_insert(table_id, bytes);
            Ok(row_id)
        })
    }

    /// Live rows matching `filter`, narrowed to `columns` when given.
    pub fn seq_scan(
        &self,
        schema: &str,
        table: &str,
        filter: Option<&DataFilter>,
        columns: Option<&[&str]>,
    ) -> StorageResult<Vec<Row>> {
        self.with_storage(|state, files| {
            let table_id = resolve_table(&state.catalog, schema, table)?;
            let rows = matching_rows(state, files, table_id, filter)?;
            let Some(columns) = columns else {
                return Ok(rows);
            };
            let projection = table_of(&state.catalog, table_id)?.projection(columns)?;
            Ok(rows.iter().map(|row| row.project(&projection)).collect())
        })
    }

    /// Apply `update` to every matching row. Each updated row gets a new row
    /// id; the new ids are returned in scan order. Every row is validated
    /// before the first one changes.
    pub fn update_where(
        &self,
        schema: &str,
        table: &str,
        filter: Option<&DataFilter>,
        update: &RowUpdate,
    ) -> StorageResult<Vec<RowId>> {
        self.with_storage(|state, files| {
            let table_id = resolve_table(&state.catalog, schema, table)?;
            let targets: Vec<RowId> = matching_rows(state, files, table_id, filter)?
                .iter()
                .map(|row| row.row_id)
                .collect();

            let mut staged = Vec::with_capacity(targets.len());
            for row_id in &targets {
                staged.push(state.pages.prepare_update(
                    files,
                    &mut state.catalog,
                    table_id,
                    *row_id,
                    update,
                )?);
            }
            check_batch_unique(table_of(&state.catalog, table_id)?, &staged)?;

            let mut new_ids = Vec::with_capacity(targets.len());
            for old_row_id in targets {
                let new_row_id =
                    state
                        .pages
                        .update_row(files, &mut state.catalog, table_id, old_row_id, update)?;
                let bytes = stored_row_bytes(state, table_id, new_row_id)?;
                self.wal.push_update(table_id, old_row_id, bytes);
                new_ids.push(new_row_id);
            }
            Ok(new_ids)
        })
    }

    /// Tombstone every matching row. Returns how many were deleted.
    pub fn delete_where(&self, schema: &str, table: &str, filter: Option<&DataFilter>) -> StorageResult<usize> {
        self.with_storage(|state, files| {
            let table_id = resolve_table(&state.catalog, schema, table)?;
            let targets = matching_rows(state, files, table_id, filter)?;
            for row in &targets {
                state
                    .pages
                    .delete_row(files, &mut state.catalog, table_id, row.row_id)?;
                self.wal.push_delete(table_id, row.row_id);
            }
            Ok(targets.len())
        })
    }

    pub fn catalog_snapshot(&self) -> StorageResult<CatalogSnapshot> {
        self.with_storage(|state, _| Ok(state.catalog.make_snapshot()))
    }

    pub fn table(&self, schema: &str, name: &str) -> StorageResult<Table> {
        self.with_storage(|state, _| {
            let table_id = resolve_table(&state.catalog, schema, name)?;
            table_of(&state.catalog, table_id).cloned()
        })
    }

    pub fn list_schemas(&self) -> StorageResult<Vec<String>> {
        self.with_storage(|state, _| {
            Ok(state.catalog.schemas().iter().map(|s| s.name.clone()).collect())
        })
    }

    pub fn list_tables(&self, schema: &str) -> StorageResult<Vec<String>> {
        self.with_storage(|state, _| {
            let schema_id = resolve_schema(&state.catalog, schema)?;
            Ok(state
                .catalog
                .tables_in_schema(&schema_id)
                .iter()
                .map(|t| t.name.clone())
                .collect())
        })
    }

    pub fn checkpoint(&self) -> StorageResult<LSN> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Shutdown);
        }
        self.checkpointer.checkpoint()
    }

    /// Force buffered WAL records to disk.
    pub fn sync_wal(&self) -> StorageResult<LSN> {
        self.wal.flush()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("closing database '{}' failed: {}", self.config.database, e);
        }
    }
}
