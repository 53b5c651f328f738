//! Page buffer: the in-memory working set of row pages.
//!
//! Pages are read per table on first touch and stay cached until the table
//! is dropped. Dirty pages are written back by `flush` during a checkpoint.

pub mod registry;

use crate::catalog::{Catalog, Table};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::file::FileManager;
use crate::storage::page::{Page, PageId, RowUpdate, PAGE_HEADER_SIZE};
use crate::storage::row::{Row, RowId};
use log::{debug, warn};
use registry::Registry;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Working set of pages, loaded per table on first touch and kept until the
/// table is dropped. Decides which page a new row version lands on.
#[derive(Debug)]
pub struct PageBuffer {
    pages: Registry<Page>,
    /// Page ids of each loaded table, in the order rows were first placed.
    table_pages: HashMap<Uuid, Vec<PageId>>,
    loaded_tables: HashSet<Uuid>,
    page_capacity: u64,
}

/// Names needed to address a table on disk.
struct TableLocation {
    schema: String,
    table: String,
}

fn locate(catalog: &Catalog, table_id: Uuid) -> StorageResult<TableLocation> {
    let table = catalog.table(&table_id).ok_or(StorageError::CacheMiss {
        kind: "table",
        id: table_id,
    })?;
    let schema = catalog.schema(&table.schema_id).ok_or(StorageError::CacheMiss {
        kind: "schema",
        id: table.schema_id,
    })?;
    Ok(TableLocation {
        schema: schema.name.clone(),
        table: table.name.clone(),
    })
}

fn table_mut(catalog: &mut Catalog, table_id: Uuid) -> StorageResult<&mut Table> {
    catalog.table_mut(&table_id).ok_or(StorageError::CacheMiss {
        kind: "table",
        id: table_id,
    })
}

impl PageBuffer {
    pub fn new(page_capacity: u64) -> Self {
        Self {
            pages: Registry::new(),
            table_pages: HashMap::new(),
            loaded_tables: HashSet::new(),
            page_capacity,
        }
    }

    pub fn page_capacity(&self) -> u64 {
        self.page_capacity
    }

    pub fn page(&self, page_id: &PageId) -> Option<&Page> {
        self.pages.get(page_id)
    }

    pub fn is_loaded(&self, table_id: &Uuid) -> bool {
        self.loaded_tables.contains(table_id)
    }

    pub fn dirty_count(&self) -> usize {
        self.pages.dirty_count()
    }

    pub fn pages_of(&self, table_id: &Uuid) -> impl Iterator<Item = &Page> + '_ {
        self.table_pages
            .get(table_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.pages.get(id))
    }

    /// Read every page file of a table into the buffer. No-op once loaded.
    pub fn load_table(
        &mut self,
        files: &FileManager,
        catalog: &mut Catalog,
        table_id: Uuid,
    ) -> StorageResult<()> {
        if self.loaded_tables.contains(&table_id) {
            return Ok(());
        }
        let location = locate(catalog, table_id)?;
        if catalog.dir_pending_removal(&location.schema, &location.table) {
            // recreated under a name whose old files are not deleted yet
            debug!("{}.{} starts empty", location.schema, location.table);
            self.table_pages.insert(table_id, Vec::new());
            self.loaded_tables.insert(table_id);
            return Ok(());
        }
        let table = table_mut(catalog, table_id)?;
        let column_count = table.column_count();

        let mut loaded = Vec::new();
        let mut highest_row_id = 0;
        for (page_id, data) in files.read_pages(&location.schema, &location.table)? {
            let page = Page::deserialize(&data, column_count, self.page_capacity)?;
            if page.id() != page_id || page.table_id() != table_id {
                return Err(StorageError::CorruptPage(format!(
                    "file {} holds page {} of table {}",
                    page_id,
                    page.id(),
                    page.table_id()
                )));
            }
            highest_row_id = highest_row_id.max(page.max_row_id());
            loaded.push(page);
        }

        if highest_row_id > table.last_row_id {
            warn!(
                "table '{}' row counter {} is behind its pages ({}), advancing",
                table.name, table.last_row_id, highest_row_id
            );
            table.last_row_id = highest_row_id;
            catalog.mark_table_dirty(&table_id);
        }

        loaded.sort_by_key(|p| (p.min_row_id(), p.id()));
        let ids = loaded.iter().map(Page::id).collect();
        debug!(
            "loaded {} pages of {}.{}",
            loaded.len(),
            location.schema,
            location.table
        );
        for page in loaded {
            self.pages.put(page);
        }
        self.table_pages.insert(table_id, ids);
        self.loaded_tables.insert(table_id);
        Ok(())
    }

    /// Reject values that collide on PRIMARY KEY / UNIQUE columns with a live
    /// row other than `ignore`.
    fn check_unique(&self, table: &Table, row: &Row, ignore: Option<RowId>) -> StorageResult<()> {
        for (index, column) in table.columns.iter().enumerate() {
            if !column.flags.requires_unique() {
                continue;
            }
            let Some(value) = row.values.get(index).filter(|v| !v.is_null()) else {
                continue;
            };
            let clash = self
                .pages_of(&table.id)
                .flat_map(|p| p.rows())
                .any(|existing| Some(existing.row_id) != ignore && existing.values[index] == *value);
            if clash {
                return Err(StorageError::integrity(format!(
                    "duplicate value {} for unique column '{}.{}'",
                    value, table.name, column.name
                )));
            }
        }
        Ok(())
    }

    /// `PageFull` for a row of `size` bytes that not even an empty page holds.
    fn ensure_fits(&self, size: u64) -> StorageResult<()> {
        if PAGE_HEADER_SIZE + size > self.page_capacity {
            return Err(StorageError::PageFull {
                required: size,
                available: self.page_capacity.saturating_sub(PAGE_HEADER_SIZE),
            });
        }
        Ok(())
    }

    /// Try `place` on every page of the table with room, then on a fresh page.
    /// Returns the page that accepted the row; nothing changes on failure.
    fn place_with<F>(
        &mut self,
        files: &FileManager,
        location: &TableLocation,
        table: &mut Table,
        size_hint: u64,
        mut place: F,
    ) -> StorageResult<(RowId, PageId)>
    where
        F: FnMut(&mut Page, &mut Table) -> StorageResult<RowId>,
    {
        self.ensure_fits(size_hint)?;

        let candidates = self.table_pages.get(&table.id).cloned().unwrap_or_default();
        for page_id in candidates {
            let Some(page) = self.pages.get_mut(&page_id) else {
                continue;
            };
            if page.free_space() < size_hint {
                continue;
            }
            match place(page, table) {
                Ok(row_id) => {
                    self.pages.mark_dirty(&page_id);
                    return Ok((row_id, page_id));
                }
                Err(StorageError::PageFull { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        let mut page = files.materialize_page(&location.schema, &location.table, table.id, self.page_capacity)?;
        let row_id = place(&mut page, table)?;
        let page_id = page.id();
        debug!("new page {} for {}.{}", page_id, location.schema, location.table);
        self.pages.put_dirty(page);
        self.table_pages.entry(table.id).or_default().push(page_id);
        Ok((row_id, page_id))
    }

    /// Insert a new row, allocating its id from the table's counter.
    pub fn insert_row(
        &mut self,
        files: &FileManager,
        catalog: &mut Catalog,
        table_id: Uuid,
        row: Row,
    ) -> StorageResult<RowId> {
        self.load_table(files, catalog, table_id)?;
        let location = locate(catalog, table_id)?;
        let table = table_mut(catalog, table_id)?;
        let mut row = row;
        table.fill_auto_increment(&mut row, table.last_row_id + 1)?;
        self.check_unique(table, &row, None)?;

        let size = row.encoded_size() as u64;
        let (row_id, _) = self.place_with(files, &location, table, size, |page, table| {
            page.insert_row(table, row.clone())
        })?;
        catalog.mark_table_dirty(&table_id);
        Ok(row_id)
    }

    /// Put back a row that already has an id. Returns false when some
    /// version of that row id is already present.
    pub fn restore_row(
        &mut self,
        files: &FileManager,
        catalog: &mut Catalog,
        table_id: Uuid,
        row: Row,
    ) -> StorageResult<bool> {
        self.load_table(files, catalog, table_id)?;
        if self.pages_of(&table_id).any(|p| p.contains_row(row.row_id)) {
            return Ok(false);
        }
        let location = locate(catalog, table_id)?;
        let table = table_mut(catalog, table_id)?;

        let size = row.encoded_size() as u64;
        self.place_with(files, &location, table, size, |page, table| {
            page.restore_row(table, row.clone()).map(|_| row.row_id)
        })?;
        catalog.mark_table_dirty(&table_id);
        Ok(true)
    }

    fn page_with_live_row(&self, table_id: &Uuid, row_id: RowId) -> Option<PageId> {
        self.pages_of(table_id)
            .find(|p| p.row(row_id).is_some())
            .map(Page::id)
    }

    pub fn find_row(&self, table_id: &Uuid, row_id: RowId) -> Option<&Row> {
        self.pages_of(table_id).find_map(|p| p.row(row_id))
    }

    pub fn delete_row(
        &mut self,
        files: &FileManager,
        catalog: &mut Catalog,
        table_id: Uuid,
        row_id: RowId,
    ) -> StorageResult<()> {
        self.load_table(files, catalog, table_id)?;
        let page_id = self
            .page_with_live_row(&table_id, row_id)
            .ok_or(StorageError::RowNotFound { row_id })?;
        let page = self
            .pages
            .get_mut(&page_id)
            .ok_or(StorageError::CacheMiss { kind: "page", id: page_id })?;
        page.delete_row(row_id)?;
        self.pages.mark_dirty(&page_id);
        Ok(())
    }

    /// Replace a live row with an updated copy under a new row id. When the
    /// row's own page has no room the new version goes elsewhere first and the
    /// old row is tombstoned afterwards.
    pub fn update_row(
        &mut self,
        files: &FileManager,
        catalog: &mut Catalog,
        table_id: Uuid,
        row_id: RowId,
        update: &RowUpdate,
    ) -> StorageResult<RowId> {
        let new_row = self.prepare_update(files, catalog, table_id, row_id, update)?;
        let location = locate(catalog, table_id)?;
        let table = table_mut(catalog, table_id)?;
        let page_id = self
            .page_with_live_row(&table_id, row_id)
            .ok_or(StorageError::RowNotFound { row_id })?;
        let page = self
            .pages
            .get_mut(&page_id)
            .ok_or(StorageError::CacheMiss { kind: "page", id: page_id })?;

        let new_row_id = match page.update_row(table, row_id, update) {
            Ok(new_row_id) => {
                self.pages.mark_dirty(&page_id);
                new_row_id
            }
            Err(StorageError::PageFull { .. }) => {
                let size = new_row.encoded_size() as u64;
                let (new_row_id, new_page_id) =
                    self.place_with(files, &location, table, size, |page, table| {
                        page.insert_row(table, new_row.clone())
                    })?;
                debug!("row {} moved to page {} as {}", row_id, new_page_id, new_row_id);
                if let Some(old_page) = self.pages.get_mut(&page_id) {
                    old_page.delete_row(row_id)?;
                }
                self.pages.mark_dirty(&page_id);
                new_row_id
            }
            Err(e) => return Err(e),
        };
        catalog.mark_table_dirty(&table_id);
        Ok(new_row_id)
    }

    /// Validate an update against the table and its unique columns and
    /// return the replacement row, without changing anything.
    pub fn prepare_update(
        &mut self,
        files: &FileManager,
        catalog: &mut Catalog,
        table_id: Uuid,
        row_id: RowId,
        update: &RowUpdate,
    ) -> StorageResult<Row> {
        self.load_table(files, catalog, table_id)?;
        let table = catalog.table(&table_id).ok_or(StorageError::CacheMiss {
            kind: "table",
            id: table_id,
        })?;
        let page_id = self
            .page_with_live_row(&table_id, row_id)
            .ok_or(StorageError::RowNotFound { row_id })?;
        let page = self
            .pages
            .get(&page_id)
            .ok_or(StorageError::CacheMiss { kind: "page", id: page_id })?;
        let new_row = page.prepare_update(table, row_id, update)?;
        self.ensure_fits(new_row.encoded_size() as u64)?;
        self.check_unique(table, &new_row, Some(row_id))?;
        Ok(new_row)
    }

    /// Live rows of a table in page order.
    pub fn scan(
        &mut self,
        files: &FileManager,
        catalog: &mut Catalog,
        table_id: Uuid,
    ) -> StorageResult<Vec<Row>> {
        self.load_table(files, catalog, table_id)?;
        Ok(self.pages_of(&table_id).flat_map(|p| p.rows()).cloned().collect())
    }

    /// Forget a table's pages, dirty or not. Returns how many were cached.
    pub fn drop_table(&mut self, table_id: &Uuid) -> usize {
        self.loaded_tables.remove(table_id);
        let ids = self.table_pages.remove(table_id).unwrap_or_default();
        for id in &ids {
            self.pages.remove(id);
        }
        ids.len()
    }

    /// Write every dirty page. Returns the number of pages written.
    pub fn flush(&mut self, files: &FileManager, catalog: &Catalog) -> StorageResult<usize> {
        let mut written = 0;
        for page_id in self.pages.dirty_keys() {
            let Some(page) = self.pages.get(&page_id) else {
                continue;
            };
            let location = locate(catalog, page.table_id())?;
            let column_count = catalog
                .table(&page.table_id())
                .map(Table::column_count)
                .unwrap_or_default();
            let data = page.serialize(column_count)?;
            files.write_page(&location.schema, &location.table, page_id, &data)?;
            self.pages.clear_dirty(&page_id);
            written += 1;
        }
        if written > 0 {
            debug!("flushed {} pages", written);
        }
        Ok(written)
    }
}
