//! Row pages.
//!
//! A page is a capacity-bounded run of encoded rows belonging to one table.
//! Serialized layout:
//!
//! ```text
//! [id_len u32][id][table_id_len u32][table_id][byte_size u64][min_rid u64][max_rid u64][rows...]
//! ```
//!
//! `byte_size` always equals the header size plus the encoded size of every
//! row, tombstones included; rows are never physically removed.

use crate::catalog::Table;
use crate::storage::buffer::registry::Keyed;
use crate::storage::codec::{self, ByteCursor, UUID_LEN};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::row::{Projection, Row, RowFlags, RowId};
use crate::storage::value::Value;
use bytes::BufMut;
use uuid::Uuid;

pub type PageId = Uuid;

/// Default page capacity. Some deployments used 8 KiB pages; the value is
/// configurable through `DatabaseConfig::max_page_size`.
pub const DEFAULT_MAX_PAGE_SIZE: u64 = 1024 * 1024;

/// Largest page image accepted when deserializing, whatever the configured capacity.
pub const MAX_PAGE_CEILING: u64 = 64 * 1024 * 1024;

pub const PAGE_HEADER_SIZE: u64 = (4 + UUID_LEN + 4 + UUID_LEN + 8 + 8 + 8) as u64;

/// Column assignments applied by [`Page::update_row`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowUpdate {
    assignments: Vec<(String, Value)>,
}

impl RowUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, column: impl Into<String>, value: Value) -> Self {
        self.assignments.push((column.into(), value));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Copy `row` with the assignments applied. The copy has no id yet.
    pub fn apply(&self, table: &Table, row: &Row) -> StorageResult<Row> {
        let mut values = row.values.clone();
        for (column, value) in &self.assignments {
            let index = table.column_index(column).ok_or_else(|| {
                StorageError::integrity(format!("table '{}' has no column '{}'", table.name, column))
            })?;
            values[index] = value.clone();
        }
        Ok(Row::new(values))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    id: PageId,
    table_id: Uuid,
    byte_size: u64,
    min_row_id: RowId,
    max_row_id: RowId,
    rows: Vec<Row>,
    capacity: u64,
}

impl Page {
    pub fn new(id: PageId, table_id: Uuid, capacity: u64) -> Self {
        Self {
            id,
            table_id,
            byte_size: PAGE_HEADER_SIZE,
            min_row_id: 0,
            max_row_id: 0,
            rows: Vec::new(),
            capacity,
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn table_id(&self) -> Uuid {
        self.table_id
    }

    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn min_row_id(&self) -> RowId {
        self.min_row_id
    }

    pub fn max_row_id(&self) -> RowId {
        self.max_row_id
    }

    pub fn free_space(&self) -> u64 {
        self.capacity.saturating_sub(self.byte_size)
    }

    pub fn can_insert(&self, row: &Row) -> bool {
        self.byte_size + row.encoded_size() as u64 <= self.capacity
    }

    /// Live (non-tombstoned) rows in insertion order.
    pub fn rows(&self) -> impl Iterator<Item = &Row> + '_ {
        self.rows.iter().filter(|r| !r.is_obsolete())
    }

    /// Every row including tombstones.
    pub fn all_rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row(&self, row_id: RowId) -> Option<&Row> {
        self.rows().find(|r| r.row_id == row_id)
    }

    /// True if any version with this id is on the page, tombstoned or not.
    pub fn contains_row(&self, row_id: RowId) -> bool {
        self.rows.iter().any(|r| r.row_id == row_id)
    }

    fn live_position(&self, row_id: RowId) -> StorageResult<usize> {
        self.rows
            .iter()
            .position(|r| r.row_id == row_id && !r.is_obsolete())
            .ok_or(StorageError::RowNotFound { row_id })
    }

    fn append(&mut self, row: Row, size: u64) {
        if self.rows.is_empty() {
            self.min_row_id = row.row_id;
            self.max_row_id = row.row_id;
        } else {
            self.min_row_id = self.min_row_id.min(row.row_id);
            self.max_row_id = self.max_row_id.max(row.row_id);
        }
        self.byte_size += size;
        self.rows.push(row);
    }

    /// Allocate `++table.last_row_id` for `row` and append it. Neither the
    /// page nor the table change on failure.
    pub fn insert_row(&mut self, table: &mut Table, row: Row) -> StorageResult<RowId> {
        let mut row = row;
        let row_id = table.last_row_id + 1;
        row.row_id = row_id;
        row.flags = RowFlags::NONE;
        table.fill_auto_increment(&mut row, row_id)?;
        table.validate_row(&row)?;

        let size = row.encoded_size() as u64;
        if self.byte_size + size > self.capacity {
            return Err(StorageError::PageFull {
                required: size,
                available: self.free_space(),
            });
        }

        table.last_row_id = row_id;
        self.append(row, size);
        Ok(row_id)
    }

    /// Append a row that already carries its id (WAL replay). The table's
    /// counter is raised to cover it.
    pub fn restore_row(&mut self, table: &mut Table, row: Row) -> StorageResult<()> {
        table.validate_row(&row)?;
        let size = row.encoded_size() as u64;
        if self.byte_size + size > self.capacity {
            return Err(StorageError::PageFull {
                required: size,
                available: self.free_space(),
            });
        }
        table.last_row_id = table.last_row_id.max(row.row_id);
        self.append(row, size);
        Ok(())
    }

    /// Tombstone a live row in place.
    pub fn delete_row(&mut self, row_id: RowId) -> StorageResult<()> {
        let position = self.live_position(row_id)?;
        self.rows[position].mark_obsolete();
        Ok(())
    }

    /// Build the replacement version of a live row without touching the page.
    pub fn prepare_update(
        &self,
        table: &Table,
        old_row_id: RowId,
        update: &RowUpdate,
    ) -> StorageResult<Row> {
        let position = self.live_position(old_row_id)?;
        let new_row = update.apply(table, &self.rows[position])?;
        table.validate_row(&new_row)?;
        Ok(new_row)
    }

    /// Tombstone `old_row_id` and insert its updated copy under a new row id.
    /// On `PageFull` the page is left unchanged.
    pub fn update_row(
        &mut self,
        table: &mut Table,
        old_row_id: RowId,
        update: &RowUpdate,
    ) -> StorageResult<RowId> {
        let new_row = self.prepare_update(table, old_row_id, update)?;
        let new_row_id = self.insert_row(table, new_row)?;
        self.delete_row(old_row_id)?;
        Ok(new_row_id)
    }

    pub fn serialize(&self, column_count: usize) -> StorageResult<Vec<u8>> {
        let mut data = Vec::with_capacity(self.byte_size as usize);
        data.put_u32_le(UUID_LEN as u32);
        codec::put_uuid(&mut data, &self.id);
        data.put_u32_le(UUID_LEN as u32);
        codec::put_uuid(&mut data, &self.table_id);
        data.put_u64_le(self.byte_size);
        data.put_u64_le(self.min_row_id);
        data.put_u64_le(self.max_row_id);
        for row in &self.rows {
            row.encode(column_count, &mut data)?;
        }
        debug_assert_eq!(data.len() as u64, self.byte_size);
        Ok(data)
    }

    pub fn deserialize(data: &[u8], column_count: usize, capacity: u64) -> StorageResult<Self> {
        let (mut page, mut cursor) = Self::read_header(data, capacity)?;
        let id = page.id;
        let (declared_min, declared_max) = (page.min_row_id, page.max_row_id);
        let byte_size = page.byte_size;
        page.byte_size = PAGE_HEADER_SIZE;

        while cursor.position() < byte_size {
            let row = Row::decode(&mut cursor, column_count, None)
                .map_err(|e| StorageError::CorruptPage(format!("page {}: {}", id, e)))?;
            let size = row.encoded_size() as u64;
            page.append(row, size);
        }

        if page.byte_size != byte_size {
            return Err(StorageError::CorruptPage(format!(
                "page {} declares {} bytes but its rows add up to {}",
                id, byte_size, page.byte_size
            )));
        }
        if !page.rows.is_empty()
            && (page.min_row_id != declared_min || page.max_row_id != declared_max)
        {
            return Err(StorageError::CorruptPage(format!(
                "page {} row id range [{}, {}] does not match its rows [{}, {}]",
                id, declared_min, declared_max, page.min_row_id, page.max_row_id
            )));
        }
        Ok(page)
    }

    /// Decode the live rows of a page image without building a [`Page`].
    pub fn scan_serialized(
        data: &[u8],
        column_count: usize,
        projection: Option<&Projection>,
    ) -> StorageResult<Vec<Row>> {
        let (page, mut cursor) = Self::read_header(data, MAX_PAGE_CEILING)?;
        let mut rows = Vec::new();
        while cursor.position() < page.byte_size {
            let row = Row::decode(&mut cursor, column_count, projection)
                .map_err(|e| StorageError::CorruptPage(format!("page {}: {}", page.id, e)))?;
            if !row.is_obsolete() {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// Parse and sanity-check the header; the returned page has no rows yet
    /// but carries the declared `byte_size` and row id range.
    fn read_header(data: &[u8], capacity: u64) -> StorageResult<(Page, ByteCursor<'_>)> {
        let corrupt = |e: StorageError| StorageError::CorruptPage(e.to_string());
        let mut cursor = ByteCursor::new(data);

        let id_len = codec::read_u32(&mut cursor, "page id length").map_err(corrupt)?;
        if id_len as usize != UUID_LEN {
            return Err(StorageError::CorruptPage(format!("page id length {}", id_len)));
        }
        let id = codec::read_uuid(&mut cursor, "page id").map_err(corrupt)?;

        let table_id_len = codec::read_u32(&mut cursor, "table id length").map_err(corrupt)?;
        if table_id_len as usize != UUID_LEN {
            return Err(StorageError::CorruptPage(format!(
                "page {} table id length {}",
                id, table_id_len
            )));
        }
        let table_id = codec::read_uuid(&mut cursor, "table id").map_err(corrupt)?;

        let byte_size = codec::read_u64(&mut cursor, "byte size").map_err(corrupt)?;
        if byte_size > MAX_PAGE_CEILING || byte_size < PAGE_HEADER_SIZE {
            return Err(StorageError::CorruptPage(format!(
                "page {} byte size {} out of range",
                id, byte_size
            )));
        }
        if byte_size != data.len() as u64 {
            return Err(StorageError::CorruptPage(format!(
                "page {} declares {} bytes but the image has {}",
                id,
                byte_size,
                data.len()
            )));
        }
        let min_row_id = codec::read_u64(&mut cursor, "min row id").map_err(corrupt)?;
        let max_row_id = codec::read_u64(&mut cursor, "max row id").map_err(corrupt)?;

        let page = Page {
            id,
            table_id,
            byte_size,
            min_row_id,
            max_row_id,
            rows: Vec::new(),
            capacity,
        };
        Ok((page, cursor))
    }
}

impl Keyed for Page {
    type Key = PageId;

    fn key(&self) -> PageId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnDef, ColumnFlags};
    use crate::storage::value::ValueType;

    fn people_table() -> Table {
        Table::new(
            Uuid::new_v4(),
            "people",
            vec![
                ColumnDef::new("age", ValueType::Integer),
                ColumnDef::new("name", ValueType::String),
                ColumnDef::new("nick", ValueType::String),
            ],
        )
    }

    fn person(age: i32, name: &str) -> Row {
        Row::new(vec![
            Value::Integer(age),
            Value::String(name.to_string()),
            Value::Null,
        ])
    }

    #[test]
    fn test_insert_assigns_row_ids() -> StorageResult<()> {
        let mut table = people_table();
        let mut page = Page::new(Uuid::new_v4(), table.id, DEFAULT_MAX_PAGE_SIZE);

        assert_eq!(page.insert_row(&mut table, person(7, "ivan"))?, 1);
        assert_eq!(page.insert_row(&mut table, person(9, "olga"))?, 2);
        assert_eq!(table.last_row_id, 2);
        assert_eq!(page.min_row_id(), 1);
        assert_eq!(page.max_row_id(), 2);

        let expected =
            PAGE_HEADER_SIZE + page.rows().map(|r| r.encoded_size() as u64).sum::<u64>();
        assert_eq!(page.byte_size(), expected);
        Ok(())
    }

    #[test]
    fn test_page_full_leaves_page_unchanged() -> StorageResult<()> {
        let mut table = people_table();
        let row_size = {
            let mut r = person(1, "abcdefgh");
            r.row_id = 1;
            r.encoded_size() as u64
        };
        let capacity = PAGE_HEADER_SIZE + row_size * 3 + row_size / 2;
        let mut page = Page::new(Uuid::new_v4(), table.id, capacity);

        for _ in 0..3 {
            page.insert_row(&mut table, person(1, "abcdefgh"))?;
        }
        let before = page.clone();
        let last_row_id = table.last_row_id;

        let result = page.insert_row(&mut table, person(1, "abcdefgh"));
        assert!(matches!(result, Err(StorageError::PageFull { .. })));
        assert_eq!(page, before);
        assert_eq!(table.last_row_id, last_row_id);
        assert!(page.byte_size() <= page.capacity());
        Ok(())
    }

    #[test]
    fn test_insert_rejects_invalid_row() {
        let mut table = people_table();
        let mut page = Page::new(Uuid::new_v4(), table.id, DEFAULT_MAX_PAGE_SIZE);
        let bad = Row::new(vec![Value::String("x".into()), Value::Null, Value::Null]);
        assert!(matches!(
            page.insert_row(&mut table, bad),
            Err(StorageError::IntegrityViolation(_))
        ));
        assert_eq!(table.last_row_id, 0);
        assert_eq!(page.all_rows().len(), 0);
    }

    #[test]
    fn test_auto_increment_column() -> StorageResult<()> {
        let mut table = Table::new(
            Uuid::new_v4(),
            "ids",
            vec![
                ColumnDef::new("id", ValueType::Integer).with_flags(ColumnFlags::AI | ColumnFlags::PK),
                ColumnDef::new("tag", ValueType::Char),
            ],
        );
        let mut page = Page::new(Uuid::new_v4(), table.id, DEFAULT_MAX_PAGE_SIZE);
        let row_id = page.insert_row(&mut table, Row::new(vec![Value::Null, Value::Char(b'a')]))?;
        assert_eq!(page.row(row_id).unwrap().values[0], Value::Integer(row_id as i32));
        Ok(())
    }

    #[test]
    fn test_delete_row_tombstones() -> StorageResult<()> {
        let mut table = people_table();
        let mut page = Page::new(Uuid::new_v4(), table.id, DEFAULT_MAX_PAGE_SIZE);
        let a = page.insert_row(&mut table, person(1, "a"))?;
        let b = page.insert_row(&mut table, person(2, "b"))?;
        let size = page.byte_size();

        page.delete_row(a)?;
        assert_eq!(page.rows().map(|r| r.row_id).collect::<Vec<_>>(), vec![b]);
        assert!(page.contains_row(a));
        assert_eq!(page.byte_size(), size);

        assert!(matches!(page.delete_row(a), Err(StorageError::RowNotFound { row_id }) if row_id == a));
        assert!(matches!(page.delete_row(99), Err(StorageError::RowNotFound { .. })));
        Ok(())
    }

    #[test]
    fn test_update_row_allocates_new_id() -> StorageResult<()> {
        let mut table = people_table();
        let mut page = Page::new(Uuid::new_v4(), table.id, DEFAULT_MAX_PAGE_SIZE);
        let old = page.insert_row(&mut table, person(30, "ivan"))?;

        let update = RowUpdate::new().set("age", Value::Integer(31));
        let new = page.update_row(&mut table, old, &update)?;
        assert_eq!(new, old + 1);

        let live: Vec<&Row> = page.rows().collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].row_id, new);
        assert_eq!(live[0].values[0], Value::Integer(31));
        assert_eq!(live[0].values[1], Value::String("ivan".into()));

        let tombstone = page.all_rows().iter().find(|r| r.row_id == old).unwrap();
        assert!(tombstone.is_obsolete());
        assert_eq!(tombstone.values[0], Value::Integer(30));

        assert!(matches!(
            page.update_row(&mut table, old, &update),
            Err(StorageError::RowNotFound { .. })
        ));
        assert!(matches!(
            page.update_row(&mut table, new, &RowUpdate::new().set("nope", Value::Null)),
            Err(StorageError::IntegrityViolation(_))
        ));
        Ok(())
    }

    #[test]
    fn test_update_on_full_page_changes_nothing() -> StorageResult<()> {
        let mut table = people_table();
        let mut sized = person(1, "x");
        sized.row_id = 1;
        let capacity = PAGE_HEADER_SIZE + sized.encoded_size() as u64;
        let mut page = Page::new(Uuid::new_v4(), table.id, capacity);
        let id = page.insert_row(&mut table, person(1, "x"))?;
        let before = page.clone();

        let result = page.update_row(&mut table, id, &RowUpdate::new().set("age", Value::Integer(2)));
        assert!(matches!(result, Err(StorageError::PageFull { .. })));
        assert_eq!(page, before);
        Ok(())
    }

    #[test]
    fn test_serialize_round_trip() -> StorageResult<()> {
        let mut table = people_table();
        let mut page = Page::new(Uuid::new_v4(), table.id, DEFAULT_MAX_PAGE_SIZE);
        for i in 0..50 {
            page.insert_row(&mut table, person(i, &format!("p{}", i)))?;
        }
        page.delete_row(10)?;
        page.update_row(&mut table, 20, &RowUpdate::new().set("nick", Value::String("n".into())))?;

        let bytes = page.serialize(table.column_count())?;
        assert_eq!(bytes.len() as u64, page.byte_size());
        let restored = Page::deserialize(&bytes, table.column_count(), DEFAULT_MAX_PAGE_SIZE)?;
        assert_eq!(restored, page);
        Ok(())
    }

    #[test]
    fn test_empty_page_round_trip() -> StorageResult<()> {
        let page = Page::new(Uuid::new_v4(), Uuid::new_v4(), 4096);
        let bytes = page.serialize(2)?;
        assert_eq!(bytes.len() as u64, PAGE_HEADER_SIZE);
        assert_eq!(Page::deserialize(&bytes, 2, 4096)?, page);
        Ok(())
    }

    #[test]
    fn test_deserialize_rejects_corruption() -> StorageResult<()> {
        let mut table = people_table();
        let mut page = Page::new(Uuid::new_v4(), table.id, DEFAULT_MAX_PAGE_SIZE);
        page.insert_row(&mut table, person(1, "a"))?;
        let bytes = page.serialize(3)?;

        // truncated image
        assert!(matches!(
            Page::deserialize(&bytes[..bytes.len() - 1], 3, DEFAULT_MAX_PAGE_SIZE),
            Err(StorageError::CorruptPage(_))
        ));

        // bogus id length
        let mut bad_id = bytes.clone();
        bad_id[..4].copy_from_slice(&1000u32.to_le_bytes());
        assert!(matches!(
            Page::deserialize(&bad_id, 3, DEFAULT_MAX_PAGE_SIZE),
            Err(StorageError::CorruptPage(_))
        ));

        // byte size above the ceiling
        let mut huge = bytes.clone();
        let offset = 4 + UUID_LEN + 4 + UUID_LEN;
        huge[offset..offset + 8].copy_from_slice(&(MAX_PAGE_CEILING + 1).to_le_bytes());
        assert!(Page::deserialize(&huge, 3, DEFAULT_MAX_PAGE_SIZE).is_err());

        // header row-id range disagrees with the rows
        let mut range = bytes.clone();
        range[offset + 16..offset + 24].copy_from_slice(&7u64.to_le_bytes());
        assert!(Page::deserialize(&range, 3, DEFAULT_MAX_PAGE_SIZE).is_err());
        Ok(())
    }

    #[test]
    fn test_scan_serialized_with_projection() -> StorageResult<()> {
        let mut table = people_table();
        let mut page = Page::new(Uuid::new_v4(), table.id, DEFAULT_MAX_PAGE_SIZE);
        page.insert_row(&mut table, person(1, "a"))?;
        page.insert_row(&mut table, person(2, "b"))?;
        page.delete_row(1)?;
        let bytes = page.serialize(3)?;

        let projection = table.projection(&["name"])?;
        let rows = Page::scan_serialized(&bytes, 3, Some(&projection))?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row_id, 2);
        assert_eq!(rows[0].values, vec![Value::String("b".into())]);
        Ok(())
    }
}
