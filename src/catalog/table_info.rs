//! Table information and metadata structures.

use crate::storage::buffer::registry::Keyed;
use crate::storage::codec::{self, ByteCursor};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::row::{Projection, Row, RowId};
use crate::storage::value::{Value, ValueType};
use bytes::BufMut;
use uuid::Uuid;

use super::column_info::{Column, ColumnDef, ColumnFlags};
use super::MAX_NAME_LEN;

/// Upper bound on the column count accepted from a table meta file.
const MAX_COLUMNS: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub id: Uuid,
    pub schema_id: Uuid,
    pub name: String,
    pub columns: Vec<Column>,
    /// Highest row id handed out so far; the next insert gets `last_row_id + 1`.
    pub last_row_id: RowId,
}

impl Table {
    pub fn new(schema_id: Uuid, name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            schema_id,
            name: name.into(),
            columns: columns.into_iter().map(|def| Column::new(id, def)).collect(),
            last_row_id: 0,
        }
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn primary_key(&self) -> Option<&Column> {
        self.columns.iter().find(|c| c.flags.contains(ColumnFlags::PK))
    }

    /// Resolve column names to a [`Projection`].
    pub fn projection(&self, names: &[&str]) -> StorageResult<Projection> {
        let indices = names
            .iter()
            .map(|name| {
                self.column_index(name).ok_or_else(|| {
                    StorageError::integrity(format!(
                        "table '{}' has no column '{}'",
                        self.name, name
                    ))
                })
            })
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(Projection::new(indices))
    }

    /// Fill NULL auto-increment integer columns with `row_id`. Fails once
    /// row ids outgrow the integer column type.
    pub fn fill_auto_increment(&self, row: &mut Row, row_id: RowId) -> StorageResult<()> {
        for (column, value) in self.columns.iter().zip(row.values.iter_mut()) {
            if column.flags.contains(ColumnFlags::AI)
                && column.value_type == ValueType::Integer
                && value.is_null()
            {
                let id = i32::try_from(row_id).map_err(|_| {
                    StorageError::integrity(format!(
                        "row id {} does not fit auto increment column '{}.{}'",
                        row_id, self.name, column.name
                    ))
                })?;
                *value = Value::Integer(id);
            }
        }
        Ok(())
    }

    /// Check value count, type compatibility and NOT NULL constraints.
    pub fn validate_row(&self, row: &Row) -> StorageResult<()> {
        if row.values.len() != self.columns.len() {
            return Err(StorageError::integrity(format!(
                "table '{}' expects {} values, got {}",
                self.name,
                self.columns.len(),
                row.values.len()
            )));
        }
        for (column, value) in self.columns.iter().zip(&row.values) {
            if !value.is_compatible_with(column.value_type) {
                return Err(StorageError::integrity(format!(
                    "column '{}.{}' is {} but got {}",
                    self.name,
                    column.name,
                    column.value_type,
                    value.value_type()
                )));
            }
            if value.is_null() && column.flags.requires_value() {
                return Err(StorageError::integrity(format!(
                    "column '{}.{}' does not accept NULL",
                    self.name, column.name
                )));
            }
        }
        Ok(())
    }

    /// Field-level equality that stops at column ids instead of comparing
    /// column contents.
    pub fn same_content(&self, other: &Table) -> bool {
        self.id == other.id
            && self.schema_id == other.schema_id
            && self.name == other.name
            && self.last_row_id == other.last_row_id
            && self.columns.len() == other.columns.len()
            && self
                .columns
                .iter()
                .zip(&other.columns)
                .all(|(a, b)| a.id == b.id)
    }

    /// `[id][schema_id][name_len][name][has_pk][last_rid][pk if has_pk][columns_count][columns...]`
    pub fn serialize(&self) -> Vec<u8> {
        let mut data = Vec::new();
        codec::put_uuid(&mut data, &self.id);
        codec::put_uuid(&mut data, &self.schema_id);
        codec::put_string(&mut data, &self.name);
        let primary_key = self.primary_key();
        data.put_u8(u8::from(primary_key.is_some()));
        data.put_u64_le(self.last_row_id);
        if let Some(pk) = primary_key {
            codec::put_uuid(&mut data, &pk.id);
        }
        data.put_u32_le(self.columns.len() as u32);
        for column in &self.columns {
            column.serialize(&mut data);
        }
        data
    }

    pub fn deserialize(data: &[u8]) -> StorageResult<Self> {
        let mut cursor = ByteCursor::new(data);

        let id = codec::read_uuid(&mut cursor, "table id")?;
        let schema_id = codec::read_uuid(&mut cursor, "schema id")?;
        let name = codec::read_string(&mut cursor, MAX_NAME_LEN, "table name")?;
        let has_pk = match codec::read_u8(&mut cursor, "primary key marker")? {
            0 => false,
            1 => true,
            other => {
                return Err(StorageError::corrupt(format!(
                    "invalid primary key marker {}",
                    other
                )))
            }
        };
        let last_row_id = codec::read_u64(&mut cursor, "last row id")?;
        let pk_id = if has_pk {
            Some(codec::read_uuid(&mut cursor, "primary key id")?)
        } else {
            None
        };

        let column_count = codec::read_u32(&mut cursor, "column count")? as usize;
        if column_count > MAX_COLUMNS {
            return Err(StorageError::corrupt(format!(
                "column count {} exceeds limit {}",
                column_count, MAX_COLUMNS
            )));
        }
        let columns = (0..column_count)
            .map(|_| Column::deserialize(&mut cursor, id))
            .collect::<StorageResult<Vec<_>>>()?;

        if codec::remaining(&cursor) != 0 {
            return Err(StorageError::corrupt(format!(
                "{} trailing bytes after table '{}'",
                codec::remaining(&cursor),
                name
            )));
        }

        let table = Table {
            id,
            schema_id,
            name,
            columns,
            last_row_id,
        };
        if table.primary_key().map(|c| c.id) != pk_id {
            return Err(StorageError::corrupt(format!(
                "primary key of table '{}' does not match its columns",
                table.name
            )));
        }
        Ok(table)
    }
}

impl Keyed for Table {
    type Key = Uuid;

    fn key(&self) -> Uuid {
        self.id
    }
}
