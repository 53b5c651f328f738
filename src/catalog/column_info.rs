//! Column information and metadata structures.

use crate::storage::buffer::registry::Keyed;
use crate::storage::codec::{self, ByteCursor};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::value::ValueType;
use bitflags::bitflags;
use bytes::BufMut;
use uuid::Uuid;

use super::MAX_NAME_LEN;

bitflags! {
    /// Column constraints.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ColumnFlags: u8 {
        /// Primary key.
        const PK = 0b0000_0001;
        /// Foreign key.
        const FK = 0b0000_0010;
        /// Auto increment: a NULL integer is filled with the new row id.
        const AI = 0b0000_0100;
        const NOT_NULL = 0b0000_1000;
        const UNIQUE = 0b0001_0000;
    }
}

impl ColumnFlags {
    /// Primary keys imply NOT NULL and UNIQUE.
    pub fn requires_value(self) -> bool {
        self.intersects(ColumnFlags::PK | ColumnFlags::NOT_NULL)
    }

    pub fn requires_unique(self) -> bool {
        self.intersects(ColumnFlags::PK | ColumnFlags::UNIQUE)
    }
}

/// Column definition supplied when creating a table.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub value_type: ValueType,
    pub flags: ColumnFlags,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            flags: ColumnFlags::empty(),
        }
    }

    pub fn with_flags(mut self, flags: ColumnFlags) -> Self {
        self.flags |= flags;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub id: Uuid,
    pub table_id: Uuid,
    pub name: String,
    pub value_type: ValueType,
    pub flags: ColumnFlags,
}

impl Column {
    pub fn new(table_id: Uuid, def: ColumnDef) -> Self {
        Self {
            id: Uuid::new_v4(),
            table_id,
            name: def.name,
            value_type: def.value_type,
            flags: def.flags,
        }
    }

    /// `[id][name_len][name][type][flags]`; the owning table is implied by
    /// the enclosing table meta.
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        codec::put_uuid(buf, &self.id);
        codec::put_string(buf, &self.name);
        buf.put_u8(self.value_type as u8);
        buf.put_u8(self.flags.bits());
    }

    pub fn deserialize(cursor: &mut ByteCursor<'_>, table_id: Uuid) -> StorageResult<Self> {
        let id = codec::read_uuid(cursor, "column id")?;
        let name = codec::read_string(cursor, MAX_NAME_LEN, "column name")?;
        let value_type = ValueType::from_u8(codec::read_u8(cursor, "column type")?)?;
        let raw_flags = codec::read_u8(cursor, "column flags")?;
        let flags = ColumnFlags::from_bits(raw_flags).ok_or_else(|| {
            StorageError::corrupt(format!("unknown column flags {:#04x}", raw_flags))
        })?;

        Ok(Column {
            id,
            table_id,
            name,
            value_type,
            flags,
        })
    }
}

impl Keyed for Column {
    type Key = Uuid;

    fn key(&self) -> Uuid {
        self.id
    }
}
