//! Schema (table namespace) metadata.

use crate::storage::buffer::registry::Keyed;
use crate::storage::codec::{self, ByteCursor};
use crate::storage::error::{StorageError, StorageResult};
use uuid::Uuid;

use super::MAX_NAME_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub id: Uuid,
    pub name: String,
    /// Owning database; implied by the directory the schema lives in.
    pub database: String,
}

impl Schema {
    pub fn new(name: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            database: database.into(),
        }
    }

    /// `[id][name_len][name]`
    pub fn serialize(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(16 + 4 + self.name.len());
        codec::put_uuid(&mut data, &self.id);
        codec::put_string(&mut data, &self.name);
        data
    }

    pub fn deserialize(data: &[u8], database: &str) -> StorageResult<Self> {
        let mut cursor = ByteCursor::new(data);
        let id = codec::read_uuid(&mut cursor, "schema id")?;
        let name = codec::read_string(&mut cursor, MAX_NAME_LEN, "schema name")?;
        if codec::remaining(&cursor) != 0 {
            return Err(StorageError::corrupt(format!(
                "{} trailing bytes after schema '{}'",
                codec::remaining(&cursor),
                name
            )));
        }
        Ok(Schema {
            id,
            name,
            database: database.to_string(),
        })
    }
}

impl Keyed for Schema {
    type Key = Uuid;

    fn key(&self) -> Uuid {
        self.id
    }
}
