//! WAL record types and framing.
//!
//! Every record is framed as
//! `[record_type u8][lsn u64][payload_len u32][crc32 u32][payload]`, where the
//! CRC covers type, LSN, length and payload. The payload starts with the
//! 16-byte id of the entity the record is about.

use crate::storage::codec::{self, ByteCursor, UUID_LEN};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::row::RowId;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Type byte + LSN + payload length + checksum.
pub const WAL_RECORD_HEADER_SIZE: usize = 1 + 8 + 4 + 4;

/// Sanity ceiling on a single record payload.
const MAX_PAYLOAD_LEN: u32 = 128 * 1024 * 1024;

/// Log Sequence Number - a unique identifier for WAL records.
/// LSNs are monotonically increasing and used to order log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct LSN(pub u64);

impl LSN {
    pub fn new() -> Self {
        LSN(0)
    }

    pub fn next(&self) -> Self {
        LSN(self.0 + 1)
    }
}

impl fmt::Display for LSN {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LSN({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WalRecordType {
    Insert = 1,
    CreateSchema = 2,
    DropSchema = 3,
    CreateTable = 4,
    DropTable = 5,
    Delete = 6,
    Update = 7,
}

impl WalRecordType {
    pub fn from_u8(value: u8) -> StorageResult<Self> {
        Ok(match value {
            1 => WalRecordType::Insert,
            2 => WalRecordType::CreateSchema,
            3 => WalRecordType::DropSchema,
            4 => WalRecordType::CreateTable,
            5 => WalRecordType::DropTable,
            6 => WalRecordType::Delete,
            7 => WalRecordType::Update,
            other => {
                return Err(StorageError::corrupt(format!(
                    "unknown WAL record type {}",
                    other
                )))
            }
        })
    }
}

/// What a record journals. Entity bytes are the same encodings used on disk:
/// row frames for rows, meta images for schemas and tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalPayload {
    Insert { table_id: Uuid, row: Vec<u8> },
    CreateSchema { schema_id: Uuid, schema: Vec<u8> },
    DropSchema { schema_id: Uuid },
    CreateTable { table_id: Uuid, table: Vec<u8> },
    DropTable { table_id: Uuid },
    Delete { table_id: Uuid, row_id: RowId },
    Update { table_id: Uuid, old_row_id: RowId, row: Vec<u8> },
}

impl WalPayload {
    pub fn record_type(&self) -> WalRecordType {
        match self {
            WalPayload::Insert { .. } => WalRecordType::Insert,
            WalPayload::CreateSchema { .. } => WalRecordType::CreateSchema,
            WalPayload::DropSchema { .. } => WalRecordType::DropSchema,
            WalPayload::CreateTable { .. } => WalRecordType::CreateTable,
            WalPayload::DropTable { .. } => WalRecordType::DropTable,
            WalPayload::Delete { .. } => WalRecordType::Delete,
            WalPayload::Update { .. } => WalRecordType::Update,
        }
    }

    pub fn entity_id(&self) -> Uuid {
        match self {
            WalPayload::Insert { table_id, .. }
            | WalPayload::CreateTable { table_id, .. }
            | WalPayload::DropTable { table_id }
            | WalPayload::Delete { table_id, .. }
            | WalPayload::Update { table_id, .. } => *table_id,
            WalPayload::CreateSchema { schema_id, .. } | WalPayload::DropSchema { schema_id } => {
                *schema_id
            }
        }
    }

    fn encoded_len(&self) -> usize {
        UUID_LEN
            + match self {
                WalPayload::Insert { row: bytes, .. }
                | WalPayload::CreateSchema { schema: bytes, .. }
                | WalPayload::CreateTable { table: bytes, .. } => bytes.len(),
                WalPayload::DropSchema { .. } | WalPayload::DropTable { .. } => 0,
                WalPayload::Delete { .. } => 8,
                WalPayload::Update { row, .. } => 8 + row.len(),
            }
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.entity_id().as_bytes());
        match self {
            WalPayload::Insert { row: bytes, .. }
            | WalPayload::CreateSchema { schema: bytes, .. }
            | WalPayload::CreateTable { table: bytes, .. } => buf.put_slice(bytes),
            WalPayload::DropSchema { .. } | WalPayload::DropTable { .. } => {}
            WalPayload::Delete { row_id, .. } => buf.put_u64_le(*row_id),
            WalPayload::Update {
                old_row_id, row, ..
            } => {
                buf.put_u64_le(*old_row_id);
                buf.put_slice(row);
            }
        }
    }

    fn decode(record_type: WalRecordType, data: &[u8]) -> StorageResult<Self> {
        let mut cursor = ByteCursor::new(data);
        let id = codec::read_uuid(&mut cursor, "WAL entity id")?;
        let rest = |cursor: &ByteCursor<'_>| data[cursor.position() as usize..].to_vec();

        let payload = match record_type {
            WalRecordType::Insert => WalPayload::Insert {
                table_id: id,
                row: rest(&cursor),
            },
            WalRecordType::CreateSchema => WalPayload::CreateSchema {
                schema_id: id,
                schema: rest(&cursor),
            },
            WalRecordType::CreateTable => WalPayload::CreateTable {
                table_id: id,
                table: rest(&cursor),
            },
            WalRecordType::DropSchema => WalPayload::DropSchema { schema_id: id },
            WalRecordType::DropTable => WalPayload::DropTable { table_id: id },
            WalRecordType::Delete => WalPayload::Delete {
                table_id: id,
                row_id: codec::read_u64(&mut cursor, "deleted row id")?,
            },
            WalRecordType::Update => {
                let old_row_id = codec::read_u64(&mut cursor, "updated row id")?;
                WalPayload::Update {
                    table_id: id,
                    old_row_id,
                    row: rest(&cursor),
                }
            }
        };

        let fixed = matches!(
            record_type,
            WalRecordType::DropSchema | WalRecordType::DropTable | WalRecordType::Delete
        );
        if fixed && codec::remaining(&cursor) != 0 {
            return Err(StorageError::corrupt(format!(
                "{:?} record has {} trailing bytes",
                record_type,
                codec::remaining(&cursor)
            )));
        }
        Ok(payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub lsn: LSN,
    pub payload: WalPayload,
}

fn checksum(record_type: u8, lsn: u64, payload_len: u32, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[record_type]);
    hasher.update(&lsn.to_le_bytes());
    hasher.update(&payload_len.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

impl WalRecord {
    pub fn new(lsn: LSN, payload: WalPayload) -> Self {
        Self { lsn, payload }
    }

    pub fn record_type(&self) -> WalRecordType {
        self.payload.record_type()
    }

    pub fn encoded_len(&self) -> usize {
        WAL_RECORD_HEADER_SIZE + self.payload.encoded_len()
    }

    /// Append the framed record to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut payload = Vec::with_capacity(self.payload.encoded_len());
        self.payload.encode(&mut payload);
        let record_type = self.record_type() as u8;
        let payload_len = payload.len() as u32;

        buf.reserve(WAL_RECORD_HEADER_SIZE + payload.len());
        buf.put_u8(record_type);
        buf.put_u64_le(self.lsn.0);
        buf.put_u32_le(payload_len);
        buf.put_u32_le(checksum(record_type, self.lsn.0, payload_len, &payload));
        buf.put_slice(&payload);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.to_vec()
    }

    /// Read one framed record. Truncation, an unknown type or a checksum
    /// mismatch is `CorruptStream`.
    pub fn decode(cursor: &mut ByteCursor<'_>) -> StorageResult<Self> {
        let raw_type = codec::read_u8(cursor, "WAL record type")?;
        let lsn = codec::read_u64(cursor, "WAL lsn")?;
        let payload_len = codec::read_u32(cursor, "WAL payload length")?;
        let expected = codec::read_u32(cursor, "WAL checksum")?;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(StorageError::corrupt(format!(
                "WAL payload of {} bytes at {}",
                payload_len,
                LSN(lsn)
            )));
        }
        let payload = codec::take(cursor, payload_len as usize, "WAL payload")?;

        let actual = checksum(raw_type, lsn, payload_len, payload);
        if actual != expected {
            return Err(StorageError::corrupt(format!(
                "WAL checksum mismatch at {}: stored {:#010x}, computed {:#010x}",
                LSN(lsn),
                expected,
                actual
            )));
        }
        let record_type = WalRecordType::from_u8(raw_type)?;
        Ok(WalRecord {
            lsn: LSN(lsn),
            payload: WalPayload::decode(record_type, payload)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(bytes: &[u8]) -> StorageResult<WalRecord> {
        let mut cursor = ByteCursor::new(bytes);
        let record = WalRecord::decode(&mut cursor)?;
        assert_eq!(codec::remaining(&cursor), 0);
        Ok(record)
    }

    #[test]
    fn test_lsn_ordering() {
        let lsn = LSN::new();
        assert_eq!(lsn.next(), LSN(1));
        assert!(LSN(3) > LSN(2));
        assert_eq!(LSN(7).to_string(), "LSN(7)");
    }

    #[test]
    fn test_frame_layout() -> StorageResult<()> {
        let table_id = Uuid::new_v4();
        let record = WalRecord::new(
            LSN(9),
            WalPayload::Delete {
                table_id,
                row_id: 77,
            },
        );
        let bytes = record.to_bytes();
        assert_eq!(bytes.len(), WAL_RECORD_HEADER_SIZE + UUID_LEN + 8);
        assert_eq!(bytes[0], WalRecordType::Delete as u8);
        assert_eq!(&bytes[1..9], &9u64.to_le_bytes());
        assert_eq!(&bytes[9..13], &24u32.to_le_bytes());
        assert_eq!(&bytes[WAL_RECORD_HEADER_SIZE..WAL_RECORD_HEADER_SIZE + 16], table_id.as_bytes());
        assert_eq!(decode_one(&bytes)?, record);
        Ok(())
    }

    #[test]
    fn test_payload_variants() -> StorageResult<()> {
        let id = Uuid::new_v4();
        let payloads = vec![
            WalPayload::Insert { table_id: id, row: vec![1, 2, 3] },
            WalPayload::CreateSchema { schema_id: id, schema: b"schema".to_vec() },
            WalPayload::DropSchema { schema_id: id },
            WalPayload::CreateTable { table_id: id, table: vec![] },
            WalPayload::DropTable { table_id: id },
            WalPayload::Update { table_id: id, old_row_id: 5, row: vec![9; 40] },
        ];
        let mut buf = BytesMut::new();
        for (i, payload) in payloads.iter().enumerate() {
            WalRecord::new(LSN(i as u64 + 1), payload.clone()).encode(&mut buf);
        }

        let mut cursor = ByteCursor::new(&buf);
        for (i, payload) in payloads.iter().enumerate() {
            let record = WalRecord::decode(&mut cursor)?;
            assert_eq!(record.lsn, LSN(i as u64 + 1));
            assert_eq!(&record.payload, payload);
            assert_eq!(record.payload.entity_id(), id);
        }
        assert_eq!(codec::remaining(&cursor), 0);
        Ok(())
    }

    #[test]
    fn test_checksum_mismatch() {
        let record = WalRecord::new(
            LSN(1),
            WalPayload::Insert {
                table_id: Uuid::new_v4(),
                row: vec![0; 10],
            },
        );
        let mut bytes = record.to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(decode_one(&bytes), Err(StorageError::CorruptStream(_))));
    }

    #[test]
    fn test_truncated_and_unknown() {
        let bytes = WalRecord::new(LSN(1), WalPayload::DropTable { table_id: Uuid::new_v4() }).to_bytes();
        assert!(decode_one(&bytes[..bytes.len() - 1]).is_err());
        assert!(decode_one(&bytes[..4]).is_err());
        assert!(WalRecordType::from_u8(0).is_err());
        assert!(WalRecordType::from_u8(8).is_err());
    }
}
