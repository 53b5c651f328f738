//! Row encoding.
//!
//! A row is framed as
//! `[row_byte_length u32][row_id u64][flags u8][null bitmap][present values...]`
//! where `row_byte_length` covers the whole frame. Bit `i` of the null bitmap
//! (LSB first) is set iff column `i` is NULL; NULL columns contribute nothing
//! to the value stream.

use crate::storage::codec::{self, ByteCursor};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::value::Value;
use bitflags::bitflags;
use bytes::BufMut;

/// Row identifier, allocated per table from `Table::last_row_id`.
pub type RowId = u64;

/// `row_byte_length` + `row_id` + `flags`.
pub const ROW_HEADER_SIZE: usize = 4 + 8 + 1;

bitflags! {
    /// Per-row state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RowFlags: u8 {
        /// Soft-deleted. Skipped by scans, kept on the page.
        const OBSOLETE = 0b0000_0001;
    }
}

impl RowFlags {
    pub const NONE: RowFlags = RowFlags::empty();
}

/// Set of column positions to materialize when decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    columns: Vec<usize>,
}

impl Projection {
    pub fn new(mut columns: Vec<usize>) -> Self {
        columns.sort_unstable();
        columns.dedup();
        Self { columns }
    }

    pub fn contains(&self, column: usize) -> bool {
        self.columns.binary_search(&column).is_ok()
    }

    pub fn columns(&self) -> &[usize] {
        &self.columns
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub row_id: RowId,
    pub flags: RowFlags,
    pub values: Vec<Value>,
}

impl Row {
    /// A fresh row; the id is assigned when it lands on a page.
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            row_id: 0,
            flags: RowFlags::NONE,
            values,
        }
    }

    pub fn is_obsolete(&self) -> bool {
        self.flags.contains(RowFlags::OBSOLETE)
    }

    pub fn mark_obsolete(&mut self) {
        self.flags.insert(RowFlags::OBSOLETE);
    }

    pub fn null_bitmap_size(column_count: usize) -> usize {
        column_count.div_ceil(8)
    }

    /// Size of the encoded frame; does not depend on `row_id`.
    pub fn encoded_size(&self) -> usize {
        ROW_HEADER_SIZE
            + Self::null_bitmap_size(self.values.len())
            + self
                .values
                .iter()
                .filter(|v| !v.is_null())
                .map(Value::encoded_size)
                .sum::<usize>()
    }

    pub fn encode(&self, column_count: usize, buf: &mut Vec<u8>) -> StorageResult<()> {
        if self.values.len() != column_count {
            return Err(StorageError::corrupt(format!(
                "row {} has {} values but the table has {} columns",
                self.row_id,
                self.values.len(),
                column_count
            )));
        }

        let mut null_bitmap = vec![0u8; Self::null_bitmap_size(column_count)];
        for (i, value) in self.values.iter().enumerate() {
            if value.is_null() {
                null_bitmap[i / 8] |= 1 << (i % 8);
            }
        }

        buf.put_u32_le(self.encoded_size() as u32);
        buf.put_u64_le(self.row_id);
        buf.put_u8(self.flags.bits());
        buf.put_slice(&null_bitmap);
        for value in self.values.iter().filter(|v| !v.is_null()) {
            value.encode(buf);
        }
        Ok(())
    }

    pub fn to_bytes(&self, column_count: usize) -> StorageResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_size());
        self.encode(column_count, &mut buf)?;
        Ok(buf)
    }

    /// Decode one row frame. With a projection, columns outside it are still
    /// read (to stay aligned) but left out of `values`.
    pub fn decode(
        cursor: &mut ByteCursor<'_>,
        column_count: usize,
        projection: Option<&Projection>,
    ) -> StorageResult<Row> {
        let row_len = codec::read_u32(cursor, "row length")? as usize;
        let bitmap_size = Self::null_bitmap_size(column_count);
        if row_len < ROW_HEADER_SIZE + bitmap_size {
            return Err(StorageError::corrupt(format!(
                "row length {} is smaller than its header",
                row_len
            )));
        }
        let body = codec::take(cursor, row_len - 4, "row body")?;
        let mut body_cursor = ByteCursor::new(body);

        let row_id = codec::read_u64(&mut body_cursor, "row id")?;
        let raw_flags = codec::read_u8(&mut body_cursor, "row flags")?;
        let flags = RowFlags::from_bits(raw_flags)
            .ok_or_else(|| StorageError::corrupt(format!("unknown row flags {:#04x}", raw_flags)))?;
        let null_bitmap = codec::take(&mut body_cursor, bitmap_size, "null bitmap")?;

        let mut values = Vec::with_capacity(
            projection.map_or(column_count, |p| p.columns().len().min(column_count)),
        );
        for i in 0..column_count {
            let is_null = null_bitmap[i / 8] & (1 << (i % 8)) != 0;
            let value = if is_null {
                Value::Null
            } else {
                let value = Value::decode(&mut body_cursor)?;
                if value.is_null() {
                    return Err(StorageError::corrupt(format!(
                        "column {} of row {} is encoded as NULL but not marked in the bitmap",
                        i, row_id
                    )));
                }
                value
            };
            if projection.map_or(true, |p| p.contains(i)) {
                values.push(value);
            }
        }

        if codec::remaining(&body_cursor) != 0 {
            return Err(StorageError::corrupt(format!(
                "row {} declares {} bytes but {} were left unread",
                row_id,
                row_len,
                codec::remaining(&body_cursor)
            )));
        }

        Ok(Row {
            row_id,
            flags,
            values,
        })
    }

    /// Copy of this row restricted to the projected columns.
    pub fn project(&self, projection: &Projection) -> Row {
        Row {
            row_id: self.row_id,
            flags: self.flags,
            values: self
                .values
                .iter()
                .enumerate()
                .filter(|(i, _)| projection.contains(*i))
                .map(|(_, v)| v.clone())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::value::ValueType;

    fn decode_all(bytes: &[u8], column_count: usize) -> StorageResult<Row> {
        let mut cursor = ByteCursor::new(bytes);
        let row = Row::decode(&mut cursor, column_count, None)?;
        assert_eq!(codec::remaining(&cursor), 0);
        Ok(row)
    }

    #[test]
    fn test_null_bitmap_layout() -> StorageResult<()> {
        let mut row = Row::new(vec![
            Value::Integer(7),
            Value::String("ivan".to_string()),
            Value::Null,
        ]);
        row.row_id = 1;
        let bytes = row.to_bytes(3)?;

        assert_eq!(bytes.len(), row.encoded_size());
        // bitmap follows row_len, row_id and flags
        assert_eq!(bytes[ROW_HEADER_SIZE], 0b0000_0100);

        let mut expected_values = Value::Integer(7).to_bytes();
        expected_values.extend(Value::String("ivan".to_string()).to_bytes());
        assert_eq!(&bytes[ROW_HEADER_SIZE + 1..], expected_values.as_slice());

        assert_eq!(decode_all(&bytes, 3)?, row);
        Ok(())
    }

    #[test]
    fn test_round_trip_mixed_nulls() -> StorageResult<()> {
        let values: Vec<Value> = (0..19)
            .map(|i| match i % 4 {
                0 => Value::Null,
                1 => Value::Integer(i),
                2 => Value::Real(i as f64 / 2.0),
                _ => Value::String(format!("v{}", i)),
            })
            .collect();
        let mut row = Row::new(values);
        row.row_id = 42;
        row.mark_obsolete();

        let bytes = row.to_bytes(19)?;
        assert_eq!(Row::null_bitmap_size(19), 3);
        assert_eq!(decode_all(&bytes, 19)?, row);
        Ok(())
    }

    #[test]
    fn test_all_null_row() -> StorageResult<()> {
        let row = Row::new(vec![Value::Null; 9]);
        let bytes = row.to_bytes(9)?;
        assert_eq!(bytes.len(), ROW_HEADER_SIZE + 2);
        assert_eq!(&bytes[ROW_HEADER_SIZE..], &[0xff, 0x01]);
        assert_eq!(decode_all(&bytes, 9)?, row);
        Ok(())
    }

    #[test]
    fn test_column_count_mismatch() {
        let row = Row::new(vec![Value::Integer(1)]);
        assert!(row.to_bytes(2).is_err());
    }

    #[test]
    fn test_projection_keeps_alignment() -> StorageResult<()> {
        let first = Row::new(vec![
            Value::Integer(1),
            Value::String("a".into()),
            Value::Bool(true),
        ]);
        let second = Row::new(vec![
            Value::Integer(2),
            Value::Null,
            Value::Bool(false),
        ]);
        let mut bytes = first.to_bytes(3)?;
        second.encode(3, &mut bytes)?;

        let projection = Projection::new(vec![2, 0]);
        let mut cursor = ByteCursor::new(&bytes);
        let a = Row::decode(&mut cursor, 3, Some(&projection))?;
        let b = Row::decode(&mut cursor, 3, Some(&projection))?;

        assert_eq!(a.values, vec![Value::Integer(1), Value::Bool(true)]);
        assert_eq!(b.values, vec![Value::Integer(2), Value::Bool(false)]);
        assert_eq!(a, first.project(&projection));
        Ok(())
    }

    #[test]
    fn test_truncated_row_is_corrupt() -> StorageResult<()> {
        let row = Row::new(vec![Value::String("truncate me".into())]);
        let bytes = row.to_bytes(1)?;
        let mut cursor = ByteCursor::new(&bytes[..bytes.len() - 3]);
        assert!(matches!(
            Row::decode(&mut cursor, 1, None),
            Err(StorageError::CorruptStream(_))
        ));
        Ok(())
    }

    #[test]
    fn test_length_prefix_mismatch_is_corrupt() -> StorageResult<()> {
        let row = Row::new(vec![Value::Integer(5)]);
        let mut bytes = row.to_bytes(1)?;
        // claim one extra byte of trailing garbage
        let len = bytes.len() as u32 + 1;
        bytes[..4].copy_from_slice(&len.to_le_bytes());
        bytes.push(0);
        let mut cursor = ByteCursor::new(&bytes);
        assert!(Row::decode(&mut cursor, 1, None).is_err());
        Ok(())
    }

    #[test]
    fn test_null_tag_in_value_stream_is_corrupt() {
        let mut bytes = Vec::new();
        bytes.put_u32_le((ROW_HEADER_SIZE + 1 + 1) as u32);
        bytes.put_u64_le(1);
        bytes.put_u8(0);
        bytes.put_u8(0);
        bytes.put_u8(ValueType::Null as u8);
        let mut cursor = ByteCursor::new(&bytes);
        assert!(Row::decode(&mut cursor, 1, None).is_err());
    }
}
