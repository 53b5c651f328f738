//! Cursor helpers shared by the value, row, page, catalog and WAL codecs.
//!
//! Writers append to a `Vec<u8>` through [`bytes::BufMut`]; readers pull from a
//! [`ByteCursor`] through [`byteorder::ReadBytesExt`]. Every read failure is
//! reported as [`StorageError::CorruptStream`] naming the field being read.

use crate::storage::error::{StorageError, StorageResult};
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::BufMut;
use std::io::Cursor;
use uuid::Uuid;

/// Read position over a borrowed byte buffer.
pub type ByteCursor<'a> = Cursor<&'a [u8]>;

/// Encoded length of a [`Uuid`] on disk.
pub const UUID_LEN: usize = 16;

pub fn remaining(cursor: &ByteCursor<'_>) -> usize {
    let len = cursor.get_ref().len() as u64;
    len.saturating_sub(cursor.position()) as usize
}

fn truncated(what: &str) -> StorageError {
    StorageError::corrupt(format!("truncated while reading {}", what))
}

pub fn read_u8(cursor: &mut ByteCursor<'_>, what: &str) -> StorageResult<u8> {
    cursor.read_u8().map_err(|_| truncated(what))
}

pub fn read_u32(cursor: &mut ByteCursor<'_>, what: &str) -> StorageResult<u32> {
    cursor.read_u32::<LittleEndian>().map_err(|_| truncated(what))
}

pub fn read_u64(cursor: &mut ByteCursor<'_>, what: &str) -> StorageResult<u64> {
    cursor.read_u64::<LittleEndian>().map_err(|_| truncated(what))
}

pub fn read_i32(cursor: &mut ByteCursor<'_>, what: &str) -> StorageResult<i32> {
    cursor.read_i32::<LittleEndian>().map_err(|_| truncated(what))
}

pub fn read_f64(cursor: &mut ByteCursor<'_>, what: &str) -> StorageResult<f64> {
    cursor.read_f64::<LittleEndian>().map_err(|_| truncated(what))
}

/// Borrow the next `len` bytes and advance past them.
pub fn take<'a>(cursor: &mut ByteCursor<'a>, len: usize, what: &str) -> StorageResult<&'a [u8]> {
    if remaining(cursor) < len {
        return Err(StorageError::corrupt(format!(
            "{} declares {} bytes but only {} remain",
            what,
            len,
            remaining(cursor)
        )));
    }
    let start = cursor.position() as usize;
    let data: &'a [u8] = cursor.get_ref();
    cursor.set_position((start + len) as u64);
    Ok(&data[start..start + len])
}

pub fn read_uuid(cursor: &mut ByteCursor<'_>, what: &str) -> StorageResult<Uuid> {
    let bytes = take(cursor, UUID_LEN, what)?;
    Uuid::from_slice(bytes).map_err(|e| StorageError::corrupt(format!("{}: {}", what, e)))
}

/// Read a `u32` length-prefixed UTF-8 string, rejecting lengths above `max_len`.
pub fn read_string(cursor: &mut ByteCursor<'_>, max_len: usize, what: &str) -> StorageResult<String> {
    let len = read_u32(cursor, what)? as usize;
    if len > max_len {
        return Err(StorageError::corrupt(format!(
            "{} length {} exceeds limit {}",
            what, len, max_len
        )));
    }
    let bytes = take(cursor, len, what)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|e| StorageError::corrupt(format!("{} is not valid UTF-8: {}", what, e)))
}

pub fn put_uuid(buf: &mut Vec<u8>, id: &Uuid) {
    buf.put_slice(id.as_bytes());
}

pub fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}
