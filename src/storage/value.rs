//! Typed column values and their self-describing binary encoding.
//!
//! A value is framed as `[type_tag][length_prefix if String][payload]`. The
//! payload width of every fixed-size type comes from [`TYPE_SIZES`], so a
//! decoder never needs the table schema to know how many bytes to consume.

use crate::storage::codec::{self, ByteCursor};
use crate::storage::error::{StorageError, StorageResult};
use bytes::BufMut;
use std::cmp::Ordering;
use std::fmt;

/// Upper bound on a single encoded String payload.
pub const MAX_VALUE_LEN: usize = 16 * 1024 * 1024;

/// Data types supported by the database
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Null = 0,
    Integer = 1,
    Real = 2,
    Char = 3,
    Bool = 4,
    String = 5,
}

/// Payload width per type tag; `None` marks a length-prefixed type.
const TYPE_SIZES: [Option<usize>; 6] = [Some(0), Some(4), Some(8), Some(1), Some(1), None];

impl ValueType {
    pub fn from_u8(value: u8) -> StorageResult<Self> {
        match value {
            0 => Ok(ValueType::Null),
            1 => Ok(ValueType::Integer),
            2 => Ok(ValueType::Real),
            3 => Ok(ValueType::Char),
            4 => Ok(ValueType::Bool),
            5 => Ok(ValueType::String),
            _ => Err(StorageError::corrupt(format!("unknown value type tag {}", value))),
        }
    }

    /// Fixed payload size in bytes, or `None` for String.
    pub fn fixed_size(self) -> Option<usize> {
        TYPE_SIZES[self as usize]
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueType::Null => "NULL",
            ValueType::Integer => "INTEGER",
            ValueType::Real => "REAL",
            ValueType::Char => "CHAR",
            ValueType::Bool => "BOOL",
            ValueType::String => "STRING",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Values that can be stored in the database
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i32),
    Real(f64),
    Char(u8),
    Bool(bool),
    String(String),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Null,
            Value::Integer(_) => ValueType::Integer,
            Value::Real(_) => ValueType::Real,
            Value::Char(_) => ValueType::Char,
            Value::Bool(_) => ValueType::Bool,
            Value::String(_) => ValueType::String,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// NULL is compatible with any column type; everything else must match exactly.
    pub fn is_compatible_with(&self, value_type: ValueType) -> bool {
        self.is_null() || self.value_type() == value_type
    }

    /// Number of bytes [`Value::encode`] appends.
    pub fn encoded_size(&self) -> usize {
        match self {
            Value::String(s) => 1 + 4 + s.len(),
            other => 1 + other.value_type().fixed_size().unwrap_or(0),
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u8(self.value_type() as u8);
        match self {
            Value::Null => {}
            Value::Integer(i) => buf.put_i32_le(*i),
            Value::Real(r) => buf.put_f64_le(*r),
            Value::Char(c) => buf.put_u8(*c),
            Value::Bool(b) => buf.put_u8(u8::from(*b)),
            Value::String(s) => {
                buf.put_u32_le(s.len() as u32);
                buf.put_slice(s.as_bytes());
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_size());
        self.encode(&mut buf);
        buf
    }

    pub fn decode(cursor: &mut ByteCursor<'_>) -> StorageResult<Value> {
        let value_type = ValueType::from_u8(codec::read_u8(cursor, "value tag")?)?;

        let len = match value_type.fixed_size() {
            Some(size) => size,
            None => {
                let len = codec::read_u32(cursor, "string length")? as usize;
                if len > MAX_VALUE_LEN {
                    return Err(StorageError::corrupt(format!(
                        "string length {} exceeds limit {}",
                        len, MAX_VALUE_LEN
                    )));
                }
                len
            }
        };
        if codec::remaining(cursor) < len {
            return Err(StorageError::corrupt(format!(
                "{} value needs {} bytes but only {} remain",
                value_type,
                len,
                codec::remaining(cursor)
            )));
        }

        let value = match value_type {
            ValueType::Null => Value::Null,
            ValueType::Integer => Value::Integer(codec::read_i32(cursor, "integer")?),
            ValueType::Real => Value::Real(codec::read_f64(cursor, "real")?),
            ValueType::Char => Value::Char(codec::read_u8(cursor, "char")?),
            ValueType::Bool => match codec::read_u8(cursor, "bool")? {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => {
                    return Err(StorageError::corrupt(format!("invalid bool byte {}", other)))
                }
            },
            ValueType::String => {
                let bytes = codec::take(cursor, len, "string")?;
                Value::String(String::from_utf8(bytes.to_vec()).map_err(|e| {
                    StorageError::corrupt(format!("string is not valid UTF-8: {}", e))
                })?)
            }
        };
        Ok(value)
    }

    /// Ordering used by row filters. NULL never compares; Integer and Real
    /// compare numerically with each other.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (Value::Real(a), Value::Real(b)) => a.partial_cmp(b),
            (Value::Integer(a), Value::Real(b)) => f64::from(*a).partial_cmp(b),
            (Value::Real(a), Value::Integer(b)) => a.partial_cmp(&f64::from(*b)),
            (Value::Char(a), Value::Char(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Real(r) => write!(f, "{}", r),
            Value::Char(c) => write!(f, "{}", char::from(*c)),
            Value::Bool(b) => write!(f, "{}", b),
            Value::String(s) => write!(f, "{}", s),
        }
    }
}
