//! Row predicates used by scans, updates and deletes.

use crate::catalog::Table;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::row::Row;
use crate::storage::value::Value;
use std::cmp::Ordering;
use std::fmt;

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        };
        f.write_str(symbol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicOp {
    And,
    Or,
}

/// `column op value`
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub column: String,
    pub op: CompareOp,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataFilter {
    Condition(Condition),
    Node {
        left: Box<DataFilter>,
        op: LogicOp,
        right: Box<DataFilter>,
    },
}

impl DataFilter {
    pub fn condition(column: impl Into<String>, op: CompareOp, value: Value) -> Self {
        DataFilter::Condition(Condition {
            column: column.into(),
            op,
            value,
        })
    }

    pub fn eq(column: impl Into<String>, value: Value) -> Self {
        Self::condition(column, CompareOp::Eq, value)
    }

    pub fn and(self, other: DataFilter) -> Self {
        DataFilter::Node {
            left: Box::new(self),
            op: LogicOp::And,
            right: Box::new(other),
        }
    }

    pub fn or(self, other: DataFilter) -> Self {
        DataFilter::Node {
            left: Box::new(self),
            op: LogicOp::Or,
            right: Box::new(other),
        }
    }

    /// Evaluate against a full row of `table`. Any comparison involving NULL
    /// is false; an unknown column is an error.
    pub fn matches(&self, table: &Table, row: &Row) -> StorageResult<bool> {
        match self {
            DataFilter::Condition(condition) => {
                let index = table.column_index(&condition.column).ok_or_else(|| {
                    StorageError::integrity(format!(
                        "table '{}' has no column '{}'",
                        table.name, condition.column
                    ))
                })?;
                let value = row.values.get(index).unwrap_or(&Value::Null);
                Ok(value
                    .compare(&condition.value)
                    .is_some_and(|ordering| condition.op.holds(ordering)))
            }
            DataFilter::Node { left, op, right } => Ok(match op {
                LogicOp::And => left.matches(table, row)? && right.matches(table, row)?,
                LogicOp::Or => left.matches(table, row)? || right.matches(table, row)?,
            }),
        }
    }
}
