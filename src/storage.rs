//! Storage layer for pagedb.
//!
//! - **Value / Row**: the typed value and row codecs
//! - **Page**: capacity-bounded run of rows belonging to one table
//! - **PageBuffer**: per-table working set of pages with dirty tracking
//! - **FileManager**: directory layout and atomic blob writes
//! - **WAL**: segment-based write-ahead log

pub mod buffer;
pub mod codec;
pub mod error;
pub mod file;
pub mod page;
pub mod row;
pub mod value;
pub mod wal;

pub use buffer::PageBuffer;
pub use error::{StorageError, StorageResult};
pub use file::FileManager;
pub use page::{Page, PageId, RowUpdate, DEFAULT_MAX_PAGE_SIZE};
pub use row::{Projection, Row, RowFlags, RowId};
pub use value::{Value, ValueType};
