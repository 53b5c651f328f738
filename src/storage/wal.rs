//! Write-ahead log.
//!
//! Every catalog and row mutation is journaled here before the page and meta
//! files it touches are rewritten by a checkpoint. Segments live in
//! `data/<db>/wal/` and are replayed on open.

pub mod manager;
pub mod record;

pub use manager::{WalConfig, WalManager};
pub use record::{WalPayload, WalRecord, WalRecordType, LSN, WAL_RECORD_HEADER_SIZE};
