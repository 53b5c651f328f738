//! Redo of WAL records newer than the last checkpoint.
//!
//! Every step checks whether its effect is already present, so records whose
//! changes reached disk before a crash are applied at most once.

use crate::catalog::{Catalog, Schema, Table};
use crate::storage::buffer::PageBuffer;
use crate::storage::codec::ByteCursor;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::file::FileManager;
use crate::storage::row::Row;
use crate::storage::wal::{WalPayload, WalRecord, LSN};
use log::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Records whose effect was missing and has been applied.
    pub applied: usize,
    /// Records already reflected on disk.
    pub already_present: usize,
    /// Records referring to schemas or tables that no longer exist.
    pub skipped: usize,
    pub last_lsn: LSN,
}

enum Outcome {
    Applied,
    AlreadyPresent,
    Skipped,
}

fn decode_row(catalog: &Catalog, table_id: Uuid, bytes: &[u8]) -> StorageResult<Option<Row>> {
    let Some(table) = catalog.table(&table_id) else {
        return Ok(None);
    };
    let mut cursor = ByteCursor::new(bytes);
    Row::decode(&mut cursor, table.column_count(), None).map(Some)
}

fn tombstone(
    pages: &mut PageBuffer,
    files: &FileManager,
    catalog: &mut Catalog,
    table_id: Uuid,
    row_id: u64,
) -> StorageResult<bool> {
    match pages.delete_row(files, catalog, table_id, row_id) {
        Ok(()) => Ok(true),
        Err(StorageError::RowNotFound { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

fn apply(
    record: &WalRecord,
    catalog: &mut Catalog,
    pages: &mut PageBuffer,
    files: &FileManager,
) -> StorageResult<Outcome> {
    let outcome = match &record.payload {
        WalPayload::CreateSchema { schema_id, schema } => {
            if catalog.schema(schema_id).is_some() {
                Outcome::AlreadyPresent
            } else {
                let schema = Schema::deserialize(schema, catalog.database())?;
                catalog.add_schema(schema)?;
                Outcome::Applied
            }
        }
        WalPayload::DropSchema { schema_id } => {
            if catalog.schema(schema_id).is_some() {
                catalog.remove_schema(schema_id)?;
                Outcome::Applied
            } else {
                Outcome::AlreadyPresent
            }
        }
        WalPayload::CreateTable { table_id, table } => {
            if catalog.table(table_id).is_some() {
                Outcome::AlreadyPresent
            } else {
                let table = Table::deserialize(table)?;
                if catalog.schema(&table.schema_id).is_none() {
                    Outcome::Skipped
                } else {
                    catalog.add_table(table)?;
                    Outcome::Applied
                }
            }
        }
        WalPayload::DropTable { table_id } => {
            if catalog.table(table_id).is_some() {
                pages.drop_table(table_id);
                catalog.remove_table(table_id)?;
                Outcome::Applied
            } else {
                Outcome::AlreadyPresent
            }
        }
        WalPayload::Insert { table_id, row } => match decode_row(catalog, *table_id, row)? {
            None => Outcome::Skipped,
            Some(row) => {
                if pages.restore_row(files, catalog, *table_id, row)? {
                    Outcome::Applied
                } else {
                    Outcome::AlreadyPresent
                }
            }
        },
        WalPayload::Delete { table_id, row_id } => {
            if catalog.table(table_id).is_none() {
                Outcome::Skipped
            } else if tombstone(pages, files, catalog, *table_id, *row_id)? {
                Outcome::Applied
            } else {
                Outcome::AlreadyPresent
            }
        }
        WalPayload::Update {
            table_id,
            old_row_id,
            row,
        } => match decode_row(catalog, *table_id, row)? {
            None => Outcome::Skipped,
            Some(row) => {
                let placed = pages.restore_row(files, catalog, *table_id, row)?;
                let removed = tombstone(pages, files, catalog, *table_id, *old_row_id)?;
                if placed || removed {
                    Outcome::Applied
                } else {
                    Outcome::AlreadyPresent
                }
            }
        },
    };
    Ok(outcome)
}

/// Re-apply every record with an LSN above `from`.
pub fn replay(
    records: &[WalRecord],
    from: LSN,
    catalog: &mut Catalog,
    pages: &mut PageBuffer,
    files: &FileManager,
) -> StorageResult<ReplayStats> {
    let mut stats = ReplayStats {
        last_lsn: from,
        ..Default::default()
    };

    for record in records.iter().filter(|r| r.lsn > from) {
        match apply(record, catalog, pages, files)? {
            Outcome::Applied => stats.applied += 1,
            Outcome::AlreadyPresent => stats.already_present += 1,
            Outcome::Skipped => {
                warn!(
                    "skipping {:?} at {} for {}: its schema or table no longer exists",
                    record.record_type(),
                    record.lsn,
                    record.payload.entity_id()
                );
                stats.skipped += 1;
            }
        }
        stats.last_lsn = stats.last_lsn.max(record.lsn);
    }

    if stats.applied > 0 {
        info!(
            "replayed WAL from {} to {}: {} applied, {} already present, {} skipped",
            from, stats.last_lsn, stats.applied, stats.already_present, stats.skipped
        );
    } else {
        debug!("WAL replay from {}: nothing to apply", from);
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ColumnDef;
    use crate::storage::page::{PageId, PAGE_HEADER_SIZE};
    use crate::storage::value::{Value, ValueType};
    use crate::storage::wal::WalRecord;
    use tempfile::TempDir;

    struct Setup {
        _dir: TempDir,
        files: FileManager,
        schema: Schema,
        table: Table,
        records: Vec<WalRecord>,
    }

    fn record(lsn: u64, payload: WalPayload) -> WalRecord {
        WalRecord::new(LSN(lsn), payload)
    }

    fn row_bytes(row_id: u64, value: i32) -> Vec<u8> {
        let mut row = Row::new(vec![Value::Integer(value)]);
        row.row_id = row_id;
        row.to_bytes(1).unwrap()
    }

    fn create_setup() -> Setup {
        let dir = TempDir::new().unwrap();
        let files = FileManager::open(dir.path(), "db").unwrap();
        let schema = Schema::new("main", "db");
        let table = Table::new(schema.id, "numbers", vec![ColumnDef::new("n", ValueType::Integer)]);
        let records = vec![
            record(1, WalPayload::CreateSchema { schema_id: schema.id, schema: schema.serialize() }),
            record(2, WalPayload::CreateTable { table_id: table.id, table: table.serialize() }),
            record(3, WalPayload::Insert { table_id: table.id, row: row_bytes(1, 10) }),
            record(4, WalPayload::Insert { table_id: table.id, row: row_bytes(2, 20) }),
            record(5, WalPayload::Delete { table_id: table.id, row_id: 1 }),
            record(6, WalPayload::Update { table_id: table.id, old_row_id: 2, row: row_bytes(3, 21) }),
        ];
        Setup {
            _dir: dir,
            files,
            schema,
            table,
            records,
        }
    }

    fn values(pages: &mut PageBuffer, files: &FileManager, catalog: &mut Catalog, table_id: Uuid) -> Vec<(u64, Value)> {
        pages
            .scan(files, catalog, table_id)
            .unwrap()
            .into_iter()
            .map(|r| (r.row_id, r.values[0].clone()))
            .collect()
    }

    #[test]
    fn test_replay_rebuilds_state() {
        let s = create_setup();
        let mut catalog = Catalog::new("db");
        let mut pages = PageBuffer::new(4096);

        let stats = replay(&s.records, LSN(0), &mut catalog, &mut pages, &s.files).unwrap();
        assert_eq!(stats.applied, 6);
        assert_eq!(stats.last_lsn, LSN(6));
        assert!(catalog.schema(&s.schema.id).is_some());
        assert_eq!(catalog.table(&s.table.id).unwrap().last_row_id, 3);
        assert_eq!(
            values(&mut pages, &s.files, &mut catalog, s.table.id),
            vec![(3, Value::Integer(21))]
        );
    }

    #[test]
    fn test_replay_is_idempotent() {
        let s = create_setup();
        let mut catalog = Catalog::new("db");
        let mut pages = PageBuffer::new(4096);
        replay(&s.records, LSN(0), &mut catalog, &mut pages, &s.files).unwrap();

        let again = replay(&s.records, LSN(0), &mut catalog, &mut pages, &s.files).unwrap();
        assert_eq!(again.applied, 0);
        assert_eq!(again.already_present, 6);
        assert_eq!(values(&mut pages, &s.files, &mut catalog, s.table.id).len(), 1);
    }

    #[test]
    fn test_replay_starts_after_checkpoint() {
        let s = create_setup();
        let mut catalog = Catalog::new("db");
        let mut pages = PageBuffer::new(4096);
        replay(&s.records[..3], LSN(0), &mut catalog, &mut pages, &s.files).unwrap();

        let stats = replay(&s.records, LSN(3), &mut catalog, &mut pages, &s.files).unwrap();
        assert_eq!(stats.applied, 3);
        assert_eq!(stats.already_present, 0);
    }

    fn page_of(pages: &PageBuffer, table_id: &Uuid, row_id: u64) -> Option<PageId> {
        pages
            .pages_of(table_id)
            .find(|p| p.row(row_id).is_some())
            .map(|p| p.id())
    }

    #[test]
    fn test_update_placed_on_another_page() {
        let s = create_setup();
        let row_size = row_bytes(1, 10).len() as u64;
        let mut catalog = Catalog::new("db");
        let mut pages = PageBuffer::new(PAGE_HEADER_SIZE + row_size * 2);
        let records = vec![
            s.records[0].clone(),
            s.records[1].clone(),
            record(3, WalPayload::Insert { table_id: s.table.id, row: row_bytes(1, 10) }),
            record(4, WalPayload::Insert { table_id: s.table.id, row: row_bytes(2, 20) }),
            record(5, WalPayload::Update { table_id: s.table.id, old_row_id: 1, row: row_bytes(3, 11) }),
        ];

        let stats = replay(&records, LSN(0), &mut catalog, &mut pages, &s.files).unwrap();
        assert_eq!(stats.applied, 5);
        assert_eq!(pages.pages_of(&s.table.id).count(), 2);
        assert!(pages.find_row(&s.table.id, 1).is_none());
        assert_ne!(
            page_of(&pages, &s.table.id, 2),
            page_of(&pages, &s.table.id, 3)
        );
        assert_eq!(
            values(&mut pages, &s.files, &mut catalog, s.table.id),
            vec![(2, Value::Integer(20)), (3, Value::Integer(11))]
        );

        let again = replay(&records, LSN(0), &mut catalog, &mut pages, &s.files).unwrap();
        assert_eq!(again.applied, 0);
        assert_eq!(pages.pages_of(&s.table.id).count(), 2);
    }

    #[test]
    fn test_update_that_fits_nowhere_keeps_old_row() {
        let s = create_setup();
        let mut null_row = Row::new(vec![Value::Null]);
        null_row.row_id = 1;
        let null_bytes = null_row.to_bytes(1).unwrap();
        let mut catalog = Catalog::new("db");
        // room for the NULL row only; the integer version is larger
        let mut pages = PageBuffer::new(PAGE_HEADER_SIZE + null_bytes.len() as u64);
        let records = vec![
            s.records[0].clone(),
            s.records[1].clone(),
            record(3, WalPayload::Insert { table_id: s.table.id, row: null_bytes }),
            record(4, WalPayload::Update { table_id: s.table.id, old_row_id: 1, row: row_bytes(2, 5) }),
        ];

        let result = replay(&records, LSN(0), &mut catalog, &mut pages, &s.files);
        assert!(matches!(result, Err(StorageError::PageFull { .. })));
        assert_eq!(
            values(&mut pages, &s.files, &mut catalog, s.table.id),
            vec![(1, Value::Null)]
        );
    }

    #[test]
    fn test_unknown_table_is_skipped() {
        let s = create_setup();
        let mut catalog = Catalog::new("db");
        let mut pages = PageBuffer::new(4096);
        let orphan = vec![
            record(1, WalPayload::Insert { table_id: Uuid::new_v4(), row: row_bytes(1, 1) }),
            record(2, WalPayload::Delete { table_id: Uuid::new_v4(), row_id: 1 }),
        ];
        let stats = replay(&orphan, LSN(0), &mut catalog, &mut pages, &s.files).unwrap();
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.applied, 0);
    }

    #[test]
    fn test_drop_records() {
        let mut s = create_setup();
        s.records.push(record(7, WalPayload::DropTable { table_id: s.table.id }));
        s.records.push(record(8, WalPayload::DropSchema { schema_id: s.schema.id }));
        let mut catalog = Catalog::new("db");
        let mut pages = PageBuffer::new(4096);

        replay(&s.records, LSN(0), &mut catalog, &mut pages, &s.files).unwrap();
        assert!(catalog.table(&s.table.id).is_none());
        assert!(catalog.schema(&s.schema.id).is_none());
        assert!(!pages.is_loaded(&s.table.id));
    }
}
