//! WAL manager implementation.
//!
//! Records are appended to an in-memory buffer by the mutating thread and
//! written out in batches by `flush`, either from the background writer or
//! explicitly (checkpoint, close, `sync_wal`).

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use uuid::Uuid;

use super::record::{WalPayload, WalRecord, LSN};
use crate::storage::codec::{self, ByteCursor};
use crate::storage::error::StorageResult;
use crate::storage::row::RowId;
use crate::worker::ShutdownToken;

/// WAL file prefix.
const WAL_FILE_PREFIX: &str = "wal_";

/// WAL file extension.
const WAL_FILE_EXTENSION: &str = ".log";

/// WAL manager configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory where WAL segments are stored.
    pub wal_dir: PathBuf,
    /// Size after which a new segment is started.
    pub segment_size: u64,
    /// Whether every flush is followed by an fsync.
    pub sync_on_flush: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            wal_dir: PathBuf::from("wal"),
            segment_size: 64 * 1024 * 1024,
            sync_on_flush: true,
        }
    }
}

fn segment_file_name(seq: u64) -> String {
    format!("{}{:020}{}", WAL_FILE_PREFIX, seq, WAL_FILE_EXTENSION)
}

fn parse_segment_name(name: &str) -> Option<u64> {
    name.strip_prefix(WAL_FILE_PREFIX)?
        .strip_suffix(WAL_FILE_EXTENSION)?
        .parse()
        .ok()
}

/// The segment currently being appended to.
struct ActiveSegment {
    seq: u64,
    path: PathBuf,
    file: BufWriter<File>,
    size: u64,
    last_lsn: LSN,
    /// Set after a failed write; the next flush starts a new segment.
    poisoned: bool,
}

impl ActiveSegment {
    fn create(dir: &Path, seq: u64) -> StorageResult<Self> {
        let path = dir.join(segment_file_name(seq));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        File::open(dir)?.sync_all()?;
        debug!("opened WAL segment {}", path.display());
        Ok(ActiveSegment {
            seq,
            path,
            file: BufWriter::new(file),
            size: 0,
            last_lsn: LSN::new(),
            poisoned: false,
        })
    }

    fn write(&mut self, data: &[u8], sync: bool) -> StorageResult<()> {
        self.file.write_all(data)?;
        self.file.flush()?;
        if sync {
            self.file.get_mut().sync_data()?;
        }
        self.size += data.len() as u64;
        Ok(())
    }
}

/// A segment that will not be written again.
#[derive(Debug, Clone)]
struct ClosedSegment {
    path: PathBuf,
    last_lsn: LSN,
}

struct Segments {
    active: ActiveSegment,
    closed: Vec<ClosedSegment>,
}

impl Segments {
    fn rotate(&mut self, dir: &Path) -> StorageResult<()> {
        if !self.active.poisoned {
            self.active.file.flush()?;
            self.active.file.get_mut().sync_all()?;
        }
        let next = ActiveSegment::create(dir, self.active.seq + 1)?;
        let old = std::mem::replace(&mut self.active, next);
        self.closed.push(ClosedSegment {
            path: old.path,
            last_lsn: old.last_lsn,
        });
        Ok(())
    }
}

/// LSN allocation and the not-yet-written records share one lock so records
/// sit in the buffer in LSN order.
struct PendingRecords {
    next_lsn: u64,
    records: Vec<WalRecord>,
}

/// WAL manager for handling write-ahead logging.
pub struct WalManager {
    config: WalConfig,
    pending: Mutex<PendingRecords>,
    segments: Mutex<Segments>,
    /// All records up to this LSN have reached the segment files.
    flushed_lsn: AtomicU64,
}

impl WalManager {
    /// Open the log in `config.wal_dir`, returning the records found in the
    /// existing segments. Appends always go to a fresh segment.
    pub fn open(config: WalConfig) -> StorageResult<(Self, Vec<WalRecord>)> {
        fs::create_dir_all(&config.wal_dir)?;

        let mut records = Vec::new();
        let mut closed = Vec::new();
        let mut last_seq = 0;
        for (seq, path) in Self::segment_paths(&config.wal_dir)? {
            let segment_records = Self::read_segment(&path)?;
            let last_lsn = segment_records.iter().map(|r| r.lsn).max().unwrap_or_default();
            closed.push(ClosedSegment { path, last_lsn });
            records.extend(segment_records);
            last_seq = seq;
        }
        let max_lsn = records.iter().map(|r| r.lsn).max().unwrap_or_default();

        let active = ActiveSegment::create(&config.wal_dir, last_seq + 1)?;
        info!(
            "WAL opened in {} with {} records in {} segments, next {}",
            config.wal_dir.display(),
            records.len(),
            closed.len(),
            max_lsn.next()
        );

        let manager = WalManager {
            config,
            pending: Mutex::new(PendingRecords {
                next_lsn: max_lsn.0 + 1,
                records: Vec::new(),
            }),
            segments: Mutex::new(Segments { active, closed }),
            flushed_lsn: AtomicU64::new(max_lsn.0),
        };
        Ok((manager, records))
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    /// Highest LSN handed out so far.
    pub fn current_lsn(&self) -> LSN {
        LSN(self.pending.lock().next_lsn - 1)
    }

    pub fn flushed_lsn(&self) -> LSN {
        LSN(self.flushed_lsn.load(Ordering::SeqCst))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().records.len()
    }

    /// Number of segment files, the active one included.
    pub fn segment_count(&self) -> usize {
        self.segments.lock().closed.len() + 1
    }

    /// Never hand out an LSN at or below `lsn`. Segments purged by a
    /// checkpoint take their LSNs with them, so the checkpoint's LSN is the
    /// floor on open.
    pub fn advance_to(&self, lsn: LSN) {
        let mut pending = self.pending.lock();
        if pending.next_lsn <= lsn.0 {
            pending.next_lsn = lsn.0 + 1;
        }
        self.flushed_lsn.fetch_max(lsn.0, Ordering::SeqCst);
    }

    fn push(&self, payload: WalPayload) -> LSN {
        let mut pending = self.pending.lock();
        let lsn = LSN(pending.next_lsn);
        pending.next_lsn += 1;
        pending.records.push(WalRecord::new(lsn, payload));
        lsn
    }

    pub fn push_insert(&self, table_id: Uuid, row: Vec<u8>) -> LSN {
        self.push(WalPayload::Insert { table_id, row })
    }

    pub fn push_create_schema(&self, schema_id: Uuid, schema: Vec<u8>) -> LSN {
        self.push(WalPayload::CreateSchema { schema_id, schema })
    }

    pub fn push_drop_schema(&self, schema_id: Uuid) -> LSN {
        self.push(WalPayload::DropSchema { schema_id })
    }

    pub fn push_create_table(&self, table_id: Uuid, table: Vec<u8>) -> LSN {
        self.push(WalPayload::CreateTable { table_id, table })
    }

    pub fn push_drop_table(&self, table_id: Uuid) -> LSN {
        self.push(WalPayload::DropTable { table_id })
    }

    pub fn push_delete(&self, table_id: Uuid, row_id: RowId) -> LSN {
        self.push(WalPayload::Delete { table_id, row_id })
    }

    pub fn push_update(&self, table_id: Uuid, old_row_id: RowId, row: Vec<u8>) -> LSN {
        self.push(WalPayload::Update {
            table_id,
            old_row_id,
            row,
        })
    }

    /// Write every buffered record. Returns the flushed LSN. On failure the
    /// records go back to the front of the buffer.
    pub fn flush(&self) -> StorageResult<LSN> {
        let mut segments = self.segments.lock();
        let batch = std::mem::take(&mut self.pending.lock().records);
        let Some(last) = batch.last() else {
            return Ok(self.flushed_lsn());
        };
        let last_lsn = last.lsn;

        let mut buf = BytesMut::with_capacity(batch.iter().map(WalRecord::encoded_len).sum());
        for record in &batch {
            record.encode(&mut buf);
        }

        let active = &segments.active;
        let overflow = active.size > 0 && active.size + buf.len() as u64 > self.config.segment_size;
        let result = if active.poisoned || overflow {
            segments.rotate(&self.config.wal_dir)
        } else {
            Ok(())
        }
        .and_then(|_| segments.active.write(&buf, self.config.sync_on_flush));

        if let Err(e) = result {
            segments.active.poisoned = true;
            let mut pending = self.pending.lock();
            let newer = std::mem::replace(&mut pending.records, batch);
            pending.records.extend(newer);
            return Err(e);
        }

        segments.active.last_lsn = last_lsn;
        self.flushed_lsn.store(last_lsn.0, Ordering::SeqCst);
        debug!(
            "flushed {} WAL records ({} bytes) through {}",
            batch.len(),
            buf.len(),
            last_lsn
        );
        Ok(last_lsn)
    }

    /// Delete closed segments whose records are all covered by `lsn`.
    pub fn purge_through(&self, lsn: LSN) -> StorageResult<usize> {
        let mut segments = self.segments.lock();
        let mut purged = 0;
        let mut kept = Vec::new();
        for segment in std::mem::take(&mut segments.closed) {
            if segment.last_lsn <= lsn {
                match fs::remove_file(&segment.path) {
                    Ok(()) => purged += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => purged += 1,
                    Err(e) => {
                        warn!("could not remove {}: {}", segment.path.display(), e);
                        kept.push(segment);
                    }
                }
            } else {
                kept.push(segment);
            }
        }
        segments.closed = kept;
        if purged > 0 {
            debug!("purged {} WAL segments through {}", purged, lsn);
        }
        Ok(purged)
    }

    /// Periodically flush until `shutdown` is cancelled, then flush once more.
    pub fn run_writer(&self, shutdown: &ShutdownToken, interval: Duration) {
        while !shutdown.wait_timeout(interval) {
            if let Err(e) = self.flush() {
                error!("WAL flush failed: {}", e);
            }
        }
        if let Err(e) = self.flush() {
            error!("final WAL flush failed: {}", e);
        }
        debug!("WAL writer stopped");
    }

    /// Segment files in `dir`, ordered by sequence number.
    pub fn segment_paths(dir: &Path) -> StorageResult<Vec<(u64, PathBuf)>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut segments = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Some(seq) = entry.file_name().to_str().and_then(parse_segment_name) {
                segments.push((seq, entry.path()));
            }
        }
        segments.sort();
        Ok(segments)
    }

    /// Decode the records of one segment. A torn or corrupt tail ends the
    /// segment; everything before it is returned.
    pub fn read_segment(path: &Path) -> StorageResult<Vec<WalRecord>> {
        let data = fs::read(path)?;
        let mut cursor = ByteCursor::new(&data);
        let mut records = Vec::new();
        while codec::remaining(&cursor) > 0 {
            let offset = cursor.position();
            match WalRecord::decode(&mut cursor) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(
                        "ignoring {} bytes at offset {} of {}: {}",
                        data.len() as u64 - offset,
                        offset,
                        path.display(),
                        e
                    );
                    break;
                }
            }
        }
        Ok(records)
    }

    /// Records of every segment in `dir`, in segment order.
    pub fn read_all(dir: &Path) -> StorageResult<Vec<WalRecord>> {
        let mut records = Vec::new();
        for (_, path) in Self::segment_paths(dir)? {
            records.extend(Self::read_segment(&path)?);
        }
        Ok(records)
    }
}
