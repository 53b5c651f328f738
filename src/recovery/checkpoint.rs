//! Checkpoint management for recovery.
//!
//! A checkpoint makes everything journaled so far durable in the page and
//! meta files, records the covered LSN in `checkpoint.meta` and drops the WAL
//! segments it no longer needs.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, error, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::file::FileManager;
use crate::storage::wal::{WalManager, LSN};
use crate::worker::ShutdownToken;

/// Whatever owns the dirty pages and catalog entries a checkpoint writes out.
pub trait CheckpointTarget: Send + Sync {
    /// Persist all dirty state. Returns the number of files written.
    fn flush_storage(&self) -> StorageResult<usize>;
}

/// Contents of `checkpoint.meta`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Every record up to and including this LSN is reflected on disk.
    pub lsn: LSN,
    pub created_at_micros: u64,
}

impl CheckpointMeta {
    /// The last completed checkpoint, if any.
    pub fn read(files: &FileManager) -> StorageResult<Option<Self>> {
        match files.read_blob_if_exists(&files.checkpoint_path())? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    fn write(&self, files: &FileManager) -> StorageResult<()> {
        let data = bincode::serialize(self)?;
        files.write_blob(&files.checkpoint_path(), &data)
    }
}

/// Internal checkpoint state.
#[derive(Debug)]
struct CheckpointState {
    last_checkpoint_lsn: LSN,
    checkpoint_in_progress: bool,
}

/// Checkpoint manager handles creating and managing checkpoints.
pub struct CheckpointManager {
    wal_manager: Arc<WalManager>,
    target: Arc<dyn CheckpointTarget>,
    files: Arc<FileManager>,
    state: Mutex<CheckpointState>,
}

impl CheckpointManager {
    pub fn new(
        wal_manager: Arc<WalManager>,
        target: Arc<dyn CheckpointTarget>,
        files: Arc<FileManager>,
    ) -> StorageResult<Self> {
        let last = CheckpointMeta::read(&files)?.map(|m| m.lsn).unwrap_or_default();
        Ok(CheckpointManager {
            wal_manager,
            target,
            files,
            state: Mutex::new(CheckpointState {
                last_checkpoint_lsn: last,
                checkpoint_in_progress: false,
            }),
        })
    }

    pub fn last_checkpoint_lsn(&self) -> LSN {
        self.state.lock().last_checkpoint_lsn
    }

    /// Flush the WAL, flush the target, record the covered LSN and purge the
    /// segments it makes redundant. Overlapping runs are refused.
    pub fn checkpoint(&self) -> StorageResult<LSN> {
        {
            let mut state = self.state.lock();
            if state.checkpoint_in_progress {
                return Err(StorageError::Other("checkpoint already in progress".into()));
            }
            state.checkpoint_in_progress = true;
        }

        let result = self.run_checkpoint();

        let mut state = self.state.lock();
        state.checkpoint_in_progress = false;
        if let Ok(lsn) = result {
            state.last_checkpoint_lsn = lsn;
        }
        result
    }

    fn run_checkpoint(&self) -> StorageResult<LSN> {
        // Records pushed after this flush may already be applied to the pages
        // written below; replaying them later is harmless.
        let lsn = self.wal_manager.flush()?;
        let written = self.target.flush_storage()?;

        let meta = CheckpointMeta {
            lsn,
            created_at_micros: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_micros() as u64)
                .unwrap_or_default(),
        };
        meta.write(&self.files)?;
        let purged = self.wal_manager.purge_through(lsn)?;

        if written > 0 || purged > 0 {
            info!(
                "checkpoint at {}: {} files written, {} WAL segments purged",
                lsn, written, purged
            );
        } else {
            debug!("checkpoint at {}: nothing to write", lsn);
        }
        Ok(lsn)
    }

    /// Checkpoint every `interval` until `shutdown` is cancelled.
    pub fn run(&self, shutdown: &ShutdownToken, interval: Duration) {
        while !shutdown.wait_timeout(interval) {
            if let Err(e) = self.checkpoint() {
                error!("checkpoint failed: {}", e);
            }
        }
        debug!("checkpoint loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::wal::WalConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use uuid::Uuid;

    #[derive(Default)]
    struct CountingTarget {
        flushes: AtomicUsize,
    }

    impl CheckpointTarget for CountingTarget {
        fn flush_storage(&self) -> StorageResult<usize> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        }
    }

    struct FailingTarget;

    impl CheckpointTarget for FailingTarget {
        fn flush_storage(&self) -> StorageResult<usize> {
            Err(StorageError::Other("disk on fire".into()))
        }
    }

    fn create_test_setup(
        target: Arc<dyn CheckpointTarget>,
        segment_size: u64,
    ) -> (CheckpointManager, Arc<WalManager>, Arc<FileManager>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let files = Arc::new(FileManager::open(temp_dir.path(), "db").unwrap());
        let config = WalConfig {
            wal_dir: files.wal_dir(),
            segment_size,
            sync_on_flush: false,
        };
        let (wal, _) = WalManager::open(config).unwrap();
        let wal = Arc::new(wal);
        let manager = CheckpointManager::new(Arc::clone(&wal), target, Arc::clone(&files)).unwrap();
        (manager, wal, files, temp_dir)
    }

    #[test]
    fn test_checkpoint_manager_creation() {
        let (manager, _, files, _dir) = create_test_setup(Arc::new(CountingTarget::default()), 1 << 20);
        assert_eq!(manager.last_checkpoint_lsn(), LSN::new());
        assert!(CheckpointMeta::read(&files).unwrap().is_none());
    }

    #[test]
    fn test_checkpoint_flushes_wal_then_target() {
        let target = Arc::new(CountingTarget::default());
        let (manager, wal, files, _dir) = create_test_setup(target.clone(), 1 << 20);
        let table = Uuid::new_v4();
        wal.push_insert(table, vec![1, 2, 3]);
        wal.push_delete(table, 1);

        assert_eq!(manager.checkpoint().unwrap(), LSN(2));
        assert_eq!(wal.flushed_lsn(), LSN(2));
        assert_eq!(target.flushes.load(Ordering::SeqCst), 1);
        assert_eq!(manager.last_checkpoint_lsn(), LSN(2));
        assert_eq!(CheckpointMeta::read(&files).unwrap().unwrap().lsn, LSN(2));

        // a new manager picks the LSN up from disk
        let reopened = CheckpointManager::new(wal, target, files).unwrap();
        assert_eq!(reopened.last_checkpoint_lsn(), LSN(2));
    }

    #[test]
    fn test_checkpoint_purges_covered_segments() {
        let (manager, wal, _files, _dir) = create_test_setup(Arc::new(CountingTarget::default()), 32);
        let table = Uuid::new_v4();
        for _ in 0..3 {
            wal.push_insert(table, vec![0; 32]);
            wal.flush().unwrap();
        }
        assert_eq!(wal.segment_count(), 3);

        manager.checkpoint().unwrap();
        assert_eq!(wal.segment_count(), 1);
    }

    #[test]
    fn test_failed_checkpoint_keeps_previous_lsn() {
        let (manager, wal, files, _dir) = create_test_setup(Arc::new(FailingTarget), 1 << 20);
        wal.push_drop_table(Uuid::new_v4());

        assert!(manager.checkpoint().is_err());
        assert_eq!(manager.last_checkpoint_lsn(), LSN(0));
        assert!(CheckpointMeta::read(&files).unwrap().is_none());

        // the in-progress flag was reset
        assert!(manager.checkpoint().is_err());
    }

    #[test]
    fn test_checkpoint_in_progress_error() {
        let (manager, _, _, _dir) = create_test_setup(Arc::new(CountingTarget::default()), 1 << 20);
        manager.state.lock().checkpoint_in_progress = true;
        assert!(matches!(manager.checkpoint(), Err(StorageError::Other(_))));
    }

    #[test]
    fn test_background_loop_stops_on_cancel() {
        let target = Arc::new(CountingTarget::default());
        let (manager, _, _, _dir) = create_test_setup(target.clone(), 1 << 20);
        let manager = Arc::new(manager);
        let shutdown = ShutdownToken::new();

        let handle = {
            let manager = Arc::clone(&manager);
            let shutdown = shutdown.clone();
            std::thread::spawn(move || manager.run(&shutdown, Duration::from_millis(5)))
        };
        std::thread::sleep(Duration::from_millis(40));
        shutdown.cancel();
        handle.join().unwrap();
        assert!(target.flushes.load(Ordering::SeqCst) >= 1);
    }
}
