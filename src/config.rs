//! Database configuration.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::file::FileManager;
use crate::storage::page::{DEFAULT_MAX_PAGE_SIZE, MAX_PAGE_CEILING, PAGE_HEADER_SIZE};
use crate::storage::wal::WalConfig;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Directory holding `data/<database>/...`.
    pub data_root: PathBuf,
    pub database: String,
    /// Capacity of every page created from now on.
    pub max_page_size: u64,
    /// Pause between background WAL flushes.
    pub wal_flush_interval: Duration,
    /// Pause between background checkpoints.
    pub checkpoint_interval: Duration,
    pub wal_segment_size: u64,
    pub sync_on_flush: bool,
    pub worker_threads: usize,
    /// Take a final checkpoint when the database is closed.
    pub checkpoint_on_close: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let threads = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        DatabaseConfig {
            data_root: PathBuf::from("."),
            database: "default".to_string(),
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            wal_flush_interval: Duration::from_millis(50),
            checkpoint_interval: Duration::from_secs(30),
            wal_segment_size: WalConfig::default().segment_size,
            sync_on_flush: true,
            // the WAL writer and the checkpoint loop each hold a thread
            worker_threads: threads.max(2),
            checkpoint_on_close: true,
        }
    }
}

impl DatabaseConfig {
    pub fn new(data_root: impl Into<PathBuf>, database: impl Into<String>) -> Self {
        DatabaseConfig {
            data_root: data_root.into(),
            database: database.into(),
            ..Default::default()
        }
    }

    pub fn max_page_size(mut self, size: u64) -> Self {
        self.max_page_size = size;
        self
    }

    pub fn wal_flush_interval(mut self, interval: Duration) -> Self {
        self.wal_flush_interval = interval;
        self
    }

    pub fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn wal_segment_size(mut self, size: u64) -> Self {
        self.wal_segment_size = size;
        self
    }

    pub fn sync_on_flush(mut self, sync: bool) -> Self {
        self.sync_on_flush = sync;
        self
    }

    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn checkpoint_on_close(mut self, enabled: bool) -> Self {
        self.checkpoint_on_close = enabled;
        self
    }

    /// Reject settings the storage layer cannot work with.
    pub fn validate(&self) -> StorageResult<()> {
        if self.max_page_size <= PAGE_HEADER_SIZE || self.max_page_size > MAX_PAGE_CEILING {
            return Err(StorageError::Other(format!(
                "max_page_size must be above {} and at most {} bytes, got {}",
                PAGE_HEADER_SIZE, MAX_PAGE_CEILING, self.max_page_size
            )));
        }
        if self.worker_threads < 2 {
            return Err(StorageError::Other(
                "at least two worker threads are needed for the background jobs".into(),
            ));
        }
        if self.wal_segment_size == 0 {
            return Err(StorageError::Other("wal_segment_size must not be zero".into()));
        }
        Ok(())
    }

    pub fn wal_config(&self, files: &FileManager) -> WalConfig {
        WalConfig {
            wal_dir: files.wal_dir(),
            segment_size: self.wal_segment_size,
            sync_on_flush: self.sync_on_flush,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DatabaseConfig::default();
        assert_eq!(config.max_page_size, DEFAULT_MAX_PAGE_SIZE);
        assert!(config.worker_threads >= 2);
        assert!(config.checkpoint_on_close);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(DatabaseConfig::default().max_page_size(16).validate().is_err());
        assert!(DatabaseConfig::default()
            .max_page_size(MAX_PAGE_CEILING + 1)
            .validate()
            .is_err());
        assert!(DatabaseConfig::default().worker_threads(1).validate().is_err());
        assert!(DatabaseConfig::default().wal_segment_size(0).validate().is_err());
    }

    #[test]
    fn test_wal_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = DatabaseConfig::new(dir.path(), "shop")
            .wal_segment_size(1024)
            .sync_on_flush(false);
        let files = FileManager::open(&config.data_root, &config.database).unwrap();
        let wal = config.wal_config(&files);
        assert_eq!(wal.wal_dir, files.wal_dir());
        assert_eq!(wal.segment_size, 1024);
        assert!(!wal.sync_on_flush);
    }
}
