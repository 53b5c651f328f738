//! Directory layout and raw blob I/O.
//!
//! ```text
//! <root>/data/<db>/<schema>/schema.meta
//! <root>/data/<db>/<schema>/<table>/table.meta
//! <root>/data/<db>/<schema>/<table>/data/<page-uuid>
//! <root>/data/<db>/wal/wal_<seq>.log
//! <root>/data/<db>/checkpoint.meta
//! ```

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{Page, PageId};
use log::debug;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const SCHEMA_META_FILE: &str = "schema.meta";
pub const TABLE_META_FILE: &str = "table.meta";
pub const CHECKPOINT_META_FILE: &str = "checkpoint.meta";
pub const PAGE_DIR: &str = "data";
pub const WAL_DIR: &str = "wal";

const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone)]
pub struct FileManager {
    root: PathBuf,
    database: String,
}

impl FileManager {
    /// Open (creating if needed) the directory of `database` under `root`.
    pub fn open(root: &Path, database: &str) -> StorageResult<Self> {
        let manager = Self {
            root: root.to_path_buf(),
            database: database.to_string(),
        };
        fs::create_dir_all(manager.database_dir())?;
        Ok(manager)
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn database_dir(&self) -> PathBuf {
        self.root.join("data").join(&self.database)
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.database_dir().join(WAL_DIR)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.database_dir().join(CHECKPOINT_META_FILE)
    }

    pub fn schema_dir(&self, schema: &str) -> PathBuf {
        self.database_dir().join(schema)
    }

    pub fn schema_meta_path(&self, schema: &str) -> PathBuf {
        self.schema_dir(schema).join(SCHEMA_META_FILE)
    }

    pub fn table_dir(&self, schema: &str, table: &str) -> PathBuf {
        self.schema_dir(schema).join(table)
    }

    pub fn table_meta_path(&self, schema: &str, table: &str) -> PathBuf {
        self.table_dir(schema, table).join(TABLE_META_FILE)
    }

    pub fn page_dir(&self, schema: &str, table: &str) -> PathBuf {
        self.table_dir(schema, table).join(PAGE_DIR)
    }

    pub fn page_path(&self, schema: &str, table: &str, page_id: PageId) -> PathBuf {
        self.page_dir(schema, table).join(page_id.to_string())
    }

    /// Replace `path` with `data`. The bytes go to a temp file that is synced
    /// and then renamed over the target, so a torn write never clobbers the
    /// previous version.
    pub fn write_blob(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(TEMP_SUFFIX);
        let tmp_path = PathBuf::from(tmp_name);

        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        if let Some(parent) = path.parent() {
            self.sync_dir(parent)?;
        }
        debug!("wrote {} bytes to {}", data.len(), path.display());
        Ok(())
    }

    pub fn read_blob(&self, path: &Path) -> StorageResult<Vec<u8>> {
        Ok(fs::read(path)?)
    }

    pub fn read_blob_if_exists(&self, path: &Path) -> StorageResult<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of the sub-directories of `path`, sorted. A missing directory is empty.
    pub fn list_dirs(&self, path: &Path) -> StorageResult<Vec<String>> {
        self.list_entries(path, true)
    }

    /// Names of the regular files in `path`, sorted, skipping leftover temp files.
    pub fn list_files(&self, path: &Path) -> StorageResult<Vec<String>> {
        Ok(self
            .list_entries(path, false)?
            .into_iter()
            .filter(|name| !name.ends_with(TEMP_SUFFIX))
            .collect())
    }

    fn list_entries(&self, path: &Path, dirs: bool) -> StorageResult<Vec<String>> {
        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() != dirs {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Recursively remove `path`; a missing directory is not an error.
    pub fn remove_dir(&self, path: &Path) -> StorageResult<()> {
        match fs::remove_dir_all(path) {
            Ok(()) => {
                debug!("removed {}", path.display());
                match path.parent() {
                    Some(parent) => self.sync_dir(parent),
                    None => Ok(()),
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Move a directory; a missing source is not an error.
    pub fn rename_dir(&self, from: &Path, to: &Path) -> StorageResult<()> {
        if !from.exists() {
            return Ok(());
        }
        if to.exists() {
            return Err(StorageError::Io(std::io::Error::new(
                ErrorKind::AlreadyExists,
                format!("cannot move {} onto existing {}", from.display(), to.display()),
            )));
        }
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(from, to)?;
        for dir in [from.parent(), to.parent()].into_iter().flatten() {
            self.sync_dir(dir)?;
        }
        Ok(())
    }

    /// Create an empty page for a table, making sure its page directory exists.
    pub fn materialize_page(
        &self,
        schema: &str,
        table: &str,
        table_id: Uuid,
        capacity: u64,
    ) -> StorageResult<Page> {
        fs::create_dir_all(self.page_dir(schema, table))?;
        Ok(Page::new(Uuid::new_v4(), table_id, capacity))
    }

    pub fn write_page(&self, schema: &str, table: &str, page_id: PageId, data: &[u8]) -> StorageResult<()> {
        self.write_blob(&self.page_path(schema, table, page_id), data)
    }

    /// Raw images of every page stored for a table.
    pub fn read_pages(&self, schema: &str, table: &str) -> StorageResult<Vec<(PageId, Vec<u8>)>> {
        let dir = self.page_dir(schema, table);
        let mut pages = Vec::new();
        for name in self.list_files(&dir)? {
            let page_id = Uuid::parse_str(&name).map_err(|e| {
                StorageError::CorruptPage(format!("unexpected file {:?} in {}: {}", name, dir.display(), e))
            })?;
            pages.push((page_id, self.read_blob(&dir.join(&name))?));
        }
        Ok(pages)
    }

    /// Flush directory metadata so renames and creates inside `path` survive a crash.
    fn sync_dir(&self, path: &Path) -> StorageResult<()> {
        File::open(path)?.sync_all()?;
        Ok(())
    }
}
