//! JSON document mapping store
//!
//! The document is a single JSON object keyed by placeholder token. Writers
//! hold an exclusive `fd-lock` on a sidecar `<file>.lock` for the whole
//! load-modify-save cycle and replace the document through a temp file in the
//! same directory, so readers only ever see complete documents.

use crate::error::{Error, Result};
use crate::mapping::{MappingBackend, MappingTable, UpdateFn};
use fd_lock::RwLock;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| OsString::from("entity_mapping"));
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn directory(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    fn open_lock_file(&self) -> std::io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.lock_path())
    }

    fn lock_error(&self, source: std::io::Error) -> Error {
        Error::Lock {
            path: self.lock_path(),
            source,
        }
    }

    fn read_table(&self) -> Result<MappingTable> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Mapping store {} does not exist yet", self.path.display());
                return Ok(MappingTable::default());
            }
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                return Err(Error::StoreCorrupt {
                    path: self.path.clone(),
                    reason: "document is not valid UTF-8".to_string(),
                });
            }
            Err(source) => {
                return Err(Error::StoreRead {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        if contents.trim().is_empty() {
            debug!("Mapping store {} is empty", self.path.display());
            return Ok(MappingTable::default());
        }

        let table: MappingTable = serde_json::from_str(&contents).map_err(|e| Error::StoreCorrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        table.validate().map_err(|reason| Error::StoreCorrupt {
            path: self.path.clone(),
            reason,
        })?;

        debug!("Loaded {} mappings from {}", table.len(), self.path.display());
        Ok(table)
    }

    fn write_table(&self, table: &MappingTable) -> Result<()> {
        let write_error = |source: std::io::Error| Error::StoreWrite {
            path: self.path.clone(),
            source,
        };

        let mut contents = serde_json::to_vec_pretty(table).map_err(|e| write_error(e.into()))?;
        contents.push(b'\n');

        let mut temp = NamedTempFile::new_in(self.directory()).map_err(write_error)?;
        temp.write_all(&contents).map_err(write_error)?;
        temp.as_file().sync_all().map_err(write_error)?;
        temp.persist(&self.path).map_err(|e| write_error(e.error))?;

        info!("Saved {} mappings to {}", table.len(), self.path.display());
        Ok(())
    }
}

impl MappingBackend for JsonFileStore {
    fn load(&self) -> Result<MappingTable> {
        if !self.path.exists() {
            return Ok(MappingTable::default());
        }

        // Readers can do without the lock: the document is only ever replaced
        // whole, never rewritten in place.
        let lock_file = match self.open_lock_file() {
            Ok(file) => file,
            Err(e) => {
                warn!("Reading {} without a lock: {}", self.path.display(), e);
                return self.read_table();
            }
        };

        let lock = RwLock::new(lock_file);
        let _guard = lock.read().map_err(|e| self.lock_error(e))?;
        self.read_table()
    }

    fn update(&self, apply: &mut UpdateFn<'_>) -> Result<()> {
        std::fs::create_dir_all(self.directory()).map_err(|source| Error::StoreWrite {
            path: self.path.clone(),
            source,
        })?;

        let mut lock = RwLock::new(self.open_lock_file().map_err(|e| self.lock_error(e))?);
        let _guard = lock.write().map_err(|e| self.lock_error(e))?;
        debug!("Acquired exclusive lock on {}", self.lock_path().display());

        let mut table = self.read_table()?;
        let before = table.len();
        apply(&mut table)?;

        if table.len() == before {
            debug!("No new mappings, leaving {} untouched", self.path.display());
            return Ok(());
        }
        self.write_table(&table)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
