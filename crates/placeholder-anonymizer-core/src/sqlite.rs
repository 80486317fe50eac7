//! Entity mapping storage using SQLite
//!
//! Alternative backend for stores shared by several users or large documents.
//! Writers serialise on an `IMMEDIATE` transaction, which plays the role of the
//! exclusive file lock used by the JSON backend.

use crate::error::{Error, Result};
use crate::mapping::{MappingBackend, MappingStatistics, MappingTable, UpdateFn};
use rusqlite::{params, Connection, ErrorCode, TransactionBehavior};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SqliteMappingStore {
    conn: Mutex<Option<Connection>>,
    path: PathBuf,
}

impl SqliteMappingStore {
    /// Opens an existing database right away. A missing file is only created
    /// by the first [`MappingBackend::update`], so read-only calls leave the
    /// filesystem untouched.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(None),
            path: path.as_ref().to_path_buf(),
        };

        if store.exists() {
            let conn = store.open()?;
            *store.lock() = Some(conn);
        } else {
            debug!("Mapping database {:?} will be created on first write", store.path);
        }
        Ok(store)
    }

    fn is_in_memory(&self) -> bool {
        self.path == Path::new(":memory:")
    }

    fn exists(&self) -> bool {
        self.is_in_memory() || self.path.exists()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Connection for reads; `None` while the database file does not exist.
    fn read_connection(&self) -> Result<MutexGuard<'_, Option<Connection>>> {
        let mut guard = self.lock();
        if guard.is_none() && self.exists() {
            *guard = Some(self.open()?);
        }
        Ok(guard)
    }

    fn open(&self) -> Result<Connection> {
        let conn = if self.is_in_memory() {
            Connection::open_in_memory()
        } else {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|source| Error::StoreWrite {
                    path: self.path.clone(),
                    source,
                })?;
            }
            Connection::open(&self.path)
        }
        .map_err(|e| db_error(&self.path, e))?;

        conn.busy_timeout(BUSY_TIMEOUT).map_err(|e| db_error(&self.path, e))?;
        self.initialize_schema(&conn)?;

        info!("Initialized mapping database at {:?}", self.path);
        Ok(conn)
    }

    fn initialize_schema(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS entity_mappings (
                token TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                original_value TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_entity_lookup
             ON entity_mappings(entity_type, original_value);",
        )
        .map_err(|e| db_error(&self.path, e))?;

        debug!("Database schema initialized");
        Ok(())
    }

    fn read_all(&self, conn: &Connection) -> Result<MappingTable> {
        let mut stmt = conn
            .prepare("SELECT token, entity_type, original_value FROM entity_mappings")
            .map_err(|e| db_error(&self.path, e))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(|e| db_error(&self.path, e))?;

        let mut document = serde_json::Map::new();
        for row in rows {
            let (token, entity_type, value) = row.map_err(|e| db_error(&self.path, e))?;
            document.insert(
                token,
                serde_json::json!({ "entityType": entity_type, "value": value }),
            );
        }

        let table: MappingTable =
            serde_json::from_value(serde_json::Value::Object(document)).map_err(|e| Error::StoreCorrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        table.validate().map_err(|reason| Error::StoreCorrupt {
            path: self.path.clone(),
            reason,
        })?;
        Ok(table)
    }
}

impl MappingBackend for SqliteMappingStore {
    fn load(&self) -> Result<MappingTable> {
        let guard = self.read_connection()?;
        let Some(conn) = guard.as_ref() else {
            debug!("Mapping database {:?} does not exist yet", self.path);
            return Ok(MappingTable::default());
        };
        let table = self.read_all(conn)?;
        debug!("Loaded {} mappings from {:?}", table.len(), self.path);
        Ok(table)
    }

    fn update(&self, apply: &mut UpdateFn<'_>) -> Result<()> {
        let mut guard = self.lock();
        let conn = match guard.take() {
            Some(conn) => guard.insert(conn),
            None => guard.insert(self.open()?),
        };
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| db_error(&self.path, e))?;

        let base = self.read_all(&tx)?;
        let mut table = base.clone();
        apply(&mut table)?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut inserted = 0;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO entity_mappings
                     (token, entity_type, original_value, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .map_err(|e| db_error(&self.path, e))?;

            for entry in table.added_since(&base) {
                stmt.execute(params![entry.token, entry.entity_type, entry.original_value, now])
                    .map_err(|e| db_error(&self.path, e))?;
                inserted += 1;
            }
        }

        tx.commit().map_err(|e| db_error(&self.path, e))?;
        if inserted > 0 {
            debug!("Stored batch of {} mappings", inserted);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }

    fn statistics(&self) -> Result<MappingStatistics> {
        let guard = self.read_connection()?;
        let Some(conn) = guard.as_ref() else {
            return Ok(MappingStatistics::default());
        };
        let total_mappings: i64 = conn
            .query_row("SELECT COUNT(*) FROM entity_mappings", [], |row| row.get(0))
            .map_err(|e| db_error(&self.path, e))?;

        let mut stmt = conn
            .prepare("SELECT entity_type, COUNT(*) FROM entity_mappings GROUP BY entity_type")
            .map_err(|e| db_error(&self.path, e))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(|e| db_error(&self.path, e))?;

        let mut mappings_by_type = BTreeMap::new();
        for row in rows {
            let (entity_type, count) = row.map_err(|e| db_error(&self.path, e))?;
            mappings_by_type.insert(entity_type, count as usize);
        }

        Ok(MappingStatistics {
            total_mappings: total_mappings as usize,
            mappings_by_type,
        })
    }
}

fn db_error(path: &Path, err: rusqlite::Error) -> Error {
    match err {
        rusqlite::Error::SqliteFailure(ref e, _)
            if matches!(e.code, ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt) =>
        {
            Error::StoreCorrupt {
                path: path.to_path_buf(),
                reason: err.to_string(),
            }
        }
        other => Error::Database(other),
    }
}
