//! Placeholder-to-entity mapping storage
//!
//! [`MappingTable`] is the in-memory form of a mapping store. Backends
//! implementing [`MappingBackend`] own persistence and the lock scope around a
//! load-modify-save cycle, so the anonymizer never touches files directly.

use crate::config::{MappingBackendKind, MappingConfig};
use crate::error::{Error, Result};
use crate::file_store::JsonFileStore;
use crate::placeholder::PlaceholderToken;
use crate::sqlite::SqliteMappingStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::{debug, info};

/// Persisted form of one entry, keyed by its token in the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    #[serde(rename = "entityType")]
    pub entity_type: String,
    pub value: String,
}

/// Borrowed view of one mapping entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingEntry<'a> {
    pub token: &'a str,
    pub entity_type: &'a str,
    pub original_value: &'a str,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MappingTable {
    entries: BTreeMap<String, EntityRecord>,
}

impl MappingTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_token(&self, token: &str) -> bool {
        self.entries.contains_key(token)
    }

    pub fn entries(&self) -> impl Iterator<Item = MappingEntry<'_>> {
        self.entries.iter().map(|(token, record)| MappingEntry {
            token,
            entity_type: &record.entity_type,
            original_value: &record.value,
        })
    }

    pub fn find_by_token(&self, token: &str) -> Option<MappingEntry<'_>> {
        self.entries.get_key_value(token).map(|(token, record)| MappingEntry {
            token,
            entity_type: &record.entity_type,
            original_value: &record.value,
        })
    }

    /// If an edited store holds the same value twice, the lowest counter wins.
    pub fn find_by_value(&self, entity_type: &str, original_value: &str) -> Option<MappingEntry<'_>> {
        self.entries()
            .filter(|entry| entry.entity_type == entity_type && entry.original_value == original_value)
            .min_by_key(|entry| PlaceholderToken::parse(entry.token).map(|t| t.index()).unwrap_or(u64::MAX))
    }

    /// Next unused token for `entity_type`, computed from the entries currently
    /// present rather than from any remembered counter.
    pub fn next_token(&self, entity_type: &str) -> Result<PlaceholderToken> {
        let highest = self
            .entries
            .keys()
            .filter_map(|key| PlaceholderToken::parse(key))
            .filter(|token| token.entity_type() == entity_type)
            .map(|token| token.index())
            .max()
            .unwrap_or(0);

        let index = highest.checked_add(1).ok_or_else(|| Error::CounterExhausted {
            entity_type: entity_type.to_string(),
        })?;
        Ok(PlaceholderToken::new(entity_type, index))
    }

    /// Adds an entry. An existing token is never overwritten; returns whether
    /// the entry was inserted.
    pub fn insert(&mut self, token: &PlaceholderToken, original_value: &str) -> bool {
        let key = token.to_string();
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(
            key,
            EntityRecord {
                entity_type: token.entity_type().to_string(),
                value: original_value.to_string(),
            },
        );
        true
    }

    /// Checks that every key is a canonical token whose type matches the
    /// entry's `entityType`.
    pub fn validate(&self) -> std::result::Result<(), String> {
        for (key, record) in &self.entries {
            let token = PlaceholderToken::parse(key)
                .ok_or_else(|| format!("'{}' is not a placeholder token", key))?;
            if token.entity_type() != record.entity_type {
                return Err(format!(
                    "token '{}' is recorded with entity type '{}'",
                    key, record.entity_type
                ));
            }
        }
        Ok(())
    }

    /// Entries present here but not in `base`, in token order.
    pub fn added_since<'a>(&'a self, base: &'a MappingTable) -> impl Iterator<Item = MappingEntry<'a>> {
        self.entries().filter(move |entry| !base.contains_token(entry.token))
    }

    pub fn statistics(&self) -> MappingStatistics {
        let mut mappings_by_type = BTreeMap::new();
        for record in self.entries.values() {
            *mappings_by_type.entry(record.entity_type.clone()).or_insert(0) += 1;
        }
        MappingStatistics {
            total_mappings: self.entries.len(),
            mappings_by_type,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingStatistics {
    pub total_mappings: usize,
    pub mappings_by_type: BTreeMap<String, usize>,
}

/// Closure applied to a freshly loaded table while the backend holds its
/// exclusive lock.
pub type UpdateFn<'a> = dyn FnMut(&mut MappingTable) -> Result<()> + 'a;

pub trait MappingBackend: Send + Sync {
    /// Snapshot of the store under a shared lock. An absent store is empty.
    fn load(&self) -> Result<MappingTable>;

    /// Loads the store under an exclusive lock, applies `apply` and persists
    /// the result in one write if entries were added. If `apply` fails nothing
    /// is written.
    fn update(&self, apply: &mut UpdateFn<'_>) -> Result<()>;

    /// Human-readable location used in log lines.
    fn describe(&self) -> String;

    fn statistics(&self) -> Result<MappingStatistics> {
        Ok(self.load()?.statistics())
    }
}

/// Opens the backend selected in the configuration.
pub fn open_backend(config: &MappingConfig) -> Result<Box<dyn MappingBackend>> {
    let backend: Box<dyn MappingBackend> = match config.backend {
        MappingBackendKind::Json => Box::new(JsonFileStore::new(&config.path)),
        MappingBackendKind::Sqlite => Box::new(SqliteMappingStore::new(&config.path)?),
    };
    info!("Using mapping store at {}", backend.describe());
    Ok(backend)
}

/// Process-local store, for tests and in-process callers that do not need
/// durability.
#[derive(Debug, Default)]
pub struct MemoryStore {
    table: Mutex<MappingTable>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(table: MappingTable) -> Self {
        Self {
            table: Mutex::new(table),
        }
    }
}

impl MappingBackend for MemoryStore {
    fn load(&self) -> Result<MappingTable> {
        let table = self
            .table
            .lock()
            .map_err(|_| Error::Invocation("in-memory mapping store lock poisoned".to_string()))?;
        Ok(table.clone())
    }

    fn update(&self, apply: &mut UpdateFn<'_>) -> Result<()> {
        let mut table = self
            .table
            .lock()
            .map_err(|_| Error::Invocation("in-memory mapping store lock poisoned".to_string()))?;
        let mut staged = table.clone();
        apply(&mut staged)?;
        if staged.len() != table.len() {
            debug!("Committed {} new in-memory mappings", staged.len() - table.len());
            *table = staged;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "<memory>".to_string()
    }
}
