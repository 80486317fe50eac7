//! Error kinds surfaced by an anonymize or deanonymize call

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// A fatal failure of one call. No text is replaced and the mapping store is
/// left exactly as it was loaded.
#[derive(Debug, Error)]
pub enum Error {
    #[error("entity detection failed: {0:#}")]
    Detection(anyhow::Error),

    #[error("mapping store {path} is corrupt: {reason}")]
    StoreCorrupt { path: PathBuf, reason: String },

    /// The store already holds the largest representable counter for a type.
    #[error("placeholder counter exhausted for {entity_type}")]
    CounterExhausted { entity_type: String },

    #[error("failed to read mapping store {path}: {source}")]
    StoreRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write mapping store {path}: {source}")]
    StoreWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to lock mapping store {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("mapping database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invocation failed: {0}")]
    Invocation(String),
}

impl Error {
    /// Stable name of the failure kind, shown to the user next to the message.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Detection(_) => "DetectionFailure",
            Error::StoreCorrupt { .. } | Error::CounterExhausted { .. } => "StoreCorrupt",
            Error::StoreRead { .. } | Error::Lock { .. } => "StoreUnavailable",
            Error::StoreWrite { .. } => "StoreWriteFailure",
            Error::Database(_) => "StoreUnavailable",
            Error::Config(_) => "ConfigurationError",
            Error::Invocation(_) => "InvocationFailure",
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Detection(_) => 3,
            Error::StoreCorrupt { .. } | Error::CounterExhausted { .. } => 4,
            Error::StoreRead { .. } | Error::Lock { .. } | Error::Database(_) => 5,
            Error::StoreWrite { .. } => 6,
            Error::Config(_) => 7,
            Error::Invocation(_) => 8,
        }
    }
}
