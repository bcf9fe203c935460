//! Configuration store errors

use thiserror::Error;

/// Errors that can occur when reading or writing the configuration store
#[derive(Debug, Error)]
pub enum StoreError {
    /// No config with this name
    #[error("Config not found: {0}")]
    NotFound(String),

    /// The write was based on a stale version. The caller must re-read and
    /// recompute; the store never retries or merges.
    #[error("Dirty write on config {name}: expected version {expected}, store has {found}")]
    DirtyWrite {
        name: String,
        expected: u64,
        found: u64,
    },

    /// A config with this name already exists
    #[error("Config already exists: {0}")]
    AlreadyExists(String),

    /// YAML (de)serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error while loading a seed file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend unavailable (injected by the mock, or a remote store outage)
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_dirty_write(&self) -> bool {
        matches!(self, StoreError::DirtyWrite { .. })
    }
}
