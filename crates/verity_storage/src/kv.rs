//! The key-value interface every backing store implements.
//!
//! Keys are `/`-separated relative paths such as `runs/<id>/meta.json`.

use crate::dir::DirStore;
use crate::error::StoreError;
use crate::memory::MemoryStore;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Key-value store
pub trait KvStore: Send + Sync + std::fmt::Debug {
    /// Read the value under `key`
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the key is absent
    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Write `value` under `key`, replacing any existing value
    ///
    /// # Errors
    ///
    /// Returns error if the key is invalid or the write fails
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Remove `key`; returns whether it existed
    ///
    /// # Errors
    ///
    /// Returns error if the key is invalid or the removal fails
    fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// All keys starting with `prefix`, sorted
    ///
    /// # Errors
    ///
    /// Returns error if the backing store cannot be listed
    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    fn contains(&self, key: &str) -> Result<bool, StoreError> {
        match self.get(key) {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }
}

/// Reject keys that are empty, absolute, or contain `..` or empty segments
///
/// # Errors
///
/// Returns [`StoreError::InvalidKey`] naming the problem
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let invalid = |reason| StoreError::InvalidKey {
        key: key.to_string(),
        reason,
    };
    if key.is_empty() {
        return Err(invalid("empty key"));
    }
    if key.starts_with('/') {
        return Err(invalid("absolute key"));
    }
    if key.contains('\\') || key.contains('\0') {
        return Err(invalid("reserved character"));
    }
    for segment in key.split('/') {
        match segment {
            "" => return Err(invalid("empty segment")),
            "." | ".." => return Err(invalid("relative segment")),
            _ => {}
        }
    }
    Ok(())
}

/// Backing store selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Dir,
    Memory,
}

/// Store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Root directory for the `dir` backend
    pub root: PathBuf,
    /// Maximum value size in bytes (0 = unlimited)
    pub max_value_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Dir,
            root: PathBuf::from(".verity"),
            max_value_size: 100 * 1024 * 1024, // 100 MB
        }
    }
}

/// Open the store described by `config`
///
/// # Errors
///
/// Returns error if the root directory cannot be created
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn KvStore>, StoreError> {
    let store: Arc<dyn KvStore> = match config.backend {
        StoreBackend::Memory => {
            Arc::new(MemoryStore::new().with_max_value_size(config.max_value_size))
        }
        StoreBackend::Dir => Arc::new(
            DirStore::open(&config.root)?.with_max_value_size(config.max_value_size),
        ),
    };
    tracing::debug!(backend = ?config.backend, root = %config.root.display(), "store opened");
    Ok(store)
}

pub(crate) fn check_size(key: &str, size: usize, limit: usize) -> Result<(), StoreError> {
    if limit > 0 && size > limit {
        return Err(StoreError::ValueTooLarge {
            key: key.to_string(),
            size,
            limit,
        });
    }
    Ok(())
}
