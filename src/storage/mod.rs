//! Key-value storage abstraction
//!
//! The twin core never owns durable storage. Collaborators that want to
//! persist something (currently the monitor ledger) go through
//! [`KeyValueStore`] so backends can be swapped without touching the core:
//! - `MemoryStore`: in-process map for tests and throwaway runs
//! - `SledStore`: embedded sled database on disk
//!
//! Values are opaque bytes; callers choose the encoding (JSON everywhere in
//! this crate). Best effort only: no durability guarantee beyond what the
//! backend offers.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use tracing::info;

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("store lock poisoned")]
    Poisoned,
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Pluggable key-value backend.
///
/// Implementations must be thread-safe (Send + Sync) for shared access
/// across async tasks.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Insert or overwrite. Last write wins.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Remove a key. Returns whether it existed.
    fn remove(&self, key: &str) -> Result<bool, StorageError>;

    /// Backend name for logging
    fn backend_name(&self) -> &'static str;
}

// ============================================================================
// In-memory backend
// ============================================================================

/// Not durable: data is lost when dropped.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let entries = self.entries.read().map_err(|_| StorageError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mut entries = self.entries.write().map_err(|_| StorageError::Poisoned)?;
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StorageError> {
        let mut entries = self.entries.write().map_err(|_| StorageError::Poisoned)?;
        Ok(entries.remove(key).is_some())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

// ============================================================================
// Sled backend
// ============================================================================

pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Open or create a sled database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path_ref = path.as_ref();
        let db = sled::open(path_ref)?;
        info!(path = %path_ref.display(), "Sled store opened");
        Ok(Self { db })
    }

    /// Database that is removed when dropped.
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

impl KeyValueStore for SledStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.db.insert(key.as_bytes(), value)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.db.remove(key.as_bytes())?.is_some())
    }

    fn backend_name(&self) -> &'static str {
        "sled"
    }
}
