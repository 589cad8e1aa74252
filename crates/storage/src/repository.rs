use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::remote::{InMemoryRemote, RemoteDocumentStore};

/// Errors surfaced by storage adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Durable string-keyed blob store.
///
/// Keys are namespaced by record kind and identity (see `blobs`); values are
/// serialized JSON. There is no schema versioning.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the blob stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend cannot be read.
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Insert or overwrite the blob under `key`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the blob cannot be stored.
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Delete the blob under `key`. Missing keys are not an error.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend cannot be written.
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

#[derive(Default)]
struct MemoryState {
    entries: HashMap<String, String>,
    writes: usize,
    fail_writes: bool,
}

/// Simple in-memory key-value store for testing and prototyping.
#[derive(Clone, Default)]
pub struct InMemoryKeyValueStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryKeyValueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `set` calls so far.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.state.lock().map(|s| s.writes).unwrap_or_default()
    }

    /// Make subsequent `set` calls fail with `StorageError::Connection`.
    pub fn fail_writes(&self, fail: bool) {
        if let Ok(mut guard) = self.state.lock() {
            guard.fail_writes = fail;
        }
    }

    /// Synchronous peek used by tests and tooling.
    #[must_use]
    pub fn snapshot(&self, key: &str) -> Option<String> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.entries.get(key).cloned())
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let guard = self
            .state
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(guard.entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut guard = self
            .state
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        if guard.fail_writes {
            return Err(StorageError::Connection("writes disabled".into()));
        }
        guard.entries.insert(key.to_owned(), value.to_owned());
        guard.writes += 1;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut guard = self
            .state
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        guard.entries.remove(key);
        Ok(())
    }
}

/// Local and remote backends behind trait objects for easy swapping.
#[derive(Clone)]
pub struct Storage {
    pub local: Arc<dyn KeyValueStore>,
    pub remote: Arc<dyn RemoteDocumentStore>,
}

impl Storage {
    #[must_use]
    pub fn new(local: Arc<dyn KeyValueStore>, remote: Arc<dyn RemoteDocumentStore>) -> Self {
        Self { local, remote }
    }

    #[must_use]
    pub fn in_memory() -> Self {
        let local: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());
        let remote: Arc<dyn RemoteDocumentStore> = Arc::new(InMemoryRemote::new());
        Self { local, remote }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_remove_round_trip() {
        let store = InMemoryKeyValueStore::new();
        assert_eq!(store.get("progress:anonymous").await.unwrap(), None);

        store.set("progress:anonymous", "[]").await.unwrap();
        assert_eq!(
            store.get("progress:anonymous").await.unwrap().as_deref(),
            Some("[]")
        );
        assert_eq!(store.write_count(), 1);

        store.remove("progress:anonymous").await.unwrap();
        assert_eq!(store.get("progress:anonymous").await.unwrap(), None);
    }

    #[tokio::test]
    async fn failing_writes_leave_state_untouched() {
        let store = InMemoryKeyValueStore::new();
        store.fail_writes(true);
        let err = store.set("k", "v").await.unwrap_err();
        assert!(matches!(err, StorageError::Connection(_)));
        assert_eq!(store.snapshot("k"), None);
        assert_eq!(store.write_count(), 0);
    }
}
