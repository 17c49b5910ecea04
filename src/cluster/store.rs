//! Narrow persistence hook for membership records.
//!
//! The real durable store (WAL, snapshots, key-value tree) is an external
//! collaborator; the cluster only needs flat create/set/get/delete over
//! hierarchical keys to persist member attributes and removal tombstones.

use std::collections::BTreeMap;
use std::sync::Mutex;
use thiserror::Error;

/// Version of the membership key schema, served on `GET /version`.
pub const STORE_VERSION: u32 = 2;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key {0:?} already exists")]
    KeyExists(String),

    #[error("key {0:?} not found")]
    KeyNotFound(String),
}

/// The slice of the durable store the cluster manipulates.
pub trait Store: Send + Sync {
    /// Creates `key` with `value`; fails if the key already exists.
    fn create(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Creates or replaces `key` with `value`.
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Returns all `(key, value)` pairs under `prefix`, sorted by key.
    fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;

    /// Deletes `key` and everything below it.
    fn delete_prefix(&self, key: &str) -> Result<(), StoreError>;
}

/// In-memory [`Store`] backed by a sorted map.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<BTreeMap<String, String>>,
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Store for MemStore {
    fn create(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if inner.contains_key(key) {
            return Err(StoreError::KeyExists(key.to_string()));
        }
        inner.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn delete_prefix(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let doomed: Vec<String> = inner
            .range(key.to_string()..)
            .take_while(|(k, _)| k.starts_with(key))
            .map(|(k, _)| k.clone())
            .collect();
        if doomed.is_empty() {
            return Err(StoreError::KeyNotFound(key.to_string()));
        }
        for k in doomed {
            inner.remove(&k);
        }
        Ok(())
    }
}
