//! Key/value contract the storage engine is built over.
//!
//! Concrete back-ends (filesystem, embedded databases, remote stores) live
//! outside the core; they implement [`KeyValueStore`] and everything above
//! it — document logs, file chunks, locks, rate-limit state — works
//! unchanged. [`MemoryStore`] ships in-crate as the reference
//! implementation and test backend.
//!
//! Values come in two shapes: JSON documents (`get`/`set`) and raw byte
//! strings (`get_raw`/`set_raw`) for CRDT updates and file chunks. Each key
//! additionally carries an out-of-band metadata document (`get_meta`/
//! `set_meta`) used by the TTL lock.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::StorageResult;

/// Shared key/value contract. All storage adapters are built over this.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch a JSON value, or `None` when the key is absent.
    async fn get(&self, key: &str) -> StorageResult<Option<Value>>;

    /// Store a JSON value.
    async fn set(&self, key: &str, value: Value) -> StorageResult<()>;

    /// Remove a key (value, raw bytes, and metadata). Removing an absent
    /// key is not an error.
    async fn remove(&self, key: &str) -> StorageResult<()>;

    /// List keys starting with `prefix`, sorted.
    async fn get_keys(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Fetch raw bytes stored under a key.
    async fn get_raw(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Store raw bytes under a key.
    async fn set_raw(&self, key: &str, bytes: &[u8]) -> StorageResult<()>;

    /// Fetch the metadata document attached to a key.
    async fn get_meta(&self, key: &str) -> StorageResult<Option<Value>>;

    /// Replace the metadata document attached to a key. Callers that need
    /// to preserve sibling fields read, modify, and write back.
    async fn set_meta(&self, key: &str, meta: Value) -> StorageResult<()>;
}

#[derive(Default, Clone)]
struct Entry {
    value: Option<Value>,
    raw: Option<Vec<u8>>,
    meta: Option<Value>,
}

impl Entry {
    fn is_empty(&self) -> bool {
        self.value.is_none() && self.raw.is_none() && self.meta.is_none()
    }
}

/// In-memory [`KeyValueStore`].
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entry<R>(&self, key: &str, f: impl FnOnce(&mut Entry) -> R) -> R {
        let mut entries = self.entries.write().unwrap();
        let entry = entries.entry(key.to_string()).or_default();
        let result = f(entry);
        if entry.is_empty() {
            entries.remove(key);
        }
        result
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        Ok(self
            .entries
            .read()
            .unwrap()
            .get(key)
            .and_then(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: Value) -> StorageResult<()> {
        self.with_entry(key, |entry| entry.value = Some(value));
        Ok(())
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        self.entries.write().unwrap().remove(key);
        Ok(())
    }

    async fn get_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let entries = self.entries.read().unwrap();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.is_empty())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn get_raw(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self
            .entries
            .read()
            .unwrap()
            .get(key)
            .and_then(|entry| entry.raw.clone()))
    }

    async fn set_raw(&self, key: &str, bytes: &[u8]) -> StorageResult<()> {
        self.with_entry(key, |entry| entry.raw = Some(bytes.to_vec()));
        Ok(())
    }

    async fn get_meta(&self, key: &str) -> StorageResult<Option<Value>> {
        Ok(self
            .entries
            .read()
            .unwrap()
            .get(key)
            .and_then(|entry| entry.meta.clone()))
    }

    async fn set_meta(&self, key: &str, meta: Value) -> StorageResult<()> {
        self.with_entry(key, |entry| entry.meta = Some(meta));
        Ok(())
    }
}
