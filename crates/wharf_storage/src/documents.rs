//! Plaintext document storage: metadata plus an append-only update log
//! compacted at read time.
//!
//! Each update is stored as its own raw key and an index row tracks the
//! set. `fetch` merges the log through a fresh CRDT document, writes the
//! merged update back as a single key, and deletes the rest, so a document
//! read is also its compaction. `unload` forces the same compaction when
//! the last client disconnects.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::files::DocumentMetadataUpdater;
use crate::kv::KeyValueStore;
use crate::lock::with_transaction;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Persisted document metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub encrypted: bool,
    /// Content ids of files attached to this document.
    #[serde(default)]
    pub files: Vec<String>,
}

impl DocumentMetadata {
    fn new() -> Self {
        let now = now_ms();
        Self {
            created_at: now,
            updated_at: now,
            encrypted: false,
            files: Vec::new(),
        }
    }
}

/// Result of a `fetch`: the merged update and its state vector.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub update: Vec<u8>,
    pub state_vector: Vec<u8>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UpdateIndex {
    keys: Vec<String>,
}

/// Plaintext document storage over the shared key/value store.
pub struct DocumentStorage {
    store: Arc<dyn KeyValueStore>,
    config: StorageConfig,
}

impl DocumentStorage {
    pub fn new(store: Arc<dyn KeyValueStore>, config: StorageConfig) -> Self {
        Self { store, config }
    }

    fn doc_key(&self, id: &str) -> String {
        format!("{}{}", self.config.document_prefix, id)
    }

    fn update_key(&self, id: &str) -> String {
        format!("{}-update-{}", self.doc_key(id), Uuid::new_v4())
    }

    fn update_prefix(&self, id: &str) -> String {
        format!("{}-update-", self.doc_key(id))
    }

    fn meta_key(&self, id: &str) -> String {
        format!("{}:meta", self.doc_key(id))
    }

    fn attributions_key(&self, id: &str) -> String {
        format!("{}:attributions", self.doc_key(id))
    }

    async fn read_index(&self, id: &str) -> StorageResult<Vec<String>> {
        match self.store.get(&self.doc_key(id)).await? {
            Some(value) => Ok(serde_json::from_value::<UpdateIndex>(value)?.keys),
            // No index row: fall back to scanning the update keys.
            None => self.store.get_keys(&self.update_prefix(id)).await,
        }
    }

    async fn write_index(&self, id: &str, keys: Vec<String>) -> StorageResult<()> {
        self.store
            .set(
                &self.doc_key(id),
                serde_json::to_value(UpdateIndex { keys })?,
            )
            .await
    }

    /// Stored metadata, or `None` for an unknown document.
    pub async fn metadata(&self, id: &str) -> StorageResult<Option<DocumentMetadata>> {
        match self.store.get(&self.meta_key(id)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Append an update to the document's log, creating the document on
    /// first write. Optionally merges a CRDT attribution id-map.
    pub async fn write(
        &self,
        id: &str,
        update: &[u8],
        attributions: Option<Map<String, Value>>,
    ) -> StorageResult<()> {
        let doc_key = self.doc_key(id);
        with_transaction(&self.store, &doc_key, &self.config.lock, || async move {
            let update_key = self.update_key(id);
            self.store.set_raw(&update_key, update).await?;

            let mut keys = self.read_index(id).await?;
            keys.push(update_key);
            self.write_index(id, keys).await?;

            let mut meta = self.metadata(id).await?.unwrap_or_else(DocumentMetadata::new);
            meta.updated_at = now_ms();
            self.store
                .set(&self.meta_key(id), serde_json::to_value(&meta)?)
                .await?;

            if let Some(incoming) = attributions {
                let mut merged = match self.store.get(&self.attributions_key(id)).await? {
                    Some(Value::Object(map)) => map,
                    _ => Map::new(),
                };
                merged.extend(incoming);
                self.store
                    .set(&self.attributions_key(id), Value::Object(merged))
                    .await?;
            }

            debug!(document_id = id, bytes = update.len(), "appended update");
            Ok(())
        })
        .await
    }

    /// Read the document, compacting its update log in the process.
    ///
    /// Returns `None` for a document that has never been written.
    pub async fn fetch(&self, id: &str) -> StorageResult<Option<FetchedDocument>> {
        let doc_key = self.doc_key(id);
        with_transaction(&self.store, &doc_key, &self.config.lock, || async move {
            self.compact(id).await
        })
        .await
    }

    /// Force a synchronous compaction without returning the content; called
    /// when the last client for the document disconnects.
    pub async fn unload(&self, id: &str) -> StorageResult<()> {
        let doc_key = self.doc_key(id);
        with_transaction(&self.store, &doc_key, &self.config.lock, || async move {
            self.compact(id).await.map(|_| ())
        })
        .await
    }

    /// Merge all update keys into one, delete the originals, and return the
    /// merged state. Caller holds the document lock.
    async fn compact(&self, id: &str) -> StorageResult<Option<FetchedDocument>> {
        let keys = self.read_index(id).await?;
        if keys.is_empty() {
            return Ok(None);
        }

        let mut raw_updates = Vec::with_capacity(keys.len());
        for key in &keys {
            match self.store.get_raw(key).await? {
                Some(bytes) => raw_updates.push(bytes),
                None => warn!(document_id = id, key = %key, "indexed update key missing"),
            }
        }

        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            for bytes in &raw_updates {
                match Update::decode_v1(bytes) {
                    Ok(update) => {
                        txn.apply_update(update)
                            .map_err(|e| StorageError::Crdt(e.to_string()))?;
                    }
                    Err(e) => {
                        warn!(document_id = id, error = %e, "skipping undecodable update");
                    }
                }
            }
        }

        let txn = doc.transact();
        let merged = txn.encode_state_as_update_v1(&StateVector::default());
        let state_vector = txn.state_vector().encode_v1();
        drop(txn);

        if keys.len() > 1 {
            let merged_key = self.update_key(id);
            self.store.set_raw(&merged_key, &merged).await?;
            for key in &keys {
                self.store.remove(key).await?;
            }
            self.write_index(id, vec![merged_key]).await?;
            debug!(document_id = id, collapsed = keys.len(), "compacted update log");
        }

        Ok(Some(FetchedDocument {
            update: merged,
            state_vector,
        }))
    }

    async fn mutate_metadata(
        &self,
        id: &str,
        f: impl FnOnce(&mut DocumentMetadata),
    ) -> StorageResult<()> {
        let doc_key = self.doc_key(id);
        with_transaction(&self.store, &doc_key, &self.config.lock, || async move {
            let mut meta = self.metadata(id).await?.unwrap_or_else(DocumentMetadata::new);
            f(&mut meta);
            meta.updated_at = now_ms();
            self.store
                .set(&self.meta_key(id), serde_json::to_value(&meta)?)
                .await
        })
        .await
    }
}

#[async_trait::async_trait]
impl DocumentMetadataUpdater for DocumentStorage {
    async fn attach_file(&self, document_id: &str, file_id: &str) -> StorageResult<()> {
        self.mutate_metadata(document_id, |meta| {
            if !meta.files.iter().any(|f| f == file_id) {
                meta.files.push(file_id.to_string());
            }
        })
        .await
    }

    async fn detach_file(&self, document_id: &str, file_id: &str) -> StorageResult<()> {
        self.mutate_metadata(document_id, |meta| {
            meta.files.retain(|f| f != file_id);
        })
        .await
    }

    async fn document_files(&self, document_id: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .metadata(document_id)
            .await?
            .map(|meta| meta.files)
            .unwrap_or_default())
    }

    async fn clear_files(&self, document_id: &str) -> StorageResult<()> {
        self.mutate_metadata(document_id, |meta| meta.files.clear()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;
    use yrs::{GetString, Text};

    fn storage() -> DocumentStorage {
        DocumentStorage::new(Arc::new(MemoryStore::new()), StorageConfig::default())
    }

    fn text_update(content: &str) -> Vec<u8> {
        let doc = Doc::new();
        let text = doc.get_or_insert_text("body");
        let mut txn = doc.transact_mut();
        text.insert(&mut txn, 0, content);
        drop(txn);
        doc.transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    fn text_of(update: &[u8]) -> String {
        let doc = Doc::new();
        let text = doc.get_or_insert_text("body");
        {
            let mut txn = doc.transact_mut();
            txn.apply_update(Update::decode_v1(update).unwrap()).unwrap();
        }
        let txn = doc.transact();
        text.get_string(&txn)
    }

    #[tokio::test]
    async fn test_fetch_unknown_document() {
        let storage = storage();
        assert!(storage.fetch("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_then_fetch() {
        let storage = storage();
        storage.write("d1", &text_update("hello"), None).await.unwrap();
        let fetched = storage.fetch("d1").await.unwrap().unwrap();
        assert_eq!(text_of(&fetched.update), "hello");
        assert!(!fetched.state_vector.is_empty());
    }

    #[tokio::test]
    async fn test_compaction_collapses_update_keys() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let storage = DocumentStorage::new(store.clone(), StorageConfig::default());

        // Five concurrent-editor updates, one per client.
        for i in 0..5 {
            let doc = Doc::new();
            let text = doc.get_or_insert_text("body");
            let mut txn = doc.transact_mut();
            text.insert(&mut txn, 0, &format!("edit{i} "));
            drop(txn);
            let update = doc
                .transact()
                .encode_state_as_update_v1(&StateVector::default());
            storage.write("d1", &update, None).await.unwrap();
        }
        assert_eq!(
            store.get_keys("document:d1-update-").await.unwrap().len(),
            5
        );

        let fetched = storage.fetch("d1").await.unwrap().unwrap();
        let merged = text_of(&fetched.update);
        for i in 0..5 {
            assert!(merged.contains(&format!("edit{i}")), "missing edit{i} in {merged:?}");
        }

        // Exactly one update key remains, plus metadata.
        assert_eq!(
            store.get_keys("document:d1-update-").await.unwrap().len(),
            1
        );
        assert!(store.get("document:d1:meta").await.unwrap().is_some());

        // A second fetch returns identical content.
        let again = storage.fetch("d1").await.unwrap().unwrap();
        assert_eq!(text_of(&again.update), merged);
    }

    #[tokio::test]
    async fn test_unload_compacts() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let storage = DocumentStorage::new(store.clone(), StorageConfig::default());
        storage.write("d1", &text_update("a"), None).await.unwrap();
        storage.write("d1", &text_update("b"), None).await.unwrap();
        storage.unload("d1").await.unwrap();
        assert_eq!(
            store.get_keys("document:d1-update-").await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_attribution_merge() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let storage = DocumentStorage::new(store.clone(), StorageConfig::default());

        let mut first = Map::new();
        first.insert("1".to_string(), serde_json::json!("alice"));
        storage.write("d1", &text_update("a"), Some(first)).await.unwrap();

        let mut second = Map::new();
        second.insert("2".to_string(), serde_json::json!("bob"));
        storage.write("d1", &text_update("b"), Some(second)).await.unwrap();

        let attrs = store.get("document:d1:attributions").await.unwrap().unwrap();
        assert_eq!(attrs["1"], "alice");
        assert_eq!(attrs["2"], "bob");
    }

    #[tokio::test]
    async fn test_file_attachment_updates_metadata() {
        let storage = storage();
        storage.write("d1", &text_update("a"), None).await.unwrap();
        storage.attach_file("d1", "file-abc").await.unwrap();
        storage.attach_file("d1", "file-abc").await.unwrap(); // idempotent
        assert_eq!(
            storage.metadata("d1").await.unwrap().unwrap().files,
            vec!["file-abc".to_string()]
        );
        storage.detach_file("d1", "file-abc").await.unwrap();
        assert!(storage.metadata("d1").await.unwrap().unwrap().files.is_empty());
    }
}
