//! Encrypted document storage.
//!
//! The server never decrypts anything here. A document is an active
//! snapshot (an opaque ciphertext blob) plus an ordered log of opaque
//! updates attached to it; the only readable structure is the framing:
//! snapshot ids, Lamport timestamps, and the server version this storage
//! stamps onto each persisted update. Stamping happens under the document's
//! TTL lock, which makes the `server_version` sequence the total order of
//! the log.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use wharf_protocol::{
    EncryptedPayload, EncryptedStateVector, EncryptedUpdate, LamportTimestamp, Snapshot,
    SyncStep2Payload,
};

use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::kv::KeyValueStore;
use crate::lock::with_transaction;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Metadata row for an encrypted document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedDocumentMetadata {
    pub created_at: i64,
    pub updated_at: i64,
    pub encrypted: bool,
    /// Every snapshot id ever stored, oldest first; older snapshots may be
    /// retained for history.
    pub snapshots: Vec<String>,
    /// The snapshot new updates currently attach to.
    pub active_snapshot_id: Option<String>,
    /// Highest version stamped within the active snapshot.
    pub server_version: u64,
}

impl EncryptedDocumentMetadata {
    fn new() -> Self {
        let now = now_ms();
        Self {
            created_at: now,
            updated_at: now,
            encrypted: true,
            snapshots: Vec::new(),
            active_snapshot_id: None,
            server_version: 0,
        }
    }
}

/// Snapshot metadata row.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotMeta {
    id: String,
    parent_snapshot_id: Option<String>,
    created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

/// One persisted update row. Payload bytes are base64 at this JSON edge
/// only; in-memory structs carry raw bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UpdateRow {
    id: String,
    snapshot_id: String,
    client_id: u32,
    counter: u64,
    server_version: u64,
    payload: String,
}

impl UpdateRow {
    fn from_update(update: &EncryptedUpdate, server_version: u64) -> Self {
        Self {
            id: update.id.clone(),
            snapshot_id: update.snapshot_id.clone(),
            client_id: update.timestamp.client_id,
            counter: update.timestamp.counter,
            server_version,
            payload: BASE64.encode(&update.payload),
        }
    }

    fn into_update(self) -> StorageResult<EncryptedUpdate> {
        let payload = BASE64
            .decode(&self.payload)
            .map_err(|e| StorageError::Backend(format!("corrupt update payload: {e}")))?;
        Ok(EncryptedUpdate {
            id: self.id,
            snapshot_id: self.snapshot_id,
            timestamp: LamportTimestamp::new(self.client_id, self.counter),
            payload,
            server_version: Some(self.server_version),
        })
    }
}

/// Encrypted document storage over the shared key/value store.
pub struct EncryptedDocumentStorage {
    store: Arc<dyn KeyValueStore>,
    config: StorageConfig,
}

impl EncryptedDocumentStorage {
    pub fn new(store: Arc<dyn KeyValueStore>, config: StorageConfig) -> Self {
        Self { store, config }
    }

    fn doc_key(&self, id: &str) -> String {
        format!("{}{}", self.config.document_prefix, id)
    }

    fn meta_key(&self, id: &str) -> String {
        format!("{}:meta", self.doc_key(id))
    }

    fn snapshot_payload_key(&self, id: &str, snapshot_id: &str) -> String {
        format!("{}:snapshot:{}:payload", self.doc_key(id), snapshot_id)
    }

    fn snapshot_meta_key(&self, id: &str, snapshot_id: &str) -> String {
        format!("{}:snapshot:{}:meta", self.doc_key(id), snapshot_id)
    }

    fn updates_key(&self, id: &str, snapshot_id: &str) -> String {
        format!("{}:snapshot:{}:updates", self.doc_key(id), snapshot_id)
    }

    pub async fn metadata(&self, id: &str) -> StorageResult<Option<EncryptedDocumentMetadata>> {
        match self.store.get(&self.meta_key(id)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn read_updates(&self, id: &str, snapshot_id: &str) -> StorageResult<Vec<EncryptedUpdate>> {
        let rows: Vec<UpdateRow> = match self.store.get(&self.updates_key(id, snapshot_id)).await? {
            Some(value) => serde_json::from_value(value)?,
            None => Vec::new(),
        };
        rows.into_iter().map(UpdateRow::into_update).collect()
    }

    async fn read_snapshot(&self, id: &str, snapshot_id: &str) -> StorageResult<Option<Snapshot>> {
        let Some(payload) = self
            .store
            .get_raw(&self.snapshot_payload_key(id, snapshot_id))
            .await?
        else {
            return Ok(None);
        };
        let meta: SnapshotMeta = match self.store.get(&self.snapshot_meta_key(id, snapshot_id)).await? {
            Some(value) => serde_json::from_value(value)?,
            None => {
                return Err(StorageError::NotFound(format!(
                    "snapshot meta for {snapshot_id}"
                )));
            }
        };
        Ok(Some(Snapshot {
            id: meta.id,
            parent_snapshot_id: meta.parent_snapshot_id,
            payload,
        }))
    }

    /// Answer a client's sync-step-1.
    ///
    /// Includes the active snapshot when the client sits on a different
    /// snapshot (or none), and the slice of updates the client has not seen
    /// yet. An unknown document yields an empty payload.
    pub async fn handle_sync_step_1(
        &self,
        id: &str,
        state_vector: &[u8],
    ) -> StorageResult<SyncStep2Payload> {
        let client = EncryptedStateVector::decode(state_vector)?;
        let Some(meta) = self.metadata(id).await? else {
            return Ok(SyncStep2Payload::default());
        };
        let Some(active) = meta.active_snapshot_id.as_deref() else {
            return Ok(SyncStep2Payload::default());
        };

        let client_on_active = client.snapshot_id == active;
        let snapshot = if client_on_active {
            None
        } else {
            self.read_snapshot(id, active).await?
        };

        // The client's version only means anything within its own snapshot;
        // across a snapshot boundary it restarts from zero.
        let since = if client_on_active {
            client.server_version
        } else {
            0
        };
        let updates = self
            .read_updates(id, active)
            .await?
            .into_iter()
            .filter(|u| u.server_version.unwrap_or(0) > since)
            .collect();

        Ok(SyncStep2Payload { snapshot, updates })
    }

    /// The server's own encrypted state vector for `id`.
    pub async fn state_vector(&self, id: &str) -> StorageResult<EncryptedStateVector> {
        let meta = self.metadata(id).await?;
        Ok(match meta {
            Some(meta) => EncryptedStateVector::new(
                meta.active_snapshot_id.unwrap_or_default(),
                meta.server_version,
            ),
            None => EncryptedStateVector::new("", 0),
        })
    }

    /// Persist a client-sent sync-step-2 (snapshot and/or update batch)
    /// under the document's lock. Returns the re-emitted stamped payloads,
    /// snapshot first, each in `doc.update` framing.
    pub async fn handle_sync_step_2(
        &self,
        id: &str,
        payload: &[u8],
    ) -> StorageResult<Vec<Vec<u8>>> {
        let decoded = SyncStep2Payload::decode(payload)?;
        let doc_key = self.doc_key(id);
        with_transaction(&self.store, &doc_key, &self.config.lock, || async move {
            let mut stamped = Vec::new();
            if let Some(snapshot) = decoded.snapshot {
                stamped.push(self.apply_snapshot(id, snapshot).await?);
            }
            if !decoded.updates.is_empty() {
                stamped.push(self.apply_updates(id, decoded.updates).await?);
            }
            Ok(stamped)
        })
        .await
    }

    /// Persist an encrypted update payload under the document's lock and
    /// return the re-emitted, server-stamped payload.
    ///
    /// A snapshot installs itself as active and resets the version counter;
    /// updates against anything but the active snapshot fail with
    /// `StaleSnapshot` and the origin is expected to re-sync.
    pub async fn handle_encrypted_update(
        &self,
        id: &str,
        payload: &[u8],
    ) -> StorageResult<Vec<u8>> {
        let decoded = EncryptedPayload::decode(payload)?;
        let doc_key = self.doc_key(id);
        with_transaction(&self.store, &doc_key, &self.config.lock, || async move {
            match decoded {
                EncryptedPayload::Snapshot(snapshot) => self.apply_snapshot(id, snapshot).await,
                EncryptedPayload::Updates(updates) => self.apply_updates(id, updates).await,
            }
        })
        .await
    }

    async fn apply_snapshot(&self, id: &str, snapshot: Snapshot) -> StorageResult<Vec<u8>> {
        let mut meta = self
            .metadata(id)
            .await?
            .unwrap_or_else(EncryptedDocumentMetadata::new);

        if meta.snapshots.iter().any(|s| s == &snapshot.id) {
            // Replayed snapshot; idempotent.
            debug!(document_id = id, snapshot_id = %snapshot.id, "snapshot already stored");
            return Ok(EncryptedPayload::Snapshot(snapshot).encode());
        }

        self.store
            .set_raw(&self.snapshot_payload_key(id, &snapshot.id), &snapshot.payload)
            .await?;
        self.store
            .set(
                &self.snapshot_meta_key(id, &snapshot.id),
                serde_json::to_value(SnapshotMeta {
                    id: snapshot.id.clone(),
                    parent_snapshot_id: snapshot.parent_snapshot_id.clone(),
                    created_at: now_ms(),
                    name: None,
                })?,
            )
            .await?;
        self.store
            .set(
                &self.updates_key(id, &snapshot.id),
                serde_json::to_value(Vec::<UpdateRow>::new())?,
            )
            .await?;

        meta.snapshots.push(snapshot.id.clone());
        meta.active_snapshot_id = Some(snapshot.id.clone());
        meta.server_version = 0;
        meta.updated_at = now_ms();
        self.store
            .set(&self.meta_key(id), serde_json::to_value(&meta)?)
            .await?;

        info!(document_id = id, snapshot_id = %snapshot.id, "installed active snapshot");
        Ok(EncryptedPayload::Snapshot(snapshot).encode())
    }

    async fn apply_updates(
        &self,
        id: &str,
        updates: Vec<EncryptedUpdate>,
    ) -> StorageResult<Vec<u8>> {
        let mut meta = self
            .metadata(id)
            .await?
            .unwrap_or_else(EncryptedDocumentMetadata::new);
        let active = meta.active_snapshot_id.clone().unwrap_or_default();

        let mut stamped = Vec::with_capacity(updates.len());
        let mut rows: Vec<UpdateRow> = match self.store.get(&self.updates_key(id, &active)).await? {
            Some(value) => serde_json::from_value(value)?,
            None => Vec::new(),
        };

        for mut update in updates {
            if update.snapshot_id != active {
                return Err(StorageError::StaleSnapshot {
                    snapshot_id: update.snapshot_id,
                    active,
                });
            }
            if let Some(existing) = rows.iter().find(|row| row.id == update.id) {
                // Content-derived ids make retransmission idempotent: re-emit
                // the already-stamped row instead of appending a duplicate.
                update.server_version = Some(existing.server_version);
                stamped.push(update);
                continue;
            }
            meta.server_version += 1;
            update.server_version = Some(meta.server_version);
            rows.push(UpdateRow::from_update(&update, meta.server_version));
            stamped.push(update);
        }

        self.store
            .set(&self.updates_key(id, &active), serde_json::to_value(&rows)?)
            .await?;
        meta.updated_at = now_ms();
        self.store
            .set(&self.meta_key(id), serde_json::to_value(&meta)?)
            .await?;

        debug!(
            document_id = id,
            count = stamped.len(),
            head = meta.server_version,
            "stamped encrypted updates"
        );
        Ok(EncryptedPayload::Updates(stamped).encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;

    fn storage() -> EncryptedDocumentStorage {
        EncryptedDocumentStorage::new(Arc::new(MemoryStore::new()), StorageConfig::default())
    }

    fn snapshot(id: &str, payload: &[u8]) -> Vec<u8> {
        EncryptedPayload::Snapshot(Snapshot {
            id: id.to_string(),
            parent_snapshot_id: None,
            payload: payload.to_vec(),
        })
        .encode()
    }

    fn update(snapshot_id: &str, counter: u64, payload: &[u8]) -> Vec<u8> {
        EncryptedPayload::Updates(vec![EncryptedUpdate::new(
            snapshot_id,
            LamportTimestamp::new(1, counter),
            payload.to_vec(),
        )])
        .encode()
    }

    fn decode_updates(bytes: &[u8]) -> Vec<EncryptedUpdate> {
        match EncryptedPayload::decode(bytes).unwrap() {
            EncryptedPayload::Updates(updates) => updates,
            other => panic!("expected updates, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_snapshot_installs_and_resets_version() {
        let storage = storage();
        storage
            .handle_encrypted_update("d", &snapshot("s1", b"cipher"))
            .await
            .unwrap();

        let meta = storage.metadata("d").await.unwrap().unwrap();
        assert_eq!(meta.active_snapshot_id.as_deref(), Some("s1"));
        assert_eq!(meta.server_version, 0);
        assert_eq!(meta.snapshots, vec!["s1".to_string()]);
        assert!(meta.encrypted);
    }

    #[tokio::test]
    async fn test_updates_get_monotonic_server_versions() {
        let storage = storage();
        storage
            .handle_encrypted_update("d", &snapshot("s1", b"c"))
            .await
            .unwrap();

        let first = storage
            .handle_encrypted_update("d", &update("s1", 1, b"u1"))
            .await
            .unwrap();
        assert_eq!(decode_updates(&first)[0].server_version, Some(1));

        let second = storage
            .handle_encrypted_update("d", &update("s1", 2, b"u2"))
            .await
            .unwrap();
        assert_eq!(decode_updates(&second)[0].server_version, Some(2));

        assert_eq!(storage.metadata("d").await.unwrap().unwrap().server_version, 2);
    }

    #[tokio::test]
    async fn test_stale_snapshot_rejected() {
        let storage = storage();
        storage
            .handle_encrypted_update("d", &snapshot("s1", b"c"))
            .await
            .unwrap();
        storage
            .handle_encrypted_update("d", &snapshot("s2", b"c2"))
            .await
            .unwrap();

        let err = storage
            .handle_encrypted_update("d", &update("s1", 1, b"late"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::StaleSnapshot { .. }));
    }

    #[tokio::test]
    async fn test_retransmitted_update_is_idempotent() {
        let storage = storage();
        storage
            .handle_encrypted_update("d", &snapshot("s1", b"c"))
            .await
            .unwrap();

        let bytes = update("s1", 1, b"u1");
        let first = storage.handle_encrypted_update("d", &bytes).await.unwrap();
        let replay = storage.handle_encrypted_update("d", &bytes).await.unwrap();
        assert_eq!(decode_updates(&first)[0].server_version, Some(1));
        assert_eq!(decode_updates(&replay)[0].server_version, Some(1));
        assert_eq!(storage.metadata("d").await.unwrap().unwrap().server_version, 1);
    }

    #[tokio::test]
    async fn test_sync_step_1_for_fresh_client() {
        let storage = storage();
        storage
            .handle_encrypted_update("d", &snapshot("s1", b"cipher"))
            .await
            .unwrap();
        storage
            .handle_encrypted_update("d", &update("s1", 1, b"u1"))
            .await
            .unwrap();
        storage
            .handle_encrypted_update("d", &update("s1", 2, b"u2"))
            .await
            .unwrap();

        let reply = storage
            .handle_sync_step_1("d", &EncryptedStateVector::new("", 0).encode())
            .await
            .unwrap();
        assert_eq!(reply.snapshot.as_ref().unwrap().id, "s1");
        assert_eq!(reply.snapshot.as_ref().unwrap().payload, b"cipher");
        assert_eq!(reply.updates.len(), 2);
        assert_eq!(reply.updates[0].server_version, Some(1));
        assert_eq!(reply.updates[1].server_version, Some(2));
    }

    #[tokio::test]
    async fn test_sync_step_1_for_caught_up_client() {
        let storage = storage();
        storage
            .handle_encrypted_update("d", &snapshot("s1", b"c"))
            .await
            .unwrap();
        for i in 1..=3 {
            storage
                .handle_encrypted_update("d", &update("s1", i, format!("u{i}").as_bytes()))
                .await
                .unwrap();
        }

        let reply = storage
            .handle_sync_step_1("d", &EncryptedStateVector::new("s1", 2).encode())
            .await
            .unwrap();
        assert!(reply.snapshot.is_none(), "same snapshot needs no snapshot bytes");
        assert_eq!(reply.updates.len(), 1);
        assert_eq!(reply.updates[0].server_version, Some(3));
    }

    #[tokio::test]
    async fn test_sync_step_1_unknown_document() {
        let storage = storage();
        let reply = storage
            .handle_sync_step_1("nope", &EncryptedStateVector::new("", 0).encode())
            .await
            .unwrap();
        assert!(reply.snapshot.is_none());
        assert!(reply.updates.is_empty());
    }

    #[tokio::test]
    async fn test_state_vector_reflects_metadata() {
        let storage = storage();
        assert_eq!(
            storage.state_vector("d").await.unwrap(),
            EncryptedStateVector::new("", 0)
        );
        storage
            .handle_encrypted_update("d", &snapshot("s1", b"c"))
            .await
            .unwrap();
        storage
            .handle_encrypted_update("d", &update("s1", 1, b"u"))
            .await
            .unwrap();
        assert_eq!(
            storage.state_vector("d").await.unwrap(),
            EncryptedStateVector::new("s1", 1)
        );
    }

    #[tokio::test]
    async fn test_old_snapshots_retained() {
        let storage = storage();
        storage
            .handle_encrypted_update("d", &snapshot("s1", b"c1"))
            .await
            .unwrap();
        storage
            .handle_encrypted_update("d", &snapshot("s2", b"c2"))
            .await
            .unwrap();
        let meta = storage.metadata("d").await.unwrap().unwrap();
        assert_eq!(meta.snapshots, vec!["s1".to_string(), "s2".to_string()]);
        assert_eq!(meta.active_snapshot_id.as_deref(), Some("s2"));
    }
}
