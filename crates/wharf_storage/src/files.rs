//! Content-addressed chunked file storage.
//!
//! Files arrive through temporary upload sessions: chunks land at
//! deterministic keys, the session tracks which indexes are present, and
//! completion re-derives the Merkle root from the stored chunks. Only when
//! the recomputed root matches the declared file id does the upload become
//! a durable file; a mismatch leaves the session untouched so the uploader
//! can retry with the right id. Idle sessions are garbage-collected.
//!
//! File storage mutates a document's `files[]` list through the
//! [`DocumentMetadataUpdater`] seam rather than depending on document
//! storage directly; the concrete implementation is wired in after
//! construction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::kv::KeyValueStore;
use crate::merkle::{ChunkProof, MerkleTree, NodeHash, content_id, expected_chunk_count, verify_proof};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The slice of document storage that file storage needs: keeping a
/// document's `files[]` list in step with the file rows.
#[async_trait]
pub trait DocumentMetadataUpdater: Send + Sync {
    /// Add a file id to the document's `files[]` (under the doc lock).
    async fn attach_file(&self, document_id: &str, file_id: &str) -> StorageResult<()>;

    /// Remove a file id from the document's `files[]` (under the doc lock).
    async fn detach_file(&self, document_id: &str, file_id: &str) -> StorageResult<()>;

    /// The document's current `files[]`.
    async fn document_files(&self, document_id: &str) -> StorageResult<Vec<String>>;

    /// Empty the document's `files[]` (under the doc lock).
    async fn clear_files(&self, document_id: &str) -> StorageResult<()>;
}

/// Metadata describing an uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub filename: String,
    pub size: u64,
    pub mime_type: String,
    pub last_modified: i64,
    #[serde(default)]
    pub encrypted: bool,
    /// Document the file belongs to.
    pub document_id: String,
}

/// A temporary upload session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub upload_id: String,
    pub metadata: FileMetadata,
    pub bytes_uploaded: u64,
    pub last_activity: i64,
    /// Which chunk indexes have been received.
    pub chunks: BTreeMap<u64, bool>,
}

/// A durable file row. `content_id` is the raw Merkle root; the file id on
/// the wire is its base64 form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFile {
    pub metadata: FileMetadata,
    pub content_id: Vec<u8>,
    pub chunk_keys: Vec<String>,
}

/// Chunked file storage over the shared key/value store.
pub struct FileStorage {
    store: Arc<dyn KeyValueStore>,
    config: StorageConfig,
    documents: OnceLock<Arc<dyn DocumentMetadataUpdater>>,
}

impl FileStorage {
    pub fn new(store: Arc<dyn KeyValueStore>, config: StorageConfig) -> Self {
        Self {
            store,
            config,
            documents: OnceLock::new(),
        }
    }

    /// Wire in the document-metadata implementation. Called once by the
    /// factory after both storages exist.
    pub fn set_document_updater(&self, updater: Arc<dyn DocumentMetadataUpdater>) {
        let _ = self.documents.set(updater);
    }

    fn documents(&self) -> StorageResult<&Arc<dyn DocumentMetadataUpdater>> {
        self.documents
            .get()
            .ok_or_else(|| StorageError::Backend("document updater not wired".to_string()))
    }

    fn file_key(&self, file_id: &str) -> String {
        format!("{}file:{}", self.config.file_prefix, file_id)
    }

    fn file_chunk_key(&self, file_id: &str, index: u64) -> String {
        format!("{}:chunk:{}", self.file_key(file_id), index)
    }

    fn upload_key(&self, upload_id: &str) -> String {
        format!("{}upload:{}", self.config.file_prefix, upload_id)
    }

    fn upload_chunk_key(&self, upload_id: &str, index: u64) -> String {
        format!("{}:chunk:{}", self.upload_key(upload_id), index)
    }

    async fn save_session(&self, session: &UploadSession) -> StorageResult<()> {
        self.store
            .set(
                &self.upload_key(&session.upload_id),
                serde_json::to_value(session)?,
            )
            .await
    }

    /// The session for `upload_id`, or `None`.
    pub async fn upload_session(&self, upload_id: &str) -> StorageResult<Option<UploadSession>> {
        match self.store.get(&self.upload_key(upload_id)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Open an upload session. Re-opening an existing session keeps its
    /// chunks (resumed upload).
    pub async fn begin_upload(
        &self,
        upload_id: &str,
        metadata: FileMetadata,
    ) -> StorageResult<UploadSession> {
        if let Some(existing) = self.upload_session(upload_id).await? {
            debug!(upload_id, "resuming existing upload session");
            return Ok(existing);
        }
        let session = UploadSession {
            upload_id: upload_id.to_string(),
            metadata,
            bytes_uploaded: 0,
            last_activity: now_ms(),
            chunks: BTreeMap::new(),
        };
        self.save_session(&session).await?;
        Ok(session)
    }

    fn chunk_len_at(&self, size: u64, index: u64) -> u64 {
        let expected = expected_chunk_count(size, self.config.chunk_size);
        if index + 1 < expected {
            self.config.chunk_size as u64
        } else {
            size - (expected - 1) * self.config.chunk_size as u64
        }
    }

    /// Store one chunk of an upload, optionally verifying an inclusion
    /// proof against the root the uploader claims.
    pub async fn store_chunk(
        &self,
        upload_id: &str,
        index: u64,
        bytes: &[u8],
        proof: Option<(&ChunkProof, &NodeHash)>,
    ) -> StorageResult<UploadSession> {
        let mut session = self
            .upload_session(upload_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("upload {upload_id}")))?;

        let expected = expected_chunk_count(session.metadata.size, self.config.chunk_size);
        if index >= expected {
            return Err(StorageError::Integrity(format!(
                "chunk index {index} out of range ({expected} expected)"
            )));
        }
        let expected_len = self.chunk_len_at(session.metadata.size, index);
        if bytes.len() as u64 != expected_len {
            return Err(StorageError::Integrity(format!(
                "chunk {index} size mismatch: got {}, expected {expected_len}",
                bytes.len()
            )));
        }
        if let Some((proof, root)) = proof {
            if proof.index != index || !verify_proof(bytes, proof, root) {
                return Err(StorageError::Integrity(format!(
                    "chunk {index} failed inclusion proof"
                )));
            }
        }

        self.store
            .set_raw(&self.upload_chunk_key(upload_id, index), bytes)
            .await?;
        session.chunks.insert(index, true);
        session.bytes_uploaded = session
            .chunks
            .keys()
            .map(|&i| self.chunk_len_at(session.metadata.size, i))
            .sum();
        session.last_activity = now_ms();
        self.save_session(&session).await?;
        debug!(upload_id, index, bytes = bytes.len(), "stored upload chunk");
        Ok(session)
    }

    /// Verify a finished upload and return its content-derived file id.
    ///
    /// Checks that every expected chunk is present, sizes sum to the
    /// declared size, and the recomputed Merkle root matches
    /// `declared_file_id` when one is supplied. On failure the session and
    /// its chunks remain for a corrected retry.
    pub async fn complete_upload(
        &self,
        upload_id: &str,
        declared_file_id: Option<&str>,
    ) -> StorageResult<String> {
        let session = self
            .upload_session(upload_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("upload {upload_id}")))?;

        let expected = expected_chunk_count(session.metadata.size, self.config.chunk_size);
        let missing: Vec<u64> = (0..expected)
            .filter(|i| !session.chunks.contains_key(i))
            .collect();
        if !missing.is_empty() {
            return Err(StorageError::Integrity(format!(
                "upload incomplete: missing chunks {missing:?}"
            )));
        }
        if session.bytes_uploaded != session.metadata.size {
            return Err(StorageError::Integrity(format!(
                "size mismatch: uploaded {} of {}",
                session.bytes_uploaded, session.metadata.size
            )));
        }

        let mut chunks = Vec::with_capacity(expected as usize);
        for index in 0..expected {
            let chunk = self
                .store
                .get_raw(&self.upload_chunk_key(upload_id, index))
                .await?
                .ok_or_else(|| {
                    StorageError::Integrity(format!("chunk {index} vanished from storage"))
                })?;
            chunks.push(chunk);
        }

        let tree = MerkleTree::from_chunks(&chunks);
        let derived = content_id(&tree.root());
        if let Some(declared) = declared_file_id {
            if declared != derived {
                return Err(StorageError::Integrity("Merkle root mismatch".to_string()));
            }
        }
        Ok(derived)
    }

    /// Promote a verified upload into a durable file, attach it to its
    /// document, and drop the session.
    pub async fn store_file_from_upload(
        &self,
        upload_id: &str,
        declared_file_id: Option<&str>,
    ) -> StorageResult<String> {
        let file_id = self.complete_upload(upload_id, declared_file_id).await?;
        let session = self
            .upload_session(upload_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("upload {upload_id}")))?;

        let expected = expected_chunk_count(session.metadata.size, self.config.chunk_size);
        let mut chunk_keys = Vec::with_capacity(expected as usize);
        let mut chunks = Vec::with_capacity(expected as usize);
        for index in 0..expected {
            let bytes = self
                .store
                .get_raw(&self.upload_chunk_key(upload_id, index))
                .await?
                .ok_or_else(|| {
                    StorageError::Integrity(format!("chunk {index} vanished from storage"))
                })?;
            let durable = self.file_chunk_key(&file_id, index);
            self.store.set_raw(&durable, &bytes).await?;
            chunk_keys.push(durable);
            chunks.push(bytes);
        }

        let tree = MerkleTree::from_chunks(&chunks);
        let row = StoredFile {
            metadata: session.metadata.clone(),
            content_id: tree.root().to_vec(),
            chunk_keys,
        };
        self.store
            .set(&self.file_key(&file_id), serde_json::to_value(&row)?)
            .await?;

        self.documents()?
            .attach_file(&session.metadata.document_id, &file_id)
            .await?;

        self.discard_upload(upload_id).await?;
        info!(
            file_id = %file_id,
            document_id = %session.metadata.document_id,
            size = session.metadata.size,
            "stored file from upload"
        );
        Ok(file_id)
    }

    /// Drop an upload session and its chunks.
    pub async fn discard_upload(&self, upload_id: &str) -> StorageResult<()> {
        let chunk_keys = self
            .store
            .get_keys(&format!("{}:chunk:", self.upload_key(upload_id)))
            .await?;
        for key in chunk_keys {
            self.store.remove(&key).await?;
        }
        self.store.remove(&self.upload_key(upload_id)).await
    }

    /// The durable row for a file, or `None`.
    pub async fn file(&self, file_id: &str) -> StorageResult<Option<StoredFile>> {
        match self.store.get(&self.file_key(file_id)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// One chunk of a durable file.
    pub async fn read_chunk(&self, file_id: &str, index: u64) -> StorageResult<Option<Vec<u8>>> {
        self.store.get_raw(&self.file_chunk_key(file_id, index)).await
    }

    /// Delete a file's chunks and row, then detach it from its document.
    pub async fn delete_file(&self, file_id: &str) -> StorageResult<()> {
        let Some(row) = self.file(file_id).await? else {
            return Err(StorageError::NotFound(format!("file {file_id}")));
        };
        self.delete_file_rows(file_id, &row).await?;
        self.documents()?
            .detach_file(&row.metadata.document_id, file_id)
            .await
    }

    async fn delete_file_rows(&self, file_id: &str, row: &StoredFile) -> StorageResult<()> {
        for key in &row.chunk_keys {
            self.store.remove(key).await?;
        }
        self.store.remove(&self.file_key(file_id)).await
    }

    /// Delete every file belonging to `document_id`.
    ///
    /// File rows are removed without per-file document transactions (the
    /// nested lock would deadlock against the caller's); the `files[]`
    /// list is cleared once at the end.
    pub async fn delete_files_by_document(&self, document_id: &str) -> StorageResult<()> {
        let file_ids = self.documents()?.document_files(document_id).await?;
        for file_id in &file_ids {
            if let Some(row) = self.file(file_id).await? {
                self.delete_file_rows(file_id, &row).await?;
            }
        }
        self.documents()?.clear_files(document_id).await?;
        debug!(document_id, count = file_ids.len(), "deleted document files");
        Ok(())
    }

    /// Garbage-collect upload sessions idle past the configured timeout.
    /// Returns the ids of collected sessions.
    pub async fn collect_expired_uploads(&self) -> StorageResult<Vec<String>> {
        let prefix = format!("{}upload:", self.config.file_prefix);
        let cutoff = now_ms() - self.config.upload_timeout_ms;
        let mut collected = Vec::new();

        for key in self.store.get_keys(&prefix).await? {
            if key.contains(":chunk:") {
                continue;
            }
            let Some(value) = self.store.get(&key).await? else {
                continue;
            };
            let session: UploadSession = match serde_json::from_value(value) {
                Ok(session) => session,
                Err(e) => {
                    warn!(key = %key, error = %e, "dropping unreadable upload session");
                    self.store.remove(&key).await?;
                    continue;
                }
            };
            if session.last_activity < cutoff {
                self.discard_upload(&session.upload_id).await?;
                collected.push(session.upload_id);
            }
        }

        if !collected.is_empty() {
            info!(count = collected.len(), "collected expired upload sessions");
        }
        Ok(collected)
    }
}
