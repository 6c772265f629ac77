//! Storage engine for Wharf.
//!
//! Everything persists through the [`KeyValueStore`] contract: document
//! metadata and update logs (compacted at read time), encrypted snapshot +
//! delta logs, content-addressed chunked files with Merkle verification,
//! milestones, rate-limit state, and the TTL locks that serialize mutation
//! per key. Concrete back-ends live outside the core.

mod config;
mod documents;
mod encrypted_docs;
mod error;
mod files;
mod kv;
mod lock;
pub mod merkle;
mod milestones;
mod rate_limit;

pub use config::{LockConfig, StorageConfig};
pub use documents::{DocumentMetadata, DocumentStorage, FetchedDocument};
pub use encrypted_docs::{EncryptedDocumentMetadata, EncryptedDocumentStorage};
pub use error::{StorageError, StorageResult};
pub use files::{DocumentMetadataUpdater, FileMetadata, FileStorage, StoredFile, UploadSession};
pub use kv::{KeyValueStore, MemoryStore};
pub use lock::with_transaction;
pub use milestones::{Milestone, MilestoneStorage};
pub use rate_limit::{RateDecision, RateLimitConfig, RateLimiter};

use std::sync::Arc;

/// All storage adapters wired over one backend.
///
/// The factory resolves the file ↔ document dependency cycle: file storage
/// only knows the [`DocumentMetadataUpdater`] seam, and the concrete
/// document storage is wired in here after both exist.
pub struct Storage {
    pub documents: Arc<DocumentStorage>,
    pub encrypted: Arc<EncryptedDocumentStorage>,
    pub files: Arc<FileStorage>,
    pub milestones: Arc<MilestoneStorage>,
}

impl Storage {
    pub fn new(store: Arc<dyn KeyValueStore>, config: StorageConfig) -> Self {
        let documents = Arc::new(DocumentStorage::new(store.clone(), config.clone()));
        let encrypted = Arc::new(EncryptedDocumentStorage::new(store.clone(), config.clone()));
        let files = Arc::new(FileStorage::new(store.clone(), config.clone()));
        let milestones = Arc::new(MilestoneStorage::new(store, config));
        files.set_document_updater(documents.clone());
        Self {
            documents,
            encrypted,
            files,
            milestones,
        }
    }
}
