use thiserror::Error;
use wharf_protocol::ProtocolError;

/// Errors surfaced by the storage engine.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Lock acquisition exceeded the configured retry budget.
    #[error("lock acquisition for '{key}' timed out after {retries} attempts")]
    LockTimeout { key: String, retries: u32 },

    /// An update references a snapshot that is no longer active. Non-fatal:
    /// the origin re-syncs and re-attaches its pending updates.
    #[error("update references stale snapshot '{snapshot_id}' (active: '{active}')")]
    StaleSnapshot { snapshot_id: String, active: String },

    /// Merkle root mismatch, chunk size mismatch, or similar corruption.
    /// The offending data is discarded and the session is not advanced.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// The operation requires a document, snapshot, upload, or file that
    /// does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    /// Failure reported by the key/value backend.
    #[error("storage backend: {0}")]
    Backend(String),

    /// CRDT update bytes failed to decode or apply during compaction.
    #[error("crdt: {0}")]
    Crdt(String),
}

pub type StorageResult<T> = Result<T, StorageError>;
