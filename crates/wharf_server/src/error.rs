use thiserror::Error;
use wharf_protocol::ProtocolError;
use wharf_storage::StorageError;

/// Errors surfaced by the server dispatcher.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("unknown connection {0}")]
    UnknownConnection(u64),

    #[error("connection send failed: {0}")]
    Connection(String),

    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type ServerResult<T> = Result<T, ServerError>;
