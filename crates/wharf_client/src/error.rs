use thiserror::Error;
use wharf_protocol::ProtocolError;

/// Errors surfaced by the encrypted-document client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Ciphertext failed authentication or decrypted to garbage. The
    /// offending data is discarded.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A decrypted update failed to decode or apply to the replica.
    #[error("crdt: {0}")]
    Crdt(String),
}

pub type ClientResult<T> = Result<T, ClientError>;
