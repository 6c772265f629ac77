use thiserror::Error;

/// Errors surfaced while encoding or decoding protocol messages.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The buffer is malformed: truncated, over-long length, or bad utf-8.
    #[error("malformed frame at byte {position}: {reason}")]
    Codec { reason: String, position: usize },

    /// The variant tag is outside the closed set.
    #[error("unknown message variant tag {tag}")]
    UnknownVariant { tag: u8 },

    /// The payload uses a schema this implementation rejects (e.g. the
    /// legacy seen-clock-map encrypted update format).
    #[error("unsupported payload schema (kind byte {kind})")]
    UnsupportedSchema { kind: u8 },
}

impl ProtocolError {
    pub(crate) fn codec(reason: impl Into<String>, position: usize) -> Self {
        ProtocolError::Codec {
            reason: reason.into(),
            position,
        }
    }
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
