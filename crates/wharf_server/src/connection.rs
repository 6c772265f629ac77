//! Connection surface.
//!
//! Concrete transports (WebSocket, in-memory pipes) live outside the core.
//! A transport hands the server a [`ConnectionSink`] for outbound frames
//! plus the connection's validated [`Claims`], and feeds inbound frames to
//! the dispatcher. Token validation itself is an external concern; by the
//! time a connection reaches the core its identity is settled.

use async_trait::async_trait;

use crate::error::ServerResult;

/// Server-assigned connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Validated identity and permission claims for one connection.
#[derive(Debug, Clone)]
pub struct Claims {
    /// Stable identity (user or device id).
    pub subject: String,
    pub can_read: bool,
    pub can_write: bool,
}

impl Claims {
    pub fn read_write(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            can_read: true,
            can_write: true,
        }
    }

    pub fn read_only(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            can_read: true,
            can_write: false,
        }
    }

    pub fn denied(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            can_read: false,
            can_write: false,
        }
    }
}

/// Outbound half of a connection; implemented by the transport adapter.
#[async_trait]
pub trait ConnectionSink: Send + Sync {
    /// Deliver one encoded frame to the remote end.
    async fn send(&self, frame: Vec<u8>) -> ServerResult<()>;
}
