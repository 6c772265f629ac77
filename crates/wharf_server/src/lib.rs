//! Server dispatcher for Wharf.
//!
//! Decodes inbound frames, applies dedupe and rate limiting, verifies
//! permission claims, serializes document mutation through the storage
//! engine's TTL locks, broadcasts to peers, answers rpc, and publishes
//! telemetry. Transports and authentication token validation live outside;
//! they hand the server a [`ConnectionSink`] and validated [`Claims`].

mod config;
mod connection;
mod dedupe;
mod dispatcher;
mod error;
mod rpc;
mod telemetry;

pub use config::ServerConfig;
pub use connection::{Claims, ConnectionId, ConnectionSink};
pub use dedupe::{DedupeConfig, TtlDedupe};
pub use dispatcher::Server;
pub use error::{ServerError, ServerResult};
pub use rpc::RpcRouter;
pub use telemetry::{ListenerId, TelemetryBus, TelemetryEvent};
