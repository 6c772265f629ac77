//! Wire protocol for Wharf.
//!
//! Defines the binary message envelope exchanged between clients and the
//! coordinating server, the encodings used for end-to-end encrypted document
//! payloads (which the server treats as opaque), and the Lamport clock that
//! orders encrypted updates within a snapshot.

mod encrypted;
mod envelope;
mod error;
mod lamport;
mod varint;

pub use encrypted::{
    EncryptedPayload, EncryptedStateVector, EncryptedUpdate, Snapshot, SyncStep2Payload,
};
pub use envelope::{
    Envelope, FileLegacyKind, MAGIC, MessageBody, MessageContext, MessageId, PROTOCOL_VERSION,
    Permission, RpcMessage, RpcRequestType,
};
pub use error::{ProtocolError, ProtocolResult};
pub use lamport::{LamportClock, LamportTimestamp};
