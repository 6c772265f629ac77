//! Encrypted-document client engine for Wharf.
//!
//! A [`EncryptedDocClient`] owns a local CRDT replica and speaks the sync
//! protocol in its encrypted flavor: snapshots and updates cross the wire
//! as ciphertext the server never opens. Hosts feed inbound payloads in,
//! send the envelopes the engine hands back, and observe progress through
//! typed [`ClientEvent`]s.

mod cipher;
mod engine;
mod error;
mod events;
mod plain;

pub use cipher::{AesGcmCipher, DocumentCipher};
pub use engine::{ClientConfig, EncryptedDocClient};
pub use error::{ClientError, ClientResult};
pub use events::{ClientEvent, EventObservers, SubscriptionId};
pub use plain::PlainDocClient;
