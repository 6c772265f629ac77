//! Encodings for end-to-end encrypted document payloads.
//!
//! The server never sees plaintext for an encrypted document. What crosses
//! the wire (and what the server stores) are snapshots and updates whose
//! `payload` fields are opaque ciphertext; only the framing below is
//! readable server-side, enough to order updates and slice the delta log.
//!
//! Three encodings live here:
//!
//! - the encrypted state vector `(activeSnapshotId, serverVersion)` carried
//!   in sync-step-1,
//! - the encrypted update payload (a snapshot or a batch of updates) carried
//!   in `doc.update`,
//! - the sync-step-2 payload (optional snapshot plus update suffix).
//!
//! Every encoding starts with a version or kind byte so future schemas can
//! be added without guessing. The legacy seen-clock-map update schema is
//! recognized by its kind byte and rejected as unsupported.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};

use crate::error::{ProtocolError, ProtocolResult};
use crate::lamport::LamportTimestamp;
use crate::varint::{Reader, write_bytes, write_string, write_varuint};

/// Version byte for the state-vector and sync-step-2 encodings.
const ENCODING_VERSION: u8 = 0;

/// Kind bytes for [`EncryptedPayload`].
mod kind {
    pub const UPDATES: u8 = 0;
    pub const SNAPSHOT: u8 = 1;
    /// Legacy seen-clock-map schema; recognized and rejected.
    pub const LEGACY_CLOCK_MAP: u8 = 2;
}

/// What an encrypted-document client already knows: its active snapshot and
/// the highest server version it has applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedStateVector {
    /// Active snapshot id, or empty when the client holds none.
    pub snapshot_id: String,
    pub server_version: u64,
}

impl EncryptedStateVector {
    pub fn new(snapshot_id: impl Into<String>, server_version: u64) -> Self {
        Self {
            snapshot_id: snapshot_id.into(),
            server_version,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + self.snapshot_id.len() + 10);
        buf.push(ENCODING_VERSION);
        write_string(&mut buf, &self.snapshot_id);
        write_varuint(&mut buf, self.server_version);
        buf
    }

    pub fn decode(data: &[u8]) -> ProtocolResult<Self> {
        let mut reader = Reader::new(data);
        expect_version(&mut reader, "encrypted state vector")?;
        let snapshot_id = reader.string("snapshot id")?;
        let server_version = reader.varuint("server version")?;
        reader.expect_end("encrypted state vector")?;
        Ok(Self {
            snapshot_id,
            server_version,
        })
    }
}

/// A full, opaque encrypted CRDT state at a moment in time; the compaction
/// anchor all subsequent updates reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: String,
    pub parent_snapshot_id: Option<String>,
    /// Ciphertext of a full CRDT state update.
    pub payload: Vec<u8>,
}

impl Snapshot {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        write_string(buf, &self.id);
        write_string(buf, self.parent_snapshot_id.as_deref().unwrap_or(""));
        write_bytes(buf, &self.payload);
    }

    fn decode_from(reader: &mut Reader<'_>) -> ProtocolResult<Self> {
        let id = reader.string("snapshot id")?;
        let parent = reader.string("parent snapshot id")?;
        let payload = reader.bytes("snapshot payload")?.to_vec();
        Ok(Self {
            id,
            parent_snapshot_id: (!parent.is_empty()).then_some(parent),
            payload,
        })
    }
}

/// One encrypted incremental update, bound to a snapshot and ordered by a
/// Lamport timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedUpdate {
    /// Content-derived id: base64 of sha256 over the ciphertext. Identical
    /// payloads get identical ids, which makes retransmission idempotent.
    pub id: String,
    pub snapshot_id: String,
    pub timestamp: LamportTimestamp,
    /// Ciphertext of a CRDT delta.
    pub payload: Vec<u8>,
    /// Assigned by the server on persistence; `None` until acknowledged.
    pub server_version: Option<u64>,
}

impl EncryptedUpdate {
    /// Build an update record for a fresh ciphertext, deriving its id.
    pub fn new(
        snapshot_id: impl Into<String>,
        timestamp: LamportTimestamp,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id: Self::content_id(&payload),
            snapshot_id: snapshot_id.into(),
            timestamp,
            payload,
            server_version: None,
        }
    }

    /// base64(sha256(payload)) — the idempotent update identifier.
    pub fn content_id(payload: &[u8]) -> String {
        BASE64.encode(Sha256::digest(payload))
    }

    /// Key under which a client tracks this update: `{snapshotId}:{c}-{n}`.
    pub fn update_key(&self) -> String {
        format!("{}:{}", self.snapshot_id, self.timestamp)
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        write_string(buf, &self.id);
        write_string(buf, &self.snapshot_id);
        write_varuint(buf, u64::from(self.timestamp.client_id));
        write_varuint(buf, self.timestamp.counter);
        // 0 encodes "not yet assigned"; stamping starts at 1.
        write_varuint(buf, self.server_version.unwrap_or(0));
        write_bytes(buf, &self.payload);
    }

    fn decode_from(reader: &mut Reader<'_>) -> ProtocolResult<Self> {
        let id = reader.string("update id")?;
        let snapshot_id = reader.string("update snapshot id")?;
        let at = reader.position();
        let client_id = reader.varuint("update client id")?;
        let client_id = u32::try_from(client_id)
            .map_err(|_| ProtocolError::codec("update client id exceeds u32", at))?;
        let counter = reader.varuint("update counter")?;
        let server_version = reader.varuint("update server version")?;
        let payload = reader.bytes("update payload")?.to_vec();
        Ok(Self {
            id,
            snapshot_id,
            timestamp: LamportTimestamp::new(client_id, counter),
            payload,
            server_version: (server_version != 0).then_some(server_version),
        })
    }
}

/// Payload of an encrypted `doc.update`: either a batch of updates or a
/// whole snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptedPayload {
    Updates(Vec<EncryptedUpdate>),
    Snapshot(Snapshot),
}

impl EncryptedPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            EncryptedPayload::Updates(updates) => {
                buf.push(kind::UPDATES);
                write_varuint(&mut buf, updates.len() as u64);
                for update in updates {
                    update.encode_into(&mut buf);
                }
            }
            EncryptedPayload::Snapshot(snapshot) => {
                buf.push(kind::SNAPSHOT);
                snapshot.encode_into(&mut buf);
            }
        }
        buf
    }

    pub fn decode(data: &[u8]) -> ProtocolResult<Self> {
        let mut reader = Reader::new(data);
        let at = reader.position();
        match reader.u8("payload kind")? {
            kind::UPDATES => {
                let count = reader.varuint("update count")? as usize;
                let mut updates = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    updates.push(EncryptedUpdate::decode_from(&mut reader)?);
                }
                reader.expect_end("encrypted updates")?;
                Ok(EncryptedPayload::Updates(updates))
            }
            kind::SNAPSHOT => {
                let snapshot = Snapshot::decode_from(&mut reader)?;
                reader.expect_end("encrypted snapshot")?;
                Ok(EncryptedPayload::Snapshot(snapshot))
            }
            kind::LEGACY_CLOCK_MAP => Err(ProtocolError::UnsupportedSchema {
                kind: kind::LEGACY_CLOCK_MAP,
            }),
            other => Err(ProtocolError::codec(
                format!("unknown encrypted payload kind {other}"),
                at,
            )),
        }
    }
}

/// Payload of an encrypted sync-step-2: the active snapshot (when the peer
/// is behind a snapshot boundary) plus the update suffix it is missing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncStep2Payload {
    pub snapshot: Option<Snapshot>,
    pub updates: Vec<EncryptedUpdate>,
}

impl SyncStep2Payload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(ENCODING_VERSION);
        match &self.snapshot {
            Some(snapshot) => {
                buf.push(1);
                snapshot.encode_into(&mut buf);
            }
            None => buf.push(0),
        }
        write_varuint(&mut buf, self.updates.len() as u64);
        for update in &self.updates {
            update.encode_into(&mut buf);
        }
        buf
    }

    pub fn decode(data: &[u8]) -> ProtocolResult<Self> {
        let mut reader = Reader::new(data);
        expect_version(&mut reader, "sync-step-2 payload")?;
        let at = reader.position();
        let snapshot = match reader.u8("snapshot marker")? {
            0 => None,
            1 => Some(Snapshot::decode_from(&mut reader)?),
            other => {
                return Err(ProtocolError::codec(
                    format!("invalid snapshot marker {other}"),
                    at,
                ));
            }
        };
        let count = reader.varuint("update count")? as usize;
        let mut updates = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            updates.push(EncryptedUpdate::decode_from(&mut reader)?);
        }
        reader.expect_end("sync-step-2 payload")?;
        Ok(Self { snapshot, updates })
    }
}

fn expect_version(reader: &mut Reader<'_>, what: &str) -> ProtocolResult<()> {
    let at = reader.position();
    let version = reader.u8("encoding version")?;
    if version != ENCODING_VERSION {
        return Err(ProtocolError::codec(
            format!("unknown {what} version {version}"),
            at,
        ));
    }
    Ok(())
}
