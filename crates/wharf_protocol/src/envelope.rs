//! Binary message envelope shared by clients and the server.
//!
//! # Wire Format
//!
//! Every frame begins with the three-byte magic `59 4A 53` and a protocol
//! version varuint (currently 1), followed by the length-prefixed document
//! id and a variant byte:
//!
//! ```text
//! [magic:3][version:varuint][docIdLen:varuint][docId:utf8]
//! [variant:u8][msgId:16]?[context]?[body…]
//! ```
//!
//! The low five bits of the variant byte select the message type; the high
//! bits flag optional envelope fields:
//!
//! - `0x80` — a context block `(clientId:varuint, lastEventId:string)` follows
//! - `0x40` — a 16-byte random message id follows (dedupe / ack correlation)
//! - `0x20` — the payload is an end-to-end encrypted blob
//!
//! The body runs to the end of the frame; there is no payload length prefix.
//! A frame with no flags set is the minimal form: magic, version, document
//! id, tag, body.
//!
//! Doc messages (`tag 0`) carry a sub-variant byte: sync-step-1, sync-step-2,
//! update, sync-done, auth-message. Awareness, ack, rpc, and the legacy file
//! tag are top-level variants.

use crate::error::{ProtocolError, ProtocolResult};
use crate::varint::{Reader, write_string, write_varuint};

/// Frame magic: `"YJS"`.
pub const MAGIC: [u8; 3] = [0x59, 0x4A, 0x53];

/// Current protocol version.
pub const PROTOCOL_VERSION: u64 = 1;

/// Random per-message identifier, used for dedupe and ack correlation.
pub type MessageId = [u8; 16];

/// Message variant tags (low five bits of the variant byte).
mod tag {
    pub const DOC: u8 = 0;
    pub const AWARENESS_UPDATE: u8 = 1;
    pub const AWARENESS_REQUEST: u8 = 2;
    pub const ACK: u8 = 3;
    pub const RPC: u8 = 4;
    pub const FILE_LEGACY: u8 = 5;
}

/// Doc sub-variant tags.
mod doc_tag {
    pub const SYNC_STEP_1: u8 = 0;
    pub const SYNC_STEP_2: u8 = 1;
    pub const UPDATE: u8 = 2;
    pub const SYNC_DONE: u8 = 3;
    pub const AUTH_MESSAGE: u8 = 4;
}

/// Envelope flag bits (high bits of the variant byte).
mod flag {
    pub const CONTEXT: u8 = 0x80;
    pub const MESSAGE_ID: u8 = 0x40;
    pub const ENCRYPTED: u8 = 0x20;
    pub const TAG_MASK: u8 = 0x1F;
}

/// Optional sender context carried in the envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContext {
    /// Logical client id of the sender.
    pub client_id: u32,
    /// Last event id the sender has observed (resume cursor).
    pub last_event_id: String,
}

/// Permission level reported in a `doc.auth-message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Denied,
    ReadOnly,
    Full,
}

impl Permission {
    fn to_byte(self) -> u8 {
        match self {
            Permission::Denied => 0,
            Permission::ReadOnly => 1,
            Permission::Full => 2,
        }
    }

    fn from_byte(byte: u8, position: usize) -> ProtocolResult<Self> {
        match byte {
            0 => Ok(Permission::Denied),
            1 => Ok(Permission::ReadOnly),
            2 => Ok(Permission::Full),
            other => Err(ProtocolError::codec(
                format!("unknown permission level {other}"),
                position,
            )),
        }
    }
}

/// Direction of an rpc message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcRequestType {
    Request,
    Response,
    Stream,
}

impl RpcRequestType {
    fn to_byte(self) -> u8 {
        match self {
            RpcRequestType::Request => 0,
            RpcRequestType::Response => 1,
            RpcRequestType::Stream => 2,
        }
    }

    fn from_byte(byte: u8, position: usize) -> ProtocolResult<Self> {
        match byte {
            0 => Ok(RpcRequestType::Request),
            1 => Ok(RpcRequestType::Response),
            2 => Ok(RpcRequestType::Stream),
            other => Err(ProtocolError::codec(
                format!("unknown rpc request type {other}"),
                position,
            )),
        }
    }
}

/// A named rpc call, response, or stream part. File transfer and milestone
/// operations are carried as rpc.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcMessage {
    pub method: String,
    pub request_type: RpcRequestType,
    /// Correlates responses and stream parts with their request.
    pub correlation_id: MessageId,
    pub payload: Vec<u8>,
}

/// Sub-variants of the legacy `file-*` tag, kept for wire compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileLegacyKind {
    Metadata,
    ChunkData,
    Auth,
}

impl FileLegacyKind {
    fn to_byte(self) -> u8 {
        match self {
            FileLegacyKind::Metadata => 0,
            FileLegacyKind::ChunkData => 1,
            FileLegacyKind::Auth => 2,
        }
    }

    fn from_byte(byte: u8, position: usize) -> ProtocolResult<Self> {
        match byte {
            0 => Ok(FileLegacyKind::Metadata),
            1 => Ok(FileLegacyKind::ChunkData),
            2 => Ok(FileLegacyKind::Auth),
            other => Err(ProtocolError::codec(
                format!("unknown file message kind {other}"),
                position,
            )),
        }
    }
}

/// Typed message body. The closed set of frame variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// State vector exchange, first half of the sync handshake. Opaque
    /// bytes: a CRDT state vector for plaintext documents, an encoded
    /// `(activeSnapshotId, serverVersion)` pair for encrypted ones.
    SyncStep1(Vec<u8>),
    /// Missing-updates response, second half of the handshake.
    SyncStep2(Vec<u8>),
    /// Incremental document update.
    Update(Vec<u8>),
    /// Handshake completion marker.
    SyncDone,
    /// In-band permission report; never raised as an error.
    AuthMessage {
        permission: Permission,
        /// Human-readable reason; `None` encodes as a zero length.
        reason: Option<String>,
    },
    /// Opaque presence payload, broadcast without persistence.
    AwarenessUpdate(Vec<u8>),
    /// Ask peers to re-send their awareness state.
    AwarenessRequest,
    /// Acknowledges receipt of the referenced message.
    Ack { message_id: MessageId },
    /// Named request/response/stream call.
    Rpc(RpcMessage),
    /// Legacy file-transfer frames, passed through opaquely.
    FileLegacy {
        kind: FileLegacyKind,
        payload: Vec<u8>,
    },
}

impl MessageBody {
    fn tag(&self) -> u8 {
        match self {
            MessageBody::SyncStep1(_)
            | MessageBody::SyncStep2(_)
            | MessageBody::Update(_)
            | MessageBody::SyncDone
            | MessageBody::AuthMessage { .. } => tag::DOC,
            MessageBody::AwarenessUpdate(_) => tag::AWARENESS_UPDATE,
            MessageBody::AwarenessRequest => tag::AWARENESS_REQUEST,
            MessageBody::Ack { .. } => tag::ACK,
            MessageBody::Rpc(_) => tag::RPC,
            MessageBody::FileLegacy { .. } => tag::FILE_LEGACY,
        }
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            MessageBody::SyncStep1(payload) => {
                buf.push(doc_tag::SYNC_STEP_1);
                buf.extend_from_slice(payload);
            }
            MessageBody::SyncStep2(payload) => {
                buf.push(doc_tag::SYNC_STEP_2);
                buf.extend_from_slice(payload);
            }
            MessageBody::Update(payload) => {
                buf.push(doc_tag::UPDATE);
                buf.extend_from_slice(payload);
            }
            MessageBody::SyncDone => {
                buf.push(doc_tag::SYNC_DONE);
            }
            MessageBody::AuthMessage { permission, reason } => {
                buf.push(doc_tag::AUTH_MESSAGE);
                buf.push(permission.to_byte());
                write_string(buf, reason.as_deref().unwrap_or(""));
            }
            MessageBody::AwarenessUpdate(payload) => {
                buf.extend_from_slice(payload);
            }
            MessageBody::AwarenessRequest => {}
            MessageBody::Ack { message_id } => {
                buf.extend_from_slice(message_id);
            }
            MessageBody::Rpc(rpc) => {
                write_string(buf, &rpc.method);
                buf.push(rpc.request_type.to_byte());
                buf.extend_from_slice(&rpc.correlation_id);
                buf.extend_from_slice(&rpc.payload);
            }
            MessageBody::FileLegacy { kind, payload } => {
                buf.push(kind.to_byte());
                buf.extend_from_slice(payload);
            }
        }
    }

    fn decode(tag_byte: u8, reader: &mut Reader<'_>) -> ProtocolResult<Self> {
        match tag_byte {
            tag::DOC => {
                let position = reader.position();
                let sub = reader.u8("doc sub-variant")?;
                match sub {
                    doc_tag::SYNC_STEP_1 => Ok(MessageBody::SyncStep1(reader.rest().to_vec())),
                    doc_tag::SYNC_STEP_2 => Ok(MessageBody::SyncStep2(reader.rest().to_vec())),
                    doc_tag::UPDATE => Ok(MessageBody::Update(reader.rest().to_vec())),
                    doc_tag::SYNC_DONE => {
                        reader.expect_end("sync-done")?;
                        Ok(MessageBody::SyncDone)
                    }
                    doc_tag::AUTH_MESSAGE => {
                        let at = reader.position();
                        let permission = Permission::from_byte(reader.u8("permission")?, at)?;
                        let reason = reader.string("auth reason")?;
                        reader.expect_end("auth-message")?;
                        Ok(MessageBody::AuthMessage {
                            permission,
                            reason: (!reason.is_empty()).then_some(reason),
                        })
                    }
                    other => Err(ProtocolError::codec(
                        format!("unknown doc sub-variant {other}"),
                        position,
                    )),
                }
            }
            tag::AWARENESS_UPDATE => Ok(MessageBody::AwarenessUpdate(reader.rest().to_vec())),
            tag::AWARENESS_REQUEST => {
                reader.expect_end("awareness-request")?;
                Ok(MessageBody::AwarenessRequest)
            }
            tag::ACK => {
                let bytes = reader.take(16, "ack message id")?;
                reader.expect_end("ack")?;
                let mut message_id = [0u8; 16];
                message_id.copy_from_slice(bytes);
                Ok(MessageBody::Ack { message_id })
            }
            tag::RPC => {
                let method = reader.string("rpc method")?;
                let at = reader.position();
                let request_type = RpcRequestType::from_byte(reader.u8("rpc request type")?, at)?;
                let mut correlation_id = [0u8; 16];
                correlation_id.copy_from_slice(reader.take(16, "rpc correlation id")?);
                Ok(MessageBody::Rpc(RpcMessage {
                    method,
                    request_type,
                    correlation_id,
                    payload: reader.rest().to_vec(),
                }))
            }
            tag::FILE_LEGACY => {
                let at = reader.position();
                let kind = FileLegacyKind::from_byte(reader.u8("file message kind")?, at)?;
                Ok(MessageBody::FileLegacy {
                    kind,
                    payload: reader.rest().to_vec(),
                })
            }
            other => Err(ProtocolError::UnknownVariant { tag: other }),
        }
    }
}

/// A decoded message frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Target document.
    pub document_id: String,
    /// Present when the sender wants dedupe and an ack.
    pub message_id: Option<MessageId>,
    /// Optional sender context.
    pub context: Option<MessageContext>,
    /// Whether the body payload is an end-to-end encrypted blob.
    pub encrypted: bool,
    pub body: MessageBody,
}

impl Envelope {
    /// Minimal envelope: no message id, no context, plaintext.
    pub fn new(document_id: impl Into<String>, body: MessageBody) -> Self {
        Self {
            document_id: document_id.into(),
            message_id: None,
            context: None,
            encrypted: false,
            body,
        }
    }

    /// Mark the payload as encrypted.
    pub fn encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }

    /// Attach a fresh random message id.
    pub fn with_fresh_message_id(mut self) -> Self {
        self.message_id = Some(rand::random());
        self
    }

    /// Attach a specific message id.
    pub fn with_message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = Some(message_id);
        self
    }

    /// Attach a sender context block.
    pub fn with_context(mut self, context: MessageContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Encode the envelope to a wire frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + self.document_id.len());
        buf.extend_from_slice(&MAGIC);
        write_varuint(&mut buf, PROTOCOL_VERSION);
        write_string(&mut buf, &self.document_id);

        let mut variant = self.body.tag();
        if self.context.is_some() {
            variant |= flag::CONTEXT;
        }
        if self.message_id.is_some() {
            variant |= flag::MESSAGE_ID;
        }
        if self.encrypted {
            variant |= flag::ENCRYPTED;
        }
        buf.push(variant);

        if let Some(message_id) = &self.message_id {
            buf.extend_from_slice(message_id);
        }
        if let Some(context) = &self.context {
            write_varuint(&mut buf, u64::from(context.client_id));
            write_string(&mut buf, &context.last_event_id);
        }

        self.body.encode_into(&mut buf);
        buf
    }

    /// Decode a wire frame.
    pub fn decode(data: &[u8]) -> ProtocolResult<Self> {
        let mut reader = Reader::new(data);

        let magic = reader.take(3, "magic")?;
        if magic != MAGIC {
            return Err(ProtocolError::codec("bad magic", 0));
        }
        let version_at = reader.position();
        let version = reader.varuint("protocol version")?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::codec(
                format!("unsupported protocol version {version}"),
                version_at,
            ));
        }

        let document_id = reader.string("document id")?;
        let variant = reader.u8("variant")?;
        let tag_byte = variant & flag::TAG_MASK;

        let message_id = if variant & flag::MESSAGE_ID != 0 {
            let mut id = [0u8; 16];
            id.copy_from_slice(reader.take(16, "message id")?);
            Some(id)
        } else {
            None
        };

        let context = if variant & flag::CONTEXT != 0 {
            let client_at = reader.position();
            let client_id = reader.varuint("context client id")?;
            let client_id = u32::try_from(client_id).map_err(|_| {
                ProtocolError::codec("context client id exceeds u32", client_at)
            })?;
            let last_event_id = reader.string("context last event id")?;
            Some(MessageContext {
                client_id,
                last_event_id,
            })
        } else {
            None
        };

        let body = MessageBody::decode(tag_byte, &mut reader)?;

        Ok(Envelope {
            document_id,
            message_id,
            context,
            encrypted: variant & flag::ENCRYPTED != 0,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Golden frames observed from round-trip samples; byte-for-byte.
    #[test]
    fn test_golden_awareness_update() {
        let envelope = Envelope::new("test", MessageBody::AwarenessUpdate(vec![0, 1, 2, 3]));
        assert_eq!(
            envelope.encode(),
            vec![0x59, 0x4A, 0x53, 0x01, 0x04, 0x74, 0x65, 0x73, 0x74, 0x01, 0x00, 0x01, 0x02, 0x03]
        );
        assert_eq!(Envelope::decode(&envelope.encode()).unwrap(), envelope);
    }

    #[test]
    fn test_golden_sync_step_1() {
        let envelope = Envelope::new("test", MessageBody::SyncStep1(vec![0, 1, 2, 3]));
        assert_eq!(
            envelope.encode(),
            vec![
                0x59, 0x4A, 0x53, 0x01, 0x04, 0x74, 0x65, 0x73, 0x74, 0x00, 0x00, 0x00, 0x01,
                0x02, 0x03
            ]
        );
    }

    #[test]
    fn test_golden_sync_step_2_and_update_subtags() {
        let step2 = Envelope::new("test", MessageBody::SyncStep2(vec![0, 1, 2, 3])).encode();
        // After magic, version, doc id: variant 0x00, sub-variant 0x01, payload.
        assert_eq!(&step2[9..], &[0x01, 0x00, 0x01, 0x02, 0x03]);

        let update = Envelope::new("test", MessageBody::Update(vec![0, 1, 2, 3])).encode();
        assert_eq!(&update[9..], &[0x02, 0x00, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_message_id_and_context_flags() {
        let envelope = Envelope::new("doc-1", MessageBody::Update(vec![9, 9]))
            .encrypted()
            .with_message_id([7u8; 16])
            .with_context(MessageContext {
                client_id: 42,
                last_event_id: "evt-12".to_string(),
            });

        let decoded = Envelope::decode(&envelope.encode()).unwrap();
        assert_eq!(decoded, envelope);
        assert!(decoded.encrypted);
        assert_eq!(decoded.message_id, Some([7u8; 16]));
        assert_eq!(decoded.context.unwrap().client_id, 42);
    }

    #[test]
    fn test_sync_done_roundtrip() {
        let envelope = Envelope::new("d", MessageBody::SyncDone);
        assert_eq!(Envelope::decode(&envelope.encode()).unwrap(), envelope);
    }

    #[test]
    fn test_auth_message_roundtrip() {
        let envelope = Envelope::new(
            "d",
            MessageBody::AuthMessage {
                permission: Permission::Denied,
                reason: Some("read-only token".to_string()),
            },
        );
        assert_eq!(Envelope::decode(&envelope.encode()).unwrap(), envelope);

        let no_reason = Envelope::new(
            "d",
            MessageBody::AuthMessage {
                permission: Permission::Full,
                reason: None,
            },
        );
        assert_eq!(Envelope::decode(&no_reason.encode()).unwrap(), no_reason);
    }

    #[test]
    fn test_ack_roundtrip() {
        let envelope = Envelope::new(
            "d",
            MessageBody::Ack {
                message_id: [0xAB; 16],
            },
        );
        assert_eq!(Envelope::decode(&envelope.encode()).unwrap(), envelope);
    }

    #[test]
    fn test_rpc_roundtrip() {
        let envelope = Envelope::new(
            "d",
            MessageBody::Rpc(RpcMessage {
                method: "file.upload".to_string(),
                request_type: RpcRequestType::Request,
                correlation_id: [3u8; 16],
                payload: vec![1, 2, 3],
            }),
        );
        assert_eq!(Envelope::decode(&envelope.encode()).unwrap(), envelope);
    }

    #[test]
    fn test_file_legacy_roundtrip() {
        let envelope = Envelope::new(
            "d",
            MessageBody::FileLegacy {
                kind: FileLegacyKind::ChunkData,
                payload: vec![0xDE, 0xAD],
            },
        );
        assert_eq!(Envelope::decode(&envelope.encode()).unwrap(), envelope);
    }

    #[test]
    fn test_bad_magic() {
        let err = Envelope::decode(&[0x00, 0x4A, 0x53, 0x01, 0x00, 0x00, 0x00]).unwrap_err();
        assert!(matches!(err, ProtocolError::Codec { position: 0, .. }));
    }

    #[test]
    fn test_unknown_version() {
        let mut frame = Envelope::new("d", MessageBody::SyncDone).encode();
        frame[3] = 0x7F;
        let err = Envelope::decode(&frame).unwrap_err();
        assert!(matches!(err, ProtocolError::Codec { position: 3, .. }));
    }

    #[test]
    fn test_unknown_variant_tag() {
        let mut buf = vec![0x59, 0x4A, 0x53, 0x01, 0x01, b'd'];
        buf.push(0x1E); // tag 30, no flags
        let err = Envelope::decode(&buf).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownVariant { tag: 0x1E });
    }

    #[test]
    fn test_truncated_frame() {
        let frame = Envelope::new("doc", MessageBody::Ack {
            message_id: [1u8; 16],
        })
        .encode();
        let err = Envelope::decode(&frame[..frame.len() - 4]).unwrap_err();
        assert!(matches!(err, ProtocolError::Codec { .. }));
    }

    #[test]
    fn test_doc_id_length_exceeding_buffer() {
        // docIdLen claims 100 bytes but the buffer ends early.
        let buf = vec![0x59, 0x4A, 0x53, 0x01, 0x64, b'a', b'b'];
        let err = Envelope::decode(&buf).unwrap_err();
        assert!(matches!(err, ProtocolError::Codec { .. }));
    }

    #[test]
    fn test_fresh_message_ids_differ() {
        let a = Envelope::new("d", MessageBody::SyncDone).with_fresh_message_id();
        let b = Envelope::new("d", MessageBody::SyncDone).with_fresh_message_id();
        assert_ne!(a.message_id, b.message_id);
    }
}
