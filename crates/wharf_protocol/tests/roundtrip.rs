//! Property tests: `decode(encode(m)) == m` over the whole variant set.

use proptest::prelude::*;
use wharf_protocol::{
    EncryptedPayload, EncryptedStateVector, EncryptedUpdate, Envelope, FileLegacyKind,
    LamportTimestamp, MessageBody, MessageContext, Permission, RpcMessage, RpcRequestType,
    Snapshot, SyncStep2Payload,
};

fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..256)
}

fn doc_id_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9:_/-]{1,32}"
}

fn message_id_strategy() -> impl Strategy<Value = [u8; 16]> {
    any::<[u8; 16]>()
}

fn permission_strategy() -> impl Strategy<Value = Permission> {
    prop_oneof![
        Just(Permission::Denied),
        Just(Permission::ReadOnly),
        Just(Permission::Full),
    ]
}

fn body_strategy() -> impl Strategy<Value = MessageBody> {
    prop_oneof![
        payload_strategy().prop_map(MessageBody::SyncStep1),
        payload_strategy().prop_map(MessageBody::SyncStep2),
        payload_strategy().prop_map(MessageBody::Update),
        Just(MessageBody::SyncDone),
        (permission_strategy(), prop::option::of("[ -~]{1,40}")).prop_map(
            |(permission, reason)| MessageBody::AuthMessage { permission, reason }
        ),
        payload_strategy().prop_map(MessageBody::AwarenessUpdate),
        Just(MessageBody::AwarenessRequest),
        message_id_strategy().prop_map(|message_id| MessageBody::Ack { message_id }),
        (
            "[a-z.]{1,24}",
            prop_oneof![
                Just(RpcRequestType::Request),
                Just(RpcRequestType::Response),
                Just(RpcRequestType::Stream)
            ],
            message_id_strategy(),
            payload_strategy()
        )
            .prop_map(|(method, request_type, correlation_id, payload)| {
                MessageBody::Rpc(RpcMessage {
                    method,
                    request_type,
                    correlation_id,
                    payload,
                })
            }),
        (
            prop_oneof![
                Just(FileLegacyKind::Metadata),
                Just(FileLegacyKind::ChunkData),
                Just(FileLegacyKind::Auth)
            ],
            payload_strategy()
        )
            .prop_map(|(kind, payload)| MessageBody::FileLegacy { kind, payload }),
    ]
}

fn envelope_strategy() -> impl Strategy<Value = Envelope> {
    (
        doc_id_strategy(),
        body_strategy(),
        prop::option::of(message_id_strategy()),
        prop::option::of((any::<u32>(), "[ -~]{0,24}")),
        any::<bool>(),
    )
        .prop_map(|(document_id, body, message_id, context, encrypted)| {
            let mut envelope = Envelope::new(document_id, body);
            envelope.message_id = message_id;
            envelope.context = context.map(|(client_id, last_event_id)| MessageContext {
                client_id,
                last_event_id,
            });
            envelope.encrypted = encrypted;
            envelope
        })
}

fn encrypted_update_strategy() -> impl Strategy<Value = EncryptedUpdate> {
    (
        "[a-f0-9-]{1,36}",
        any::<u32>(),
        1u64..u64::MAX / 2,
        payload_strategy(),
        prop::option::of(1u64..u64::MAX / 2),
    )
        .prop_map(|(snapshot_id, client_id, counter, payload, server_version)| {
            let mut update = EncryptedUpdate::new(
                snapshot_id,
                LamportTimestamp::new(client_id, counter),
                payload,
            );
            update.server_version = server_version;
            update
        })
}

fn snapshot_strategy() -> impl Strategy<Value = Snapshot> {
    (
        "[a-f0-9-]{1,36}",
        prop::option::of("[a-f0-9-]{1,36}"),
        payload_strategy(),
    )
        .prop_map(|(id, parent_snapshot_id, payload)| Snapshot {
            id,
            parent_snapshot_id,
            payload,
        })
}

proptest! {
    #[test]
    fn envelope_roundtrip(envelope in envelope_strategy()) {
        let decoded = Envelope::decode(&envelope.encode()).unwrap();
        prop_assert_eq!(decoded, envelope);
    }

    #[test]
    fn state_vector_roundtrip(snapshot_id in "[a-f0-9-]{0,36}", server_version in any::<u64>()) {
        let sv = EncryptedStateVector::new(snapshot_id, server_version);
        prop_assert_eq!(EncryptedStateVector::decode(&sv.encode()).unwrap(), sv);
    }

    #[test]
    fn encrypted_updates_roundtrip(updates in prop::collection::vec(encrypted_update_strategy(), 0..8)) {
        let payload = EncryptedPayload::Updates(updates);
        prop_assert_eq!(EncryptedPayload::decode(&payload.encode()).unwrap(), payload);
    }

    #[test]
    fn encrypted_snapshot_roundtrip(snapshot in snapshot_strategy()) {
        let payload = EncryptedPayload::Snapshot(snapshot);
        prop_assert_eq!(EncryptedPayload::decode(&payload.encode()).unwrap(), payload);
    }

    #[test]
    fn sync_step_2_roundtrip(
        snapshot in prop::option::of(snapshot_strategy()),
        updates in prop::collection::vec(encrypted_update_strategy(), 0..8),
    ) {
        let payload = SyncStep2Payload { snapshot, updates };
        prop_assert_eq!(SyncStep2Payload::decode(&payload.encode()).unwrap(), payload);
    }

    /// Decoding arbitrary bytes never panics; it returns a message or an error.
    #[test]
    fn decode_arbitrary_bytes_never_panics(data in prop::collection::vec(any::<u8>(), 0..128)) {
        let _ = Envelope::decode(&data);
        let _ = EncryptedPayload::decode(&data);
        let _ = SyncStep2Payload::decode(&data);
        let _ = EncryptedStateVector::decode(&data);
    }
}
