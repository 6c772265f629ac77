//! End-to-end flows between the client engine and the encrypted document
//! storage, without a dispatcher in between.

use std::sync::{Arc, Mutex};

use wharf_client::{AesGcmCipher, ClientConfig, ClientEvent, EncryptedDocClient};
use wharf_protocol::{EncryptedPayload, MessageBody};
use wharf_storage::{EncryptedDocumentStorage, MemoryStore, StorageConfig, StorageError};
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, Text, Transact, Update};

/// A stand-in for the application's own document: produces incremental
/// plaintext updates the way an editor binding would.
struct Editor {
    doc: Doc,
}

impl Editor {
    fn new() -> Self {
        Self { doc: Doc::new() }
    }

    fn insert(&self, at: u32, content: &str) -> Vec<u8> {
        let before = self.doc.transact().state_vector();
        let text = self.doc.get_or_insert_text("body");
        {
            let mut txn = self.doc.transact_mut();
            text.insert(&mut txn, at, content);
        }
        self.doc.transact().encode_state_as_update_v1(&before)
    }
}

fn text_of(state: &[u8]) -> String {
    let doc = Doc::new();
    let text = doc.get_or_insert_text("body");
    {
        let mut txn = doc.transact_mut();
        txn.apply_update(Update::decode_v1(state).unwrap()).unwrap();
    }
    let txn = doc.transact();
    text.get_string(&txn)
}

fn cipher() -> Arc<AesGcmCipher> {
    Arc::new(AesGcmCipher::new([9u8; 32]))
}

fn client(id: u32, cipher: Arc<AesGcmCipher>) -> EncryptedDocClient {
    EncryptedDocClient::new(
        "doc-1",
        cipher,
        ClientConfig::new(id).with_snapshot_interval_ms(0),
    )
}

fn storage() -> EncryptedDocumentStorage {
    EncryptedDocumentStorage::new(Arc::new(MemoryStore::new()), StorageConfig::default())
}

fn update_payload(envelope: &wharf_protocol::Envelope) -> &[u8] {
    match &envelope.body {
        MessageBody::Update(payload) => payload,
        other => panic!("expected doc.update, got {other:?}"),
    }
}

fn capture_events(client: &EncryptedDocClient) -> Arc<Mutex<Vec<ClientEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    client.on(move |event| sink.lock().unwrap().push(event.clone()));
    events
}

/// The full write path: snapshot, update, acknowledgement, then a fresh
/// client converging from storage.
#[tokio::test]
async fn test_encrypted_ack_loop() {
    let cipher = cipher();
    let storage = storage();
    let a = client(1, cipher.clone());
    let a_events = capture_events(&a);
    let editor = Editor::new();

    // First edit promotes to a snapshot.
    let snapshot_msg = a.apply_local_update(&editor.insert(0, "hello")).await.unwrap();
    assert!(snapshot_msg.encrypted);
    storage
        .handle_encrypted_update("doc-1", update_payload(&snapshot_msg))
        .await
        .unwrap();

    // Second edit is a pending update until the server stamps it.
    let update_msg = a.apply_local_update(&editor.insert(5, " world")).await.unwrap();
    assert_eq!(a.pending_update_count().await, 1);
    let stamped = storage
        .handle_encrypted_update("doc-1", update_payload(&update_msg))
        .await
        .unwrap();

    // The stamped re-emission acknowledges the pending update.
    a.handle_update(&stamped).await.unwrap();
    assert_eq!(a.pending_update_count().await, 0);
    assert_eq!(a.server_version().await, 1);
    let snapshot_id = a.active_snapshot_id().await.unwrap();
    assert!(a_events.lock().unwrap().iter().any(|e| matches!(
        e,
        ClientEvent::UpdateAcknowledged { snapshot_id: s, server_version: 1 } if *s == snapshot_id
    )));

    // Fresh client B syncs from zero and converges.
    let b = client(2, cipher);
    let start = b.start().await;
    let MessageBody::SyncStep1(sv) = &start.body else {
        panic!("expected sync-step-1");
    };
    let reply = storage.handle_sync_step_1("doc-1", sv).await.unwrap();
    let follow_up = b.handle_sync_step_2(&reply.encode()).await.unwrap();

    assert_eq!(text_of(&b.full_state().await), "hello world");
    // The compaction snapshot started a fresh generation for B.
    assert_eq!(b.server_version().await, 0);

    // Snapshot + updates in one step-2 triggers a compaction snapshot,
    // which the server can install as the new flattened active state.
    let follow_up = follow_up.expect("initial sync should emit a compaction snapshot");
    storage
        .handle_encrypted_update("doc-1", update_payload(&follow_up))
        .await
        .unwrap();
    let meta = storage.metadata("doc-1").await.unwrap().unwrap();
    assert_eq!(
        meta.active_snapshot_id.as_deref(),
        Some(b.active_snapshot_id().await.unwrap().as_str())
    );
}

/// Replaying one client's full message sequence into a fresh client yields
/// the same replica state.
#[tokio::test]
async fn test_convergence_from_replay() {
    let cipher = cipher();
    let a = client(1, cipher.clone());
    let editor = Editor::new();

    let mut messages = Vec::new();
    messages.push(a.apply_local_update(&editor.insert(0, "abc")).await.unwrap());
    messages.push(a.apply_local_update(&editor.insert(3, "def")).await.unwrap());
    messages.push(a.apply_local_update(&editor.insert(0, "<<")).await.unwrap());

    let b = client(2, cipher);
    for message in &messages {
        b.handle_update(update_payload(message)).await.unwrap();
    }

    assert_eq!(b.full_state().await, a.full_state().await);
    assert_eq!(text_of(&b.full_state().await), "<<abcdef");
}

/// An update is applied exactly once no matter how often it arrives.
#[tokio::test]
async fn test_duplicate_updates_applied_once() {
    let cipher = cipher();
    let a = client(1, cipher.clone());
    let b = client(2, cipher);
    let editor = Editor::new();

    let snapshot_msg = a.apply_local_update(&editor.insert(0, "x")).await.unwrap();
    b.handle_update(update_payload(&snapshot_msg)).await.unwrap();

    let update_msg = a.apply_local_update(&editor.insert(1, "y")).await.unwrap();
    for _ in 0..3 {
        b.handle_update(update_payload(&update_msg)).await.unwrap();
    }
    assert_eq!(text_of(&b.full_state().await), "xy");
}

/// Updates for a snapshot we have not adopted yet queue and replay when it
/// lands.
#[tokio::test]
async fn test_foreign_snapshot_updates_queue_until_adoption() {
    let cipher = cipher();
    let a = client(1, cipher.clone());
    let b = client(2, cipher);
    let editor = Editor::new();

    let snapshot_msg = a.apply_local_update(&editor.insert(0, "base")).await.unwrap();
    let update_msg = a.apply_local_update(&editor.insert(4, "+more")).await.unwrap();

    // B sees the update first: nothing applies yet.
    b.handle_update(update_payload(&update_msg)).await.unwrap();
    assert_eq!(text_of(&b.full_state().await), "");

    // The snapshot arrives; the queued update replays on top of it.
    b.handle_update(update_payload(&snapshot_msg)).await.unwrap();
    assert_eq!(text_of(&b.full_state().await), "base+more");
}

/// sync-step-1 answering: a peer with no snapshot gets ours; a peer on the
/// same snapshot gets our pending updates.
#[tokio::test]
async fn test_handle_sync_step_1_peer_variants() {
    let cipher = cipher();
    let a = client(1, cipher.clone());
    let editor = Editor::new();
    a.apply_local_update(&editor.insert(0, "seed")).await.unwrap();
    a.apply_local_update(&editor.insert(4, "ling")).await.unwrap();
    let snapshot_id = a.active_snapshot_id().await.unwrap();

    // Empty peer: gets the active snapshot.
    let fresh = wharf_protocol::EncryptedStateVector::new("", 0).encode();
    let reply = a.handle_sync_step_1(&fresh).await.unwrap();
    let MessageBody::SyncStep2(bytes) = &reply.body else {
        panic!("expected sync-step-2");
    };
    let payload = wharf_protocol::SyncStep2Payload::decode(bytes).unwrap();
    assert_eq!(payload.snapshot.unwrap().id, snapshot_id);

    // Same-snapshot peer: gets the pending updates instead.
    let caught_up = wharf_protocol::EncryptedStateVector::new(snapshot_id.clone(), 0).encode();
    let reply = a.handle_sync_step_1(&caught_up).await.unwrap();
    let MessageBody::SyncStep2(bytes) = &reply.body else {
        panic!("expected sync-step-2");
    };
    let payload = wharf_protocol::SyncStep2Payload::decode(bytes).unwrap();
    assert!(payload.snapshot.is_none());
    assert_eq!(payload.updates.len(), 1);
    assert_eq!(payload.updates[0].snapshot_id, snapshot_id);
}

/// A stale client's update is rejected by storage; re-syncing recovers.
#[tokio::test]
async fn test_stale_client_recovers_via_resync() {
    let cipher = cipher();
    let storage = storage();
    let a = client(1, cipher.clone());
    let b = client(2, cipher);
    let editor_a = Editor::new();
    let editor_b = Editor::new();

    let msg = a.apply_local_update(&editor_a.insert(0, "from-a")).await.unwrap();
    storage
        .handle_encrypted_update("doc-1", update_payload(&msg))
        .await
        .unwrap();

    // B never synced; its first edit creates a competing snapshot which
    // replaces A's as active.
    let msg = b.apply_local_update(&editor_b.insert(0, "from-b")).await.unwrap();
    storage
        .handle_encrypted_update("doc-1", update_payload(&msg))
        .await
        .unwrap();

    // A's next update references the replaced snapshot and is rejected.
    let msg = a.apply_local_update(&editor_a.insert(6, "!")).await.unwrap();
    let err = storage
        .handle_encrypted_update("doc-1", update_payload(&msg))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::StaleSnapshot { .. }));

    // A re-syncs: adopts B's snapshot, then its local content can be
    // re-snapshotted on top.
    let start = a.start().await;
    let MessageBody::SyncStep1(sv) = &start.body else {
        panic!("expected sync-step-1");
    };
    let reply = storage.handle_sync_step_1("doc-1", sv).await.unwrap();
    a.handle_sync_step_2(&reply.encode()).await.unwrap();
    assert_eq!(
        a.active_snapshot_id().await,
        b.active_snapshot_id().await,
        "A adopted the active snapshot"
    );
    assert!(text_of(&a.full_state().await).contains("from-b"));
}

/// Encrypted awareness passes through opaquely.
#[tokio::test]
async fn test_awareness_roundtrip() {
    let cipher = cipher();
    let a = client(1, cipher.clone());
    let b = client(2, cipher);
    let b_events = capture_events(&b);

    let envelope = a.awareness_message(b"cursor:5").await.unwrap();
    let MessageBody::AwarenessUpdate(payload) = &envelope.body else {
        panic!("expected awareness-update");
    };
    assert_ne!(payload.as_slice(), b"cursor:5", "payload is encrypted");

    b.handle_awareness_update(payload).await.unwrap();
    assert!(b_events.lock().unwrap().iter().any(|e| matches!(
        e,
        ClientEvent::AwarenessUpdate { payload } if payload == b"cursor:5"
    )));
}

/// Periodic compaction emits exactly one snapshot for drifted state and
/// stays quiet while nothing changes.
#[tokio::test]
async fn test_periodic_snapshot_single_fire() {
    let cipher = cipher();
    let client = EncryptedDocClient::new(
        "doc-1",
        cipher,
        ClientConfig::new(1).with_snapshot_interval_ms(20),
    );
    let events = capture_events(&client);
    let editor = Editor::new();

    // First edit installs the initial snapshot; the second leaves the
    // replica ahead of it.
    client.apply_local_update(&editor.insert(0, "a")).await.unwrap();
    client.apply_local_update(&editor.insert(1, "b")).await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(35)).await;
    let sent = |events: &Arc<Mutex<Vec<ClientEvent>>>| {
        events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, ClientEvent::SendMessage { .. }))
            .count()
    };
    assert_eq!(sent(&events), 1, "exactly one compaction snapshot");

    // No further edits: no further snapshots.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(sent(&events), 1);

    // The emitted message carries a snapshot payload.
    let snapshot_ok = events.lock().unwrap().iter().any(|e| {
        matches!(e, ClientEvent::SendMessage { envelope }
            if matches!(&envelope.body, MessageBody::Update(p)
                if matches!(EncryptedPayload::decode(p), Ok(EncryptedPayload::Snapshot(_)))))
    });
    assert!(snapshot_ok);
    client.destroy();
}
