//! The encrypted-document client engine.
//!
//! Owns a local CRDT replica plus the bookkeeping that makes end-to-end
//! encryption workable against a server that only sees ciphertext:
//!
//! - a Lamport clock ordering this replica's updates within the active
//!   snapshot,
//! - a pending log of local updates awaiting their server version,
//! - a seen set so no `(snapshotId, timestamp)` is ever applied twice,
//! - a queue of updates that arrived for a snapshot we have not adopted
//!   yet, replayed the moment that snapshot lands.
//!
//! Sync follows the usual two-step handshake, except the state vector and
//! update payloads are the encrypted flavor: the client tells the server
//! `(activeSnapshotId, serverVersion)` and gets back an opaque snapshot
//! (when it is behind a snapshot boundary) plus the update suffix.
//!
//! A periodic timer compacts the delta log: when the replica state has
//! drifted from the active snapshot's content, the engine emits a fresh
//! snapshot through the `send-message` observation. An unchanged state
//! emits nothing.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use wharf_protocol::{
    EncryptedPayload, EncryptedStateVector, EncryptedUpdate, Envelope, LamportClock, MessageBody,
    Snapshot, SyncStep2Payload,
};

use crate::cipher::DocumentCipher;
use crate::error::{ClientError, ClientResult};
use crate::events::{ClientEvent, EventObservers, SubscriptionId};

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Logical client id for the Lamport clock.
    pub client_id: u32,
    /// Compaction-snapshot interval; 0 disables the timer.
    pub snapshot_interval_ms: u64,
    /// Updates decrypted per batch before yielding to the scheduler.
    pub decrypt_batch_size: usize,
}

impl ClientConfig {
    pub fn new(client_id: u32) -> Self {
        Self {
            client_id,
            snapshot_interval_ms: 300_000,
            decrypt_batch_size: 100,
        }
    }

    pub fn with_snapshot_interval_ms(mut self, interval_ms: u64) -> Self {
        self.snapshot_interval_ms = interval_ms;
        self
    }
}

struct Inner {
    doc: Doc,
    clock: LamportClock,
    /// Active snapshot in ciphertext form, re-served to peers that hold none.
    active_snapshot: Option<Snapshot>,
    /// Canonical plaintext state at snapshot time; the no-op detector for
    /// periodic compaction.
    active_plaintext: Option<Vec<u8>>,
    server_version: u64,
    /// Local updates awaiting their server version, by update key.
    pending_updates: HashMap<String, EncryptedUpdate>,
    /// Update keys already applied, per snapshot.
    seen_updates: HashMap<String, HashSet<String>>,
    /// Updates for snapshots we have not adopted yet, replayed on adoption.
    queued_updates: HashMap<String, Vec<EncryptedUpdate>>,
}

impl Inner {
    fn active_snapshot_id(&self) -> String {
        self.active_snapshot
            .as_ref()
            .map(|s| s.id.clone())
            .unwrap_or_default()
    }
}

fn full_state(doc: &Doc) -> Vec<u8> {
    doc.transact()
        .encode_state_as_update_v1(&StateVector::default())
}

/// Re-encode a state update through a fresh replica so byte comparison is
/// stable regardless of where the bytes came from.
fn canonicalize(state: &[u8]) -> ClientResult<Vec<u8>> {
    let doc = Doc::new();
    apply_plaintext(&doc, state)?;
    Ok(full_state(&doc))
}

fn apply_plaintext(doc: &Doc, update: &[u8]) -> ClientResult<()> {
    if update.is_empty() {
        return Ok(());
    }
    let decoded =
        Update::decode_v1(update).map_err(|e| ClientError::Crdt(format!("decode: {e}")))?;
    let mut txn = doc.transact_mut();
    txn.apply_update(decoded)
        .map_err(|e| ClientError::Crdt(format!("apply: {e}")))?;
    Ok(())
}

/// Client engine for one encrypted document.
pub struct EncryptedDocClient {
    document_id: String,
    config: ClientConfig,
    cipher: Arc<dyn DocumentCipher>,
    observers: Arc<EventObservers>,
    inner: Arc<Mutex<Inner>>,
    snapshot_timer: StdMutex<Option<JoinHandle<()>>>,
}

impl EncryptedDocClient {
    pub fn new(
        document_id: impl Into<String>,
        cipher: Arc<dyn DocumentCipher>,
        config: ClientConfig,
    ) -> Self {
        let inner = Inner {
            doc: Doc::new(),
            clock: LamportClock::new(config.client_id),
            active_snapshot: None,
            active_plaintext: None,
            server_version: 0,
            pending_updates: HashMap::new(),
            seen_updates: HashMap::new(),
            queued_updates: HashMap::new(),
        };
        let client = Self {
            document_id: document_id.into(),
            config,
            cipher,
            observers: Arc::new(EventObservers::new()),
            inner: Arc::new(Mutex::new(inner)),
            snapshot_timer: StdMutex::new(None),
        };
        client.restart_snapshot_timer();
        client
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Subscribe to engine observations.
    pub fn on(
        &self,
        callback: impl Fn(&ClientEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.observers.on(callback)
    }

    pub fn off(&self, id: SubscriptionId) {
        self.observers.off(id);
    }

    /// Full replica state as one plaintext update.
    pub async fn full_state(&self) -> Vec<u8> {
        full_state(&self.inner.lock().await.doc)
    }

    pub async fn active_snapshot_id(&self) -> Option<String> {
        self.inner
            .lock()
            .await
            .active_snapshot
            .as_ref()
            .map(|s| s.id.clone())
    }

    pub async fn server_version(&self) -> u64 {
        self.inner.lock().await.server_version
    }

    pub async fn pending_update_count(&self) -> usize {
        self.inner.lock().await.pending_updates.len()
    }

    /// First message of a sync: our encrypted state vector.
    pub async fn start(&self) -> Envelope {
        let inner = self.inner.lock().await;
        let sv = EncryptedStateVector::new(inner.active_snapshot_id(), inner.server_version);
        Envelope::new(&self.document_id, MessageBody::SyncStep1(sv.encode()))
            .encrypted()
            .with_fresh_message_id()
    }

    /// Answer a peer's sync-step-1 with what we hold that it lacks.
    pub async fn handle_sync_step_1(&self, state_vector: &[u8]) -> ClientResult<Envelope> {
        let peer = EncryptedStateVector::decode(state_vector)?;
        let inner = self.inner.lock().await;

        let mut payload = SyncStep2Payload::default();
        if let Some(active) = &inner.active_snapshot {
            if peer.snapshot_id.is_empty() {
                payload.snapshot = Some(active.clone());
            } else if peer.snapshot_id == active.id {
                let mut pending: Vec<EncryptedUpdate> =
                    inner.pending_updates.values().cloned().collect();
                pending.sort_by_key(|u| u.timestamp);
                payload.updates = pending;
            }
        }

        Ok(
            Envelope::new(&self.document_id, MessageBody::SyncStep2(payload.encode()))
                .encrypted()
                .with_fresh_message_id(),
        )
    }

    /// Apply a sync-step-2 from the server.
    ///
    /// When the reply carried both a snapshot and trailing updates (an
    /// initial sync across a delta log), the engine answers with a fresh
    /// compaction snapshot so the server can persist a flattened state.
    pub async fn handle_sync_step_2(&self, payload: &[u8]) -> ClientResult<Option<Envelope>> {
        let payload = SyncStep2Payload::decode(payload)?;
        let had_snapshot = payload.snapshot.is_some();
        let had_updates = !payload.updates.is_empty();

        let mut inner = self.inner.lock().await;
        if let Some(snapshot) = payload.snapshot {
            self.apply_snapshot_inner(&mut inner, snapshot).await?;
        }
        self.apply_updates_inner(&mut inner, payload.updates).await?;

        if had_snapshot && had_updates {
            let snapshot = self.install_local_snapshot(&mut inner)?;
            debug!(
                document_id = %self.document_id,
                snapshot_id = %snapshot.id,
                "emitting post-sync compaction snapshot"
            );
            return Ok(Some(self.update_envelope(EncryptedPayload::Snapshot(snapshot))));
        }
        Ok(None)
    }

    /// Apply an incoming `doc.update` payload (snapshot or update batch).
    pub async fn handle_update(&self, payload: &[u8]) -> ClientResult<()> {
        let mut inner = self.inner.lock().await;
        match EncryptedPayload::decode(payload)? {
            EncryptedPayload::Snapshot(snapshot) => {
                self.apply_snapshot_inner(&mut inner, snapshot).await
            }
            EncryptedPayload::Updates(updates) => {
                self.apply_updates_inner(&mut inner, updates).await
            }
        }
    }

    /// Record a local plaintext edit and produce the message carrying it.
    ///
    /// The very first edit of a document has no snapshot to attach to, so
    /// it promotes the whole state into a snapshot message instead.
    pub async fn apply_local_update(&self, plain_update: &[u8]) -> ClientResult<Envelope> {
        let mut inner = self.inner.lock().await;
        apply_plaintext(&inner.doc, plain_update)?;

        if inner.active_snapshot.is_none() {
            let snapshot = self.install_local_snapshot(&mut inner)?;
            info!(
                document_id = %self.document_id,
                snapshot_id = %snapshot.id,
                "first edit promoted to snapshot"
            );
            return Ok(self.update_envelope(EncryptedPayload::Snapshot(snapshot)));
        }

        let snapshot_id = inner.active_snapshot_id();
        let ciphertext = self.cipher.encrypt(plain_update)?;
        let timestamp = inner.clock.tick();
        let update = EncryptedUpdate::new(snapshot_id.clone(), timestamp, ciphertext);
        let key = update.update_key();
        inner.pending_updates.insert(key.clone(), update.clone());
        inner
            .seen_updates
            .entry(snapshot_id)
            .or_default()
            .insert(key);

        Ok(self.update_envelope(EncryptedPayload::Updates(vec![update])))
    }

    /// Flatten the current state into a fresh snapshot and produce the
    /// message installing it server-side.
    pub async fn create_snapshot(&self) -> ClientResult<Envelope> {
        let mut inner = self.inner.lock().await;
        let snapshot = self.install_local_snapshot(&mut inner)?;
        Ok(self.update_envelope(EncryptedPayload::Snapshot(snapshot)))
    }

    /// Encrypt a presence payload for broadcast.
    pub async fn awareness_message(&self, plaintext: &[u8]) -> ClientResult<Envelope> {
        let ciphertext = self.cipher.encrypt(plaintext)?;
        Ok(
            Envelope::new(&self.document_id, MessageBody::AwarenessUpdate(ciphertext))
                .encrypted(),
        )
    }

    /// Decrypt a peer's presence payload and surface it.
    pub async fn handle_awareness_update(&self, payload: &[u8]) -> ClientResult<()> {
        let plaintext = self.cipher.decrypt(payload)?;
        self.observers
            .emit(&ClientEvent::AwarenessUpdate { payload: plaintext });
        Ok(())
    }

    /// A peer asked for our awareness state; the host answers.
    pub fn handle_awareness_request(&self) {
        self.observers.emit(&ClientEvent::AwarenessRequested);
    }

    /// Stop the periodic snapshot timer. In-flight work completes; the
    /// engine stays usable for synchronous draining.
    pub fn destroy(&self) {
        if let Some(handle) = self.snapshot_timer.lock().unwrap().take() {
            handle.abort();
        }
    }

    fn update_envelope(&self, payload: EncryptedPayload) -> Envelope {
        Envelope::new(&self.document_id, MessageBody::Update(payload.encode()))
            .encrypted()
            .with_fresh_message_id()
    }

    /// Adopt a snapshot: reset the generation-scoped state, apply the
    /// decrypted content, then replay any updates queued for it.
    async fn apply_snapshot_inner(
        &self,
        inner: &mut Inner,
        snapshot: Snapshot,
    ) -> ClientResult<()> {
        if inner.active_snapshot_id() == snapshot.id {
            debug!(snapshot_id = %snapshot.id, "snapshot already active");
            return Ok(());
        }

        let plaintext = self.cipher.decrypt(&snapshot.payload)?;
        apply_plaintext(&inner.doc, &plaintext)?;

        let queued = inner.queued_updates.remove(&snapshot.id).unwrap_or_default();
        inner.active_plaintext = Some(canonicalize(&plaintext)?);
        inner.active_snapshot = Some(snapshot.clone());
        inner.server_version = 0;
        inner.clock.reset();
        inner.pending_updates.clear();
        inner.seen_updates.clear();
        inner.queued_updates.clear();

        self.observers.emit(&ClientEvent::SnapshotStored {
            snapshot_id: snapshot.id.clone(),
        });
        self.restart_snapshot_timer();

        if !queued.is_empty() {
            debug!(
                snapshot_id = %snapshot.id,
                count = queued.len(),
                "replaying queued updates"
            );
            Box::pin(self.apply_updates_inner(inner, queued)).await?;
        }
        Ok(())
    }

    /// Apply a batch of incoming updates against the active snapshot.
    ///
    /// Foreign-snapshot updates queue; already-seen keys are skipped; a
    /// stamped re-emission of one of our pending updates becomes its
    /// acknowledgement. Decryption runs in batches with a cooperative
    /// yield in between, and all plaintexts land in a single replica
    /// transaction.
    async fn apply_updates_inner(
        &self,
        inner: &mut Inner,
        updates: Vec<EncryptedUpdate>,
    ) -> ClientResult<()> {
        let active_id = inner.active_snapshot_id();
        let mut to_apply = Vec::new();

        for update in updates {
            if update.snapshot_id != active_id {
                debug!(
                    snapshot_id = %update.snapshot_id,
                    "queueing update for foreign snapshot"
                );
                inner
                    .queued_updates
                    .entry(update.snapshot_id.clone())
                    .or_default()
                    .push(update);
                continue;
            }

            inner.clock.receive(update.timestamp);
            let key = update.update_key();

            if let Some(server_version) = update.server_version {
                inner.server_version = inner.server_version.max(server_version);
                if inner.pending_updates.remove(&key).is_some() {
                    // Our own update came back stamped; already applied.
                    self.observers.emit(&ClientEvent::UpdateAcknowledged {
                        snapshot_id: active_id.clone(),
                        server_version,
                    });
                    continue;
                }
            }

            let seen = inner.seen_updates.entry(active_id.clone()).or_default();
            if !seen.insert(key) {
                continue;
            }
            self.observers.emit(&ClientEvent::UpdateStored {
                snapshot_id: active_id.clone(),
                update_id: update.id.clone(),
            });
            to_apply.push(update);
        }

        if to_apply.is_empty() {
            return Ok(());
        }

        let mut plaintexts = Vec::with_capacity(to_apply.len());
        for batch in to_apply.chunks(self.config.decrypt_batch_size.max(1)) {
            for update in batch {
                plaintexts.push(self.cipher.decrypt(&update.payload)?);
            }
            tokio::task::yield_now().await;
        }

        let mut txn = inner.doc.transact_mut();
        for plaintext in &plaintexts {
            let update = Update::decode_v1(plaintext)
                .map_err(|e| ClientError::Crdt(format!("decode: {e}")))?;
            txn.apply_update(update)
                .map_err(|e| ClientError::Crdt(format!("apply: {e}")))?;
        }
        Ok(())
    }

    /// Encrypt the current full state into a new active snapshot, starting
    /// a fresh generation (version 0, empty pending/seen/queued, clock at
    /// zero).
    fn install_local_snapshot(&self, inner: &mut Inner) -> ClientResult<Snapshot> {
        let state = full_state(&inner.doc);
        let payload = self.cipher.encrypt(&state)?;
        let snapshot = Snapshot {
            id: Uuid::new_v4().to_string(),
            parent_snapshot_id: inner.active_snapshot.as_ref().map(|s| s.id.clone()),
            payload,
        };

        inner.active_snapshot = Some(snapshot.clone());
        inner.active_plaintext = Some(state);
        inner.server_version = 0;
        inner.clock.reset();
        inner.pending_updates.clear();
        inner.seen_updates.clear();
        inner.queued_updates.clear();

        self.observers.emit(&ClientEvent::SnapshotStored {
            snapshot_id: snapshot.id.clone(),
        });
        self.restart_snapshot_timer();
        Ok(snapshot)
    }

    fn restart_snapshot_timer(&self) {
        let mut guard = self.snapshot_timer.lock().unwrap();
        if let Some(handle) = guard.take() {
            handle.abort();
        }
        if self.config.snapshot_interval_ms == 0 {
            return;
        }

        let inner = Arc::downgrade(&self.inner);
        let cipher = self.cipher.clone();
        let observers = self.observers.clone();
        let document_id = self.document_id.clone();
        let interval = Duration::from_millis(self.config.snapshot_interval_ms);

        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // interval fires immediately; skip
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else { return };
                let mut inner = inner.lock().await;

                let Some(active_plaintext) = inner.active_plaintext.clone() else {
                    continue; // nothing to compact before the first snapshot
                };
                let current = full_state(&inner.doc);
                if current == active_plaintext {
                    continue; // unchanged state: emitting would be a no-op
                }

                let payload = match cipher.encrypt(&current) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(document_id = %document_id, error = %e, "periodic snapshot encryption failed");
                        continue;
                    }
                };
                let snapshot = Snapshot {
                    id: Uuid::new_v4().to_string(),
                    parent_snapshot_id: inner.active_snapshot.as_ref().map(|s| s.id.clone()),
                    payload,
                };
                inner.active_snapshot = Some(snapshot.clone());
                inner.active_plaintext = Some(current);
                inner.server_version = 0;
                inner.clock.reset();
                inner.pending_updates.clear();
                inner.seen_updates.clear();
                inner.queued_updates.clear();

                info!(document_id = %document_id, snapshot_id = %snapshot.id, "periodic compaction snapshot");
                observers.emit(&ClientEvent::SnapshotStored {
                    snapshot_id: snapshot.id.clone(),
                });
                let envelope = Envelope::new(
                    &document_id,
                    MessageBody::Update(EncryptedPayload::Snapshot(snapshot).encode()),
                )
                .encrypted()
                .with_fresh_message_id();
                observers.emit(&ClientEvent::SendMessage { envelope });
            }
        }));
    }
}

impl Drop for EncryptedDocClient {
    fn drop(&mut self) {
        self.destroy();
    }
}
