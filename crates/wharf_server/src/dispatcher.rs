//! The server dispatcher.
//!
//! One instance coordinates every document and connection behind a
//! message-oriented transport. Per inbound frame the pipeline is: decode,
//! rate-limit, dedupe, permission check, peer registration, then routing —
//! sync handshakes answer from storage, updates persist and broadcast,
//! awareness broadcasts without persistence, rpc goes to the named-method
//! router — then the ack and the received-message telemetry event, so
//! frames dropped by an earlier gate never reach observers. Storage
//! methods serialize document mutation under the per-document TTL lock,
//! so the dispatcher itself takes no locks around routing.
//!
//! Frames carrying a message id are deduped and acknowledged; flag-free
//! frames (plain live sync traffic) are processed as-is.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use wharf_protocol::{Envelope, MessageBody, Permission, RpcRequestType};
use wharf_storage::{KeyValueStore, RateDecision, RateLimiter, Storage, StorageError};

use crate::config::ServerConfig;
use crate::connection::{Claims, ConnectionId, ConnectionSink};
use crate::dedupe::TtlDedupe;
use crate::error::ServerResult;
use crate::rpc::RpcRouter;
use crate::telemetry::{TelemetryBus, TelemetryEvent};

struct ConnectionState {
    sink: Arc<dyn ConnectionSink>,
    claims: Claims,
    documents: HashSet<String>,
}

#[derive(Default)]
struct DocumentHandle {
    peers: HashSet<ConnectionId>,
}

/// The coordinating server for a set of documents.
pub struct Server {
    storage: Arc<Storage>,
    dedupe: TtlDedupe,
    limiter: RateLimiter,
    rpc: RpcRouter,
    telemetry: Arc<TelemetryBus>,
    connections: DashMap<u64, ConnectionState>,
    documents: DashMap<String, DocumentHandle>,
    next_connection_id: AtomicU64,
}

impl Server {
    pub fn new(store: Arc<dyn KeyValueStore>, config: ServerConfig) -> Self {
        let storage = Arc::new(Storage::new(store.clone(), config.storage.clone()));
        Self {
            dedupe: TtlDedupe::new(config.dedupe.clone()),
            limiter: RateLimiter::new(store, config.rate_limit.clone(), &config.storage),
            rpc: RpcRouter::new(storage.clone()),
            telemetry: Arc::new(TelemetryBus::new(config.message_limit)),
            storage,
            connections: DashMap::new(),
            documents: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn telemetry(&self) -> &Arc<TelemetryBus> {
        &self.telemetry
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn dedupe_counters(&self) -> (u64, u64) {
        self.dedupe.counters()
    }

    /// Register a connection whose identity has already been validated.
    pub fn connect(&self, sink: Arc<dyn ConnectionSink>, claims: Claims) -> ConnectionId {
        let id = ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed));
        info!(connection = %id, subject = %claims.subject, "connection registered");
        self.connections.insert(
            id.0,
            ConnectionState {
                sink,
                claims,
                documents: HashSet::new(),
            },
        );
        self.telemetry
            .publish(TelemetryEvent::Connected { connection: id });
        self.publish_state();
        id
    }

    /// Tear down a connection; documents left without peers are unloaded
    /// (forced compaction) and evicted.
    pub async fn disconnect(&self, connection: ConnectionId) -> ServerResult<()> {
        let Some((_, state)) = self.connections.remove(&connection.0) else {
            return Ok(());
        };

        for document_id in state.documents {
            let now_empty = match self.documents.get_mut(&document_id) {
                Some(mut handle) => {
                    handle.peers.remove(&connection);
                    handle.peers.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.documents.remove(&document_id);
                // Encrypted docs compact client-side; plaintext logs compact
                // here on unload.
                let is_encrypted = self
                    .storage
                    .encrypted
                    .metadata(&document_id)
                    .await?
                    .is_some_and(|meta| meta.encrypted);
                if !is_encrypted {
                    self.storage.documents.unload(&document_id).await?;
                }
                info!(document_id = %document_id, "document unloaded");
                self.telemetry
                    .publish(TelemetryEvent::DocumentUnloaded { document_id });
            }
        }

        self.telemetry
            .publish(TelemetryEvent::Disconnected { connection });
        self.publish_state();
        Ok(())
    }

    /// Process one inbound frame from a connection.
    pub async fn handle_frame(&self, connection: ConnectionId, frame: &[u8]) -> ServerResult<()> {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(connection = %connection, error = %e, "dropping malformed frame");
                self.telemetry.publish(TelemetryEvent::Error {
                    connection: Some(connection),
                    reason: format!("malformed frame: {e}"),
                });
                return Ok(());
            }
        };

        let claims = match self.connections.get(&connection.0) {
            Some(state) => state.claims.clone(),
            None => return Err(crate::error::ServerError::UnknownConnection(connection.0)),
        };
        let document_id = envelope.document_id.clone();

        // Rate limiting precedes everything that costs storage or peers.
        let bucket = format!("{}:{}", claims.subject, document_id);
        if let RateDecision::Denied { retry_after_ms } = self.limiter.consume(&bucket, 1).await? {
            debug!(connection = %connection, retry_after_ms, "rate limited");
            self.telemetry.publish(TelemetryEvent::Error {
                connection: Some(connection),
                reason: format!("rate limited; retry after {retry_after_ms}ms"),
            });
            return Ok(());
        }

        // Transport replays die here, silently.
        if let Some(message_id) = &envelope.message_id {
            if !self.dedupe.should_accept(&document_id, message_id) {
                debug!(connection = %connection, document_id = %document_id, "duplicate dropped");
                return Ok(());
            }
        }

        if !claims.can_read {
            self.send_to(
                connection,
                Envelope::new(
                    &document_id,
                    MessageBody::AuthMessage {
                        permission: Permission::Denied,
                        reason: Some("no read access".to_string()),
                    },
                ),
            )
            .await;
            return Ok(());
        }

        // Only readable connections join the peer set; broadcast fans out
        // to every peer, so a denied connection must never get this far.
        self.register_peer(&document_id, connection);

        let is_write = matches!(
            envelope.body,
            MessageBody::Update(_) | MessageBody::SyncStep2(_)
        );
        if is_write && !claims.can_write {
            self.send_to(
                connection,
                Envelope::new(
                    &document_id,
                    MessageBody::AuthMessage {
                        permission: Permission::ReadOnly,
                        reason: Some("write denied".to_string()),
                    },
                ),
            )
            .await;
            return Ok(());
        }

        match &envelope.body {
            MessageBody::SyncStep1(state_vector) => {
                self.handle_sync_step_1(connection, &envelope, state_vector)
                    .await?;
            }
            MessageBody::SyncStep2(payload) => {
                if envelope.encrypted {
                    // Encrypted sync-step-2 framing differs from doc.update:
                    // an optional snapshot plus an update batch.
                    match self
                        .storage
                        .encrypted
                        .handle_sync_step_2(&document_id, payload)
                        .await
                    {
                        Ok(stamped_batches) => {
                            for stamped in stamped_batches {
                                let outbound =
                                    Envelope::new(&document_id, MessageBody::Update(stamped))
                                        .encrypted();
                                self.send_to(connection, outbound.clone()).await;
                                self.broadcast(&document_id, outbound, connection).await;
                            }
                        }
                        Err(e) => self.handle_write_error(connection, &document_id, e).await?,
                    }
                } else {
                    self.storage
                        .documents
                        .write(&document_id, payload, None)
                        .await?;
                    self.broadcast(&document_id, envelope.clone(), connection).await;
                }
            }
            MessageBody::Update(payload) => {
                self.handle_doc_write(connection, &envelope, payload).await?;
            }
            MessageBody::SyncDone => {}
            MessageBody::AuthMessage { .. } | MessageBody::Ack { .. } => {
                // Client-side concerns; nothing to route.
            }
            MessageBody::AwarenessUpdate(_) | MessageBody::AwarenessRequest => {
                // Presence is broadcast-only, never persisted.
                self.broadcast(&document_id, envelope.clone(), connection).await;
            }
            MessageBody::Rpc(rpc) => {
                if rpc.request_type == RpcRequestType::Request {
                    for reply in self.rpc.handle(rpc).await {
                        self.send_to(
                            connection,
                            Envelope::new(&document_id, MessageBody::Rpc(reply)),
                        )
                        .await;
                    }
                }
            }
            MessageBody::FileLegacy { .. } => {
                self.telemetry.publish(TelemetryEvent::Error {
                    connection: Some(connection),
                    reason: "legacy file frame ignored; use rpc file methods".to_string(),
                });
            }
        }

        if let Some(message_id) = envelope.message_id {
            self.send_to(
                connection,
                Envelope::new(&document_id, MessageBody::Ack { message_id }),
            )
            .await;
        }

        // Only frames that made it through every gate count as received;
        // rate-limited, duplicate, and denied frames never reach observers.
        self.telemetry.publish(TelemetryEvent::ReceivedMessage {
            connection,
            document_id,
            envelope,
        });
        Ok(())
    }

    async fn handle_sync_step_1(
        &self,
        connection: ConnectionId,
        envelope: &Envelope,
        state_vector: &[u8],
    ) -> ServerResult<()> {
        let document_id = &envelope.document_id;
        let (step_2, own_step_1) = if envelope.encrypted {
            let reply = self
                .storage
                .encrypted
                .handle_sync_step_1(document_id, state_vector)
                .await?;
            let server_sv = self.storage.encrypted.state_vector(document_id).await?;
            (
                Envelope::new(document_id, MessageBody::SyncStep2(reply.encode())).encrypted(),
                Envelope::new(document_id, MessageBody::SyncStep1(server_sv.encode()))
                    .encrypted(),
            )
        } else {
            let fetched = self.storage.documents.fetch(document_id).await?;
            let merged = fetched.as_ref().map(|f| f.update.as_slice()).unwrap_or(&[]);
            let (diff, server_sv) = plaintext_diff(merged, state_vector)?;
            (
                Envelope::new(document_id, MessageBody::SyncStep2(diff)),
                Envelope::new(document_id, MessageBody::SyncStep1(server_sv)),
            )
        };

        // Reply both halves to the sender only; handshakes never broadcast.
        self.send_to(connection, step_2).await;
        self.send_to(connection, own_step_1).await;
        Ok(())
    }

    async fn handle_doc_write(
        &self,
        connection: ConnectionId,
        envelope: &Envelope,
        payload: &[u8],
    ) -> ServerResult<()> {
        let document_id = &envelope.document_id;
        if envelope.encrypted {
            match self
                .storage
                .encrypted
                .handle_encrypted_update(document_id, payload)
                .await
            {
                Ok(stamped) => {
                    let outbound =
                        Envelope::new(document_id, MessageBody::Update(stamped)).encrypted();
                    // The stamped re-emission goes back to the origin (it
                    // carries the assigned server versions the origin needs
                    // for acknowledgement) and out to every peer.
                    self.send_to(connection, outbound.clone()).await;
                    self.broadcast(document_id, outbound, connection).await;
                }
                Err(e) => self.handle_write_error(connection, document_id, e).await?,
            }
        } else {
            self.storage.documents.write(document_id, payload, None).await?;
            self.broadcast(document_id, envelope.clone(), connection).await;
        }
        Ok(())
    }

    /// Stale-snapshot rejections are non-fatal: the origin gets the
    /// server's sync-step-1 and re-syncs onto the active snapshot. Other
    /// storage errors propagate to the connection layer.
    async fn handle_write_error(
        &self,
        connection: ConnectionId,
        document_id: &str,
        error: StorageError,
    ) -> ServerResult<()> {
        match error {
            StorageError::StaleSnapshot { snapshot_id, active } => {
                warn!(
                    document_id = %document_id,
                    snapshot_id = %snapshot_id,
                    active = %active,
                    "rejected update against stale snapshot"
                );
                let server_sv = self.storage.encrypted.state_vector(document_id).await?;
                self.send_to(
                    connection,
                    Envelope::new(document_id, MessageBody::SyncStep1(server_sv.encode()))
                        .encrypted(),
                )
                .await;
                Ok(())
            }
            other => Err(other.into()),
        }
    }

    fn register_peer(&self, document_id: &str, connection: ConnectionId) {
        let mut loaded = false;
        {
            let mut handle = self
                .documents
                .entry(document_id.to_string())
                .or_insert_with(|| {
                    loaded = true;
                    DocumentHandle::default()
                });
            handle.peers.insert(connection);
        }
        if let Some(mut state) = self.connections.get_mut(&connection.0) {
            state.documents.insert(document_id.to_string());
        }
        if loaded {
            debug!(document_id = %document_id, "document handle created");
            self.telemetry.publish(TelemetryEvent::DocumentLoaded {
                document_id: document_id.to_string(),
            });
        }
    }

    async fn send_to(&self, connection: ConnectionId, envelope: Envelope) {
        let sink = match self.connections.get(&connection.0) {
            Some(state) => state.sink.clone(),
            None => return,
        };
        let document_id = envelope.document_id.clone();
        match sink.send(envelope.encode()).await {
            Ok(()) => {
                self.telemetry.publish(TelemetryEvent::SentMessage {
                    connection,
                    document_id,
                    envelope,
                });
            }
            Err(e) => {
                warn!(connection = %connection, error = %e, "send failed");
                self.telemetry.publish(TelemetryEvent::Error {
                    connection: Some(connection),
                    reason: format!("send failed: {e}"),
                });
            }
        }
    }

    async fn broadcast(&self, document_id: &str, envelope: Envelope, except: ConnectionId) {
        let peers: Vec<ConnectionId> = match self.documents.get(document_id) {
            Some(handle) => handle
                .peers
                .iter()
                .copied()
                .filter(|peer| *peer != except)
                .collect(),
            None => return,
        };
        for peer in peers {
            self.send_to(peer, envelope.clone()).await;
        }
    }

    fn publish_state(&self) {
        self.telemetry.publish(TelemetryEvent::StateUpdate {
            documents: self.documents.len(),
            connections: self.connections.len(),
        });
    }
}

/// Diff a merged plaintext document against a client state vector. Returns
/// `(missing updates, server state vector)`.
fn plaintext_diff(merged: &[u8], client_sv: &[u8]) -> ServerResult<(Vec<u8>, Vec<u8>)> {
    let doc = Doc::new();
    if !merged.is_empty() {
        if let Ok(update) = Update::decode_v1(merged) {
            let mut txn = doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| StorageError::Crdt(e.to_string()))?;
        }
    }
    let since = StateVector::decode_v1(client_sv).unwrap_or_default();
    let txn = doc.transact();
    Ok((
        txn.encode_state_as_update_v1(&since),
        txn.state_vector().encode_v1(),
    ))
}
