//! Client-side sync for unencrypted documents.
//!
//! The plaintext flavor is the classic two-step handshake over native CRDT
//! encodings: sync-step-1 carries a state vector, sync-step-2 and update
//! carry raw deltas, and the server merges server-side. No Lamport
//! bookkeeping is needed — the CRDT's own state vector does the work the
//! encrypted engine has to rebuild around opaque blobs.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use wharf_protocol::{Envelope, MessageBody};

use crate::error::{ClientError, ClientResult};

/// Sync handler for one plaintext document.
pub struct PlainDocClient {
    document_id: String,
    doc: Doc,
}

impl PlainDocClient {
    pub fn new(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            doc: Doc::new(),
        }
    }

    /// Rebuild from a previously captured full state.
    pub fn from_state(document_id: impl Into<String>, state: &[u8]) -> ClientResult<Self> {
        let client = Self::new(document_id);
        if !state.is_empty() {
            client.apply(state)?;
        }
        Ok(client)
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// First message of a sync: our native state vector.
    pub fn start(&self) -> Envelope {
        let sv = self.doc.transact().state_vector().encode_v1();
        Envelope::new(&self.document_id, MessageBody::SyncStep1(sv))
    }

    /// Handle an inbound doc message, returning any replies to send.
    ///
    /// A peer's sync-step-1 gets our missing-updates diff plus our own
    /// sync-step-1 so both sides converge; sync-step-2 and update apply
    /// locally and need no reply.
    pub fn handle_message(&self, body: &MessageBody) -> ClientResult<Vec<Envelope>> {
        match body {
            MessageBody::SyncStep1(remote_sv) => {
                let since = StateVector::decode_v1(remote_sv)
                    .map_err(|e| ClientError::Crdt(format!("state vector: {e}")))?;
                let txn = self.doc.transact();
                let diff = txn.encode_state_as_update_v1(&since);
                let our_sv = txn.state_vector().encode_v1();
                drop(txn);
                Ok(vec![
                    Envelope::new(&self.document_id, MessageBody::SyncStep2(diff)),
                    Envelope::new(&self.document_id, MessageBody::SyncStep1(our_sv)),
                ])
            }
            MessageBody::SyncStep2(update) | MessageBody::Update(update) => {
                if !update.is_empty() {
                    self.apply(update)?;
                }
                Ok(Vec::new())
            }
            MessageBody::SyncDone => Ok(Vec::new()),
            other => Err(ClientError::Crdt(format!(
                "unexpected message for plaintext sync: {other:?}"
            ))),
        }
    }

    /// Record a local edit and produce the update message carrying it.
    pub fn apply_local_update(&self, update: &[u8]) -> ClientResult<Envelope> {
        self.apply(update)?;
        Ok(Envelope::new(
            &self.document_id,
            MessageBody::Update(update.to_vec()),
        )
        .with_fresh_message_id())
    }

    /// Full replica state as one update.
    pub fn full_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    fn apply(&self, update: &[u8]) -> ClientResult<()> {
        let decoded =
            Update::decode_v1(update).map_err(|e| ClientError::Crdt(format!("decode: {e}")))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(decoded)
            .map_err(|e| ClientError::Crdt(format!("apply: {e}")))?;
        Ok(())
    }
}
