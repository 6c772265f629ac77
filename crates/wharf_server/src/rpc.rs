//! Named RPC methods carried over `rpc` frames.
//!
//! File transfer and milestone operations ride the message envelope as
//! request/response/stream exchanges correlated by id. Payloads are JSON;
//! chunk bytes and Merkle hashes cross this edge base64-encoded. Handler
//! failures become `{"error": …}` responses rather than dropped frames, so
//! a misbehaving caller still learns what went wrong.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use wharf_protocol::{RpcMessage, RpcRequestType};
use wharf_storage::merkle::{ChunkProof, NodeHash};
use wharf_storage::{FileMetadata, Storage, StorageError};

use crate::error::ServerResult;

#[derive(Deserialize)]
struct BeginUploadRequest {
    upload_id: String,
    metadata: FileMetadata,
}

#[derive(Deserialize)]
struct ProofPayload {
    index: u64,
    siblings: Vec<String>,
    root: String,
}

impl ProofPayload {
    fn decode(&self) -> Result<(ChunkProof, NodeHash), String> {
        let mut siblings = Vec::with_capacity(self.siblings.len());
        for sibling in &self.siblings {
            siblings.push(decode_hash(sibling)?);
        }
        Ok((
            ChunkProof {
                index: self.index,
                siblings,
            },
            decode_hash(&self.root)?,
        ))
    }
}

fn decode_hash(encoded: &str) -> Result<NodeHash, String> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| format!("bad hash encoding: {e}"))?;
    NodeHash::try_from(bytes.as_slice()).map_err(|_| "hash must be 32 bytes".to_string())
}

#[derive(Deserialize)]
struct StoreChunkRequest {
    upload_id: String,
    index: u64,
    chunk: String,
    #[serde(default)]
    proof: Option<ProofPayload>,
}

#[derive(Deserialize)]
struct CompleteUploadRequest {
    upload_id: String,
    #[serde(default)]
    file_id: Option<String>,
}

#[derive(Deserialize)]
struct FileIdRequest {
    file_id: String,
}

#[derive(Deserialize)]
struct MilestoneListRequest {
    document_id: String,
}

#[derive(Deserialize)]
struct MilestoneCreateRequest {
    document_id: String,
    name: String,
    snapshot: String,
}

#[derive(Deserialize)]
struct MilestoneGetRequest {
    document_id: String,
    milestone_id: String,
}

#[derive(Deserialize)]
struct MilestoneRenameRequest {
    document_id: String,
    milestone_id: String,
    name: String,
}

#[derive(Serialize)]
struct MilestoneInfo {
    id: String,
    document_id: String,
    name: String,
    created_at: i64,
}

impl From<&wharf_storage::Milestone> for MilestoneInfo {
    fn from(milestone: &wharf_storage::Milestone) -> Self {
        Self {
            id: milestone.id.clone(),
            document_id: milestone.document_id.clone(),
            name: milestone.name.clone(),
            created_at: milestone.created_at,
        }
    }
}

/// Routes named rpc methods to storage.
pub struct RpcRouter {
    storage: Arc<Storage>,
}

impl RpcRouter {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Handle one rpc request, returning the ordered messages to send back
    /// to the caller (stream parts followed by the final response).
    pub async fn handle(&self, request: &RpcMessage) -> Vec<RpcMessage> {
        debug!(method = %request.method, "rpc request");
        match self.dispatch(request).await {
            Ok(messages) => messages,
            Err(e) => vec![response(request, json!({ "error": e.to_string() }))],
        }
    }

    async fn dispatch(&self, request: &RpcMessage) -> ServerResult<Vec<RpcMessage>> {
        match request.method.as_str() {
            "file.upload.begin" => {
                let req: BeginUploadRequest = serde_json::from_slice(&request.payload)?;
                let session = self
                    .storage
                    .files
                    .begin_upload(&req.upload_id, req.metadata)
                    .await?;
                Ok(vec![response(
                    request,
                    json!({
                        "upload_id": session.upload_id,
                        "bytes_uploaded": session.bytes_uploaded,
                    }),
                )])
            }
            "file.upload.chunk" => {
                let req: StoreChunkRequest = serde_json::from_slice(&request.payload)?;
                let chunk = BASE64
                    .decode(&req.chunk)
                    .map_err(|e| StorageError::Integrity(format!("bad chunk encoding: {e}")))?;
                let proof = match &req.proof {
                    Some(payload) => Some(payload.decode().map_err(StorageError::Integrity)?),
                    None => None,
                };
                let session = self
                    .storage
                    .files
                    .store_chunk(
                        &req.upload_id,
                        req.index,
                        &chunk,
                        proof.as_ref().map(|(p, root)| (p, root)),
                    )
                    .await?;
                Ok(vec![response(
                    request,
                    json!({ "bytes_uploaded": session.bytes_uploaded }),
                )])
            }
            "file.upload.complete" => {
                let req: CompleteUploadRequest = serde_json::from_slice(&request.payload)?;
                let file_id = self
                    .storage
                    .files
                    .store_file_from_upload(&req.upload_id, req.file_id.as_deref())
                    .await?;
                Ok(vec![response(request, json!({ "file_id": file_id }))])
            }
            "file.download" => {
                let req: FileIdRequest = serde_json::from_slice(&request.payload)?;
                let Some(file) = self.storage.files.file(&req.file_id).await? else {
                    return Err(StorageError::NotFound(format!("file {}", req.file_id)).into());
                };

                // Chunks stream ahead of the closing response.
                let mut messages = Vec::with_capacity(file.chunk_keys.len() + 1);
                for index in 0..file.chunk_keys.len() as u64 {
                    let chunk = self
                        .storage
                        .files
                        .read_chunk(&req.file_id, index)
                        .await?
                        .ok_or_else(|| {
                            StorageError::Integrity(format!("chunk {index} missing"))
                        })?;
                    messages.push(stream_part(
                        request,
                        json!({ "index": index, "chunk": BASE64.encode(&chunk) }),
                    ));
                }
                messages.push(response(
                    request,
                    json!({
                        "file_id": req.file_id,
                        "metadata": file.metadata,
                        "chunk_count": file.chunk_keys.len(),
                    }),
                ));
                Ok(messages)
            }
            "file.delete" => {
                let req: FileIdRequest = serde_json::from_slice(&request.payload)?;
                self.storage.files.delete_file(&req.file_id).await?;
                Ok(vec![response(request, json!({ "deleted": req.file_id }))])
            }
            "milestone.list" => {
                let req: MilestoneListRequest = serde_json::from_slice(&request.payload)?;
                let milestones = self.storage.milestones.list(&req.document_id).await?;
                let infos: Vec<MilestoneInfo> = milestones.iter().map(Into::into).collect();
                Ok(vec![response(request, json!({ "milestones": infos }))])
            }
            "milestone.create" => {
                let req: MilestoneCreateRequest = serde_json::from_slice(&request.payload)?;
                let snapshot = BASE64.decode(&req.snapshot).map_err(|e| {
                    StorageError::Integrity(format!("bad snapshot encoding: {e}"))
                })?;
                let milestone = self
                    .storage
                    .milestones
                    .create(&req.document_id, &req.name, snapshot)
                    .await?;
                Ok(vec![response(
                    request,
                    serde_json::to_value(MilestoneInfo::from(&milestone))?,
                )])
            }
            "milestone.snapshot" => {
                let req: MilestoneGetRequest = serde_json::from_slice(&request.payload)?;
                let milestone = self
                    .storage
                    .milestones
                    .get(&req.document_id, &req.milestone_id)
                    .await?
                    .ok_or_else(|| {
                        StorageError::NotFound(format!("milestone {}", req.milestone_id))
                    })?;
                Ok(vec![response(
                    request,
                    json!({
                        "id": milestone.id,
                        "snapshot": BASE64.encode(&milestone.snapshot),
                    }),
                )])
            }
            "milestone.rename" => {
                let req: MilestoneRenameRequest = serde_json::from_slice(&request.payload)?;
                let milestone = self
                    .storage
                    .milestones
                    .rename(&req.document_id, &req.milestone_id, &req.name)
                    .await?;
                Ok(vec![response(
                    request,
                    serde_json::to_value(MilestoneInfo::from(&milestone))?,
                )])
            }
            other => Ok(vec![response(
                request,
                json!({ "error": format!("unknown method '{other}'") }),
            )]),
        }
    }
}

fn response(request: &RpcMessage, payload: serde_json::Value) -> RpcMessage {
    RpcMessage {
        method: request.method.clone(),
        request_type: RpcRequestType::Response,
        correlation_id: request.correlation_id,
        payload: payload.to_string().into_bytes(),
    }
}

fn stream_part(request: &RpcMessage, payload: serde_json::Value) -> RpcMessage {
    RpcMessage {
        method: request.method.clone(),
        request_type: RpcRequestType::Stream,
        correlation_id: request.correlation_id,
        payload: payload.to_string().into_bytes(),
    }
}
