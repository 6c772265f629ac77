//! Named point-in-time document versions.
//!
//! A milestone pins a full document state under a human-readable name.
//! For encrypted documents the pinned bytes are ciphertext like everything
//! else the server holds.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::kv::KeyValueStore;

/// A stored milestone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Milestone {
    pub id: String,
    pub document_id: String,
    pub name: String,
    pub created_at: i64,
    /// Full document state at creation time (opaque for encrypted docs).
    pub snapshot: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct MilestoneRow {
    id: String,
    document_id: String,
    name: String,
    created_at: i64,
    snapshot: String,
}

impl MilestoneRow {
    fn from_milestone(milestone: &Milestone) -> Self {
        Self {
            id: milestone.id.clone(),
            document_id: milestone.document_id.clone(),
            name: milestone.name.clone(),
            created_at: milestone.created_at,
            snapshot: BASE64.encode(&milestone.snapshot),
        }
    }

    fn into_milestone(self) -> StorageResult<Milestone> {
        let snapshot = BASE64
            .decode(&self.snapshot)
            .map_err(|e| StorageError::Backend(format!("corrupt milestone snapshot: {e}")))?;
        Ok(Milestone {
            id: self.id,
            document_id: self.document_id,
            name: self.name,
            created_at: self.created_at,
            snapshot,
        })
    }
}

/// Milestone storage over the shared key/value store.
pub struct MilestoneStorage {
    store: Arc<dyn KeyValueStore>,
    config: StorageConfig,
}

impl MilestoneStorage {
    pub fn new(store: Arc<dyn KeyValueStore>, config: StorageConfig) -> Self {
        Self { store, config }
    }

    fn milestone_key(&self, document_id: &str, milestone_id: &str) -> String {
        format!(
            "{}{}:{}",
            self.config.milestone_prefix, document_id, milestone_id
        )
    }

    /// Milestones for a document, oldest first.
    pub async fn list(&self, document_id: &str) -> StorageResult<Vec<Milestone>> {
        let prefix = format!("{}{}:", self.config.milestone_prefix, document_id);
        let mut milestones = Vec::new();
        for key in self.store.get_keys(&prefix).await? {
            if let Some(value) = self.store.get(&key).await? {
                let row: MilestoneRow = serde_json::from_value(value)?;
                milestones.push(row.into_milestone()?);
            }
        }
        milestones.sort_by_key(|m| m.created_at);
        Ok(milestones)
    }

    /// Pin the given document state under a name.
    pub async fn create(
        &self,
        document_id: &str,
        name: &str,
        snapshot: Vec<u8>,
    ) -> StorageResult<Milestone> {
        let milestone = Milestone {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            name: name.to_string(),
            created_at: chrono::Utc::now().timestamp_millis(),
            snapshot,
        };
        self.store
            .set(
                &self.milestone_key(document_id, &milestone.id),
                serde_json::to_value(MilestoneRow::from_milestone(&milestone))?,
            )
            .await?;
        debug!(document_id, milestone_id = %milestone.id, name, "created milestone");
        Ok(milestone)
    }

    pub async fn get(
        &self,
        document_id: &str,
        milestone_id: &str,
    ) -> StorageResult<Option<Milestone>> {
        match self
            .store
            .get(&self.milestone_key(document_id, milestone_id))
            .await?
        {
            Some(value) => {
                let row: MilestoneRow = serde_json::from_value(value)?;
                Ok(Some(row.into_milestone()?))
            }
            None => Ok(None),
        }
    }

    pub async fn rename(
        &self,
        document_id: &str,
        milestone_id: &str,
        name: &str,
    ) -> StorageResult<Milestone> {
        let mut milestone = self
            .get(document_id, milestone_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("milestone {milestone_id}")))?;
        milestone.name = name.to_string();
        self.store
            .set(
                &self.milestone_key(document_id, milestone_id),
                serde_json::to_value(MilestoneRow::from_milestone(&milestone))?,
            )
            .await?;
        Ok(milestone)
    }
}
