//! TTL-based suppression of replayed messages.
//!
//! The transport may replay frames (reconnects, retries); every id-bearing
//! message passes through here before it can touch storage or peers. Seen
//! ids age out after the TTL, and each document's set is capped so one
//! noisy document cannot grow without bound.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use wharf_protocol::MessageId;

/// Dedupe tuning.
#[derive(Debug, Clone)]
pub struct DedupeConfig {
    /// How long a message id is remembered.
    pub ttl_ms: u64,
    /// Maximum remembered ids per document; oldest evicted first.
    pub max_per_doc: usize,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 30_000,
            max_per_doc: 1_000,
        }
    }
}

/// Per-document seen-id sets with TTL eviction.
///
/// `should_accept` is atomic under one interior lock, so exactly one of
/// any set of concurrent callers with the same `(document, message_id)`
/// sees `true`.
pub struct TtlDedupe {
    config: DedupeConfig,
    documents: Mutex<HashMap<String, HashMap<MessageId, Instant>>>,
    accepted: AtomicU64,
    duplicates: AtomicU64,
}

impl TtlDedupe {
    pub fn new(config: DedupeConfig) -> Self {
        Self {
            config,
            documents: Mutex::new(HashMap::new()),
            accepted: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        }
    }

    /// Record and accept a message id, or reject a replay seen within the
    /// TTL window.
    pub fn should_accept(&self, document_id: &str, message_id: &MessageId) -> bool {
        let now = Instant::now();
        let ttl = Duration::from_millis(self.config.ttl_ms);
        let mut documents = self.documents.lock().unwrap();
        let seen = documents.entry(document_id.to_string()).or_default();

        seen.retain(|_, inserted| now.duration_since(*inserted) < ttl);

        if seen.contains_key(message_id) {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        if seen.len() >= self.config.max_per_doc {
            if let Some(oldest) = seen
                .iter()
                .min_by_key(|(_, inserted)| **inserted)
                .map(|(id, _)| *id)
            {
                seen.remove(&oldest);
            }
        }

        seen.insert(*message_id, now);
        self.accepted.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn clear_document(&self, document_id: &str) {
        self.documents.lock().unwrap().remove(document_id);
    }

    pub fn clear_all(&self) {
        self.documents.lock().unwrap().clear();
    }

    /// `(accepted, duplicates)` counters since construction.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.accepted.load(Ordering::Relaxed),
            self.duplicates.load(Ordering::Relaxed),
        )
    }
}
