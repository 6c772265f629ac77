//! Persisted token-bucket rate limiting.
//!
//! State lives in the shared key/value store so limits survive restarts and
//! apply across processes. Each `consume` runs inside the key's TTL-lock
//! transaction: refill from elapsed time, then deduct or deny.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::config::{LockConfig, StorageConfig};
use crate::error::StorageResult;
use crate::kv::KeyValueStore;
use crate::lock::with_transaction;

/// Rate-limit tuning for one bucket class.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Refill window: a fully drained bucket refills over this span.
    pub window_ms: u64,
    /// Bucket capacity.
    pub max_messages: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_messages: 100,
        }
    }
}

/// Outcome of a `consume` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateDecision {
    Allowed,
    /// Over budget; the caller may retry after the given delay.
    Denied { retry_after_ms: u64 },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BucketState {
    tokens: f64,
    last_refill_ms: i64,
}

/// Token-bucket limiter keyed by an identity/document pair (or any string).
pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
    config: RateLimitConfig,
    prefix: String,
    lock: LockConfig,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        config: RateLimitConfig,
        storage_config: &StorageConfig,
    ) -> Self {
        Self {
            store,
            config,
            prefix: storage_config.rate_limit_prefix.clone(),
            lock: storage_config.lock.clone(),
        }
    }

    fn state_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Take `n` tokens from the bucket for `key`.
    ///
    /// A denial persists the refill but not a deduction, so a denied caller
    /// is not pushed further into debt.
    pub async fn consume(&self, key: &str, n: u32) -> StorageResult<RateDecision> {
        let state_key = self.state_key(key);
        let store = self.store.clone();
        let config = self.config.clone();
        let inner_key = state_key.clone();

        with_transaction(&self.store, &state_key, &self.lock, move || async move {
            let now = chrono::Utc::now().timestamp_millis();
            let max = f64::from(config.max_messages);

            let mut state = match store.get(&inner_key).await? {
                Some(value) => serde_json::from_value::<BucketState>(value)?,
                None => BucketState {
                    tokens: max,
                    last_refill_ms: now,
                },
            };

            // Stale state past its TTL re-initializes full; the refill
            // formula converges to the same thing.
            let elapsed = (now - state.last_refill_ms).max(0) as f64;
            let refill = elapsed / config.window_ms as f64 * max;
            state.tokens = (state.tokens + refill).min(max);
            state.last_refill_ms = now;

            let requested = f64::from(n);
            let decision = if state.tokens >= requested {
                state.tokens -= requested;
                RateDecision::Allowed
            } else {
                let deficit = requested - state.tokens;
                let retry_after_ms =
                    (deficit * config.window_ms as f64 / max).ceil() as u64;
                debug!(key = %inner_key, retry_after_ms, "rate limited");
                RateDecision::Denied { retry_after_ms }
            };

            store.set(&inner_key, serde_json::to_value(&state)?).await?;
            Ok(decision)
        })
        .await
    }

    /// Drop persisted state for a key (tests, admin resets).
    pub async fn clear(&self, key: &str) -> StorageResult<()> {
        self.store.remove(&self.state_key(key)).await
    }
}
