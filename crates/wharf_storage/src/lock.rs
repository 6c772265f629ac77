//! Cooperative TTL lock over the shared key/value store.
//!
//! [`with_transaction`] serializes mutations per key across processes that
//! share one backend. The lock lives in the key's metadata document as
//! `{lock_expires_at, lock_id}`; a holder that outlives its TTL simply
//! loses the lock, and the `lock_id` guard keeps the late holder from
//! releasing its successor's acquisition.
//!
//! Acquisition backs off exponentially with additive uniform jitter:
//! `min(base · 2^retries + U(0, base), max_delay)`.

use rand::Rng;
use serde_json::{Map, Value, json};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::{StorageError, StorageResult};
use crate::kv::KeyValueStore;

const EXPIRES_FIELD: &str = "lock_expires_at";
const ID_FIELD: &str = "lock_id";

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn backoff_delay(config: &LockConfig, retries: u32) -> Duration {
    let exp = config.base_delay_ms.saturating_mul(1u64 << retries.min(20));
    let jitter = if config.base_delay_ms > 0 {
        rand::thread_rng().gen_range(0..config.base_delay_ms)
    } else {
        0
    };
    Duration::from_millis(exp.saturating_add(jitter).min(config.max_delay_ms))
}

fn meta_object(meta: Option<Value>) -> Map<String, Value> {
    match meta {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Run `f` while holding the TTL lock for `key`.
///
/// The function's error propagates after a best-effort release. The lock is
/// only released when our `lock_id` is still in place; if the TTL elapsed
/// and another holder took over, their lock is left untouched.
pub async fn with_transaction<T, F, Fut>(
    store: &Arc<dyn KeyValueStore>,
    key: &str,
    config: &LockConfig,
    f: F,
) -> StorageResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let lock_id = acquire(store, key, config).await?;
    let result = f().await;
    release(store, key, &lock_id).await;
    result
}

async fn acquire(
    store: &Arc<dyn KeyValueStore>,
    key: &str,
    config: &LockConfig,
) -> StorageResult<String> {
    let mut retries = 0u32;
    loop {
        let mut meta = meta_object(store.get_meta(key).await?);

        let expires_at = meta.get(EXPIRES_FIELD).and_then(Value::as_i64).unwrap_or(0);
        let held = meta.get(ID_FIELD).and_then(Value::as_str).is_some() && expires_at > now_ms();
        if held {
            if retries >= config.max_retries {
                return Err(StorageError::LockTimeout {
                    key: key.to_string(),
                    retries,
                });
            }
            let delay = backoff_delay(config, retries);
            debug!(key, retries, delay_ms = delay.as_millis() as u64, "lock held, backing off");
            tokio::time::sleep(delay).await;
            retries += 1;
            continue;
        }

        // Free or expired: claim it, preserving sibling metadata fields.
        let lock_id = Uuid::new_v4().to_string();
        meta.insert(
            EXPIRES_FIELD.to_string(),
            json!(now_ms() + config.ttl_ms as i64),
        );
        meta.insert(ID_FIELD.to_string(), json!(lock_id));
        store.set_meta(key, Value::Object(meta)).await?;

        // Read back: a concurrent claimer may have overwritten our write.
        let check = meta_object(store.get_meta(key).await?);
        if check.get(ID_FIELD).and_then(Value::as_str) == Some(lock_id.as_str()) {
            return Ok(lock_id);
        }

        if retries >= config.max_retries {
            return Err(StorageError::LockTimeout {
                key: key.to_string(),
                retries,
            });
        }
        let delay = backoff_delay(config, retries);
        debug!(key, retries, "lost acquisition race, backing off");
        tokio::time::sleep(delay).await;
        retries += 1;
    }
}

async fn release(store: &Arc<dyn KeyValueStore>, key: &str, lock_id: &str) {
    // Best-effort: a failed release just leaves the lock to expire.
    let meta = match store.get_meta(key).await {
        Ok(meta) => meta,
        Err(e) => {
            warn!(key, error = %e, "failed to read lock meta on release");
            return;
        }
    };
    let mut meta = meta_object(meta);
    if meta.get(ID_FIELD).and_then(Value::as_str) != Some(lock_id) {
        // TTL elapsed and someone else holds the lock now; leave it alone.
        debug!(key, "lock id changed, skipping release");
        return;
    }
    meta.insert(EXPIRES_FIELD.to_string(), json!(now_ms()));
    if let Err(e) = store.set_meta(key, Value::Object(meta)).await {
        warn!(key, error = %e, "failed to release lock");
    }
}
