//! Storage configuration: key prefixes, chunking, upload expiry, and lock
//! tuning. Every prefix is overridable so several substrates can share one
//! key/value namespace.

/// Tuning for the cooperative TTL lock.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// How long a held lock stays valid before contenders may steal it.
    pub ttl_ms: u64,
    /// Acquisition attempts before giving up with `LockTimeout`.
    pub max_retries: u32,
    /// Base backoff delay; doubled per retry with additive uniform jitter.
    pub base_delay_ms: u64,
    /// Backoff ceiling.
    pub max_delay_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 5_000,
            max_retries: 50,
            base_delay_ms: 50,
            max_delay_ms: 5_000,
        }
    }
}

/// Configuration shared by the storage adapters.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Prefix for document keys (`{prefix}{id}…`).
    pub document_prefix: String,
    /// Prefix for file and upload keys (`{prefix}file:…`, `{prefix}upload:…`).
    pub file_prefix: String,
    /// Prefix for milestone keys.
    pub milestone_prefix: String,
    /// Prefix for rate-limit state keys.
    pub rate_limit_prefix: String,
    /// Fixed chunk size for file storage; a power of two.
    pub chunk_size: usize,
    /// Idle time after which an upload session is garbage-collected.
    pub upload_timeout_ms: i64,
    pub lock: LockConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            document_prefix: "document:".to_string(),
            file_prefix: "file:".to_string(),
            milestone_prefix: "milestone:".to_string(),
            rate_limit_prefix: "ratelimit:".to_string(),
            chunk_size: 256 * 1024,
            upload_timeout_ms: 24 * 60 * 60 * 1000,
            lock: LockConfig::default(),
        }
    }
}

impl StorageConfig {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        debug_assert!(chunk_size.is_power_of_two());
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_upload_timeout_ms(mut self, upload_timeout_ms: i64) -> Self {
        self.upload_timeout_ms = upload_timeout_ms;
        self
    }

    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }
}
