//! Server configuration.

use wharf_storage::{RateLimitConfig, StorageConfig};

use crate::dedupe::DedupeConfig;

/// Tuning for one coordinating server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Telemetry ring-buffer capacity.
    pub message_limit: usize,
    pub dedupe: DedupeConfig,
    pub rate_limit: RateLimitConfig,
    pub storage: StorageConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            message_limit: 200,
            dedupe: DedupeConfig::default(),
            rate_limit: RateLimitConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_dedupe(mut self, dedupe: DedupeConfig) -> Self {
        self.dedupe = dedupe;
        self
    }

    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }
}
