//! Configuration model for the lock manager
//!
//! Typed access to `jicama.lock.*` configuration keys with defaults.

use jicama_common::DEFAULT_RECALL_TIMEOUT_MS;

/// Resolved lock manager settings
#[derive(Clone, Debug)]
pub struct LockManagerConfig {
    /// Whether the server may grant greedy (client-cached) locks
    pub greedy_enabled: bool,
    /// How long a recall may stay unanswered before the server logs the
    /// greedy holder as unresponsive (and purges it if disconnected)
    pub recall_timeout_ms: u64,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            greedy_enabled: true,
            recall_timeout_ms: DEFAULT_RECALL_TIMEOUT_MS,
        }
    }
}

impl LockManagerConfig {
    /// Resolve settings from an application configuration
    pub fn from_config(config: &config::Config) -> Self {
        Self {
            greedy_enabled: config.get_bool("jicama.lock.greedy-enabled").unwrap_or(true),
            recall_timeout_ms: config
                .get_int("jicama.lock.recall-timeout")
                .map(|v| v.max(0) as u64)
                .unwrap_or(DEFAULT_RECALL_TIMEOUT_MS),
        }
    }
}
