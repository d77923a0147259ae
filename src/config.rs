//! Engine configuration.
//!
//! All settings can be configured via environment variables:
//! - `SOSA_BATCH_SIZE`: Entries buffered before a flush (default: 1000)
//! - `SOSA_MAX_GENERATION`: Traversal depth cap, never above the store's own cap (default: unset)
//! - `SOSA_COMPUTE_TIMEOUT_SECS`: Abort a computation after this many seconds (default: unset)
//! - `SOSA_STATS_CACHE_ENTRIES`: Per-generation statistics kept in the LRU cache (default: 256)

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of entries buffered by the batch writer.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default capacity of the statistics cache.
pub const DEFAULT_STATS_CACHE_ENTRIES: usize = 256;

/// Configuration for computations and statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SosaConfig {
    /// Entries buffered before the batch writer flushes (default: 1000).
    pub batch_size: usize,
    /// Optional traversal cap below the store's maximum generation.
    pub max_generation: Option<u32>,
    /// Optional wall-clock limit for one computation, in seconds.
    pub compute_timeout_secs: Option<u64>,
    /// Capacity of the per-generation statistics cache (0 disables it).
    pub stats_cache_entries: usize,
}

impl SosaConfig {
    /// Load configuration from environment variables with defaults.
    pub fn from_env() -> Self {
        Self {
            batch_size: std::env::var("SOSA_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(DEFAULT_BATCH_SIZE),
            max_generation: std::env::var("SOSA_MAX_GENERATION")
                .ok()
                .and_then(|s| s.parse().ok()),
            compute_timeout_secs: std::env::var("SOSA_COMPUTE_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok()),
            stats_cache_entries: std::env::var("SOSA_STATS_CACHE_ENTRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_STATS_CACHE_ENTRIES),
        }
    }

    /// Timeout as a duration.
    pub fn compute_timeout(&self) -> Option<Duration> {
        self.compute_timeout_secs.map(Duration::from_secs)
    }

    /// Effective traversal cap given the store's own cap.
    pub fn effective_max_generation(&self, store_cap: u32) -> u32 {
        self.max_generation
            .map(|cap| cap.clamp(1, store_cap))
            .unwrap_or(store_cap)
    }
}

impl Default for SosaConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_generation: None,
            compute_timeout_secs: None,
            stats_cache_entries: DEFAULT_STATS_CACHE_ENTRIES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SosaConfig::default();
        assert_eq!(config.batch_size, 1000);
        assert!(config.compute_timeout().is_none());
        assert_eq!(config.effective_max_generation(64), 64);
    }

    #[test]
    fn test_max_generation_never_exceeds_store_cap() {
        let config = SosaConfig {
            max_generation: Some(80),
            ..SosaConfig::default()
        };
        assert_eq!(config.effective_max_generation(63), 63);

        let config = SosaConfig {
            max_generation: Some(12),
            ..SosaConfig::default()
        };
        assert_eq!(config.effective_max_generation(64), 12);
    }
}
