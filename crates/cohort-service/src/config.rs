//! Group service configuration.

use serde::Deserialize;

/// Configuration for the group mutation service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Maximum group name length in characters (default: 100).
    pub max_name_length: usize,
    /// Maximum group description length in characters (default: 1024).
    pub max_description_length: usize,
    /// Prefix reserved for system groups (default: `role:`).
    pub reserved_name_prefix: String,
    /// Closure re-reads allowed while locking a subgraph before giving up
    /// with a contention error (default: 8).
    pub max_lock_rounds: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_name_length: 100,
            max_description_length: 1024,
            reserved_name_prefix: "role:".into(),
            max_lock_rounds: 8,
        }
    }
}
