//! Action tuning read from spec properties.

use std::collections::BTreeMap;

use crate::error::{ClusterError, Result};

/// Property key capping the number of concurrent role workers.
pub const MAX_CONCURRENCY_KEY: &str = "cluster.action.max-concurrency";

/// Configuration for one action run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionConfig {
    /// Upper bound on concurrent role workers.
    pub max_concurrency: usize,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self { max_concurrency: 8 }
    }
}

impl ActionConfig {
    /// Read overrides from free-form properties, falling back to defaults.
    pub fn from_properties(properties: &BTreeMap<String, String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(raw) = properties.get(MAX_CONCURRENCY_KEY) {
            let value: usize = raw.trim().parse().map_err(|_| {
                ClusterError::Configuration(format!(
                    "{MAX_CONCURRENCY_KEY} must be a positive integer, got '{raw}'"
                ))
            })?;
            if value == 0 {
                return Err(ClusterError::Configuration(format!(
                    "{MAX_CONCURRENCY_KEY} must be at least 1"
                )));
            }
            config.max_concurrency = value;
        }
        Ok(config)
    }

    /// Worker pool size: the number of distinct roles or the cap, whichever is smaller.
    pub fn pool_size(&self, distinct_roles: usize) -> usize {
        distinct_roles.clamp(1, self.max_concurrency.max(1))
    }
}
