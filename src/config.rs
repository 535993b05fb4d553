//! Configuration Module
//!
//! Holds the construction options for a [`crate::Cache`] and validates them.

use std::env;

use crate::cache::{DEFAULT_MAX_COST, DYNAMIC_INITIAL_SHARDS};
use crate::error::ConfigError;

/// Cache configuration parameters.
///
/// All values can also be loaded from environment variables via
/// [`Config::from_env`], with the same defaults as [`Config::default`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Start one background sweeper task per shard that removes expired
    /// entries. Requires an ambient tokio runtime at construction time.
    pub enable_cleaner: bool,
    /// Let the shard pool grow and shrink with load. The pool starts at
    /// 4 shards and `shard_cap` becomes an upper bound.
    pub enable_dynamic_sharding: bool,
    /// Fixed shard count when dynamic sharding is off; upper bound on the
    /// shard count when it is on. Must be positive.
    pub shard_cap: usize,
    /// Per-shard entry capacity. Must be positive.
    pub node_cap: usize,
    /// Cost ceiling in bytes, split evenly across `shard_cap` shards.
    /// Inserts evict least-recently-used entries while a shard's cost sum
    /// exceeds its share; an entry costlier than the share itself is
    /// dropped on arrival. Zero selects the 512 MiB default.
    pub max_cost: u64,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `ENABLE_CLEANER` - "1" or "true" starts per-shard sweepers (default: false)
    /// - `ENABLE_DYNAMIC_SHARDING` - "1" or "true" enables the scaling controller (default: false)
    /// - `SHARD_CAP` - shard count or upper bound (default: 8)
    /// - `NODE_CAP` - per-shard entry capacity (default: 1024)
    /// - `MAX_COST` - cost ceiling in bytes (default: 512 MiB)
    pub fn from_env() -> Self {
        Self {
            enable_cleaner: env_flag("ENABLE_CLEANER"),
            enable_dynamic_sharding: env_flag("ENABLE_DYNAMIC_SHARDING"),
            shard_cap: env::var("SHARD_CAP")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
            node_cap: env::var("NODE_CAP")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1024),
            max_cost: env::var("MAX_COST")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_COST),
        }
    }

    /// Checks the capacity fields; called by [`crate::Cache::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shard_cap == 0 {
            return Err(ConfigError::InvalidShardCap(self.shard_cap));
        }
        if self.node_cap == 0 {
            return Err(ConfigError::InvalidNodeCap(self.node_cap));
        }
        if self.enable_dynamic_sharding && self.shard_cap < DYNAMIC_INITIAL_SHARDS {
            return Err(ConfigError::ShardCapBelowDynamicFloor {
                min: DYNAMIC_INITIAL_SHARDS,
                got: self.shard_cap,
            });
        }
        Ok(())
    }

    /// The configured cost ceiling, with zero mapped to the default.
    pub(crate) fn effective_max_cost(&self) -> u64 {
        if self.max_cost == 0 {
            DEFAULT_MAX_COST
        } else {
            self.max_cost
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enable_cleaner: false,
            enable_dynamic_sharding: false,
            shard_cap: 8,
            node_cap: 1024,
            max_cost: DEFAULT_MAX_COST,
        }
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
