//! Error types for cache construction
//!
//! Provides unified error handling using thiserror.

use thiserror::Error;

// == Config Error Enum ==
/// Errors reported when a [`crate::Config`] fails validation.
///
/// Construction is the only fallible surface of the cache: every runtime
/// operation either succeeds or reports a miss.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `shard_cap` must be a positive shard count
    #[error("shard_cap must be positive, got {0}")]
    InvalidShardCap(usize),

    /// `node_cap` must be a positive per-shard entry capacity
    #[error("node_cap must be positive, got {0}")]
    InvalidNodeCap(usize),

    /// Dynamic sharding starts from a fixed pool and needs headroom for it
    #[error("dynamic sharding requires shard_cap >= {min}, got {got}")]
    ShardCapBelowDynamicFloor { min: usize, got: usize },
}
