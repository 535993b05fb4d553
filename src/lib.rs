//! shardcache - a sharded in-process key/value cache
//!
//! Values are stored under arbitrary byte-string keys, optionally with a
//! time-to-live, and read back concurrently from any number of threads.
//! Keys are partitioned across shards by a 64-bit fingerprint; each shard
//! keeps its entries in a recency list and an expiration heap, evicting the
//! least-recently-used entry on overflow and expired entries as their TTL
//! passes. An optional controller grows and shrinks the shard pool with
//! load, and optional per-shard sweepers collect expired entries in the
//! background.
//!
//! # Example
//!
//! ```
//! use shardcache::{Cache, Config};
//!
//! let config = Config {
//!     shard_cap: 4,
//!     node_cap: 128,
//!     ..Config::default()
//! };
//! let cache: Cache<String> = Cache::new(config).unwrap();
//!
//! cache.set("user:1", "ada".to_string(), 64);
//! assert_eq!(cache.get("user:1"), Some("ada".to_string()));
//!
//! cache.remove("user:1");
//! assert_eq!(cache.get("user:1"), None);
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod manager;
pub mod router;

pub(crate) mod tasks;

pub use cache::clock::{Clock, ManualClock, SystemClock};
pub use cache::stats::CacheStats;
pub use cache::{BYTE, DEFAULT_MAX_COST, DEFAULT_TTL_SECS, DYNAMIC_INITIAL_SHARDS, GB, KB, MB};
pub use config::Config;
pub use error::ConfigError;
pub use manager::Cache;
pub use router::fingerprint;
