//! Cache Manager Module
//!
//! Owns the shard pool, the router, and the scaling controller, and
//! dispatches every public operation to one shard.
//!
//! Lock hierarchy, acquired strictly top-down: the pool lock first (read
//! for routing, write for adding/removing shards and rebalancing), then one
//! shard's exclusive lock. Rebalancing holds the pool write lock for its
//! whole duration, so callers observe the pool either before or after a
//! scaling step, never in between.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::cache::clock::{Clock, SystemClock};
use crate::cache::shard::Shard;
use crate::cache::stats::CacheStats;
use crate::cache::{DEFAULT_TTL_SECS, DYNAMIC_INITIAL_SHARDS};
use crate::config::Config;
use crate::error::ConfigError;
use crate::router::Router;
use crate::tasks::spawn_cleaner;

/// Sharded in-process key/value cache.
///
/// Keys are arbitrary byte strings; values are any cloneable payload. All
/// operations are safe to call concurrently from any number of threads, and
/// every operation runs to completion under at most one shard lock.
pub struct Cache<V> {
    pool: RwLock<Vec<Arc<Shard<V>>>>,
    router: Router,
    shard_cap: usize,
    node_cap: usize,
    shard_cost_limit: u64,
    dynamic: bool,
    cleaner_enabled: bool,
    clock: Arc<dyn Clock>,
}

impl<V: Clone + Send + Sync + 'static> Cache<V> {
    /// Builds a cache from the configuration, using the system clock.
    ///
    /// With dynamic sharding enabled the pool starts at 4 shards and
    /// `shard_cap` bounds its growth; otherwise exactly `shard_cap` shards
    /// are created and the pool never changes size.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Builds a cache that reads time from the given clock. Useful for
    /// deterministic expiration tests; [`Cache::new`] is the common path.
    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        config.validate()?;

        let cache = Self {
            pool: RwLock::new(Vec::with_capacity(config.shard_cap)),
            router: Router::new(),
            shard_cap: config.shard_cap,
            node_cap: config.node_cap,
            shard_cost_limit: config.effective_max_cost() / config.shard_cap as u64,
            dynamic: config.enable_dynamic_sharding,
            cleaner_enabled: config.enable_cleaner,
            clock,
        };

        let initial = if cache.dynamic {
            DYNAMIC_INITIAL_SHARDS
        } else {
            cache.shard_cap
        };
        {
            let mut pool = cache.pool.write();
            for _ in 0..initial {
                cache.add_shard(&mut pool);
            }
        }
        info!(shards = initial, dynamic = cache.dynamic, "cache initialized");

        Ok(cache)
    }

    /// Stores a key/value pair with the default 12-hour TTL.
    ///
    /// `cost` is the caller's size estimate in bytes; see
    /// [`Config::max_cost`] for how it feeds eviction.
    pub fn set(&self, key: impl Into<Vec<u8>>, value: V, cost: u64) {
        let now = self.clock.now_unix();
        self.write(key.into(), value, cost, now + DEFAULT_TTL_SECS, now);
    }

    /// Stores a key/value pair with an explicit TTL. A zero TTL means the
    /// entry never expires. Sub-second durations truncate to whole seconds.
    pub fn set_ttl(&self, key: impl Into<Vec<u8>>, value: V, cost: u64, ttl: Duration) {
        let now = self.clock.now_unix();
        let expires_at = if ttl.as_secs() == 0 {
            0
        } else {
            now + ttl.as_secs()
        };
        self.write(key.into(), value, cost, expires_at, now);
    }

    /// Looks up a key, returning a clone of its value. A hit refreshes the
    /// entry's recency; an expired entry is removed and reported as a miss.
    pub fn get(&self, key: impl AsRef<[u8]>) -> Option<V> {
        let key = key.as_ref();
        let now = self.clock.now_unix();
        let pool = self.pool.read();
        let idx = self.router.bucket(key, pool.len());
        pool[idx].lookup(key, now)
    }

    /// Removes a key. Removing an absent key is a no-op; returns whether an
    /// entry was removed.
    pub fn remove(&self, key: impl AsRef<[u8]>) -> bool {
        let key = key.as_ref();
        let pool = self.pool.read();
        let idx = self.router.bucket(key, pool.len());
        pool[idx].remove(key)
    }

    /// Number of live entries across all shards.
    pub fn len(&self) -> usize {
        self.pool.read().iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current shard count.
    pub fn shard_count(&self) -> usize {
        self.pool.read().len()
    }

    /// Snapshot of the aggregated counters and gauges.
    pub fn stats(&self) -> CacheStats {
        let pool = self.pool.read();
        let mut stats = CacheStats {
            shards: pool.len(),
            ..CacheStats::default()
        };
        for shard in pool.iter() {
            let (counters, entries, cost) = shard.snapshot();
            stats.absorb(counters, entries, cost);
        }
        stats
    }

    fn write(&self, key: Vec<u8>, value: V, cost: u64, expires_at: u64, now: u64) {
        if self.dynamic {
            self.scale_if_needed();
        }

        let pool = self.pool.read();
        let idx = self.router.bucket(&key, pool.len());

        // The routed shard always handles keys it already holds, so writes
        // to a live key stay last-writer-wins. Only a brand-new key on a
        // full shard spills to the least-loaded shard.
        if let Some((key, value)) =
            pool[idx].try_insert(key.into_boxed_slice(), value, cost, expires_at, now)
        {
            Self::least_loaded(&pool).insert(key, value, cost, expires_at, now);
        }
    }

    /// First shard with the smallest entry count.
    fn least_loaded<'a>(pool: &'a [Arc<Shard<V>>]) -> &'a Arc<Shard<V>> {
        let mut target = &pool[0];
        let mut min = target.len();
        for shard in &pool[1..] {
            let len = shard.len();
            if len < min {
                min = len;
                target = shard;
            }
        }
        target
    }

    fn add_shard(&self, pool: &mut Vec<Arc<Shard<V>>>) {
        let shard = Arc::new(Shard::new(self.node_cap, self.shard_cost_limit));
        if self.cleaner_enabled {
            shard.set_cleaner(spawn_cleaner(Arc::clone(&shard), Arc::clone(&self.clock)));
        }
        pool.push(shard);
    }

    /// The scaling controller, run before every write when dynamic sharding
    /// is on. Grow and shrink are mutually exclusive within one cycle and
    /// grow takes precedence.
    fn scale_if_needed(&self) {
        let (grow, shrink) = {
            let pool = self.pool.read();
            let grow = pool.len() < self.shard_cap
                && pool.iter().any(|s| s.len() + 1 >= self.node_cap);
            let shrink =
                pool.len() > 2 && pool.iter().any(|s| s.len() <= self.node_cap / 4);
            (grow, !grow && shrink)
        };
        if !grow && !shrink {
            return;
        }

        let mut pool = self.pool.write();

        // Conditions are re-checked under the write lock: another writer
        // may have scaled the pool while we waited.
        if grow {
            if pool.len() < self.shard_cap && pool.iter().any(|s| s.len() + 1 >= self.node_cap)
            {
                self.add_shard(&mut pool);
                self.rebalance(&pool);
                info!(shards = pool.len(), "shard pool grown");
            }
            return;
        }

        if pool.len() > 2 && pool.iter().any(|s| s.len() <= self.node_cap / 4) {
            let mut dropped = 0;
            while pool.len() > 2 && pool.last().map_or(false, |s| s.is_empty()) {
                if let Some(shard) = pool.pop() {
                    shard.stop_cleaner();
                    dropped += 1;
                }
            }
            // Rebalancing is the second half of the shrink action, whether
            // or not the backward scan found empty trailing shards to drop.
            self.rebalance(&pool);
            info!(dropped, shards = pool.len(), "shard pool shrunk");
        }
    }

    /// Re-homes every live entry against the current pool length. Runs
    /// under the pool write lock, so no other operation observes a
    /// half-moved state.
    fn rebalance(&self, pool: &[Arc<Shard<V>>]) {
        let now = self.clock.now_unix();

        let mut entries = Vec::new();
        for shard in pool.iter() {
            entries.extend(shard.drain());
        }
        let total = entries.len();

        for entry in entries {
            let idx = self.router.bucket(&entry.key, pool.len());
            pool[idx].rehome(entry, now);
        }
        debug!(entries = total, shards = pool.len(), "entries re-homed");
    }
}

impl<V> Drop for Cache<V> {
    fn drop(&mut self) {
        for shard in self.pool.read().iter() {
            shard.stop_cleaner();
        }
    }
}

#[cfg(test)]
impl<V: Clone + Send + Sync + 'static> Cache<V> {
    /// Checks the pool-shape invariant and every shard's cross-index
    /// invariant.
    pub(crate) fn assert_invariants(&self) {
        let pool = self.pool.read();
        assert!(!pool.is_empty(), "shard pool is never empty");
        if self.dynamic {
            assert!(pool.len() >= 2, "dynamic pool shrank below 2");
            assert!(pool.len() <= self.shard_cap, "dynamic pool exceeded cap");
        } else {
            assert_eq!(pool.len(), self.shard_cap);
        }
        for shard in pool.iter() {
            shard.assert_invariants();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;

    fn fixed(shard_cap: usize, node_cap: usize) -> Config {
        Config {
            enable_cleaner: false,
            enable_dynamic_sharding: false,
            shard_cap,
            node_cap,
            max_cost: 0,
        }
    }

    fn manual(start: u64) -> Arc<ManualClock> {
        Arc::new(ManualClock::new(start))
    }

    #[test]
    fn test_set_get_remove_round_trip() {
        let cache: Cache<String> = Cache::new(fixed(4, 4)).unwrap();

        cache.set("a", "1".to_string(), 0);
        assert_eq!(cache.get("a"), Some("1".to_string()));

        assert!(cache.remove("a"));
        assert_eq!(cache.get("a"), None);
        assert!(!cache.remove("a"));
        cache.assert_invariants();
    }

    #[test]
    fn test_set_overwrites_value() {
        let cache: Cache<String> = Cache::new(fixed(4, 4)).unwrap();

        cache.set("a", "1".to_string(), 0);
        cache.set("a", "2".to_string(), 0);
        assert_eq!(cache.get("a"), Some("2".to_string()));
        assert_eq!(cache.len(), 1);
        cache.assert_invariants();
    }

    #[test]
    fn test_default_ttl_is_twelve_hours() {
        let clock = manual(1_000_000);
        let cache: Cache<String> =
            Cache::with_clock(fixed(2, 8), clock.clone()).unwrap();

        cache.set("a", "1".to_string(), 0);

        clock.advance(12 * 60 * 60 - 1);
        assert_eq!(cache.get("a"), Some("1".to_string()));

        // The hit above refreshed last_used but not the expiry.
        clock.advance(1);
        assert_eq!(cache.get("a"), None);
        cache.assert_invariants();
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        let clock = manual(1_000);
        let cache: Cache<String> =
            Cache::with_clock(fixed(2, 8), clock.clone()).unwrap();

        cache.set_ttl("a", "1".to_string(), 0, Duration::ZERO);
        clock.advance(u64::MAX / 4);
        assert_eq!(cache.get("a"), Some("1".to_string()));
        cache.assert_invariants();
    }

    #[test]
    fn test_expired_entry_vanishes_from_every_index() {
        let clock = manual(1_000);
        let cache: Cache<String> =
            Cache::with_clock(fixed(2, 8), clock.clone()).unwrap();

        cache.set_ttl("t", "v".to_string(), 0, Duration::from_secs(1));
        assert_eq!(cache.get("t"), Some("v".to_string()));

        clock.advance(2);
        assert_eq!(cache.get("t"), None);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().expired, 1);
        cache.assert_invariants();
    }

    #[test]
    fn test_stats_track_hits_and_misses() {
        let cache: Cache<String> = Cache::new(fixed(2, 8)).unwrap();

        cache.set("a", "1".to_string(), 0);
        cache.get("a");
        cache.get("a");
        cache.get("missing");

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.shards, 2);
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_dynamic_pool_grows_under_load() {
        let cache: Cache<String> = Cache::new(Config {
            enable_dynamic_sharding: true,
            shard_cap: 16,
            node_cap: 4,
            ..Config::default()
        })
        .unwrap();
        assert_eq!(cache.shard_count(), DYNAMIC_INITIAL_SHARDS);

        for i in 0..50 {
            cache.set(format!("key-{i}"), format!("val-{i}"), 0);
        }

        assert!(cache.shard_count() > DYNAMIC_INITIAL_SHARDS);
        assert!(cache.shard_count() <= 16);
        cache.assert_invariants();

        // Whatever survived capacity pressure must read back unchanged.
        let mut present = 0;
        for i in 0..50 {
            if let Some(v) = cache.get(format!("key-{i}")) {
                assert_eq!(v, format!("val-{i}"));
                present += 1;
            }
        }
        assert!(present > 0);
        assert_eq!(cache.len(), present);
    }

    #[test]
    fn test_dynamic_pool_shrinks_when_load_drops() {
        let cache: Cache<String> = Cache::new(Config {
            enable_dynamic_sharding: true,
            shard_cap: 16,
            node_cap: 4,
            ..Config::default()
        })
        .unwrap();

        for i in 0..50 {
            cache.set(format!("key-{i}"), format!("val-{i}"), 0);
        }
        let grown = cache.shard_count();
        assert!(grown > DYNAMIC_INITIAL_SHARDS);

        for i in 0..50 {
            cache.remove(format!("key-{i}"));
        }
        assert!(cache.is_empty());

        // The controller runs on writes; the next write sees the idle pool
        // and drops the empty trailing shards before routing.
        cache.set("fresh", "v".to_string(), 0);

        let shrunk = cache.shard_count();
        assert!(shrunk < grown, "pool should shrink once load drops");
        assert!(shrunk >= 2, "pool never shrinks below 2");
        assert_eq!(cache.get("fresh"), Some("v".to_string()));
        assert_eq!(cache.len(), 1);
        cache.assert_invariants();
    }

    #[test]
    fn test_fixed_pool_never_scales() {
        let cache: Cache<String> = Cache::new(fixed(3, 2)).unwrap();

        for i in 0..100 {
            cache.set(format!("key-{i}"), "v".to_string(), 0);
        }
        assert_eq!(cache.shard_count(), 3);
        assert!(cache.len() <= 6);
        cache.assert_invariants();
    }

    #[test]
    fn test_rebalance_preserves_values() {
        let clock = manual(1_000);
        let cache: Cache<String> = Cache::with_clock(
            Config {
                enable_dynamic_sharding: true,
                shard_cap: 16,
                node_cap: 16,
                ..Config::default()
            },
            clock.clone(),
        )
        .unwrap();

        for i in 0..60 {
            cache.set(format!("key-{i}"), format!("val-{i}"), 0);
        }
        // Pool is large enough that nothing was evicted; a grow (and thus a
        // rebalance) must have happened along the way.
        assert!(cache.shard_count() > DYNAMIC_INITIAL_SHARDS);
        assert_eq!(cache.len(), 60);
        for i in 0..60 {
            assert_eq!(cache.get(format!("key-{i}")), Some(format!("val-{i}")));
        }
        cache.assert_invariants();
    }

    #[test]
    fn test_full_shard_spills_new_key_to_least_loaded() {
        let cache: Cache<String> = Cache::new(fixed(2, 2)).unwrap();

        // Fill both shards completely, then one more new key: every shard
        // ties on load, so the spill lands on the first and evicts its LRU.
        for i in 0..40 {
            cache.set(format!("key-{i}"), "v".to_string(), 0);
            if cache.len() == 4 {
                break;
            }
        }
        assert_eq!(cache.len(), 4);
        cache.set("one-more", "v".to_string(), 0);
        assert_eq!(cache.len(), 4);
        cache.assert_invariants();
    }

    #[test]
    fn test_rejects_invalid_config() {
        assert!(Cache::<String>::new(fixed(0, 4)).is_err());
        assert!(Cache::<String>::new(fixed(4, 0)).is_err());
        assert!(Cache::<String>::new(Config {
            enable_dynamic_sharding: true,
            shard_cap: 3,
            ..Config::default()
        })
        .is_err());
    }
}
