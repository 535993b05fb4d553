//! Shard Module
//!
//! One partition of the cache: a key-to-slot map, the recency list, the
//! expiration heap, and the size/cost counters, all behind a single
//! exclusive lock. Lookups take the lock too, because a hit mutates the
//! recency list and refreshes `last_used`.
//!
//! Invariant: the set of slots in the map, the slots reachable from the
//! recency head, and the slots stored in the heap are always the same set.
//! Every mutation below goes through helpers that update all three together.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::cache::entry::{Arena, Entry};
use crate::cache::expiry::ExpiryHeap;
use crate::cache::recency::RecencyList;
use crate::cache::stats::ShardCounters;
use crate::tasks::CleanerHandle;

struct ShardInner<V> {
    map: HashMap<Box<[u8]>, usize>,
    arena: Arena<V>,
    recency: RecencyList,
    expiry: ExpiryHeap,
    cost_sum: u64,
    counters: ShardCounters,
}

/// One cache shard. The manager owns shards behind `Arc` and routes every
/// public operation to exactly one of them.
pub(crate) struct Shard<V> {
    capacity: usize,
    cost_limit: u64,
    inner: Mutex<ShardInner<V>>,
    /// Mirror of the live entry count, readable without the lock so the
    /// manager can pick the least-loaded shard and the scaling controller
    /// can scan the pool cheaply.
    count: AtomicUsize,
    cleaner: Mutex<Option<CleanerHandle>>,
}

impl<V> Shard<V> {
    pub fn new(capacity: usize, cost_limit: u64) -> Self {
        Self {
            capacity,
            cost_limit,
            inner: Mutex::new(ShardInner {
                map: HashMap::new(),
                arena: Arena::new(),
                recency: RecencyList::new(),
                expiry: ExpiryHeap::new(),
                cost_sum: 0,
                counters: ShardCounters::default(),
            }),
            count: AtomicUsize::new(0),
            cleaner: Mutex::new(None),
        }
    }

    /// Live entry count, read without locking.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stores the pair unless the shard is full and the key is new; in that
    /// case ownership of the pair is handed back so the manager can route it
    /// to the least-loaded shard instead. Existing keys are always updated
    /// in place, keeping last-writer-wins per key.
    pub fn try_insert(
        &self,
        key: Box<[u8]>,
        value: V,
        cost: u64,
        expires_at: u64,
        now: u64,
    ) -> Option<(Box<[u8]>, V)> {
        self.store(key, value, cost, expires_at, now, true)
    }

    /// Stores the pair unconditionally, evicting the recency tail on
    /// overflow.
    pub fn insert(&self, key: Box<[u8]>, value: V, cost: u64, expires_at: u64, now: u64) {
        self.store(key, value, cost, expires_at, now, false);
    }

    fn store(
        &self,
        key: Box<[u8]>,
        value: V,
        cost: u64,
        expires_at: u64,
        now: u64,
        reject_overflow: bool,
    ) -> Option<(Box<[u8]>, V)> {
        let mut inner = self.inner.lock();

        match inner.map.get(key.as_ref()).copied() {
            Some(slot)
                if inner
                    .arena
                    .get(slot)
                    .map_or(false, |e| !e.is_expired(now)) =>
            {
                // Live update: replace the payload, re-key both indexes.
                let old_cost = match inner.arena.get_mut(slot) {
                    Some(e) => {
                        let old = e.cost;
                        e.value = value;
                        e.cost = cost;
                        e.expires_at = expires_at;
                        old
                    }
                    None => 0,
                };
                inner.cost_sum = inner.cost_sum.saturating_sub(old_cost) + cost;
                inner.touch(slot, now);
                self.trim_cost(&mut inner);
                self.count.store(inner.map.len(), Ordering::Relaxed);
                return None;
            }
            Some(slot) => {
                // Present but expired: run the normal delete path, then fall
                // through to a fresh insertion.
                inner.counters.expired += 1;
                inner.remove_slot(slot);
            }
            None => {
                if reject_overflow && inner.map.len() >= self.capacity {
                    return Some((key, value));
                }
            }
        }

        inner.insert_entry(
            Entry {
                key,
                value,
                cost,
                expires_at,
                last_used: now,
                heap_slot: 0,
            },
            now,
        );
        if inner.map.len() > self.capacity {
            inner.evict_lru();
        }
        self.trim_cost(&mut inner);
        self.count.store(inner.map.len(), Ordering::Relaxed);
        None
    }

    /// Removes the key if present. Idempotent.
    pub fn remove(&self, key: &[u8]) -> bool {
        let mut inner = self.inner.lock();
        let slot = match inner.map.get(key).copied() {
            Some(slot) => slot,
            None => return false,
        };
        inner.remove_slot(slot);
        self.count.store(inner.map.len(), Ordering::Relaxed);
        true
    }

    /// Walks the map and removes every entry whose TTL has passed, then
    /// restores `len <= capacity` by popping the expiration heap. Returns
    /// the number of expired entries removed.
    pub fn clean_expired(&self, now: u64) -> usize {
        let mut inner = self.inner.lock();

        let stale: Vec<usize> = inner
            .map
            .values()
            .copied()
            .filter(|&slot| inner.arena.get(slot).map_or(true, |e| e.is_expired(now)))
            .collect();
        let removed = stale.len();
        for slot in stale {
            inner.remove_slot(slot);
        }
        inner.counters.expired += removed as u64;

        while inner.map.len() > self.capacity {
            let inner = &mut *inner;
            let slot = match inner.expiry.pop(&mut inner.arena) {
                Some(slot) => slot,
                None => break,
            };
            inner.remove_popped(slot);
            inner.counters.evictions += 1;
        }

        self.count.store(inner.map.len(), Ordering::Relaxed);
        removed
    }

    /// Empties the shard, returning every live entry. The recency list and
    /// expiration heap are reset in place; used by rebalancing.
    pub fn drain(&self) -> Vec<Entry<V>> {
        let mut inner = self.inner.lock();
        let entries = inner.arena.drain();
        inner.map.clear();
        inner.recency.clear();
        inner.expiry.clear();
        inner.cost_sum = 0;
        self.count.store(0, Ordering::Relaxed);
        entries
    }

    /// Accepts an entry during rebalancing. If the shard already holds the
    /// key (a collision between an authoritative entry and a stale overflow
    /// copy), the more recently used one wins; if the shard is at capacity,
    /// its recency tail is evicted first.
    pub fn rehome(&self, entry: Entry<V>, now: u64) {
        let mut inner = self.inner.lock();

        if let Some(slot) = inner.map.get(entry.key.as_ref()).copied() {
            let incumbent_newer = inner
                .arena
                .get(slot)
                .map_or(false, |e| e.last_used > entry.last_used);
            if incumbent_newer {
                return;
            }
            inner.remove_slot(slot);
        }

        if inner.map.len() >= self.capacity {
            inner.evict_lru();
        }
        inner.insert_entry(entry, now);
        self.count.store(inner.map.len(), Ordering::Relaxed);
    }

    /// Counters and gauges for [`crate::Cache::stats`].
    pub fn snapshot(&self) -> (ShardCounters, usize, u64) {
        let inner = self.inner.lock();
        (inner.counters, inner.map.len(), inner.cost_sum)
    }

    pub fn set_cleaner(&self, handle: CleanerHandle) {
        *self.cleaner.lock() = Some(handle);
    }

    pub fn stop_cleaner(&self) {
        if let Some(handle) = self.cleaner.lock().take() {
            handle.shutdown();
        }
    }

    fn trim_cost(&self, inner: &mut ShardInner<V>) {
        while inner.cost_sum > self.cost_limit {
            if inner.evict_lru().is_none() {
                break;
            }
        }
    }
}

impl<V: Clone> Shard<V> {
    /// Looks up the key. An expired hit is deleted and reported as a miss;
    /// a live hit is touched to the recency head with a fresh `last_used`.
    pub fn lookup(&self, key: &[u8], now: u64) -> Option<V> {
        let mut inner = self.inner.lock();

        let slot = match inner.map.get(key).copied() {
            Some(slot) => slot,
            None => {
                inner.counters.misses += 1;
                return None;
            }
        };

        if inner.arena.get(slot).map_or(true, |e| e.is_expired(now)) {
            inner.counters.misses += 1;
            inner.counters.expired += 1;
            inner.remove_slot(slot);
            self.count.store(inner.map.len(), Ordering::Relaxed);
            return None;
        }

        inner.touch(slot, now);
        inner.counters.hits += 1;
        inner.arena.get(slot).map(|e| e.value.clone())
    }
}

impl<V> ShardInner<V> {
    /// Wires a fresh entry into all three indexes.
    fn insert_entry(&mut self, mut entry: Entry<V>, now: u64) -> usize {
        entry.last_used = now;
        let cost = entry.cost;
        let key = entry.key.clone();
        let slot = self.arena.insert(entry);
        self.recency.push_front(slot);
        self.expiry.push(&mut self.arena, slot);
        self.map.insert(key, slot);
        self.cost_sum += cost;
        slot
    }

    /// Excises a slot from all three indexes.
    fn remove_slot(&mut self, slot: usize) -> Option<Entry<V>> {
        let pos = self.arena.get(slot)?.heap_slot;
        self.expiry.remove_at(&mut self.arena, pos);
        self.recency.unlink(slot);
        let entry = self.arena.remove(slot)?;
        self.map.remove(entry.key.as_ref());
        self.cost_sum = self.cost_sum.saturating_sub(entry.cost);
        Some(entry)
    }

    /// Finishes removing an entry whose slot was already popped off the
    /// expiration heap.
    fn remove_popped(&mut self, slot: usize) {
        self.recency.unlink(slot);
        if let Some(entry) = self.arena.remove(slot) {
            self.map.remove(entry.key.as_ref());
            self.cost_sum = self.cost_sum.saturating_sub(entry.cost);
        }
    }

    /// Moves a slot to the recency head and re-keys it in the heap with a
    /// fresh `last_used`. Skipping the heap re-key here would leave the
    /// expiration order meaningless.
    fn touch(&mut self, slot: usize, now: u64) {
        if let Some(pos) = self.arena.get(slot).map(|e| e.heap_slot) {
            self.expiry.remove_at(&mut self.arena, pos);
        }
        self.recency.move_to_front(slot);
        if let Some(entry) = self.arena.get_mut(slot) {
            entry.last_used = now;
        }
        self.expiry.push(&mut self.arena, slot);
    }

    /// Evicts the oldest entry by recency order.
    fn evict_lru(&mut self) -> Option<Entry<V>> {
        let slot = self.recency.pop_back()?;
        let entry = self.remove_slot(slot);
        self.counters.evictions += 1;
        entry
    }
}

#[cfg(test)]
impl<V> Shard<V> {
    /// Asserts the cross-index invariant: map slots, recency-reachable
    /// slots, and heap slots are the same set, counters agree, and the heap
    /// property holds with consistent back-references.
    pub fn assert_invariants(&self) {
        use std::collections::HashSet;

        let inner = self.inner.lock();

        let map_slots: HashSet<usize> = inner.map.values().copied().collect();
        assert_eq!(map_slots.len(), inner.map.len(), "keys share a slot");

        let list_slots: Vec<usize> = inner.recency.iter().collect();
        let list_set: HashSet<usize> = list_slots.iter().copied().collect();
        assert_eq!(list_slots.len(), list_set.len(), "recency list has a cycle");
        assert_eq!(map_slots, list_set, "map and recency list diverged");

        let heap_slots: HashSet<usize> = inner.expiry.slots().iter().copied().collect();
        assert_eq!(
            inner.expiry.slots().len(),
            heap_slots.len(),
            "heap holds a slot twice"
        );
        assert_eq!(map_slots, heap_slots, "map and expiration heap diverged");

        assert_eq!(inner.arena.len(), inner.map.len());
        assert_eq!(self.count.load(Ordering::Relaxed), inner.map.len());
        assert!(inner.map.len() <= self.capacity, "shard over capacity");

        let slots = inner.expiry.slots();
        for (pos, &slot) in slots.iter().enumerate() {
            assert_eq!(
                inner.arena.get(slot).map(|e| e.heap_slot),
                Some(pos),
                "stale heap back-reference"
            );
            if pos > 0 {
                let parent = slots[(pos - 1) / 2];
                let parent_key = inner.arena.get(parent).map(|e| e.last_used);
                let child_key = inner.arena.get(slot).map(|e| e.last_used);
                assert!(parent_key <= child_key, "heap property violated");
            }
        }

        let cost: u64 = inner
            .map
            .values()
            .filter_map(|&slot| inner.arena.get(slot))
            .map(|e| e.cost)
            .sum();
        assert_eq!(cost, inner.cost_sum, "cost_sum drifted");

        for (key, &slot) in inner.map.iter() {
            assert_eq!(
                inner.arena.get(slot).map(|e| e.key.as_ref()),
                Some(key.as_ref()),
                "map key does not match entry key"
            );
        }
    }

    /// Most recent key in the recency list, for touch-ordering tests.
    pub fn head_key(&self) -> Option<Vec<u8>> {
        let inner = self.inner.lock();
        let slot = inner.recency.iter().next()?;
        inner.arena.get(slot).map(|e| e.key.to_vec())
    }
}
