//! Entry Store
//!
//! Bounded concurrent map from key to entry with LRU eviction and lazy expiry.
//!
//! # Locking
//!
//! ```text
//!   shard RwLock (one at a time)  ──▶  LRU Mutex  ──▶  tag index (dashmap)
//! ```
//!
//! Locks are always taken left to right and a thread never holds two shard
//! locks. An insert that must evict a key living in another shard pops the
//! victim from the LRU index while holding its own shard, then removes the
//! victim's entry after releasing it. Between those steps the victim is no
//! longer tracked by the LRU index, so lookups already treat it as absent.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::entry::{CacheEntry, CacheKey};
use super::expiry;
use super::lru::LruIndex;
use super::metrics::CacheMetrics;
use super::shard::ShardedMap;
use super::tags::TagIndex;
use crate::clock::SharedClock;
use crate::error::Result;

type EntryRef<V> = Arc<CacheEntry<V>>;

/// Bounded, sharded, LRU-ordered entry store
pub struct EntryStore<V> {
    shards: ShardedMap<EntryRef<V>>,
    lru: Mutex<LruIndex>,
    tags: TagIndex,
    clock: SharedClock,
    metrics: Arc<CacheMetrics>,
    next_generation: AtomicU64,
}

impl<V> EntryStore<V>
where
    V: Send + Sync,
{
    /// Create a store holding at most `capacity` entries
    pub fn new(
        capacity: usize,
        shard_count: usize,
        clock: SharedClock,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            shards: ShardedMap::new(shard_count),
            lru: Mutex::new(LruIndex::new(capacity)),
            tags: TagIndex::new(),
            clock,
            metrics,
            next_generation: AtomicU64::new(1),
        }
    }

    /// Look up a live entry, marking it most recently used.
    ///
    /// An expired entry is purged on the spot and reported as absent.
    pub fn get(&self, key: &CacheKey) -> Option<EntryRef<V>> {
        let now = self.clock.now();
        let expired = {
            let map = self.shards.shard_for(key).read();
            let entry = map.get(key)?;
            if expiry::is_live(entry.expires_at, now) {
                let mut lru = self.lru.lock();
                if !lru.is_current(key, entry.generation) {
                    // Evicted, removal still pending
                    return None;
                }
                lru.touch(key);
                return Some(Arc::clone(entry));
            }
            entry.generation
        };
        self.remove_generation(key, expired);
        None
    }

    /// Mark `key` most recently used without reading its value
    pub fn touch(&self, key: &CacheKey) -> bool {
        self.get(key).is_some()
    }

    /// Look up a live entry without changing its recency
    pub fn peek(&self, key: &CacheKey) -> Option<EntryRef<V>> {
        let now = self.clock.now();
        let map = self.shards.shard_for(key).read();
        let entry = map.get(key)?;
        let tracked = self.lru.lock().is_current(key, entry.generation);
        (tracked && expiry::is_live(entry.expires_at, now)).then(|| Arc::clone(entry))
    }

    /// Insert or replace an entry.
    ///
    /// Tags are moved to the new set under the key's shard lock. Inserting a
    /// new key into a full store first evicts the least-recently-used key.
    pub fn put(
        &self,
        key: CacheKey,
        value: V,
        ttl: Option<Duration>,
        tags: BTreeSet<String>,
    ) -> Result<()> {
        self.insert(key, value, ttl, tags, None).map(|_| ())
    }

    /// Insert only if the key still holds `expected` (`None`: no entry).
    ///
    /// Returns false, leaving the store untouched, when the key was written
    /// or removed since `expected` was observed.
    pub fn put_if_generation(
        &self,
        key: CacheKey,
        value: V,
        ttl: Option<Duration>,
        tags: BTreeSet<String>,
        expected: Option<u64>,
    ) -> Result<bool> {
        self.insert(key, value, ttl, tags, Some(expected))
    }

    /// Generation of the entry stored under `key`, live or not
    pub fn generation_of(&self, key: &CacheKey) -> Option<u64> {
        self.shards
            .shard_for(key)
            .read()
            .get(key)
            .map(|entry| entry.generation)
    }

    fn insert(
        &self,
        key: CacheKey,
        value: V,
        ttl: Option<Duration>,
        tags: BTreeSet<String>,
        expected: Option<Option<u64>>,
    ) -> Result<bool> {
        let created_at = self.clock.now();
        let expires_at = expiry::expires_at(created_at, ttl)?;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(CacheEntry {
            key: key.clone(),
            value,
            created_at,
            expires_at,
            tags,
            generation,
        });

        let shard_idx = self.shards.index_of(&key);
        let deferred = {
            let mut map = self.shards.shard(shard_idx).write();
            if let Some(expected) = expected {
                if map.get(&key).map(|current| current.generation) != expected {
                    return Ok(false);
                }
            }
            let victims = self.lru.lock().insert(key.clone(), generation);

            match map.insert(key.clone(), Arc::clone(&entry)) {
                Some(old) => self.tags.retag(&key, &old.tags, &entry.tags),
                None => self.tags.tag(&key, &entry.tags),
            }

            let mut deferred = Vec::new();
            for (victim, victim_generation) in victims {
                debug!(key = %victim, "Evicting least recently used entry");
                self.metrics.record_eviction();
                if self.shards.index_of(&victim) == shard_idx {
                    self.remove_locked(&mut map, &victim, Some(victim_generation));
                } else {
                    deferred.push((victim, victim_generation));
                }
            }
            deferred
        };

        for (victim, victim_generation) in deferred {
            self.remove_generation(&victim, victim_generation);
        }
        Ok(true)
    }

    /// Remove `key`; true if a live entry was removed
    pub fn remove(&self, key: &CacheKey) -> bool {
        let now = self.clock.now();
        let mut map = self.shards.shard_for(key).write();
        match self.remove_locked(&mut map, key, None) {
            Some((entry, tracked)) => tracked && expiry::is_live(entry.expires_at, now),
            None => false,
        }
    }

    /// Batch remove; returns how many live entries were removed
    pub fn remove_all<'a, I>(&self, keys: I) -> usize
    where
        I: IntoIterator<Item = &'a CacheKey>,
    {
        keys.into_iter().filter(|key| self.remove(key)).count()
    }

    /// Drop every entry carrying `tag` and forget the tag
    pub fn invalidate_tag(&self, tag: &str) -> usize {
        let candidates = self.tags.take(tag);
        let removed = self.remove_all(candidates.iter());
        debug!(
            tag,
            candidates = candidates.len(),
            removed,
            "Invalidated tag"
        );
        removed
    }

    /// Keys under `tag` that are live right now
    pub fn resolve_tag(&self, tag: &str) -> Vec<CacheKey> {
        let mut keys: Vec<_> = self
            .tags
            .resolve(tag)
            .into_iter()
            .filter(|key| self.peek(key).is_some())
            .collect();
        keys.sort();
        keys
    }

    /// Remove every expired entry; returns how many were purged
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut purged = 0;
        for shard in self.shards.shards() {
            let expired: Vec<(CacheKey, u64)> = shard
                .read()
                .iter()
                .filter(|(_, entry)| !expiry::is_live(entry.expires_at, now))
                .map(|(key, entry)| (key.clone(), entry.generation))
                .collect();
            for (key, generation) in expired {
                if self.remove_generation(&key, generation) {
                    purged += 1;
                }
            }
        }
        purged
    }

    /// Number of tracked entries (expired-but-unpurged included)
    pub fn len(&self) -> usize {
        self.lru.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lru.lock().capacity()
    }

    /// Change capacity, evicting LRU entries beyond it; returns the eviction count
    pub fn set_capacity(&self, capacity: usize) -> usize {
        let victims = self.lru.lock().set_capacity(capacity);
        let evicted = victims.len();
        for (victim, generation) in victims {
            debug!(key = %victim, capacity, "Evicting entry after capacity change");
            self.remove_generation(&victim, generation);
        }
        self.metrics.record_evictions(evicted as u64);
        evicted
    }

    /// Keys from least- to most-recently used
    pub fn keys_by_recency(&self) -> Vec<CacheKey> {
        self.lru.lock().keys()
    }

    /// Read access to the tag index
    pub fn tag_index(&self) -> &TagIndex {
        &self.tags
    }

    /// Remove `key` only if it still holds `generation`
    fn remove_generation(&self, key: &CacheKey, generation: u64) -> bool {
        let mut map = self.shards.shard_for(key).write();
        self.remove_locked(&mut map, key, Some(generation)).is_some()
    }

    /// Remove under an already-held shard lock.
    ///
    /// Returns the removed entry and whether the LRU index still tracked it.
    fn remove_locked(
        &self,
        map: &mut HashMap<CacheKey, EntryRef<V>>,
        key: &CacheKey,
        expected_generation: Option<u64>,
    ) -> Option<(EntryRef<V>, bool)> {
        if let Some(expected) = expected_generation {
            if map.get(key).map(|entry| entry.generation) != Some(expected) {
                return None;
            }
        }
        let entry = map.remove(key)?;
        self.tags.untag(key, &entry.tags);
        let tracked = self.lru.lock().remove_if_current(key, entry.generation);
        Some((entry, tracked))
    }
}

// =============================================================================
// Tests
// =============================================================================
