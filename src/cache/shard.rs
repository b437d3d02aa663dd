//! Sharded Map
//!
//! Key-to-value storage split into power-of-two shards, each behind its own
//! `RwLock`, so operations on keys in different shards never contend.
//!
//! Callers lock one shard at a time. Nothing here enforces that; the entry
//! store relies on it to stay free of lock-order deadlocks.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::entry::CacheKey;

/// One lock-protected slice of the key space
pub type Shard<V> = RwLock<HashMap<CacheKey, V>>;

/// Sharded map with a power-of-two shard count chosen at runtime
pub struct ShardedMap<V> {
    shards: Box<[Shard<V>]>,
}

impl<V> ShardedMap<V> {
    /// `shard_count` must be a power of two (checked by config validation)
    pub fn new(shard_count: usize) -> Self {
        debug_assert!(shard_count.is_power_of_two());
        Self {
            shards: (0..shard_count)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
        }
    }

    #[inline]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard owning `key`
    #[inline]
    pub fn shard_for(&self, key: &CacheKey) -> &Shard<V> {
        &self.shards[self.index_of(key)]
    }

    /// Index of the shard owning `key`
    #[inline]
    pub fn index_of(&self, key: &CacheKey) -> usize {
        key.shard_index(self.shards.len())
    }

    /// Shard at `index` (wraps around)
    #[inline]
    pub fn shard(&self, index: usize) -> &Shard<V> {
        &self.shards[index & (self.shards.len() - 1)]
    }

    pub fn shards(&self) -> impl Iterator<Item = &Shard<V>> {
        self.shards.iter()
    }

    /// Entries across all shards, locking each in turn
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.read().is_empty())
    }
}
