//! LRU Recency Index
//!
//! Orders keys from least- to most-recently used. Every access stamps the key
//! with a fresh tick from a monotonic counter, so no two keys ever share a
//! recency position; ties are broken by stamp order, which for keys that were
//! never touched again is insertion order.
//!
//! The index is also the authority on capacity: a key counts against the
//! limit exactly while it is present here.

use std::collections::{BTreeMap, HashMap};

use super::entry::CacheKey;

#[derive(Debug, Clone, Copy)]
struct Slot {
    tick: u64,
    generation: u64,
}

/// Recency order plus the generation of the entry each key currently maps to
#[derive(Debug)]
pub struct LruIndex {
    /// tick -> key, oldest first
    order: BTreeMap<u64, CacheKey>,
    /// key -> position and generation
    slots: HashMap<CacheKey, Slot>,
    next_tick: u64,
    capacity: usize,
}

impl LruIndex {
    /// Create an index holding at most `capacity` keys
    pub fn new(capacity: usize) -> Self {
        Self {
            order: BTreeMap::new(),
            slots: HashMap::new(),
            next_tick: 0,
            capacity,
        }
    }

    #[inline]
    fn stamp(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Change the capacity, returning keys evicted to fit it
    pub fn set_capacity(&mut self, capacity: usize) -> Vec<(CacheKey, u64)> {
        self.capacity = capacity;
        let mut victims = Vec::new();
        while self.slots.len() > self.capacity {
            match self.pop_lru() {
                Some(victim) => victims.push(victim),
                None => break,
            }
        }
        victims
    }

    /// Generation tracked for `key`
    pub fn generation(&self, key: &CacheKey) -> Option<u64> {
        self.slots.get(key).map(|slot| slot.generation)
    }

    /// True if `key` is tracked with exactly this generation
    pub fn is_current(&self, key: &CacheKey, generation: u64) -> bool {
        self.generation(key) == Some(generation)
    }

    /// Move `key` to the most-recently-used end
    pub fn touch(&mut self, key: &CacheKey) -> bool {
        let tick = self.stamp();
        match self.slots.get_mut(key) {
            Some(slot) => {
                self.order.remove(&slot.tick);
                slot.tick = tick;
                self.order.insert(tick, key.clone());
                true
            }
            None => false,
        }
    }

    /// Track `key` at the most-recently-used end with a new generation.
    ///
    /// Returns the keys evicted to make room; a key that is already tracked
    /// never causes an eviction.
    pub fn insert(&mut self, key: CacheKey, generation: u64) -> Vec<(CacheKey, u64)> {
        let mut victims = Vec::new();
        if let Some(slot) = self.slots.remove(&key) {
            self.order.remove(&slot.tick);
        } else {
            while self.slots.len() >= self.capacity {
                match self.pop_lru() {
                    Some(victim) => victims.push(victim),
                    None => break,
                }
            }
        }
        let tick = self.stamp();
        self.order.insert(tick, key.clone());
        self.slots.insert(key, Slot { tick, generation });
        victims
    }

    /// Stop tracking `key`
    pub fn remove(&mut self, key: &CacheKey) -> Option<u64> {
        let slot = self.slots.remove(key)?;
        self.order.remove(&slot.tick);
        Some(slot.generation)
    }

    /// Stop tracking `key` only if it still has `generation`
    pub fn remove_if_current(&mut self, key: &CacheKey, generation: u64) -> bool {
        if self.is_current(key, generation) {
            self.remove(key);
            true
        } else {
            false
        }
    }

    /// Remove and return the least-recently-used key
    pub fn pop_lru(&mut self) -> Option<(CacheKey, u64)> {
        let (_, key) = self.order.pop_first()?;
        let slot = self.slots.remove(&key)?;
        Some((key, slot.generation))
    }

    /// Least-recently-used key, without removing it
    pub fn peek_lru(&self) -> Option<&CacheKey> {
        self.order.values().next()
    }

    /// Keys from least- to most-recently used
    pub fn keys(&self) -> Vec<CacheKey> {
        self.order.values().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.slots.clear();
    }
}
