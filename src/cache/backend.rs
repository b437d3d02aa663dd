//! Backing Store Port
//!
//! The slower system of record behind the cache (database, remote API). The
//! engine treats every call as an opaque remote operation with its own
//! failure modes and wraps each one in a timeout.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::entry::CacheKey;
use crate::error::{Error, Result};

/// Backing store trait
#[async_trait]
pub trait BackingStore<V>: Send + Sync
where
    V: Send + Sync + 'static,
{
    /// Load a value; `Ok(None)` (or `Err(NotFound)`) means the store has nothing
    async fn load(&self, key: &CacheKey) -> Result<Option<V>>;

    /// Persist a value
    async fn save(&self, key: &CacheKey, value: &V) -> Result<()>;

    /// Persist several values, one result per entry in input order
    async fn save_batch(&self, entries: &[(CacheKey, V)]) -> Vec<Result<()>> {
        let mut results = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            results.push(self.save(key, value).await);
        }
        results
    }
}

/// Backing store operation counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackingStoreStats {
    pub loads: u64,
    pub saves: u64,
    pub batches: u64,
    pub failures: u64,
}

/// In-memory backing store for tests and the soak harness.
///
/// Supports artificial latency and injected failures.
pub struct InMemoryBackingStore<V> {
    data: DashMap<CacheKey, V>,
    /// Every successful save, in order
    history: Mutex<Vec<(CacheKey, V)>>,
    latency_us: AtomicU64,
    fail_loads: AtomicBool,
    fail_saves: AtomicBool,
    /// Fail this many upcoming saves, then recover
    fail_next_saves: AtomicU32,
    loads: AtomicU64,
    saves: AtomicU64,
    batches: AtomicU64,
    failures: AtomicU64,
}

impl<V> Default for InMemoryBackingStore<V> {
    fn default() -> Self {
        Self {
            data: DashMap::new(),
            history: Mutex::new(Vec::new()),
            latency_us: AtomicU64::new(0),
            fail_loads: AtomicBool::new(false),
            fail_saves: AtomicBool::new(false),
            fail_next_saves: AtomicU32::new(0),
            loads: AtomicU64::new(0),
            saves: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }
}

impl<V> InMemoryBackingStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a value without recording a save
    pub fn insert(&self, key: impl Into<CacheKey>, value: V) {
        self.data.insert(key.into(), value);
    }

    /// Current stored value
    pub fn value(&self, key: &CacheKey) -> Option<V> {
        self.data.get(key).map(|v| v.clone())
    }

    /// Successful saves for `key`, oldest first
    pub fn saves_for(&self, key: &CacheKey) -> Vec<V> {
        self.history
            .lock()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.latency_us
            .store(latency.as_micros() as u64, Ordering::Relaxed);
    }

    /// Make every load fail
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::Relaxed);
    }

    /// Make every save fail
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::Relaxed);
    }

    /// Fail the next `n` saves
    pub fn fail_next_saves(&self, n: u32) {
        self.fail_next_saves.store(n, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn stats(&self) -> BackingStoreStats {
        BackingStoreStats {
            loads: self.loads.load(Ordering::Relaxed),
            saves: self.saves.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    async fn simulate_latency(&self) {
        let us = self.latency_us.load(Ordering::Relaxed);
        if us > 0 {
            tokio::time::sleep(Duration::from_micros(us)).await;
        }
    }

    fn should_fail_save(&self) -> bool {
        if self.fail_saves.load(Ordering::Relaxed) {
            return true;
        }
        self.fail_next_saves
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl<V> BackingStore<V> for InMemoryBackingStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn load(&self, key: &CacheKey) -> Result<Option<V>> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        self.simulate_latency().await;

        if self.fail_loads.load(Ordering::Relaxed) {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(Error::BackingStore(format!("injected load failure for {}", key)));
        }
        Ok(self.data.get(key).map(|v| v.clone()))
    }

    async fn save(&self, key: &CacheKey, value: &V) -> Result<()> {
        self.saves.fetch_add(1, Ordering::Relaxed);
        self.simulate_latency().await;

        if self.should_fail_save() {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(Error::BackingStore(format!("injected save failure for {}", key)));
        }
        self.data.insert(key.clone(), value.clone());
        self.history.lock().push((key.clone(), value.clone()));
        Ok(())
    }

    async fn save_batch(&self, entries: &[(CacheKey, V)]) -> Vec<Result<()>> {
        self.batches.fetch_add(1, Ordering::Relaxed);
        let mut results = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            results.push(self.save(key, value).await);
        }
        results
    }
}

// =============================================================================
// Tests
// =============================================================================
