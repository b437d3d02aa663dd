//! Strategy Layer
//!
//! [`Cache`] is the engine's public face. It composes the entry store,
//! stampede guard, backing store and write-behind queue into the named
//! caching strategies:
//!
//! | Operation                    | Strategy       | Backing store          |
//! |------------------------------|----------------|------------------------|
//! | [`Cache::get_or_load`]       | cache-aside    | caller-supplied loader |
//! | [`Cache::get`]/[`get_with`]  | read-through   | configured store       |
//! | [`Cache::write_through`]     | write-through  | saved before caching   |
//! | [`Cache::write_behind`]      | write-behind   | queued, flushed later  |
//! | any hit near expiry          | refresh-ahead  | background reload      |
//!
//! A background maintenance task flushes the write-behind queue every
//! `flush_interval` and, when `sweep_interval` is set, purges expired
//! entries. It starts with the cache and stops on [`Cache::shutdown`].
//!
//! [`get_with`]: Cache::get_with

use std::future::Future;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::backend::BackingStore;
use super::entry::{CacheEntry, CacheKey, EntryOptions, Expiration};
use super::expiry;
use super::metrics::{CacheMetrics, CacheStats};
use super::singleflight::StampedeGuard;
use super::store::EntryStore;
use super::write_behind::{FlushFailure, FlushReport, WriteBehindConfig, WriteBehindQueue};
use crate::clock::{SharedClock, SystemClock};
use crate::config::{CacheConfig, ConfigUpdate, WriteMode};
use crate::error::{Error, Result};

/// Caching engine handle; clones share one cache
pub struct Cache<V>
where
    V: Clone + Send + Sync + 'static,
{
    inner: Arc<CacheInner<V>>,
}

impl<V> Clone for Cache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> std::fmt::Debug for Cache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").finish_non_exhaustive()
    }
}

struct CacheInner<V>
where
    V: Clone + Send + Sync + 'static,
{
    store: EntryStore<V>,
    guard: StampedeGuard<V>,
    backing: Option<Arc<dyn BackingStore<V>>>,
    queue: Option<Arc<WriteBehindQueue<V>>>,
    metrics: Arc<CacheMetrics>,
    clock: SharedClock,
    config: RwLock<CacheConfig>,
    /// Write-behind gate; true once shutdown has begun
    closed: RwLock<bool>,
    reconfigured: Arc<Notify>,
    cancel: CancellationToken,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl<V> Drop for CacheInner<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(queue) = &self.queue {
            let pending = queue.len();
            if pending > 0 {
                warn!(pending, "Cache dropped with unflushed write-behind entries");
            }
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Cache`]
pub struct CacheBuilder<V>
where
    V: Clone + Send + Sync + 'static,
{
    config: CacheConfig,
    backing: Option<Arc<dyn BackingStore<V>>>,
    clock: Option<SharedClock>,
}

impl<V> CacheBuilder<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Backing store used for read-through loads and writes
    pub fn backing_store(mut self, store: Arc<dyn BackingStore<V>>) -> Self {
        self.backing = Some(store);
        self
    }

    /// Time source for expiry (defaults to the system clock)
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration and start the cache.
    ///
    /// Spawns the maintenance task when there is anything to maintain, in
    /// which case this must be called inside a tokio runtime.
    pub fn build(self) -> Result<Cache<V>> {
        let config = self.config;
        config.validate()?;

        if config.write_mode == WriteMode::Behind && self.backing.is_none() {
            return Err(Error::Config(
                "write-behind mode requires a backing store".into(),
            ));
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let metrics = Arc::new(CacheMetrics::new());
        let store = EntryStore::new(
            config.capacity,
            config.shard_count,
            Arc::clone(&clock),
            Arc::clone(&metrics),
        );
        let queue = self.backing.as_ref().map(|backing| {
            Arc::new(WriteBehindQueue::new(
                Arc::clone(backing),
                Arc::clone(&metrics),
                WriteBehindConfig {
                    timeout: config.backing_store_timeout,
                    max_retries: config.max_flush_retries,
                    backoff: config.retry_backoff,
                },
            ))
        });

        let needs_maintenance = queue.is_some() || config.sweep_interval.is_some();
        let inner = Arc::new(CacheInner {
            store,
            guard: StampedeGuard::new(),
            backing: self.backing,
            queue,
            metrics,
            clock,
            config: RwLock::new(config),
            closed: RwLock::new(false),
            reconfigured: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            maintenance: Mutex::new(None),
        });

        if needs_maintenance {
            let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
                Error::Config("cache maintenance requires a tokio runtime".into())
            })?;
            let handle = runtime.spawn(maintain(
                Arc::downgrade(&inner),
                Arc::clone(&inner.reconfigured),
                inner.cancel.clone(),
            ));
            *inner.maintenance.lock() = Some(handle);
        }

        {
            let config = inner.config.read();
            info!(
                capacity = config.capacity,
                write_mode = %config.write_mode,
                backing_store = inner.backing.is_some(),
                "Cache started"
            );
        }
        Ok(Cache { inner })
    }
}

// =============================================================================
// Cache
// =============================================================================

impl<V> Cache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Start building a cache
    pub fn builder(config: CacheConfig) -> CacheBuilder<V> {
        CacheBuilder {
            config,
            backing: None,
            clock: None,
        }
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Read-through get with default entry options.
    ///
    /// Without a backing store this is a plain lookup.
    pub async fn get(&self, key: impl Into<CacheKey>) -> Result<Option<V>> {
        self.get_with(key, EntryOptions::default()).await
    }

    /// Read-through get; `options` apply if the value has to be loaded
    pub async fn get_with(
        &self,
        key: impl Into<CacheKey>,
        options: EntryOptions,
    ) -> Result<Option<V>> {
        let key = key.into();
        match self.inner.backing.clone() {
            Some(backing) => {
                let load_key = key.clone();
                self.get_or_load(key, options, move || async move {
                    backing.load(&load_key).await
                })
                .await
            }
            None => Ok(self.lookup(&key).map(|entry| entry.value().clone())),
        }
    }

    /// Cache-aside get: on a miss, `loader` fetches the value and the result
    /// is cached with `options`.
    ///
    /// Concurrent misses for one key run a single loader; every caller gets
    /// its result. When several callers race, the options of the one that
    /// started the load apply. A loader returning `Ok(None)` or
    /// `Err(NotFound)` is a miss and caches nothing.
    pub async fn get_or_load<F, Fut>(
        &self,
        key: impl Into<CacheKey>,
        options: EntryOptions,
        loader: F,
    ) -> Result<Option<V>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<V>>> + Send + 'static,
    {
        let key = key.into();
        if let Some(entry) = self.lookup(&key) {
            self.maybe_refresh(&entry, loader);
            return Ok(Some(entry.value().clone()));
        }
        let basis = self.inner.store.generation_of(&key);
        self.load_through(&key, options, basis, loader).await
    }

    /// Live value without touching recency or metrics
    pub fn peek(&self, key: &CacheKey) -> Option<V> {
        self.inner.store.peek(key).map(|entry| entry.value().clone())
    }

    /// Mark a key most recently used; false if it is absent
    pub fn touch(&self, key: &CacheKey) -> bool {
        self.inner.store.touch(key)
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Store a value in the cache only
    pub fn put(&self, key: impl Into<CacheKey>, value: V, options: EntryOptions) -> Result<()> {
        let ttl = self.resolve_ttl(options.expiration)?;
        self.inner.store.put(key.into(), value, ttl, options.tags)
    }

    /// Write using the configured [`WriteMode`]
    pub async fn set(&self, key: impl Into<CacheKey>, value: V, options: EntryOptions) -> Result<()> {
        let mode = self.inner.config.read().write_mode;
        match mode {
            WriteMode::Through => self.write_through(key, value, options).await,
            WriteMode::Behind => self.write_behind(key, value, options),
        }
    }

    /// Persist to the backing store, then cache.
    ///
    /// On failure the cache is left untouched and the error returned. On
    /// success any older write-behind value queued for the key is dropped so
    /// a later flush cannot overwrite this one.
    #[instrument(skip(self, key, value, options))]
    pub async fn write_through(
        &self,
        key: impl Into<CacheKey>,
        value: V,
        options: EntryOptions,
    ) -> Result<()> {
        let key = key.into();
        let queue = self.queue()?;
        let ttl = self.resolve_ttl(options.expiration)?;

        if let Err(e) = queue.save_now(&key, &value).await {
            self.inner.metrics.record_error();
            warn!(key = %key, error = %e, "Write-through save failed");
            return Err(e);
        }

        self.inner.metrics.record_persisted(1);
        self.inner.store.put(key, value, ttl, options.tags)
    }

    /// Cache now, persist later.
    ///
    /// Returns once the entry store holds the value. Fails with
    /// [`Error::ShutDown`] after [`shutdown`](Self::shutdown) has begun.
    pub fn write_behind(
        &self,
        key: impl Into<CacheKey>,
        value: V,
        options: EntryOptions,
    ) -> Result<()> {
        let queue = self.queue()?;
        let key = key.into();
        let ttl = self.resolve_ttl(options.expiration)?;

        // Held across the enqueue so shutdown cannot drain in between
        let closed = self.inner.closed.read();
        if *closed {
            return Err(Error::ShutDown);
        }
        self.inner
            .store
            .put(key.clone(), value.clone(), ttl, options.tags)?;
        queue.enqueue(key, value);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Invalidation
    // -------------------------------------------------------------------------

    /// Remove one key; true if a live entry was removed
    pub fn remove(&self, key: &CacheKey) -> bool {
        self.inner.store.remove(key)
    }

    /// Remove every entry tagged `tag`; returns how many were removed
    pub fn invalidate_tag(&self, tag: &str) -> usize {
        self.inner.store.invalidate_tag(tag)
    }

    /// Live keys currently tagged `tag`, sorted
    pub fn resolve_tag(&self, tag: &str) -> Vec<CacheKey> {
        self.inner.store.resolve_tag(tag)
    }

    /// Remove every expired entry now
    pub fn purge_expired(&self) -> usize {
        self.inner.store.purge_expired()
    }

    // -------------------------------------------------------------------------
    // Administration
    // -------------------------------------------------------------------------

    /// Point-in-time statistics
    pub fn stats(&self) -> CacheStats {
        self.inner.metrics.snapshot(self.inner.store.len())
    }

    /// Zero every counter
    pub fn reset_stats(&self) {
        self.inner.metrics.reset();
    }

    /// Shared counters, e.g. for a Prometheus collector
    pub fn metrics(&self) -> Arc<CacheMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Current configuration
    pub fn config(&self) -> CacheConfig {
        self.inner.config.read().clone()
    }

    /// Apply a runtime configuration change.
    ///
    /// A smaller capacity evicts least-recently-used entries right away. A
    /// new flush interval applies from the next maintenance cycle.
    pub fn configure(&self, update: ConfigUpdate) -> Result<()> {
        let mut config = self.inner.config.write();
        let next = update.apply_to(&config)?;

        let evicted = if next.capacity != config.capacity {
            self.inner.store.set_capacity(next.capacity)
        } else {
            0
        };
        let interval_changed = next.flush_interval != config.flush_interval;
        *config = next;

        info!(
            capacity = config.capacity,
            default_ttl = ?config.default_ttl,
            flush_interval = ?config.flush_interval,
            evicted,
            "Cache reconfigured"
        );
        drop(config);

        if interval_changed {
            self.inner.reconfigured.notify_one();
        }
        Ok(())
    }

    /// Flush due write-behind entries now
    pub async fn flush(&self) -> FlushReport {
        match &self.inner.queue {
            Some(queue) => queue.flush().await,
            None => FlushReport::default(),
        }
    }

    /// Queued write-behind entries
    pub fn pending_writes(&self) -> usize {
        self.inner.queue.as_ref().map_or(0, |queue| queue.len())
    }

    /// Write-behind entries dropped after exhausting retries
    pub fn flush_failures(&self) -> Vec<FlushFailure> {
        self.inner
            .queue
            .as_ref()
            .map(|queue| queue.failures())
            .unwrap_or_default()
    }

    /// Stop accepting write-behind writes, drain the queue, and stop the
    /// maintenance task. Safe to call more than once.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> FlushReport {
        let first = {
            let mut closed = self.inner.closed.write();
            !std::mem::replace(&mut *closed, true)
        };
        if first {
            info!(pending = self.pending_writes(), "Shutting down cache");
        }

        let report = match &self.inner.queue {
            Some(queue) => queue.drain().await,
            None => FlushReport::default(),
        };

        self.inner.cancel.cancel();
        let handle = self.inner.maintenance.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Maintenance task ended abnormally");
            }
        }
        report
    }

    /// Whether shutdown has begun
    pub fn is_shut_down(&self) -> bool {
        *self.inner.closed.read()
    }

    /// Tracked entries
    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.is_empty()
    }

    /// Keys from least- to most-recently used
    pub fn keys_by_recency(&self) -> Vec<CacheKey> {
        self.inner.store.keys_by_recency()
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// The write-behind queue, present whenever a backing store is
    fn queue(&self) -> Result<&WriteBehindQueue<V>> {
        self.inner
            .queue
            .as_deref()
            .ok_or_else(|| Error::Config("no backing store configured".into()))
    }

    fn resolve_ttl(&self, expiration: Expiration) -> Result<Option<std::time::Duration>> {
        let default_ttl = self.inner.config.read().default_ttl;
        expiry::resolve_ttl(expiration, default_ttl)
    }

    /// Entry-store lookup that records a hit or miss
    fn lookup(&self, key: &CacheKey) -> Option<Arc<CacheEntry<V>>> {
        match self.inner.store.get(key) {
            Some(entry) => {
                self.inner.metrics.record_hit();
                Some(entry)
            }
            None => {
                self.inner.metrics.record_miss();
                None
            }
        }
    }

    /// Load through the stampede guard, caching a found value.
    ///
    /// A write-behind value still queued for the key is newer than anything
    /// the backing store holds, so it is served instead of calling `loader`.
    /// The result is cached only if the key still holds generation `basis`;
    /// a write or removal that lands while the load runs wins.
    async fn load_through<F, Fut>(
        &self,
        key: &CacheKey,
        options: EntryOptions,
        basis: Option<u64>,
        loader: F,
    ) -> Result<Option<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>>> + Send + 'static,
    {
        let ttl = self.resolve_ttl(options.expiration)?;
        let timeout = self.inner.config.read().backing_store_timeout;
        let inner = Arc::clone(&self.inner);
        let load_key = key.clone();
        let tags = options.tags;

        self.inner
            .guard
            .fetch_once(key, move || {
                let queued = inner
                    .queue
                    .as_ref()
                    .and_then(|queue| queue.pending_value(&load_key));
                let load = queued.is_none().then(loader);
                async move {
                    let loaded = match load {
                        None => {
                            debug!(key = %load_key, "Serving queued write-behind value");
                            Ok(queued)
                        }
                        Some(load) => {
                            inner.metrics.record_load();
                            match tokio::time::timeout(timeout, load).await {
                                Ok(Ok(value)) => Ok(value),
                                Ok(Err(e)) if e.is_not_found() => Ok(None),
                                Ok(Err(e)) => Err(e),
                                Err(_) => Err(Error::BackingStoreTimeout {
                                    operation: "load",
                                    key: load_key.to_string(),
                                    timeout,
                                }),
                            }
                        }
                    };

                    match loaded {
                        Ok(Some(value)) => {
                            let cached = inner.store.put_if_generation(
                                load_key.clone(),
                                value.clone(),
                                ttl,
                                tags,
                                basis,
                            )?;
                            if !cached {
                                debug!(key = %load_key, "Key written during load, result not cached");
                            }
                            Ok(Some(value))
                        }
                        Ok(None) => Ok(None),
                        Err(e) => {
                            inner.metrics.record_error();
                            warn!(key = %load_key, error = %e, "Backing store load failed");
                            Err(e)
                        }
                    }
                }
            })
            .await
    }

    /// Start a background reload if `entry` is close to expiring
    fn maybe_refresh<F, Fut>(&self, entry: &CacheEntry<V>, loader: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<V>>> + Send + 'static,
    {
        let Some(threshold) = self.inner.config.read().refresh_threshold_fraction else {
            return;
        };
        let now = self.inner.clock.now();
        if !expiry::needs_refresh(entry.created_at(), entry.expires_at(), now, threshold)
            || self.inner.guard.is_in_flight(entry.key())
        {
            return;
        }

        // Reload with the entry's own lifetime and tags
        let options = EntryOptions {
            expiration: entry.ttl().map_or(Expiration::Never, Expiration::After),
            tags: entry.tags().clone(),
        };
        let key = entry.key().clone();
        let cache = self.clone();
        self.inner.metrics.record_refresh();
        debug!(key = %key, "Refreshing entry ahead of expiry");

        let basis = Some(entry.generation);
        tokio::spawn(async move {
            if let Err(e) = cache.load_through(&key, options, basis, loader).await {
                warn!(key = %key, error = %e, "Refresh-ahead failed");
            }
        });
    }
}

/// Maintenance loop: periodic write-behind flush and optional expiry sweep.
///
/// Holds only a weak reference so an abandoned cache is still freed.
#[instrument(skip_all)]
async fn maintain<V>(
    inner: Weak<CacheInner<V>>,
    reconfigured: Arc<Notify>,
    cancel: CancellationToken,
) where
    V: Clone + Send + Sync + 'static,
{
    let (mut flush_every, sweep_every) = match inner.upgrade() {
        Some(cache) => {
            let config = cache.config.read();
            (config.flush_interval, config.sweep_interval)
        }
        None => return,
    };
    info!(?flush_every, ?sweep_every, "Starting cache maintenance");

    let mut next_flush = Instant::now() + flush_every;
    let mut next_sweep = sweep_every.map(|every| Instant::now() + every);

    loop {
        let wake = match next_sweep {
            Some(sweep) if sweep < next_flush => sweep,
            _ => next_flush,
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = reconfigured.notified() => {
                let Some(cache) = inner.upgrade() else { break };
                flush_every = cache.config.read().flush_interval;
                next_flush = Instant::now() + flush_every;
                debug!(?flush_every, "Flush interval changed");
                continue;
            }
            _ = tokio::time::sleep_until(wake) => {}
        }

        let Some(cache) = inner.upgrade() else { break };
        let now = Instant::now();

        if now >= next_flush {
            if let Some(queue) = &cache.queue {
                queue.flush().await;
            }
            next_flush = Instant::now() + flush_every;
        }

        if let (Some(sweep), Some(every)) = (next_sweep, sweep_every) {
            if now >= sweep {
                let purged = cache.store.purge_expired();
                if purged > 0 {
                    debug!(purged, "Swept expired entries");
                }
                next_sweep = Some(Instant::now() + every);
            }
        }
    }

    info!("Cache maintenance stopped");
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::InMemoryBackingStore;
    use crate::clock::ManualClock;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn store() -> Arc<InMemoryBackingStore<String>> {
        Arc::new(InMemoryBackingStore::new())
    }

    fn cache_with(config: CacheConfig, backing: Arc<InMemoryBackingStore<String>>) -> Cache<String> {
        Cache::<String>::builder(config).backing_store(backing).build().unwrap()
    }

    #[tokio::test]
    async fn test_cache_aside_loads_then_hits() {
        let cache: Cache<String> = Cache::builder(CacheConfig::new()).build().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let value = cache
                .get_or_load("user:1", EntryOptions::new(), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Some("alice".to_string()))
                })
                .await
                .unwrap();
            assert_eq!(value.as_deref(), Some("alice"));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.loads, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_not_found_is_a_miss() {
        let cache: Cache<String> = Cache::builder(CacheConfig::new()).build().unwrap();

        let value = cache
            .get_or_load("ghost", EntryOptions::new(), || async {
                Err(Error::NotFound { key: "ghost".into() })
            })
            .await
            .unwrap();

        assert_eq!(value, None);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().errors, 0);
    }

    #[tokio::test]
    async fn test_loader_error_is_not_cached() {
        let cache: Cache<String> = Cache::builder(CacheConfig::new()).build().unwrap();

        let result = cache
            .get_or_load("k", EntryOptions::new(), || async {
                Err(Error::BackingStore("db down".into()))
            })
            .await;
        assert_matches!(result, Err(Error::BackingStore(_)));
        assert!(cache.is_empty());
        assert_eq!(cache.stats().errors, 1);

        let value = cache
            .get_or_load("k", EntryOptions::new(), || async { Ok(Some("ok".to_string())) })
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_write_during_load_is_not_overwritten() {
        let cache: Cache<String> = Cache::builder(CacheConfig::new()).build().unwrap();

        let loading = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_load("k", EntryOptions::new(), || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(Some("loaded".to_string()))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.put("k", "written".to_string(), EntryOptions::new()).unwrap();

        // The loader's caller still sees what it loaded
        assert_eq!(loading.await.unwrap().unwrap().as_deref(), Some("loaded"));
        assert_eq!(cache.peek(&CacheKey::new("k")).as_deref(), Some("written"));
    }

    #[tokio::test]
    async fn test_read_through_uses_backing_store() {
        let backing = store();
        backing.insert("user:1", "alice".to_string());
        let cache = cache_with(CacheConfig::new(), backing.clone());

        assert_eq!(cache.get("user:1").await.unwrap().as_deref(), Some("alice"));
        assert_eq!(cache.get("user:1").await.unwrap().as_deref(), Some("alice"));
        assert_eq!(cache.get("user:2").await.unwrap(), None);
        assert_eq!(backing.stats().loads, 2);
    }

    #[tokio::test]
    async fn test_load_timeout_releases_waiters() {
        let backing = store();
        backing.insert("slow", "v".to_string());
        backing.set_latency(Duration::from_millis(300));
        let cache = cache_with(
            CacheConfig::new().with_backing_store_timeout(Duration::from_millis(30)),
            backing,
        );

        let result = cache.get("slow").await;
        assert_matches!(
            result,
            Err(Error::BackingStoreTimeout { operation: "load", .. })
        );
        assert!(cache.is_empty());
        assert!(!cache.inner.guard.is_in_flight(&CacheKey::new("slow")));
    }

    #[tokio::test]
    async fn test_write_through_success_and_failure() {
        let backing = store();
        let cache = cache_with(CacheConfig::new(), backing.clone());
        let key = CacheKey::new("k");

        cache.write_through("k", "v1".to_string(), EntryOptions::new()).await.unwrap();
        assert_eq!(backing.value(&key).as_deref(), Some("v1"));
        assert_eq!(cache.peek(&key).as_deref(), Some("v1"));

        backing.set_fail_saves(true);
        let result = cache.write_through("k", "v2".to_string(), EntryOptions::new()).await;
        assert_matches!(result, Err(Error::BackingStore(_)));
        assert_eq!(cache.peek(&key).as_deref(), Some("v1"));
        assert_eq!(backing.value(&key).as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_write_through_without_backing_store() {
        let cache: Cache<String> = Cache::builder(CacheConfig::new()).build().unwrap();
        let result = cache.set("k", "v".to_string(), EntryOptions::new()).await;
        assert_matches!(result, Err(Error::Config(_)));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_write_behind_is_visible_before_flush() {
        let backing = store();
        let cache = cache_with(
            CacheConfig::new()
                .with_write_mode(WriteMode::Behind)
                .with_flush_interval(Duration::from_secs(3600)),
            backing.clone(),
        );
        let key = CacheKey::new("k");

        cache.set("k", "v".to_string(), EntryOptions::new()).await.unwrap();
        assert_eq!(cache.peek(&key).as_deref(), Some("v"));
        assert_eq!(backing.value(&key), None);
        assert_eq!(cache.pending_writes(), 1);

        let report = cache.flush().await;
        assert_eq!(report.persisted, 1);
        assert_eq!(backing.value(&key).as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_flush_loop_persists_in_background() {
        let backing = store();
        let cache = cache_with(
            CacheConfig::new().with_flush_interval(Duration::from_millis(20)),
            backing.clone(),
        );

        cache.write_behind("k", "v".to_string(), EntryOptions::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(backing.value(&CacheKey::new("k")).as_deref(), Some("v"));
        assert_eq!(cache.pending_writes(), 0);
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_refresh_does_not_overwrite_newer_write() {
        let clock = Arc::new(ManualClock::new());
        let backing = store();
        backing.insert("k", "old".to_string());
        backing.set_latency(Duration::from_millis(50));
        let cache = Cache::<String>::builder(
            CacheConfig::new()
                .with_refresh_threshold(0.5)
                .with_write_mode(WriteMode::Behind)
                .with_flush_interval(Duration::from_secs(3600)),
        )
        .backing_store(backing.clone())
        .clock(clock.clone())
        .build()
        .unwrap();
        let options = EntryOptions::new().ttl(Duration::from_secs(10));

        assert_eq!(cache.get_with("k", options.clone()).await.unwrap().as_deref(), Some("old"));
        clock.advance(Duration::from_secs(6));
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("old"));
        assert_eq!(cache.stats().refreshes, 1);

        // Let the background reload reach the backing store, then write
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(backing.stats().loads, 2);
        cache.write_behind("k", "new".to_string(), options).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!cache.inner.guard.is_in_flight(&CacheKey::new("k")));
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("new"));

        cache.shutdown().await;
        assert_eq!(backing.value(&CacheKey::new("k")).as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_refresh_ahead_reloads_near_expiry() {
        let clock = Arc::new(ManualClock::new());
        let backing = store();
        backing.insert("k", "v1".to_string());
        let cache = Cache::<String>::builder(CacheConfig::new().with_refresh_threshold(0.2))
            .backing_store(backing.clone())
            .clock(clock.clone())
            .build()
            .unwrap();
        let options = EntryOptions::new().ttl(Duration::from_secs(10)).tag("t");

        assert_eq!(cache.get_with("k", options.clone()).await.unwrap().as_deref(), Some("v1"));
        backing.insert("k", "v2".to_string());

        // Plenty of TTL left: no refresh
        clock.advance(Duration::from_secs(5));
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v1"));
        assert_eq!(cache.stats().refreshes, 0);

        // Under 20% left: stale value now, refreshed in the background
        clock.advance(Duration::from_millis(4500));
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v1"));
        assert_eq!(cache.stats().refreshes, 1);

        let key = CacheKey::new("k");
        for _ in 0..50 {
            if cache.peek(&key).as_deref() == Some("v2") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cache.peek(&key).as_deref(), Some("v2"));
        assert_eq!(cache.resolve_tag("t"), vec![key]);
    }

    #[tokio::test]
    async fn test_configure_shrinks_capacity() {
        let cache: Cache<u32> = Cache::builder(CacheConfig::new().with_capacity(4))
            .build()
            .unwrap();
        for i in 0..4u32 {
            cache.put(format!("k{}", i), i, EntryOptions::new()).unwrap();
        }

        cache
            .configure(ConfigUpdate {
                capacity: Some(2),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.keys_by_recency(), vec![CacheKey::new("k2"), CacheKey::new("k3")]);
        assert_eq!(cache.stats().evictions, 2);

        let rejected = cache.configure(ConfigUpdate {
            capacity: Some(0),
            ..Default::default()
        });
        assert_matches!(rejected, Err(Error::CapacityMisconfigured(_)));
        assert_eq!(cache.config().capacity, 2);
    }

    #[tokio::test]
    async fn test_default_ttl_applies_to_later_puts() {
        let clock = Arc::new(ManualClock::new());
        let cache: Cache<u32> = Cache::builder(CacheConfig::new())
            .clock(clock.clone())
            .build()
            .unwrap();

        cache.put("before", 1, EntryOptions::new()).unwrap();
        cache
            .configure(ConfigUpdate {
                default_ttl: Some(Some(Duration::from_secs(1))),
                ..Default::default()
            })
            .unwrap();
        cache.put("after", 2, EntryOptions::new()).unwrap();
        cache.put("pinned", 3, EntryOptions::new().no_expiry()).unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.peek(&CacheKey::new("before")), Some(1));
        assert_eq!(cache.peek(&CacheKey::new("after")), None);
        assert_eq!(cache.peek(&CacheKey::new("pinned")), Some(3));
    }

    #[tokio::test]
    async fn test_zero_ttl_rejected() {
        let cache: Cache<u32> = Cache::builder(CacheConfig::new()).build().unwrap();
        let result = cache.put("k", 1, EntryOptions::new().ttl(Duration::ZERO));
        assert_matches!(result, Err(Error::InvalidTtl(_)));
    }

    #[tokio::test]
    async fn test_sweep_purges_expired_entries() {
        let clock = Arc::new(ManualClock::new());
        let cache: Cache<u32> = Cache::builder(
            CacheConfig::new().with_sweep_interval(Duration::from_millis(10)),
        )
        .clock(clock.clone())
        .build()
        .unwrap();

        cache.put("k", 1, EntryOptions::new().ttl(Duration::from_secs(1))).unwrap();
        assert_eq!(cache.len(), 1);

        clock.advance(Duration::from_secs(2));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.len(), 0);
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_rejects_writes() {
        let backing = store();
        let cache = cache_with(
            CacheConfig::new().with_flush_interval(Duration::from_secs(3600)),
            backing.clone(),
        );

        cache.write_behind("a", "1".to_string(), EntryOptions::new()).unwrap();
        cache.write_behind("b", "2".to_string(), EntryOptions::new()).unwrap();

        let report = cache.shutdown().await;
        assert_eq!(report.persisted, 2);
        assert_eq!(backing.len(), 2);
        assert!(cache.is_shut_down());

        let rejected = cache.write_behind("c", "3".to_string(), EntryOptions::new());
        assert_matches!(rejected, Err(Error::ShutDown));

        // Idempotent
        assert_eq!(cache.shutdown().await, FlushReport::default());
    }

    #[tokio::test]
    async fn test_write_behind_mode_requires_backing_store() {
        let result: Result<Cache<u32>> =
            Cache::builder(CacheConfig::new().with_write_mode(WriteMode::Behind)).build();
        assert_matches!(result, Err(Error::Config(_)));
    }

    #[test]
    fn test_build_without_runtime_when_nothing_to_maintain() {
        let cache: Cache<u32> = Cache::builder(CacheConfig::new()).build().unwrap();
        cache.put("k", 1, EntryOptions::new()).unwrap();
        assert_eq!(cache.peek(&CacheKey::new("k")), Some(1));
    }
}
