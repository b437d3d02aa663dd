//! Cache Metrics Collection
//!
//! Lock-free counters shared by every component of a cache instance.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    evictions: AtomicU64,

    // Backing store traffic
    loads: AtomicU64,
    refreshes: AtomicU64,
    writes_persisted: AtomicU64,
    flush_exhausted: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, n: u64) {
        self.evictions.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_load(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persisted(&self, n: u64) {
        self.writes_persisted.fetch_add(n, Ordering::Relaxed);
    }

    /// A write-behind entry ran out of retries; also counts as an error
    pub fn record_flush_exhausted(&self) {
        self.flush_exhausted.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Point-in-time snapshot; `entries` is supplied by the entry store
    pub fn snapshot(&self, entries: usize) -> CacheStats {
        CacheStats {
            hits: self.hits(),
            misses: self.misses(),
            errors: self.errors(),
            evictions: self.evictions(),
            loads: self.loads.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            writes_persisted: self.writes_persisted.load(Ordering::Relaxed),
            flush_exhausted: self.flush_exhausted.load(Ordering::Relaxed),
            hit_rate: self.hit_ratio(),
            entries,
        }
    }

    /// Reset all counters to zero
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.errors,
            &self.evictions,
            &self.loads,
            &self.refreshes,
            &self.writes_persisted,
            &self.flush_exhausted,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Cache statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub evictions: u64,
    /// Backing store loads issued by single-flight leaders
    pub loads: u64,
    /// Refresh-ahead loads triggered by near-expiry hits
    pub refreshes: u64,
    /// Write-behind entries persisted
    pub writes_persisted: u64,
    /// Write-behind entries dropped after exhausting retries
    pub flush_exhausted: u64,
    /// hits / (hits + misses), 0.0 before any lookup
    pub hit_rate: f64,
    /// Live entry count at snapshot time
    pub entries: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_hit_ratio() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.hit_ratio(), 0.0);

        metrics.record_hit();
        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();
        assert_eq!(metrics.hit_ratio(), 0.75);
    }

    #[test]
    fn test_snapshot_and_reset() {
        let metrics = CacheMetrics::new();
        metrics.record_hit();
        metrics.record_miss();
        metrics.record_evictions(2);
        metrics.record_flush_exhausted();

        let stats = metrics.snapshot(5);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 2);
        assert_eq!(stats.flush_exhausted, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.hit_rate, 0.5);
        assert_eq!(stats.entries, 5);

        metrics.reset();
        assert_eq!(metrics.snapshot(0), CacheStats::default());
    }

    #[test]
    fn test_concurrent_increments() {
        let metrics = Arc::new(CacheMetrics::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.record_hit();
                        metrics.record_eviction();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(metrics.hits(), 8000);
        assert_eq!(metrics.evictions(), 8000);
    }
}
