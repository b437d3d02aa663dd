//! Write-Behind Queue
//!
//! Buffers writes accepted by write-behind `set`s and persists them to the
//! backing store in batches.
//!
//! # Lifecycle
//!
//! ```text
//!   enqueue ──▶ pending (latest value per key) ──▶ flush ──▶ save_batch
//!                    ▲                                  │
//!                    └──── retry with backoff ◀─────────┤ failed
//!                                                       ▼
//!                                  attempts > max_retries: FlushExhausted
//! ```
//!
//! A failed write is retried `max_retries` times (so at most
//! `max_retries + 1` attempts), waiting `backoff * 2^(n-1)` before retry
//! `n`. A value enqueued for the same key while a retry is pending replaces
//! the failing one. Exhausted writes are logged, counted, and kept in a
//! bounded failure log; nothing is dropped silently.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::backend::BackingStore;
use super::entry::CacheKey;
use super::metrics::CacheMetrics;
use crate::error::{Error, Result};

/// Maximum number of exhausted writes remembered
pub const MAX_FAILURE_LOG: usize = 1024;

/// Upper bound on the backoff exponent
const MAX_BACKOFF_SHIFT: u32 = 16;

/// A write waiting to be persisted
#[derive(Debug, Clone)]
pub struct PendingWrite<V> {
    pub key: CacheKey,
    pub value: V,
    pub enqueued_at: Instant,
    /// Failed persistence attempts so far
    pub attempts: u32,
    /// Not flushed before this instant
    pub(crate) not_before: Instant,
}

/// A write dropped after exhausting its retries
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlushFailure {
    pub key: String,
    pub attempts: u32,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

impl FlushFailure {
    /// The error this failure was reported as
    pub fn to_error(&self) -> Error {
        Error::FlushExhausted {
            key: self.key.clone(),
            attempts: self.attempts,
            reason: self.reason.clone(),
        }
    }
}

/// Outcome of one flush or drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Writes persisted
    pub persisted: usize,
    /// Writes that failed and were queued for retry
    pub retried: usize,
    /// Writes dropped after exhausting retries
    pub exhausted: usize,
}

impl FlushReport {
    fn absorb(&mut self, other: FlushReport) {
        self.persisted += other.persisted;
        self.retried += other.retried;
        self.exhausted += other.exhausted;
    }
}

/// Write-behind queue settings
#[derive(Debug, Clone)]
pub struct WriteBehindConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
}

/// Coalescing write-behind queue
pub struct WriteBehindQueue<V>
where
    V: Send + Sync + 'static,
{
    pending: Mutex<HashMap<CacheKey, PendingWrite<V>>>,
    store: Arc<dyn BackingStore<V>>,
    metrics: Arc<CacheMetrics>,
    config: WriteBehindConfig,
    failures: Mutex<VecDeque<FlushFailure>>,
    /// Serializes flushes so the timer and a drain never persist the same snapshot twice
    flush_lock: tokio::sync::Mutex<()>,
}

impl<V> WriteBehindQueue<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(
        store: Arc<dyn BackingStore<V>>,
        metrics: Arc<CacheMetrics>,
        config: WriteBehindConfig,
    ) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            store,
            metrics,
            config,
            failures: Mutex::new(VecDeque::new()),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Queue a write; returns true if it superseded an unflushed one
    pub fn enqueue(&self, key: CacheKey, value: V) -> bool {
        let now = Instant::now();
        let write = PendingWrite {
            key: key.clone(),
            value,
            enqueued_at: now,
            attempts: 0,
            not_before: now,
        };
        let superseded = self.pending.lock().insert(key.clone(), write).is_some();
        if superseded {
            debug!(key = %key, "Coalesced write-behind entry");
        }
        superseded
    }

    /// Number of queued writes
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Queued value for `key`
    pub fn pending_value(&self, key: &CacheKey) -> Option<V> {
        self.pending.lock().get(key).map(|w| w.value.clone())
    }

    /// Persist `value` right away, ahead of anything queued for `key`.
    ///
    /// Waits out an in-progress flush so an older batch cannot land after
    /// this save. On success the queued write for `key`, if any, is dropped.
    #[instrument(skip(self, value))]
    pub async fn save_now(&self, key: &CacheKey, value: &V) -> Result<()> {
        let _flushing = self.flush_lock.lock().await;

        let timeout = self.config.timeout;
        match tokio::time::timeout(timeout, self.store.save(key, value)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::BackingStoreTimeout {
                    operation: "save",
                    key: key.to_string(),
                    timeout,
                })
            }
        }

        if self.pending.lock().remove(key).is_some() {
            debug!(key = %key, "Dropped queued write superseded by a direct save");
        }
        Ok(())
    }

    /// Writes dropped after exhausting retries, oldest first
    pub fn failures(&self) -> Vec<FlushFailure> {
        self.failures.lock().iter().cloned().collect()
    }

    /// Persist every queued write that is due.
    ///
    /// Writes still backing off from an earlier failure stay queued.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> FlushReport {
        let _flushing = self.flush_lock.lock().await;

        let batch: Vec<PendingWrite<V>> = {
            let now = Instant::now();
            let mut pending = self.pending.lock();
            let due: Vec<CacheKey> = pending
                .values()
                .filter(|w| w.not_before <= now)
                .map(|w| w.key.clone())
                .collect();
            due.iter().filter_map(|key| pending.remove(key)).collect()
        };
        if batch.is_empty() {
            return FlushReport::default();
        }

        let entries: Vec<(CacheKey, V)> = batch
            .iter()
            .map(|w| (w.key.clone(), w.value.clone()))
            .collect();
        let results = self.save_batch(&entries).await;

        let mut report = FlushReport::default();
        for (write, result) in batch.into_iter().zip(results) {
            match result {
                Ok(()) => report.persisted += 1,
                Err(e) => {
                    if self.retry_or_exhaust(write, e) {
                        report.retried += 1;
                    } else {
                        report.exhausted += 1;
                    }
                }
            }
        }

        self.metrics.record_persisted(report.persisted as u64);
        debug!(
            persisted = report.persisted,
            retried = report.retried,
            exhausted = report.exhausted,
            "Write-behind flush complete"
        );
        report
    }

    /// Flush until the queue is empty, waiting out retry backoff as needed.
    ///
    /// Returns once every queued write is persisted or has exhausted its
    /// retries. Callers must stop enqueueing first or this may not return.
    #[instrument(skip(self))]
    pub async fn drain(&self) -> FlushReport {
        let mut total = FlushReport::default();
        loop {
            total.absorb(self.flush().await);

            let next_due = self.pending.lock().values().map(|w| w.not_before).min();
            match next_due {
                None => break,
                Some(at) => tokio::time::sleep_until(at).await,
            }
        }
        info!(
            persisted = total.persisted,
            exhausted = total.exhausted,
            "Write-behind queue drained"
        );
        total
    }

    async fn save_batch(&self, entries: &[(CacheKey, V)]) -> Vec<Result<()>> {
        let timeout = self.config.timeout;
        match tokio::time::timeout(timeout, self.store.save_batch(entries)).await {
            Ok(results) if results.len() == entries.len() => results,
            Ok(results) => {
                let reason = format!(
                    "save_batch returned {} results for {} entries",
                    results.len(),
                    entries.len()
                );
                entries
                    .iter()
                    .map(|_| Err(Error::BackingStore(reason.clone())))
                    .collect()
            }
            Err(_) => entries
                .iter()
                .map(|(key, _)| {
                    Err(Error::BackingStoreTimeout {
                        operation: "save_batch",
                        key: key.to_string(),
                        timeout,
                    })
                })
                .collect(),
        }
    }

    /// Requeue a failed write, or report it. Returns true if requeued.
    fn retry_or_exhaust(&self, write: PendingWrite<V>, error: Error) -> bool {
        let attempts = write.attempts + 1;

        if attempts > self.config.max_retries {
            error!(
                key = %write.key,
                attempts,
                error = %error,
                "Write-behind retries exhausted"
            );
            self.metrics.record_flush_exhausted();
            let mut failures = self.failures.lock();
            if failures.len() >= MAX_FAILURE_LOG {
                failures.pop_front();
            }
            failures.push_back(FlushFailure {
                key: write.key.to_string(),
                attempts,
                reason: error.to_string(),
                failed_at: Utc::now(),
            });
            return false;
        }

        let delay = backoff_delay(self.config.backoff, attempts);
        warn!(
            key = %write.key,
            attempts,
            ?delay,
            error = %error,
            "Write-behind flush failed, will retry"
        );

        let mut pending = self.pending.lock();
        if pending.contains_key(&write.key) {
            // A newer value arrived; it supersedes the failing one
            return true;
        }
        pending.insert(
            write.key.clone(),
            PendingWrite {
                attempts,
                not_before: Instant::now() + delay,
                ..write
            },
        );
        true
    }
}

/// Delay before retry number `attempt` (1-based)
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
    base.saturating_mul(1u32 << shift)
}

// =============================================================================
// Tests
// =============================================================================
