//! Stampede Guard (single-flight)
//!
//! Concurrent misses for one key share a single backing-store fetch. The
//! first caller becomes the leader and registers a shared future; every
//! caller arriving while it is registered awaits the same future and gets a
//! clone of its result, error included.
//!
//! The shared future is polled by whoever is awaiting it, so a leader that
//! gets cancelled does not strand its followers. The record is removed by the
//! first participant to observe completion; later callers start a new fetch.
//! When the last waiter is cancelled before completion the fetch is
//! abandoned and its record removed, so nobody joins a stale fetch.

use std::collections::HashMap;
use std::future::Future;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::debug;

use super::entry::CacheKey;
use crate::error::Result;

type InFlightFetch<V> = Shared<BoxFuture<'static, Result<Option<V>>>>;

/// Whether a call started the fetch or joined one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

struct InFlight<V> {
    fetch: InFlightFetch<V>,
    waiters: usize,
}

/// Per-key single-flight coordination
pub struct StampedeGuard<V> {
    in_flight: Mutex<HashMap<CacheKey, InFlight<V>>>,
}

/// A caller's stake in an in-flight fetch; leaves the slot when dropped
struct Waiter<'a, V>
where
    V: Clone + Send + Sync + 'static,
{
    guard: &'a StampedeGuard<V>,
    key: &'a CacheKey,
    fetch: InFlightFetch<V>,
    finished: bool,
}

impl<V> Drop for Waiter<'_, V>
where
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.guard.leave(self.key, &self.fetch, self.finished);
    }
}

impl<V> Default for StampedeGuard<V> {
    fn default() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
        }
    }
}

impl<V> StampedeGuard<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fetch` for `key` unless a fetch is already in flight, in which
    /// case wait for that one instead. `fetch` is only invoked by a leader.
    ///
    /// Anything the fetch must do exactly once (populating the entry store)
    /// belongs inside the future it returns.
    pub async fn fetch_once<F, Fut>(&self, key: &CacheKey, fetch: F) -> Result<Option<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>>> + Send + 'static,
    {
        self.fetch_once_with_role(key, fetch).await.0
    }

    /// [`fetch_once`](Self::fetch_once), also reporting the caller's role
    pub async fn fetch_once_with_role<F, Fut>(
        &self,
        key: &CacheKey,
        fetch: F,
    ) -> (Result<Option<V>>, Role)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>>> + Send + 'static,
    {
        let (shared, role) = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get_mut(key) {
                Some(existing) => {
                    existing.waiters += 1;
                    (existing.fetch.clone(), Role::Follower)
                }
                None => {
                    let shared = fetch().boxed().shared();
                    in_flight.insert(
                        key.clone(),
                        InFlight {
                            fetch: shared.clone(),
                            waiters: 1,
                        },
                    );
                    (shared, Role::Leader)
                }
            }
        };
        debug!(key = %key, ?role, "Awaiting single-flight fetch");

        let mut waiter = Waiter {
            guard: self,
            key,
            fetch: shared.clone(),
            finished: false,
        };
        let result = shared.await;
        waiter.finished = true;
        (result, role)
    }

    /// Number of keys with a fetch in flight
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Whether `key` has a fetch in flight
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.in_flight.lock().contains_key(key)
    }

    /// Drop one waiter from `key`'s slot, removing the slot once the fetch
    /// finished or nobody is left waiting on it
    fn leave(&self, key: &CacheKey, fetch: &InFlightFetch<V>, finished: bool) {
        let mut in_flight = self.in_flight.lock();
        // A newer fetch may already own the slot
        let Some(current) = in_flight.get_mut(key) else {
            return;
        };
        if !current.fetch.ptr_eq(fetch) {
            return;
        }
        current.waiters = current.waiters.saturating_sub(1);
        if finished || current.waiters == 0 {
            in_flight.remove(key);
            if !finished {
                debug!(key = %key, "Abandoned fetch with no remaining waiters");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
