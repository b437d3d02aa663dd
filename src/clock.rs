//! Time Source
//!
//! Expiry decisions read time through a [`Clock`] so tests can move time
//! forward deterministically instead of sleeping.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Supplies monotonic time for expiry and wall time for reporting
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic now
    fn now(&self) -> Instant;

    /// Wall-clock now
    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// Process clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for tests
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    /// Create a clock frozen at the current instant
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    /// Time elapsed since the clock was created
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}
