//! Expiry Manager
//!
//! Pure TTL arithmetic. Expiry is lazy: the entry store re-checks liveness on
//! every access, so nothing here needs a background task.

use std::time::{Duration, Instant};

use super::entry::Expiration;
use crate::error::{Error, Result};

/// Resolve a caller's expiration against the configured default
pub fn resolve_ttl(expiration: Expiration, default_ttl: Option<Duration>) -> Result<Option<Duration>> {
    let ttl = match expiration {
        Expiration::Default => default_ttl,
        Expiration::Never => None,
        Expiration::After(ttl) => Some(ttl),
    };
    match ttl {
        Some(ttl) if ttl.is_zero() => Err(Error::InvalidTtl("ttl must be > 0".into())),
        other => Ok(other),
    }
}

/// Compute when an entry created at `created_at` expires
pub fn expires_at(created_at: Instant, ttl: Option<Duration>) -> Result<Option<Instant>> {
    match ttl {
        None => Ok(None),
        Some(ttl) if ttl.is_zero() => Err(Error::InvalidTtl("ttl must be > 0".into())),
        Some(ttl) => created_at
            .checked_add(ttl)
            .map(Some)
            .ok_or_else(|| Error::InvalidTtl(format!("ttl {:?} overflows the clock", ttl))),
    }
}

/// An entry is live strictly before its expiry instant
#[inline]
pub fn is_live(expires_at: Option<Instant>, now: Instant) -> bool {
    match expires_at {
        None => true,
        Some(deadline) => now < deadline,
    }
}

/// Fraction of the original TTL still remaining at `now` (None = never expires)
pub fn remaining_fraction(
    created_at: Instant,
    expires_at: Option<Instant>,
    now: Instant,
) -> Option<f64> {
    let deadline = expires_at?;
    let total = deadline.saturating_duration_since(created_at);
    if total.is_zero() {
        return Some(0.0);
    }
    let remaining = deadline.saturating_duration_since(now);
    Some(remaining.as_secs_f64() / total.as_secs_f64())
}

/// Whether a hit should trigger a refresh-ahead load
pub fn needs_refresh(
    created_at: Instant,
    expires_at: Option<Instant>,
    now: Instant,
    threshold: f64,
) -> bool {
    match remaining_fraction(created_at, expires_at, now) {
        Some(fraction) => is_live(expires_at, now) && fraction < threshold,
        None => false,
    }
}
