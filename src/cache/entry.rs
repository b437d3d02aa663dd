//! Cache Entry Types
//!
//! Keys carry a precomputed hash so shard routing never rehashes the string.

use std::borrow::Borrow;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Separator between a key's namespace and its id
pub const NAMESPACE_SEPARATOR: char = ':';

/// Cache key
///
/// Keys are opaque strings. Callers are expected to namespace them
/// (`"user:123"`) so unrelated domains never collide; the engine does not
/// enforce it.
#[derive(Clone, Eq)]
pub struct CacheKey {
    /// Precomputed hash of `key`
    hash: u64,
    /// Full key
    key: Arc<str>,
}

impl CacheKey {
    /// Create a new cache key
    pub fn new(key: impl AsRef<str>) -> Self {
        let key: Arc<str> = Arc::from(key.as_ref());
        Self {
            hash: Self::fx_hash(key.as_bytes()),
            key,
        }
    }

    /// Create `"{namespace}:{id}"`
    pub fn namespaced(namespace: &str, id: impl std::fmt::Display) -> Self {
        Self::new(format!("{}{}{}", namespace, NAMESPACE_SEPARATOR, id))
    }

    /// Fast non-cryptographic hash (FxHash algorithm)
    #[inline]
    fn fx_hash(bytes: &[u8]) -> u64 {
        const SEED: u64 = 0x517cc1b727220a95;
        let mut hash = SEED;
        for &byte in bytes {
            hash = hash.rotate_left(5) ^ (byte as u64);
            hash = hash.wrapping_mul(SEED);
        }
        hash
    }

    /// Get the shard index for this key (0..shard_count, power of two)
    #[inline]
    pub fn shard_index(&self, shard_count: usize) -> usize {
        // Fold the high bits in; FxHash's low bits are weak on short keys
        let folded = self.hash ^ (self.hash >> 32);
        (folded as usize) & (shard_count - 1)
    }

    /// Full key string
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Namespace prefix, if the key has one
    pub fn namespace(&self) -> Option<&str> {
        self.key
            .split_once(NAMESPACE_SEPARATOR)
            .map(|(namespace, _)| namespace)
    }

    /// Precomputed hash
    #[inline]
    pub fn hash_value(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        // Fast path: compare hashes first
        self.hash == other.hash && self.key == other.key
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl PartialOrd for CacheKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CacheKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CacheKey({:?})", &*self.key)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// How long an entry lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiration {
    /// Use the cache's configured default TTL
    #[default]
    Default,
    /// Never expires, regardless of the default
    Never,
    /// Expires this long after insertion
    After(Duration),
}

/// Per-write options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryOptions {
    pub expiration: Expiration,
    pub tags: BTreeSet<String>,
}

impl EntryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expire after `ttl`
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.expiration = Expiration::After(ttl);
        self
    }

    /// Never expire
    pub fn no_expiry(mut self) -> Self {
        self.expiration = Expiration::Never;
        self
    }

    /// Add one tag
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Add several tags
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

/// Cache entry
///
/// Owned by the entry store and never mutated in place; an update replaces
/// the whole entry behind a fresh `Arc`.
pub struct CacheEntry<V> {
    pub(crate) key: CacheKey,
    pub(crate) value: V,
    pub(crate) created_at: Instant,
    pub(crate) expires_at: Option<Instant>,
    pub(crate) tags: BTreeSet<String>,
    /// Unique per insert; the LRU index stores the same number so a stale
    /// eviction never removes a newer entry for the same key
    pub(crate) generation: u64,
}

impl<V> CacheEntry<V> {
    /// Key
    #[inline]
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Value
    #[inline]
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Insertion time
    #[inline]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Expiry time, None = never
    #[inline]
    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    /// Tags
    #[inline]
    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// Original TTL
    pub fn ttl(&self) -> Option<Duration> {
        self.expires_at
            .map(|expires_at| expires_at.saturating_duration_since(self.created_at))
    }
}

impl<V> std::fmt::Debug for CacheEntry<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("ttl", &self.ttl())
            .field("tags", &self.tags)
            .field("generation", &self.generation)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
