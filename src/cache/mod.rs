//! Caching Engine
//!
//! In-process cache in front of a slower backing store.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              Cache (strategy)                             │
//! │   cache-aside · read-through · write-through · write-behind · refresh    │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  Stampede Guard        │  Entry Store                │ Write-Behind Queue │
//! │  ┌──────────────────┐  │  ┌───────────────────────┐  │ ┌────────────────┐ │
//! │  │ key → shared     │  │  │ ShardedMap (RwLock)   │  │ │ key → latest   │ │
//! │  │ in-flight fetch  │  │  │ LRU index + tag index │  │ │ value, retries │ │
//! │  └──────────────────┘  │  └───────────────────────┘  │ └────────────────┘ │
//! │           │            │             │               │         │          │
//! │           └────────────┴─────────────┴───────────────┴─────────┘          │
//! │                                   │                                       │
//! │                          BackingStore (async)                             │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Design Principles
//!
//! - Expiry is lazy: every read re-checks the deadline against the clock
//! - One backing-store load per missing key, however many callers wait on it
//! - Every backing-store call runs under a timeout
//! - Write-behind failures are retried, then reported, never dropped silently

mod backend;
mod codec;
mod entry;
pub mod expiry;
mod lru;
mod metrics;
mod shard;
mod singleflight;
mod store;
mod strategy;
mod tags;
mod write_behind;

pub use backend::{BackingStore, BackingStoreStats, InMemoryBackingStore};
pub use codec::{Codec, CodecStore, JsonCodec};
pub use entry::{CacheEntry, CacheKey, EntryOptions, Expiration};
pub use lru::LruIndex;
pub use metrics::{CacheMetrics, CacheStats};
pub use shard::{Shard, ShardedMap};
pub use singleflight::{Role, StampedeGuard};
pub use store::EntryStore;
pub use strategy::{Cache, CacheBuilder};
pub use tags::TagIndex;
pub use write_behind::{
    backoff_delay, FlushFailure, FlushReport, PendingWrite, WriteBehindConfig, WriteBehindQueue,
    MAX_FAILURE_LOG,
};
