//! CacheFlow - In-Process Caching Engine
//!
//! A concurrent cache that sits in front of a slower backing store (database,
//! remote API) and serves repeated reads from memory.
//!
//! # Architecture
//!
//! ```text
//! caller ──▶ Cache (strategy) ──▶ Entry Store (LRU, TTL, tags)
//!                 │                      ▲
//!                 ├── Stampede Guard ────┘  one load per missing key
//!                 └── Write-Behind Queue ──▶ Backing Store
//! ```
//!
//! # Features
//!
//! - Bounded capacity with least-recently-used eviction
//! - Lazy per-entry TTL with an optional background sweep
//! - Tag-based bulk invalidation
//! - Single-flight loads for concurrent misses
//! - Cache-aside, read-through, write-through, write-behind and refresh-ahead
//! - Hit/miss/eviction/error counters with a Prometheus collector
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use cacheflow::{Cache, CacheConfig, EntryOptions, InMemoryBackingStore};
//!
//! # async fn demo() -> cacheflow::Result<()> {
//! let db = Arc::new(InMemoryBackingStore::new());
//! db.insert("user:1", "alice".to_string());
//!
//! let cache = Cache::<String>::builder(CacheConfig::new().with_capacity(1_000))
//!     .backing_store(db)
//!     .build()?;
//!
//! let user = cache
//!     .get_with("user:1", EntryOptions::new().ttl(Duration::from_secs(60)).tag("users"))
//!     .await?;
//! assert_eq!(user.as_deref(), Some("alice"));
//!
//! cache.invalidate_tag("users");
//! cache.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Entry store, stampede guard, write-behind queue and strategies
//! - [`clock`] - Injectable time source
//! - [`config`] - Cache configuration
//! - [`error`] - Error types
//! - [`telemetry`] - Logging setup and Prometheus collector

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod telemetry;

pub use cache::{
    BackingStore, Cache, CacheBuilder, CacheKey, CacheStats, EntryOptions, Expiration,
    FlushFailure, FlushReport, InMemoryBackingStore,
};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{CacheConfig, ConfigUpdate, WriteMode};
pub use error::{Error, Result};
