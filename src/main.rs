//! CacheFlow soak harness
//!
//! Runs a synthetic read/write/invalidate workload against a cache backed by
//! an in-memory store with artificial latency, and serves Prometheus metrics
//! and health endpoints while it runs.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         Soak Harness                           │
//! ├───────────────────────────────────────────────────────────────┤
//! │  ┌──────────┐    ┌──────────────┐    ┌────────────────────┐   │
//! │  │ Workers  │───▶│    Cache     │───▶│ InMemoryBacking    │   │
//! │  │ (N tasks)│    │ (strategies) │    │ Store (+latency)   │   │
//! │  └──────────┘    └──────────────┘    └────────────────────┘   │
//! │                         │                                     │
//! │              /metrics   │   /healthz /readyz                  │
//! └───────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cacheflow::cache::CacheKey;
use cacheflow::{
    telemetry, Cache, CacheConfig, EntryOptions, Error, InMemoryBackingStore, WriteMode,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// CacheFlow soak harness - exercise the caching engine under load
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Maximum number of cached entries
    #[arg(long, env = "CACHE_CAPACITY", default_value = "10000")]
    capacity: usize,

    /// Default entry TTL in seconds (unset = entries never expire)
    #[arg(long, env = "DEFAULT_TTL_SECONDS")]
    default_ttl_seconds: Option<u64>,

    /// Write-behind flush interval in milliseconds
    #[arg(long, env = "FLUSH_INTERVAL_MS", default_value = "1000")]
    flush_interval_ms: u64,

    /// Refresh hits whose remaining TTL falls below this fraction
    #[arg(long, env = "REFRESH_THRESHOLD")]
    refresh_threshold: Option<f64>,

    /// Backing store call timeout in milliseconds
    #[arg(long, env = "BACKING_STORE_TIMEOUT_MS", default_value = "5000")]
    backing_store_timeout_ms: u64,

    /// Write-behind retries before a write is reported as exhausted
    #[arg(long, env = "MAX_FLUSH_RETRIES", default_value = "3")]
    max_flush_retries: u32,

    /// Base write-behind retry backoff in milliseconds
    #[arg(long, env = "RETRY_BACKOFF_MS", default_value = "100")]
    retry_backoff_ms: u64,

    /// Expired-entry sweep interval in seconds (unset = lazy expiry only)
    #[arg(long, env = "SWEEP_INTERVAL_SECONDS")]
    sweep_interval_seconds: Option<u64>,

    /// What a plain `set` does: through or behind
    #[arg(long, env = "WRITE_MODE", default_value = "behind")]
    write_mode: String,

    /// Distinct keys in the workload
    #[arg(long, env = "WORKLOAD_KEYS", default_value = "50000")]
    keys: usize,

    /// Concurrent workload tasks
    #[arg(long, env = "WORKLOAD_WORKERS", default_value = "8")]
    workers: usize,

    /// Run time in seconds (0 = until interrupted)
    #[arg(long, env = "WORKLOAD_DURATION_SECONDS", default_value = "60")]
    duration_seconds: u64,

    /// Artificial backing store latency in milliseconds
    #[arg(long, env = "STORE_LATENCY_MS", default_value = "5")]
    store_latency_ms: u64,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn cache_config(&self) -> anyhow::Result<CacheConfig> {
        let write_mode = match self.write_mode.to_lowercase().as_str() {
            "through" | "write-through" => WriteMode::Through,
            "behind" | "write-behind" => WriteMode::Behind,
            other => bail!("Unknown write mode '{}': expected through or behind", other),
        };

        let mut config = CacheConfig::new()
            .with_capacity(self.capacity)
            .with_flush_interval(Duration::from_millis(self.flush_interval_ms))
            .with_backing_store_timeout(Duration::from_millis(self.backing_store_timeout_ms))
            .with_max_flush_retries(self.max_flush_retries)
            .with_retry_backoff(Duration::from_millis(self.retry_backoff_ms))
            .with_write_mode(write_mode);
        if let Some(ttl) = self.default_ttl_seconds {
            config = config.with_default_ttl(Duration::from_secs(ttl));
        }
        if let Some(fraction) = self.refresh_threshold {
            config = config.with_refresh_threshold(fraction);
        }
        if let Some(sweep) = self.sweep_interval_seconds {
            config = config.with_sweep_interval(Duration::from_secs(sweep));
        }

        config.validate().context("Invalid cache configuration")?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    telemetry::init_logging(&args.log_level, args.log_json)?;

    info!("Starting CacheFlow soak harness");
    info!("  Capacity: {}", args.capacity);
    info!("  Write mode: {}", args.write_mode);
    info!("  Keys: {}, workers: {}", args.keys, args.workers);
    info!("  Store latency: {}ms", args.store_latency_ms);

    if args.keys == 0 {
        bail!("--keys must be at least 1");
    }
    let config = args.cache_config()?;

    let db = Arc::new(InMemoryBackingStore::new());
    db.set_latency(Duration::from_millis(args.store_latency_ms));
    for idx in 0..args.keys {
        db.insert(item_key(idx), format!("value-{}", idx));
    }

    let cache = Cache::<String>::builder(config)
        .backing_store(db.clone())
        .build()
        .context("Failed to start cache")?;
    telemetry::register_cache("cacheflow", &cache)?;

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_cache = cache.clone();
    let health_handle = tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_cache).await {
            error!("Health server error: {:#}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics_handle = tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {:#}", e);
        }
    });

    let stop = CancellationToken::new();
    let workers: Vec<_> = (0..args.workers)
        .map(|id| tokio::spawn(run_worker(id, cache.clone(), args.keys, stop.clone())))
        .collect();

    let run_for = Duration::from_secs(args.duration_seconds);
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = tokio::time::sleep(run_for), if args.duration_seconds > 0 => {
            info!("Soak duration elapsed");
        }
    }

    stop.cancel();
    let mut total_ops = 0u64;
    for worker in workers {
        match worker.await {
            Ok(ops) => total_ops += ops,
            Err(e) => error!("Worker task failed: {}", e),
        }
    }

    let report = cache.shutdown().await;
    info!(
        persisted = report.persisted,
        exhausted = report.exhausted,
        "Write-behind queue drained"
    );
    for failure in cache.flush_failures() {
        warn!(
            key = %failure.key,
            attempts = failure.attempts,
            failed_at = %failure.failed_at,
            "Lost write: {}",
            failure.reason
        );
    }

    let stats = serde_json::to_string(&cache.stats())?;
    info!(total_ops, stats = %stats, "Soak run complete");
    info!(store = ?db.stats(), "Backing store activity");

    health_handle.abort();
    metrics_handle.abort();

    info!("CacheFlow soak harness stopped");
    Ok(())
}

fn item_key(idx: usize) -> CacheKey {
    CacheKey::namespaced("item", idx)
}

// =============================================================================
// Workload
// =============================================================================

/// One workload task: 80% reads, 15% writes, 5% tag invalidations
async fn run_worker(id: usize, cache: Cache<String>, keys: usize, stop: CancellationToken) -> u64 {
    let mut rng = SmallRng::seed_from_u64(id as u64);
    let mut ops = 0u64;

    while !stop.is_cancelled() {
        let idx = rng.random_range(0..keys);
        let group = format!("group-{}", idx % 16);
        let options = EntryOptions::new().tag(group.clone());

        let result = match rng.random_range(0..100u32) {
            0..=79 => cache.get_with(item_key(idx), options).await.map(|_| ()),
            80..=94 => {
                cache
                    .set(item_key(idx), format!("value-{}-{}", idx, ops), options)
                    .await
            }
            _ => {
                cache.invalidate_tag(&group);
                Ok(())
            }
        };

        match result {
            Ok(()) => {}
            Err(Error::ShutDown) => break,
            Err(e) => debug!(worker = id, error = %e, "Workload operation failed"),
        }

        ops += 1;
        if ops % 256 == 0 {
            tokio::task::yield_now().await;
        }
    }

    debug!(worker = id, ops, "Worker stopped");
    ops
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str, cache: Cache<String>) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    fn respond(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = status;
        response
    }

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid health server address: {}", addr))?;

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;

    info!("Health server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .context("Health server accept error")?;

        let io = TokioIo::new(stream);
        let cache = cache.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let shutting_down = cache.is_shut_down();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
                        "/readyz" if shutting_down => {
                            respond(StatusCode::SERVICE_UNAVAILABLE, "shutting down")
                        }
                        "/readyz" => respond(StatusCode::OK, "ok"),
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use prometheus::{Encoder, TextEncoder};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn metrics_handler(
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        if req.uri().path() != "/metrics" {
            let mut response = Response::new(Full::new(Bytes::from("not found")));
            *response.status_mut() = StatusCode::NOT_FOUND;
            return Ok(response);
        }

        let encoder = TextEncoder::new();
        let metric_families = prometheus::gather();
        let mut buffer = Vec::new();
        let mut response = match encoder.encode(&metric_families, &mut buffer) {
            Ok(()) => Response::new(Full::new(Bytes::from(buffer))),
            Err(e) => {
                let mut response = Response::new(Full::new(Bytes::from(e.to_string())));
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                return Ok(response);
            }
        };
        if let Ok(content_type) = encoder.format_type().parse() {
            response
                .headers_mut()
                .insert(hyper::header::CONTENT_TYPE, content_type);
        }
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid metrics server address: {}", addr))?;

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind metrics server")?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .context("Metrics server accept error")?;

        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                error!("Metrics server connection error: {}", e);
            }
        });
    }
}
