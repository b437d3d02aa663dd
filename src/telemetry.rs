//! Logging and Prometheus exposure

use parking_lot::Mutex;
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Gauge, IntCounter, IntGauge, Opts};
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::cache::{Cache, CacheStats};
use crate::error::{Error, Result};

/// Install the global tracing subscriber.
///
/// `level` is one of trace, debug, info, warn, error (anything else means
/// info); `RUST_LOG` directives are honoured on top of it.
pub fn init_logging(level: &str, json: bool) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "h2=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    let installed = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init()
    };
    installed.map_err(|e| Error::Config(format!("Failed to install subscriber: {}", e)))
}

type StatsSource = Box<dyn Fn() -> CacheStats + Send + Sync>;

/// Exposes [`CacheStats`] as Prometheus metrics.
///
/// Values are read from the cache on every scrape. Scrapes are serialized
/// so concurrent ones never see each other's half-applied counters.
pub struct StatsCollector {
    source: StatsSource,
    scrape: Mutex<()>,
    hits: IntCounter,
    misses: IntCounter,
    errors: IntCounter,
    evictions: IntCounter,
    loads: IntCounter,
    refreshes: IntCounter,
    writes_persisted: IntCounter,
    flush_exhausted: IntCounter,
    entries: IntGauge,
    hit_rate: Gauge,
}

impl StatsCollector {
    /// Collector reading from `cache`, metric names prefixed with `namespace`
    pub fn for_cache<V>(namespace: &str, cache: &Cache<V>) -> Result<Self>
    where
        V: Clone + Send + Sync + 'static,
    {
        let cache = cache.clone();
        Self::new(namespace, Box::new(move || cache.stats()))
    }

    /// Collector reading from an arbitrary stats source
    pub fn new(namespace: &str, source: StatsSource) -> Result<Self> {
        let counter = |name: &str, help: &str| {
            IntCounter::with_opts(Opts::new(name, help).namespace(namespace)).map_err(prom_error)
        };

        Ok(Self {
            source,
            scrape: Mutex::new(()),
            hits: counter("hits_total", "Cache lookups that found a live entry")?,
            misses: counter("misses_total", "Cache lookups that found nothing")?,
            errors: counter("errors_total", "Failed backing store operations")?,
            evictions: counter("evictions_total", "Entries evicted for capacity")?,
            loads: counter("loads_total", "Backing store loads started")?,
            refreshes: counter("refreshes_total", "Refresh-ahead reloads triggered")?,
            writes_persisted: counter("writes_persisted_total", "Writes saved to the backing store")?,
            flush_exhausted: counter(
                "flush_exhausted_total",
                "Write-behind entries dropped after exhausting retries",
            )?,
            entries: IntGauge::with_opts(
                Opts::new("entries", "Entries currently tracked").namespace(namespace),
            )
            .map_err(prom_error)?,
            hit_rate: Gauge::with_opts(
                Opts::new("hit_rate", "Hits over lookups since the last reset").namespace(namespace),
            )
            .map_err(prom_error)?,
        })
    }

    fn parts(&self) -> [&dyn Collector; 10] {
        [
            &self.hits,
            &self.misses,
            &self.errors,
            &self.evictions,
            &self.loads,
            &self.refreshes,
            &self.writes_persisted,
            &self.flush_exhausted,
            &self.entries,
            &self.hit_rate,
        ]
    }

    fn update(&self, stats: &CacheStats) {
        // Counters may go down after a stats reset
        for (counter, value) in [
            (&self.hits, stats.hits),
            (&self.misses, stats.misses),
            (&self.errors, stats.errors),
            (&self.evictions, stats.evictions),
            (&self.loads, stats.loads),
            (&self.refreshes, stats.refreshes),
            (&self.writes_persisted, stats.writes_persisted),
            (&self.flush_exhausted, stats.flush_exhausted),
        ] {
            counter.reset();
            counter.inc_by(value);
        }
        self.entries.set(stats.entries as i64);
        self.hit_rate.set(stats.hit_rate);
    }
}

impl Collector for StatsCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.parts().into_iter().flat_map(|part| part.desc()).collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let _scraping = self.scrape.lock();
        self.update(&(self.source)());
        self.parts()
            .into_iter()
            .flat_map(|part| part.collect())
            .collect()
    }
}

fn prom_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("Prometheus metric setup failed: {}", e))
}

/// Register a collector for `cache` with the default registry
pub fn register_cache<V>(namespace: &str, cache: &Cache<V>) -> Result<()>
where
    V: Clone + Send + Sync + 'static,
{
    let collector = StatsCollector::for_cache(namespace, cache)?;
    prometheus::register(Box::new(collector)).map_err(prom_error)
}
