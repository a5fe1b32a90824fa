use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Gauge holding a duration in (fractional) seconds.
pub type SecondsGauge = Gauge<f64, AtomicU64>;

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the proxy.
pub struct Metrics {
    // -- request path --
    pub requests_in_progress: Gauge,
    pub hit_requests_in_progress: Gauge,
    pub miss_requests_in_progress: Gauge,
    pub hit_count: Counter,
    pub hit_bytes: Counter,
    pub miss_count: Counter,
    pub miss_bytes: Counter,
    pub error_count: Counter,
    pub upstream_error_count: Counter,

    // -- prefetch --
    pub prefetch_ignore_count: Counter,
    pub prefetch_skip_count: Counter,
    pub prefetch_download_count: Counter,
    pub prefetch_download_bytes: Counter,
    pub prefetch_download_error_count: Counter,
    pub prefetch_list_request_count: Counter,
    pub prefetch_list_error_count: Counter,
    pub prefetch_in_progress: Gauge,
    pub prefetch_loop_seconds: Histogram,
    pub prefetch_last_loop_seconds: SecondsGauge,

    // -- disk --
    pub disk_cache_size_bytes: Gauge,
    pub disk_cache_available_bytes: Gauge,
    pub disk_cache_used_bytes: Gauge,
    pub disk_cache_total_bytes: Gauge,

    // -- gc --
    pub gc_error_count: Counter,
    pub gc_in_progress: Gauge,
    pub gc_loop_seconds: Histogram,
    pub gc_last_loop_seconds: SecondsGauge,
    pub gc_retained_bytes: Gauge,
    pub gc_retained_files: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_in_progress: Gauge = Gauge::default();
        registry.register(
            "artifactcache_requests_in_progress",
            "Number of requests being served right now",
            requests_in_progress.clone(),
        );

        let hit_requests_in_progress: Gauge = Gauge::default();
        registry.register(
            "artifactcache_hit_requests_in_progress",
            "Number of cache-hit requests being served right now",
            hit_requests_in_progress.clone(),
        );

        let miss_requests_in_progress: Gauge = Gauge::default();
        registry.register(
            "artifactcache_miss_requests_in_progress",
            "Number of cache-miss requests being served right now",
            miss_requests_in_progress.clone(),
        );

        let hit_count = Counter::default();
        registry.register(
            "artifactcache_cache_hits",
            "Total cache hits",
            hit_count.clone(),
        );

        let hit_bytes = Counter::default();
        registry.register(
            "artifactcache_cache_hit_bytes",
            "Total bytes served from the local cache",
            hit_bytes.clone(),
        );

        let miss_count = Counter::default();
        registry.register(
            "artifactcache_cache_misses",
            "Total cache misses",
            miss_count.clone(),
        );

        let miss_bytes = Counter::default();
        registry.register(
            "artifactcache_cache_miss_bytes",
            "Total bytes streamed from upstream on cache misses",
            miss_bytes.clone(),
        );

        let error_count = Counter::default();
        registry.register(
            "artifactcache_errors",
            "Total errors: bad requests, unknown repos, disconnects, local I/O failures",
            error_count.clone(),
        );

        let upstream_error_count = Counter::default();
        registry.register(
            "artifactcache_upstream_errors",
            "Total upstream errors: connection failures and non-200 responses",
            upstream_error_count.clone(),
        );

        let prefetch_ignore_count = Counter::default();
        registry.register(
            "artifactcache_prefetch_ignored",
            "Listed items excluded by the include/exclude filters",
            prefetch_ignore_count.clone(),
        );

        let prefetch_skip_count = Counter::default();
        registry.register(
            "artifactcache_prefetch_skipped",
            "Listed items skipped because they are already cached",
            prefetch_skip_count.clone(),
        );

        let prefetch_download_count = Counter::default();
        registry.register(
            "artifactcache_prefetch_downloads",
            "Items downloaded by the prefetcher",
            prefetch_download_count.clone(),
        );

        let prefetch_download_bytes = Counter::default();
        registry.register(
            "artifactcache_prefetch_download_bytes",
            "Bytes downloaded by the prefetcher, including failed transfers",
            prefetch_download_bytes.clone(),
        );

        let prefetch_download_error_count = Counter::default();
        registry.register(
            "artifactcache_prefetch_download_errors",
            "Prefetch download failures",
            prefetch_download_error_count.clone(),
        );

        let prefetch_list_request_count = Counter::default();
        registry.register(
            "artifactcache_prefetch_list_requests",
            "Upstream listing requests made, regardless of outcome",
            prefetch_list_request_count.clone(),
        );

        let prefetch_list_error_count = Counter::default();
        registry.register(
            "artifactcache_prefetch_list_errors",
            "Upstream listing request failures",
            prefetch_list_error_count.clone(),
        );

        let prefetch_in_progress: Gauge = Gauge::default();
        registry.register(
            "artifactcache_prefetch_in_progress",
            "Whether a prefetch pass is running",
            prefetch_in_progress.clone(),
        );

        let prefetch_loop_seconds = Histogram::new(exponential_buckets(0.01, 2.0, 14));
        registry.register(
            "artifactcache_prefetch_loop_duration_seconds",
            "Duration of prefetch passes in seconds",
            prefetch_loop_seconds.clone(),
        );

        let prefetch_last_loop_seconds: SecondsGauge = SecondsGauge::default();
        registry.register(
            "artifactcache_prefetch_last_loop_duration_seconds",
            "Duration of the most recent prefetch pass in seconds",
            prefetch_last_loop_seconds.clone(),
        );

        let disk_cache_size_bytes: Gauge = Gauge::default();
        registry.register(
            "artifactcache_disk_cache_size_bytes",
            "Sum of cached file sizes on disk",
            disk_cache_size_bytes.clone(),
        );

        let disk_cache_available_bytes: Gauge = Gauge::default();
        registry.register(
            "artifactcache_disk_cache_available_space_bytes",
            "Available space on the cache filesystem as reported by the OS",
            disk_cache_available_bytes.clone(),
        );

        let disk_cache_used_bytes: Gauge = Gauge::default();
        registry.register(
            "artifactcache_disk_cache_used_space_bytes",
            "Used space on the cache filesystem as reported by the OS",
            disk_cache_used_bytes.clone(),
        );

        let disk_cache_total_bytes: Gauge = Gauge::default();
        registry.register(
            "artifactcache_disk_cache_total_space_bytes",
            "Total space on the cache filesystem as reported by the OS",
            disk_cache_total_bytes.clone(),
        );

        let gc_error_count = Counter::default();
        registry.register(
            "artifactcache_gc_errors",
            "Errors encountered during garbage collection",
            gc_error_count.clone(),
        );

        let gc_in_progress: Gauge = Gauge::default();
        registry.register(
            "artifactcache_gc_in_progress",
            "Whether a garbage-collection pass is running",
            gc_in_progress.clone(),
        );

        let gc_loop_seconds = Histogram::new(exponential_buckets(0.01, 2.0, 14));
        registry.register(
            "artifactcache_gc_loop_duration_seconds",
            "Duration of garbage-collection passes in seconds",
            gc_loop_seconds.clone(),
        );

        let gc_last_loop_seconds: SecondsGauge = SecondsGauge::default();
        registry.register(
            "artifactcache_gc_last_loop_duration_seconds",
            "Duration of the most recent garbage-collection pass in seconds",
            gc_last_loop_seconds.clone(),
        );

        let gc_retained_bytes: Gauge = Gauge::default();
        registry.register(
            "artifactcache_gc_retained_bytes",
            "Bytes retained in the cache after the last GC pass",
            gc_retained_bytes.clone(),
        );

        let gc_retained_files: Gauge = Gauge::default();
        registry.register(
            "artifactcache_gc_retained_files",
            "Files retained in the cache after the last GC pass",
            gc_retained_files.clone(),
        );

        Self {
            requests_in_progress,
            hit_requests_in_progress,
            miss_requests_in_progress,
            hit_count,
            hit_bytes,
            miss_count,
            miss_bytes,
            error_count,
            upstream_error_count,
            prefetch_ignore_count,
            prefetch_skip_count,
            prefetch_download_count,
            prefetch_download_bytes,
            prefetch_download_error_count,
            prefetch_list_request_count,
            prefetch_list_error_count,
            prefetch_in_progress,
            prefetch_loop_seconds,
            prefetch_last_loop_seconds,
            disk_cache_size_bytes,
            disk_cache_available_bytes,
            disk_cache_used_bytes,
            disk_cache_total_bytes,
            gc_error_count,
            gc_in_progress,
            gc_loop_seconds,
            gc_last_loop_seconds,
            gc_retained_bytes,
            gc_retained_files,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`].
///
/// [`AppState`]: crate::AppState
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all proxy metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }
}

// ---------------------------------------------------------------------------
// In-flight guard
// ---------------------------------------------------------------------------

/// RAII guard for an in-progress gauge: increments on construction,
/// decrements on drop. Moved into the streaming task on the miss path so the
/// gauge covers the whole transfer.
pub struct InFlight {
    gauge: Gauge,
}

impl InFlight {
    pub fn new(gauge: &Gauge) -> Self {
        gauge.inc();
        Self {
            gauge: gauge.clone(),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}
