//! Prometheus metrics for the HTTP layer.
//!
//! Request metrics are recorded by middleware; engine gauges are refreshed
//! from the engine's status right before each scrape. Core metrics are
//! registered alongside so one endpoint exposes everything.

use once_cell::sync::Lazy;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use regex_lite::Regex;

use crate::state::AppState;

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// HTTP Request Metrics
// =============================================================================

/// HTTP request duration in seconds.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "debridfs_http_request_duration_seconds",
            "HTTP request duration in seconds",
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ]),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests total count.
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("debridfs_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests currently in flight.
pub static HTTP_REQUESTS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "debridfs_http_requests_in_flight",
        "Number of HTTP requests currently being processed",
    )
    .unwrap()
});

/// Authentication failures.
pub static AUTH_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "debridfs_auth_failures_total",
            "Total authentication failures",
        ),
        &["reason"],
    )
    .unwrap()
});

// =============================================================================
// Engine Metrics (collected dynamically)
// =============================================================================

/// Engine running state (1 = running, 0 = stopped).
pub static ENGINE_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "debridfs_engine_running",
        "Whether the engine is running (1) or stopped (0)",
    )
    .unwrap()
});

/// Torrents still downloading upstream.
pub static TORRENTS_DOWNLOADING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "debridfs_torrents_downloading",
        "Number of torrents still downloading upstream",
    )
    .unwrap()
});

/// Provider calls currently in flight.
pub static PROVIDER_IN_FLIGHT: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "debridfs_provider_in_flight",
            "Provider calls currently in flight",
        ),
        &["provider"],
    )
    .unwrap()
});

/// Download keys not currently benched.
pub static PROVIDER_KEYS_USABLE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "debridfs_provider_download_keys_usable",
            "Download keys not currently benched",
        ),
        &["provider"],
    )
    .unwrap()
});

/// Repair tasks queued or running.
pub static REPAIRS_PENDING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "debridfs_repairs_pending",
        "Torrents with a queued or running repair",
    )
    .unwrap()
});

// =============================================================================
// Registration
// =============================================================================

fn register_metrics(registry: &Registry) {
    let server_metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        // HTTP
        Box::new(HTTP_REQUEST_DURATION.clone()),
        Box::new(HTTP_REQUESTS_TOTAL.clone()),
        Box::new(HTTP_REQUESTS_IN_FLIGHT.clone()),
        Box::new(AUTH_FAILURES_TOTAL.clone()),
        // Engine
        Box::new(ENGINE_RUNNING.clone()),
        Box::new(TORRENTS_DOWNLOADING.clone()),
        Box::new(PROVIDER_IN_FLIGHT.clone()),
        Box::new(PROVIDER_KEYS_USABLE.clone()),
        Box::new(REPAIRS_PENDING.clone()),
    ];

    // Then the core ones (providers, links, store, repair)
    for metric in server_metrics
        .into_iter()
        .chain(debridfs_core::metrics::all_metrics())
    {
        registry.register(metric).unwrap();
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

/// Refresh engine gauges from the current engine status.
pub async fn collect_dynamic_metrics(state: &AppState) {
    let status = state.engine().status().await;
    ENGINE_RUNNING.set(if status.running { 1 } else { 0 });
    TORRENTS_DOWNLOADING.set(status.downloading as i64);
    REPAIRS_PENDING.set(status.repair.active.len() as i64);
    for provider in &status.providers {
        PROVIDER_IN_FLIGHT
            .with_label_values(&[&provider.name])
            .set(provider.in_flight as i64);
        PROVIDER_KEYS_USABLE
            .with_label_values(&[&provider.name])
            .set(provider.download_keys_usable as i64);
    }
}

static FS_PATH: Lazy<Regex> = Lazy::new(|| Regex::new(r"(/api/v1/fs)/.+$").unwrap());
static ID_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(/api/v1/(?:torrents|repair))/([^/]+)$").unwrap());

/// Normalize a path for metric labels.
///
/// Filesystem paths and torrent ids are collapsed to placeholders to keep
/// label cardinality bounded.
pub fn normalize_path(path: &str) -> String {
    if FS_PATH.is_match(path) {
        return FS_PATH.replace(path, "$1/{path}").to_string();
    }
    if let Some(caps) = ID_PATH.captures(path) {
        if &caps[2] != "recent" {
            return ID_PATH.replace(path, "$1/{id}").to_string();
        }
    }
    path.to_string()
}
