//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Provider pool (calls, rate limiting, slots)
//! - Link cache (lookups, mints, refreshes)
//! - Torrent store (reconciliation, persistence)
//! - Repair engine (tasks, probes)

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts};

// =============================================================================
// Provider Pool
// =============================================================================

/// Upstream provider calls by provider and result.
pub static PROVIDER_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("debridfs_provider_calls_total", "Total upstream provider calls"),
        &["provider", "result"], // "success", "failure"
    )
    .unwrap()
});

/// Rate limit waits that hit the configured timeout.
pub static RATE_LIMIT_TIMEOUTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "debridfs_rate_limit_timeouts_total",
            "Total rate limit acquisitions that timed out",
        ),
        &["provider", "budget"],
    )
    .unwrap()
});

/// Last reported free download slots per provider.
pub static PROVIDER_SLOTS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "debridfs_provider_available_slots",
            "Free download slots last reported by the provider",
        ),
        &["provider"],
    )
    .unwrap()
});

/// Download keys benched after exhausting their traffic.
pub static KEYS_BENCHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "debridfs_download_keys_benched_total",
            "Total download keys benched for traffic exhaustion",
        ),
        &["provider"],
    )
    .unwrap()
});

// =============================================================================
// Link Cache
// =============================================================================

/// Link lookups by result.
pub static LINK_LOOKUPS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("debridfs_link_lookups_total", "Total link cache lookups"),
        &["result"], // "hit", "stale", "miss"
    )
    .unwrap()
});

/// Link mints by provider and result.
pub static LINK_MINTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("debridfs_link_mints_total", "Total download links minted"),
        &["provider", "result"],
    )
    .unwrap()
});

/// Link mint duration in seconds.
pub static LINK_MINT_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "debridfs_link_mint_duration_seconds",
            "Duration of upstream link minting",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["provider"],
    )
    .unwrap()
});

/// Links currently cached.
pub static LINKS_CACHED: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("debridfs_links_cached", "Download links currently cached").unwrap()
});

// =============================================================================
// Torrent Store
// =============================================================================

/// Torrents currently held in the store.
pub static TORRENTS_STORED: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("debridfs_torrents_stored", "Torrents currently in the store").unwrap()
});

/// Reconciliation changes by provider and kind.
pub static RECONCILE_CHANGES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "debridfs_reconcile_changes_total",
            "Torrent store changes applied by reconciliation",
        ),
        &["provider", "kind"], // "added", "updated", "removed"
    )
    .unwrap()
});

/// Torrent list syncs by provider and result.
pub static TORRENT_SYNCS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("debridfs_torrent_syncs_total", "Total torrent list refreshes"),
        &["provider", "result"],
    )
    .unwrap()
});

/// Store persistence writes by result.
pub static STORE_PERSISTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("debridfs_store_persists_total", "Total torrent store saves"),
        &["result"],
    )
    .unwrap()
});

// =============================================================================
// Repair Engine
// =============================================================================

/// Repair tasks by strategy and final state.
pub static REPAIR_TASKS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("debridfs_repair_tasks_total", "Total repair tasks finished"),
        &["strategy", "state"], // state: "succeeded", "failed", "skipped"
    )
    .unwrap()
});

/// Repair probes by result.
pub static REPAIR_PROBES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("debridfs_repair_probes_total", "Total repair link probes"),
        &["result"], // "healthy", "broken", "inconclusive"
    )
    .unwrap()
});

/// Repair task duration in seconds.
pub static REPAIR_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "debridfs_repair_duration_seconds",
            "Duration of repair tasks",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 600.0]),
        &["strategy"],
    )
    .unwrap()
});

/// Repair tasks currently running.
pub static REPAIRS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("debridfs_repairs_active", "Repair tasks currently running").unwrap()
});

/// Every core metric, for registration in the server's registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Providers
        Box::new(PROVIDER_CALLS.clone()),
        Box::new(RATE_LIMIT_TIMEOUTS.clone()),
        Box::new(PROVIDER_SLOTS.clone()),
        Box::new(KEYS_BENCHED.clone()),
        // Links
        Box::new(LINK_LOOKUPS.clone()),
        Box::new(LINK_MINTS.clone()),
        Box::new(LINK_MINT_DURATION.clone()),
        Box::new(LINKS_CACHED.clone()),
        // Store
        Box::new(TORRENTS_STORED.clone()),
        Box::new(RECONCILE_CHANGES.clone()),
        Box::new(TORRENT_SYNCS.clone()),
        Box::new(STORE_PERSISTS.clone()),
        // Repair
        Box::new(REPAIR_TASKS.clone()),
        Box::new(REPAIR_PROBES.clone()),
        Box::new(REPAIR_DURATION.clone()),
        Box::new(REPAIRS_ACTIVE.clone()),
    ]
}
