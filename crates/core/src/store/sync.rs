//! Periodic sync of each provider's torrent list into the store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::memory::TorrentStore;
use super::reconcile::ReconcileReport;
use super::types::{Torrent, TorrentStatus};
use crate::config::SharedConfig;
use crate::links::LinkCache;
use crate::metrics;
use crate::provider::{Budget, DebridError, Provider, ProviderPool};
use crate::repair::{RepairReason, RepairTrigger};
use crate::schedule::{retry_with_backoff, spawn_periodic, RunGuard};

/// What one sync pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub provider: String,
    pub reconcile: ReconcileReport,
    /// Torrents whose details were fetched.
    pub fetched: usize,
    pub stalled_removed: Vec<String>,
    pub ingest_repairs: usize,
    /// Links evicted because their torrent or file went away or changed.
    pub links_evicted: usize,
    /// The pass was skipped because the previous one was still running.
    pub skipped: bool,
}

pub struct TorrentSync {
    store: Arc<TorrentStore>,
    pool: Arc<ProviderPool>,
    links: LinkCache,
    config: Arc<SharedConfig>,
    repair: RepairTrigger,
    guards: HashMap<String, RunGuard>,
}

impl TorrentSync {
    pub fn new(
        store: Arc<TorrentStore>,
        pool: Arc<ProviderPool>,
        links: LinkCache,
        config: Arc<SharedConfig>,
        repair: RepairTrigger,
    ) -> Self {
        let guards = pool
            .providers()
            .iter()
            .map(|p| (p.name().to_string(), RunGuard::new()))
            .collect();
        Self {
            store,
            pool,
            links,
            config,
            repair,
            guards,
        }
    }

    /// Sync every provider once, in configuration order.
    pub async fn run_all(&self) -> Vec<Result<SyncReport, DebridError>> {
        let mut results = Vec::new();
        for provider in self.pool.providers() {
            results.push(self.run_once(provider.name()).await);
        }
        results
    }

    /// List `provider` upstream and reconcile the store against it.
    pub async fn run_once(&self, provider_name: &str) -> Result<SyncReport, DebridError> {
        let provider = self.pool.provider(provider_name)?;
        let Some(_claim) = self
            .guards
            .get(provider_name)
            .and_then(|guard| guard.try_claim())
        else {
            debug!("Torrent sync for {} still running, skipping tick", provider_name);
            return Ok(SyncReport {
                provider: provider_name.to_string(),
                skipped: true,
                ..Default::default()
            });
        };

        let result = self.sync(&provider).await;
        let label = if result.is_ok() { "success" } else { "failure" };
        metrics::TORRENT_SYNCS
            .with_label_values(&[provider_name, label])
            .inc();
        if let Err(e) = &result {
            warn!("Torrent sync for {} failed: {}", provider_name, e);
        }
        result
    }

    async fn sync(&self, provider: &Provider) -> Result<SyncReport, DebridError> {
        let settings = self.config.settings();
        let timeout = settings.rate_limit_timeout;
        let name = provider.name().to_string();

        let summaries = retry_with_backoff(&format!("Listing torrents on {}", name), || {
            provider.call(Budget::General, timeout, |client| async move {
                client.list_torrents().await
            })
        })
        .await?;

        // Reuse stored copies whose listing entry is unchanged; fetch the rest.
        let snapshot = self.store.snapshot();
        let mut upstream: BTreeMap<String, Torrent> = BTreeMap::new();
        let mut to_fetch = Vec::new();
        for summary in summaries {
            match snapshot.get(&summary.id) {
                Some(stored) if stored.provider == name && summary.matches(stored) => {
                    upstream.insert(summary.id.clone(), (**stored).clone());
                }
                _ => to_fetch.push(summary.id),
            }
        }

        let fetched = to_fetch.len();
        let details: Vec<(String, Result<Torrent, DebridError>)> = stream::iter(to_fetch)
            .map(|id| async move {
                let result = retry_with_backoff(&format!("Fetching torrent {}", id), || {
                    let id = id.clone();
                    provider.call(Budget::General, timeout, |client| async move {
                        client.get_torrent(&id).await
                    })
                })
                .await;
                (id, result)
            })
            .buffer_unordered(provider.settings().workers.max(1))
            .collect()
            .await;

        for (id, result) in details {
            match result {
                Ok(torrent) => {
                    upstream.insert(id, torrent);
                }
                Err(DebridError::TorrentNotFound(_)) => {
                    debug!("Torrent {} vanished from {} during sync", id, name);
                }
                Err(e) => {
                    // Keep what we have rather than dropping it on a transient error.
                    warn!("Failed to fetch torrent {} from {}: {}", id, name, e);
                    if let Some(stored) = snapshot.get(&id) {
                        upstream.insert(id, (**stored).clone());
                    }
                }
            }
        }

        let reconcile = self.store.reconcile(&name, upstream.into_values().collect());
        let mut links_evicted = 0;
        for id in &reconcile.removed {
            links_evicted += self.links.evict_torrent(id);
        }
        let mut stale: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (id, path) in &reconcile.removed_files {
            stale.entry(id.as_str()).or_default().push(path.as_str());
        }
        for (id, paths) in stale {
            links_evicted += self.links.evict_files(id, paths);
        }

        if let Err(e) = self.pool.refresh_slots(provider, timeout).await {
            debug!("Could not refresh slot count for {}: {}", name, e);
        }

        let stalled_removed = match settings.remove_stalled_after {
            Some(after) => self.remove_stalled(provider, after, timeout).await,
            None => Vec::new(),
        };

        let mut ingest_repairs = 0;
        if settings.repair.enabled && settings.repair.auto_process {
            for id in &reconcile.added {
                let failed = self
                    .store
                    .get(id)
                    .is_some_and(|t| t.status == TorrentStatus::Error);
                if failed && self.repair.send(id, RepairReason::Ingest) {
                    ingest_repairs += 1;
                }
            }
        }

        if !reconcile.is_noop() || !stalled_removed.is_empty() {
            info!(
                "Synced {}: {} added, {} updated, {} removed, {} unchanged, {} stalled removed",
                name,
                reconcile.added.len(),
                reconcile.updated.len(),
                reconcile.removed.len(),
                reconcile.unchanged,
                stalled_removed.len()
            );
        }

        Ok(SyncReport {
            provider: name,
            reconcile,
            fetched,
            stalled_removed,
            ingest_repairs,
            links_evicted,
            skipped: false,
        })
    }

    /// Delete torrents of `provider` that have been downloading for longer
    /// than `after`, upstream and locally.
    async fn remove_stalled(
        &self,
        provider: &Provider,
        after: Duration,
        timeout: Duration,
    ) -> Vec<String> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(after).unwrap_or_else(|_| chrono::Duration::zero());
        let stalled: Vec<String> = self
            .store
            .snapshot()
            .by_provider(provider.name())
            .filter(|t| t.status == TorrentStatus::Downloading && t.added_at < cutoff)
            .map(|t| t.id.clone())
            .collect();

        let mut removed = Vec::new();
        for id in stalled {
            let result = provider
                .call(Budget::General, timeout, |client| {
                    let id = id.clone();
                    async move { client.delete_torrent(&id).await }
                })
                .await;
            match result {
                Ok(()) | Err(DebridError::TorrentNotFound(_)) => {
                    info!("Removed stalled download {} from {}", id, provider.name());
                    self.store.remove(&id);
                    self.links.evict_torrent(&id);
                    removed.push(id);
                }
                Err(e) => warn!("Failed to remove stalled download {}: {}", id, e),
            }
        }
        removed
    }

    /// Spawn one sync loop per provider.
    pub fn spawn(self: Arc<Self>, shutdown_tx: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        self.pool
            .providers()
            .iter()
            .map(|provider| {
                let name = provider.name().to_string();
                let sync = Arc::clone(&self);
                spawn_periodic(
                    format!("Torrent sync ({})", name),
                    provider.settings().torrents_refresh_interval,
                    shutdown_tx.subscribe(),
                    move || {
                        let sync = Arc::clone(&sync);
                        let name = name.clone();
                        async move {
                            // Failures are logged inside; the next tick retries.
                            let _ = sync.run_once(&name).await;
                        }
                    },
                )
            })
            .collect()
    }
}
