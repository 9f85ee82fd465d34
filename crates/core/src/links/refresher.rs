//! Per-provider background re-minting of links about to go stale.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cache::LinkCache;
use crate::provider::ProviderPool;
use crate::schedule::{spawn_periodic, RunGuard};

/// Outcome of one refresh pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub refreshed: usize,
    pub failed: usize,
    /// The pass was skipped because the previous one was still running.
    pub skipped: bool,
}

pub struct LinkRefresher {
    cache: LinkCache,
    pool: Arc<ProviderPool>,
    guards: HashMap<String, RunGuard>,
}

impl LinkRefresher {
    pub fn new(cache: LinkCache, pool: Arc<ProviderPool>) -> Self {
        let guards = pool
            .providers()
            .iter()
            .map(|p| (p.name().to_string(), RunGuard::new()))
            .collect();
        Self {
            cache,
            pool,
            guards,
        }
    }

    /// Re-mint every link of `provider` that expires or falls due within
    /// `horizon`.
    pub async fn refresh_provider(&self, provider: &str, horizon: Duration) -> RefreshReport {
        let Some(guard) = self.guards.get(provider) else {
            warn!("Link refresh requested for unknown provider {}", provider);
            return RefreshReport::default();
        };
        let Some(_claim) = guard.try_claim() else {
            debug!("Link refresh for {} still running, skipping tick", provider);
            return RefreshReport {
                skipped: true,
                ..Default::default()
            };
        };

        let horizon = Utc::now()
            + chrono::Duration::from_std(horizon).unwrap_or_else(|_| chrono::Duration::zero());
        let due = self.cache.due_before(provider, horizon);
        if due.is_empty() {
            return RefreshReport::default();
        }

        let workers = self
            .pool
            .provider(provider)
            .map(|p| p.settings().workers)
            .unwrap_or(1);
        let results: Vec<bool> = stream::iter(due)
            .map(|key| async move {
                match self.cache.refresh(&key).await {
                    Ok(_) => true,
                    Err(e) => {
                        warn!("Failed to refresh link {}: {}", key, e);
                        false
                    }
                }
            })
            .buffer_unordered(workers.max(1))
            .collect()
            .await;

        let refreshed = results.iter().filter(|ok| **ok).count();
        let report = RefreshReport {
            refreshed,
            failed: results.len() - refreshed,
            skipped: false,
        };
        info!(
            "Refreshed {} links for {} ({} failed)",
            report.refreshed, provider, report.failed
        );
        report
    }

    /// Spawn one refresh loop per provider.
    pub fn spawn(self: Arc<Self>, shutdown_tx: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        self.pool
            .providers()
            .iter()
            .map(|provider| {
                let name = provider.name().to_string();
                let interval = provider.settings().download_links_refresh_interval;
                let refresher = Arc::clone(&self);
                spawn_periodic(
                    format!("Link refresh ({})", name),
                    interval,
                    shutdown_tx.subscribe(),
                    move || {
                        let refresher = Arc::clone(&refresher);
                        let name = name.clone();
                        async move {
                            refresher.refresh_provider(&name, interval).await;
                        }
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineSettings, SharedConfig};
    use crate::links::LinkKey;
    use crate::provider::DebridClient;
    use crate::repair::repair_channel;
    use crate::store::TorrentStore;
    use crate::testing::{fixtures, MockDebridClient};

    fn setup() -> (LinkRefresher, LinkCache, Arc<MockDebridClient>) {
        let config = fixtures::config(&["rd"]);
        let settings = EngineSettings::resolve(&config).unwrap();
        let client = Arc::new(MockDebridClient::new("rd"));
        let pool = Arc::new(
            ProviderPool::new(
                &settings.providers,
                vec![Arc::clone(&client) as Arc<dyn DebridClient>],
            )
            .unwrap(),
        );
        let store = Arc::new(TorrentStore::new());
        store.upsert(fixtures::torrent("T1", "rd", &[("a.mkv", 1), ("b.mkv", 2)]));
        let (trigger, _requests) = repair_channel(4);
        let cache = LinkCache::new(
            store,
            Arc::clone(&pool),
            Arc::new(SharedConfig::new(config).unwrap()),
            trigger,
        );
        (LinkRefresher::new(cache.clone(), pool), cache, client)
    }

    #[tokio::test]
    async fn test_refreshes_links_due_within_horizon() {
        let (refresher, cache, client) = setup();
        let before = cache.resolve("T1", "a.mkv").await.unwrap();
        cache.resolve("T1", "b.mkv").await.unwrap();
        assert_eq!(client.mint_count(), 2);

        // Links live three days; nothing is due within a minute.
        let report = refresher
            .refresh_provider("rd", Duration::from_secs(60))
            .await;
        assert_eq!(report, RefreshReport::default());

        let report = refresher
            .refresh_provider("rd", Duration::from_secs(4 * 86_400))
            .await;
        assert_eq!(report.refreshed, 2);
        assert_eq!(client.mint_count(), 4);
        let after = cache.get(&LinkKey::new("T1", "a.mkv")).unwrap();
        assert_ne!(before.url, after.url);
    }

    #[tokio::test]
    async fn test_ticks_leave_long_lived_links_alone() {
        let (refresher, cache, client) = setup();
        cache.resolve("T1", "a.mkv").await.unwrap();
        cache.resolve("T1", "b.mkv").await.unwrap();

        let interval = Duration::from_secs(40 * 60);
        for _ in 0..2 {
            let report = refresher.refresh_provider("rd", interval).await;
            assert_eq!(report.refreshed, 0);
        }
        assert_eq!(client.mint_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_entry() {
        let (refresher, cache, client) = setup();
        cache.resolve("T1", "a.mkv").await.unwrap();
        client
            .fail_next_mint(crate::provider::DebridError::ProviderUnavailable(
                "down".to_string(),
            ))
            .await;

        let report = refresher
            .refresh_provider("rd", Duration::from_secs(4 * 86_400))
            .await;
        assert_eq!(report.failed, 1);
        assert!(cache.get(&LinkKey::new("T1", "a.mkv")).is_some());
    }

    #[tokio::test]
    async fn test_overlapping_pass_is_skipped() {
        let (refresher, cache, client) = setup();
        cache.resolve("T1", "a.mkv").await.unwrap();
        client.set_mint_delay(Duration::from_millis(100)).await;

        let horizon = Duration::from_secs(4 * 86_400);
        let (first, second) = tokio::join!(
            refresher.refresh_provider("rd", horizon),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                refresher.refresh_provider("rd", horizon).await
            }
        );
        assert_eq!(first.refreshed, 1);
        assert!(second.skipped);
    }
}
