//! Download link cache.
//!
//! Holds one minted URL per (torrent, file). Concurrent misses for the same
//! key share a single upstream mint, and every waiter gets that mint's
//! result, success or error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::types::{CachedLink, LinkKey};
use crate::config::{SharedConfig, StaleLinkPolicy};
use crate::metrics;
use crate::provider::{Budget, DebridError, ProviderPool};
use crate::repair::{RepairReason, RepairTrigger};
use crate::store::TorrentStore;

type PendingMint = Shared<BoxFuture<'static, Result<CachedLink, DebridError>>>;

/// Cache counters for status endpoints.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub mints: u64,
    pub mint_failures: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    mints: AtomicU64,
    mint_failures: AtomicU64,
}

struct Inner {
    entries: RwLock<HashMap<LinkKey, CachedLink>>,
    pending: Mutex<HashMap<LinkKey, PendingMint>>,
    store: Arc<TorrentStore>,
    pool: Arc<ProviderPool>,
    config: Arc<SharedConfig>,
    repair: RepairTrigger,
    counters: Counters,
}

#[derive(Clone)]
pub struct LinkCache {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl LinkCache {
    pub fn new(
        store: Arc<TorrentStore>,
        pool: Arc<ProviderPool>,
        config: Arc<SharedConfig>,
        repair: RepairTrigger,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                store,
                pool,
                config,
                repair,
                counters: Counters::default(),
            }),
        }
    }

    /// Return a servable URL for a file, minting one if needed.
    ///
    /// An expired link is never returned. A link past its refresh point is
    /// either re-minted first (`block`) or returned while a background
    /// refresh runs (`serve_stale`).
    pub async fn resolve(&self, torrent_id: &str, path: &str) -> Result<CachedLink, DebridError> {
        let key = LinkKey::new(torrent_id, path);
        let now = Utc::now();

        if let Some(link) = self.get(&key) {
            if link.is_fresh(now) {
                self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                metrics::LINK_LOOKUPS.with_label_values(&["hit"]).inc();
                return Ok(link);
            }
            if !link.is_expired(now)
                && self.inner.config.settings().stale_links == StaleLinkPolicy::ServeStale
            {
                self.inner.counters.stale_hits.fetch_add(1, Ordering::Relaxed);
                metrics::LINK_LOOKUPS.with_label_values(&["stale"]).inc();
                self.refresh_in_background(key);
                return Ok(link);
            }
        }

        self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
        metrics::LINK_LOOKUPS.with_label_values(&["miss"]).inc();
        self.mint_shared(key, false).await
    }

    /// Re-mint a link even if the cached one is still fresh.
    pub async fn refresh(&self, key: &LinkKey) -> Result<CachedLink, DebridError> {
        self.mint_shared(key.clone(), true).await
    }

    /// The cached entry for `key`, whatever its age.
    pub fn get(&self, key: &LinkKey) -> Option<CachedLink> {
        match self.inner.entries.read() {
            Ok(entries) => entries.get(key).cloned(),
            Err(poisoned) => poisoned.into_inner().get(key).cloned(),
        }
    }

    pub fn len(&self) -> usize {
        match self.inner.entries.read() {
            Ok(entries) => entries.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop one entry. Returns whether it was cached.
    pub fn invalidate(&self, key: &LinkKey) -> bool {
        self.write_entries(|entries| entries.remove(key).is_some())
    }

    /// Drop every entry of a torrent.
    pub fn evict_torrent(&self, torrent_id: &str) -> usize {
        let evicted = self.write_entries(|entries| {
            let before = entries.len();
            entries.retain(|k, _| k.torrent_id != torrent_id);
            before - entries.len()
        });
        if evicted > 0 {
            debug!("Evicted {} links of torrent {}", evicted, torrent_id);
        }
        evicted
    }

    /// Drop the entries of some files of a torrent.
    pub fn evict_files<'a>(&self, torrent_id: &str, paths: impl IntoIterator<Item = &'a str>) -> usize {
        let keys: Vec<LinkKey> = paths
            .into_iter()
            .map(|p| LinkKey::new(torrent_id, p))
            .collect();
        self.write_entries(|entries| keys.iter().filter(|k| entries.remove(k).is_some()).count())
    }

    /// A reader found this file's link dead: evict it and ask for a repair.
    pub fn report_broken(&self, torrent_id: &str, path: &str) {
        warn!("Broken link reported for {}/{}", torrent_id, path);
        self.invalidate(&LinkKey::new(torrent_id, path));
        self.inner.repair.send(
            torrent_id,
            RepairReason::BrokenLink {
                path: path.to_string(),
            },
        );
    }

    /// Keys of `provider` whose link falls due for refresh, or expires,
    /// before `horizon`.
    pub fn due_before(&self, provider: &str, horizon: DateTime<Utc>) -> Vec<LinkKey> {
        let entries = match self.inner.entries.read() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut keys: Vec<LinkKey> = entries
            .iter()
            .filter(|(_, link)| {
                link.provider == provider
                    && (link.refresh_due_at <= horizon || link.expires_at <= horizon)
            })
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> LinkCacheStats {
        let c = &self.inner.counters;
        LinkCacheStats {
            entries: self.len(),
            hits: c.hits.load(Ordering::Relaxed),
            stale_hits: c.stale_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            mints: c.mints.load(Ordering::Relaxed),
            mint_failures: c.mint_failures.load(Ordering::Relaxed),
        }
    }

    fn write_entries<R>(&self, f: impl FnOnce(&mut HashMap<LinkKey, CachedLink>) -> R) -> R {
        let mut entries = match self.inner.entries.write() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        let result = f(&mut entries);
        metrics::LINKS_CACHED.set(entries.len() as i64);
        result
    }

    fn refresh_in_background(&self, key: LinkKey) {
        let mint = self.mint_shared(key.clone(), false);
        tokio::spawn(async move {
            if let Err(e) = mint.await {
                debug!("Background refresh of {} failed: {}", key, e);
            }
        });
    }

    /// Join the in-flight mint for `key`, or start one.
    ///
    /// Unless `force` is set, a link that turned fresh while the caller was
    /// deciding is returned as is.
    fn mint_shared(&self, key: LinkKey, force: bool) -> PendingMint {
        let mut pending = lock(&self.inner.pending);
        if let Some(existing) = pending.get(&key) {
            return existing.clone();
        }
        if !force {
            if let Some(link) = self.get(&key).filter(|l| l.is_fresh(Utc::now())) {
                return future::ready(Ok(link)).boxed().shared();
            }
        }

        let cache = self.clone();
        let mint_key = key.clone();
        let mint = async move {
            let result = cache.mint(&mint_key).await;
            lock(&cache.inner.pending).remove(&mint_key);
            result
        }
        .boxed()
        .shared();
        pending.insert(key, mint.clone());
        mint
    }

    async fn mint(&self, key: &LinkKey) -> Result<CachedLink, DebridError> {
        let torrent = self
            .inner
            .store
            .get(&key.torrent_id)
            .ok_or_else(|| DebridError::TorrentNotFound(key.torrent_id.clone()))?;
        let file = torrent
            .file(&key.path)
            .cloned()
            .ok_or_else(|| DebridError::FileNotFound {
                torrent_id: key.torrent_id.clone(),
                path: key.path.clone(),
            })?;
        let provider = self.inner.pool.provider(&torrent.provider)?;
        let timeout = self.inner.config.settings().rate_limit_timeout;

        let attempts = provider.settings().download_keys.len().max(1);
        let mut last_error = None;
        for _ in 0..attempts {
            provider.acquire(Budget::Download, timeout).await?;
            let download_key = provider.next_download_key()?;

            self.inner.counters.mints.fetch_add(1, Ordering::Relaxed);
            let started = Instant::now();
            let result = provider
                .client()
                .mint_link(&torrent, &file, &download_key)
                .await;
            metrics::LINK_MINT_DURATION
                .with_label_values(&[provider.name()])
                .observe(started.elapsed().as_secs_f64());

            let error = match result {
                Ok(url) => {
                    provider.record_success();
                    metrics::LINK_MINTS
                        .with_label_values(&[provider.name(), "success"])
                        .inc();
                    let settings = provider.settings();
                    let link = CachedLink::new(
                        url,
                        provider.name().to_string(),
                        download_key,
                        Utc::now(),
                        settings.auto_expire_links_after,
                        settings.download_links_refresh_interval,
                    );
                    // The torrent may have been removed while minting.
                    if self.inner.store.get(&key.torrent_id).is_some() {
                        self.write_entries(|entries| entries.insert(key.clone(), link.clone()));
                    }
                    return Ok(link);
                }
                Err(e) => e,
            };

            provider.record_failure(&error);
            self.inner.counters.mint_failures.fetch_add(1, Ordering::Relaxed);
            metrics::LINK_MINTS
                .with_label_values(&[provider.name(), "failure"])
                .inc();

            match &error {
                DebridError::TrafficExceeded(_) => {
                    provider.bench_key(&download_key);
                    last_error = Some(error);
                    continue;
                }
                DebridError::LinkBroken(_) => {
                    self.invalidate(key);
                    self.inner.repair.send(
                        &key.torrent_id,
                        RepairReason::BrokenLink {
                            path: key.path.clone(),
                        },
                    );
                }
                DebridError::TorrentNotFound(_) => {
                    info!(
                        "Torrent {} is gone from {}, removing it",
                        key.torrent_id,
                        provider.name()
                    );
                    self.inner.store.remove(&key.torrent_id);
                    self.evict_torrent(&key.torrent_id);
                }
                _ => {}
            }
            return Err(error);
        }

        Err(last_error.unwrap_or_else(|| {
            DebridError::TrafficExceeded(format!(
                "all download keys for {} are exhausted",
                provider.name()
            ))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, EngineSettings};
    use crate::provider::DebridClient;
    use crate::repair::{repair_channel, RepairRequests};
    use crate::testing::{fixtures, MockDebridClient};
    use std::time::Duration;

    struct Harness {
        cache: LinkCache,
        store: Arc<TorrentStore>,
        client: Arc<MockDebridClient>,
        requests: RepairRequests,
    }

    fn harness_with(tune: impl FnOnce(&mut Config)) -> Harness {
        let mut config = fixtures::config(&["rd"]);
        tune(&mut config);
        let settings = EngineSettings::resolve(&config).unwrap();
        let client = Arc::new(MockDebridClient::new("rd"));
        let pool = ProviderPool::new(
            &settings.providers,
            vec![Arc::clone(&client) as Arc<dyn DebridClient>],
        )
        .unwrap();
        let store = Arc::new(TorrentStore::new());
        store.upsert(fixtures::torrent(
            "T1",
            "rd",
            &[("a.mkv", 100), ("b.mkv", 200)],
        ));
        let (trigger, requests) = repair_channel(16);
        let cache = LinkCache::new(
            Arc::clone(&store),
            Arc::new(pool),
            Arc::new(SharedConfig::new(config).unwrap()),
            trigger,
        );
        Harness {
            cache,
            store,
            client,
            requests,
        }
    }

    fn harness() -> Harness {
        harness_with(|_| {})
    }

    #[tokio::test]
    async fn test_second_resolve_is_a_hit() {
        let h = harness();
        let first = h.cache.resolve("T1", "a.mkv").await.unwrap();
        let second = h.cache.resolve("T1", "a.mkv").await.unwrap();
        assert_eq!(first.url, second.url);
        assert_eq!(h.client.mint_count(), 1);
        assert_eq!(h.cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_mint() {
        let h = harness();
        h.client.set_mint_delay(Duration::from_millis(50)).await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = h.cache.clone();
            handles.push(tokio::spawn(async move {
                cache.resolve("T1", "a.mkv").await
            }));
        }
        let mut urls = Vec::new();
        for handle in handles {
            urls.push(handle.await.unwrap().unwrap().url);
        }

        assert_eq!(h.client.mint_count(), 1);
        assert!(urls.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_concurrent_waiters_share_the_error() {
        let h = harness();
        h.client.set_mint_delay(Duration::from_millis(50)).await;
        h.client
            .fail_next_mint(DebridError::ProviderUnavailable("down".to_string()))
            .await;

        let a = h.cache.clone();
        let b = h.cache.clone();
        let (ra, rb) = tokio::join!(a.resolve("T1", "a.mkv"), b.resolve("T1", "a.mkv"));
        assert!(matches!(ra, Err(DebridError::ProviderUnavailable(_))));
        assert_eq!(ra, rb);
        assert_eq!(h.client.mint_count(), 1);
    }

    #[tokio::test]
    async fn test_expired_link_is_reminted() {
        let h = harness_with(|c| {
            c.debrids[0].tunables.auto_expire_links_after = "50ms".to_string();
            c.debrids[0].tunables.download_links_refresh_interval = "50ms".to_string();
            c.webdav.stale_links = StaleLinkPolicy::ServeStale;
        });
        let first = h.cache.resolve("T1", "a.mkv").await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let second = h.cache.resolve("T1", "a.mkv").await.unwrap();
        assert_ne!(first.url, second.url);
        assert_eq!(h.client.mint_count(), 2);
    }

    #[tokio::test]
    async fn test_block_policy_remints_due_link() {
        let h = harness_with(|c| {
            c.debrids[0].tunables.auto_expire_links_after = "200ms".to_string();
            c.debrids[0].tunables.download_links_refresh_interval = "150ms".to_string();
            c.webdav.stale_links = StaleLinkPolicy::Block;
        });
        let first = h.cache.resolve("T1", "a.mkv").await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let second = h.cache.resolve("T1", "a.mkv").await.unwrap();
        assert_ne!(first.url, second.url);
        assert_eq!(h.client.mint_count(), 2);
    }

    #[tokio::test]
    async fn test_block_policy_keeps_link_far_from_expiry() {
        let h = harness_with(|c| {
            c.debrids[0].tunables.auto_expire_links_after = "10s".to_string();
            c.debrids[0].tunables.download_links_refresh_interval = "50ms".to_string();
            c.webdav.stale_links = StaleLinkPolicy::Block;
        });
        let first = h.cache.resolve("T1", "a.mkv").await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        // Older than one refresh interval, but nowhere near expiry.
        let second = h.cache.resolve("T1", "a.mkv").await.unwrap();
        assert_eq!(first.url, second.url);
        assert_eq!(h.client.mint_count(), 1);
    }

    #[tokio::test]
    async fn test_serve_stale_returns_old_and_refreshes() {
        let h = harness_with(|c| {
            c.debrids[0].tunables.auto_expire_links_after = "200ms".to_string();
            c.debrids[0].tunables.download_links_refresh_interval = "150ms".to_string();
            c.webdav.stale_links = StaleLinkPolicy::ServeStale;
        });
        let first = h.cache.resolve("T1", "a.mkv").await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let stale = h.cache.resolve("T1", "a.mkv").await.unwrap();
        assert_eq!(stale.url, first.url);
        assert_eq!(h.cache.stats().stale_hits, 1);

        // The background refresh lands shortly after.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.client.mint_count(), 2);
        let refreshed = h.cache.get(&LinkKey::new("T1", "a.mkv")).unwrap();
        assert_ne!(refreshed.url, first.url);
    }

    #[tokio::test]
    async fn test_missing_torrent_and_file() {
        let h = harness();
        assert_eq!(
            h.cache.resolve("nope", "a.mkv").await,
            Err(DebridError::TorrentNotFound("nope".to_string()))
        );
        assert!(matches!(
            h.cache.resolve("T1", "zzz.mkv").await,
            Err(DebridError::FileNotFound { .. })
        ));
        assert_eq!(h.client.mint_count(), 0);
    }

    #[tokio::test]
    async fn test_broken_mint_evicts_and_signals_repair() {
        let mut h = harness();
        h.client.break_file("T1", "a.mkv").await;

        let result = h.cache.resolve("T1", "a.mkv").await;
        assert!(matches!(result, Err(DebridError::LinkBroken(_))));
        assert!(h.cache.get(&LinkKey::new("T1", "a.mkv")).is_none());

        let request = h.requests.try_recv().unwrap();
        assert_eq!(request.torrent_id, "T1");
        assert_eq!(
            request.reason,
            RepairReason::BrokenLink {
                path: "a.mkv".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_report_broken_forces_remint() {
        let mut h = harness();
        let first = h.cache.resolve("T1", "a.mkv").await.unwrap();
        h.cache.report_broken("T1", "a.mkv");
        assert!(h.requests.try_recv().is_some());

        let second = h.cache.resolve("T1", "a.mkv").await.unwrap();
        assert_ne!(first.url, second.url);
        assert_eq!(h.client.mint_count(), 2);
    }

    #[tokio::test]
    async fn test_upstream_torrent_not_found_removes_from_store() {
        let h = harness();
        h.cache.resolve("T1", "b.mkv").await.unwrap();
        h.client
            .fail_next_mint(DebridError::TorrentNotFound("T1".to_string()))
            .await;

        let result = h.cache.resolve("T1", "a.mkv").await;
        assert!(matches!(result, Err(DebridError::TorrentNotFound(_))));
        assert!(h.store.get("T1").is_none());
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn test_traffic_exceeded_rotates_key() {
        let h = harness_with(|c| {
            c.debrids[0].download_api_keys = vec!["k1".to_string(), "k2".to_string()];
        });
        h.client
            .fail_next_mint(DebridError::TrafficExceeded("quota".to_string()))
            .await;

        let link = h.cache.resolve("T1", "a.mkv").await.unwrap();
        assert_eq!(link.download_key, "k2");
        assert_eq!(h.client.mint_keys().await, vec!["k1", "k2"]);

        // k1 is benched: the next mint uses k2 again.
        h.cache.evict_torrent("T1");
        let link = h.cache.resolve("T1", "a.mkv").await.unwrap();
        assert_eq!(link.download_key, "k2");
    }

    #[tokio::test]
    async fn test_all_keys_exhausted() {
        let h = harness();
        h.client
            .fail_next_mint(DebridError::TrafficExceeded("quota".to_string()))
            .await;
        let result = h.cache.resolve("T1", "a.mkv").await;
        assert!(matches!(result, Err(DebridError::TrafficExceeded(_))));
    }

    #[tokio::test]
    async fn test_evict_files_and_due_before() {
        let h = harness();
        h.cache.resolve("T1", "a.mkv").await.unwrap();
        h.cache.resolve("T1", "b.mkv").await.unwrap();
        assert_eq!(h.cache.len(), 2);

        let far = Utc::now() + chrono::Duration::days(30);
        assert_eq!(h.cache.due_before("rd", far).len(), 2);
        assert!(h.cache.due_before("rd", Utc::now()).is_empty());
        assert!(h.cache.due_before("other", far).is_empty());

        assert_eq!(h.cache.evict_files("T1", ["b.mkv"]), 1);
        assert_eq!(h.cache.len(), 1);
        assert_eq!(h.cache.evict_torrent("T1"), 1);
    }

    #[tokio::test]
    async fn test_refresh_forces_new_mint() {
        let h = harness();
        let first = h.cache.resolve("T1", "a.mkv").await.unwrap();
        let refreshed = h.cache.refresh(&LinkKey::new("T1", "a.mkv")).await.unwrap();
        assert_ne!(first.url, refreshed.url);
        assert_eq!(
            h.cache.get(&LinkKey::new("T1", "a.mkv")).unwrap().url,
            refreshed.url
        );
    }
}
