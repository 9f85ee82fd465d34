//! The storage engine: wires providers, store, link cache, filesystem and
//! repair together and owns their background loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConfigError, EngineSettings, ProviderSettings, SharedConfig};
use crate::content::ContentSource;
use crate::links::{CachedLink, LinkCache, LinkCacheStats, LinkRefresher};
use crate::provider::{Budget, DebridClient, DebridError, ProviderPool, ProviderStatus};
use crate::repair::{
    repair_channel, RepairEngine, RepairError, RepairReason, RepairStatus, RepairTask,
    RepairTrigger,
};
use crate::store::{
    PersistWriter, StoreError, SyncReport, Torrent, TorrentStatus, TorrentStore, TorrentSync,
    DEFAULT_PERSIST_DEBOUNCE,
};
use crate::vfs::{VfsError, VirtualFs};

/// Capacity of the repair request queue.
const REPAIR_QUEUE_CAPACITY: usize = 1024;

/// How long `stop` waits for background loops to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Debrid(#[from] DebridError),

    #[error(transparent)]
    Repair(#[from] RepairError),

    #[error(transparent)]
    Vfs(#[from] VfsError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// HTTP status a caller should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::Config(_) => 400,
            EngineError::Debrid(e) => e.status_code(),
            EngineError::Repair(RepairError::TorrentNotFound(_)) => 404,
            EngineError::Repair(RepairError::QueueFull) => 429,
            EngineError::Repair(_) => 503,
            EngineError::Vfs(e) => e.status_code(),
            EngineError::Store(_) => 500,
        }
    }
}

/// Point-in-time overview for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub torrents: usize,
    pub downloading: usize,
    pub links: LinkCacheStats,
    pub providers: Vec<ProviderStatus>,
    pub repair: RepairStatus,
}

pub struct Engine {
    config: Arc<SharedConfig>,
    store: Arc<TorrentStore>,
    pool: Arc<ProviderPool>,
    links: LinkCache,
    sync: Arc<TorrentSync>,
    refresher: Arc<LinkRefresher>,
    vfs: VirtualFs,
    repair: RepairEngine,
    repair_trigger: RepairTrigger,
    /// Held from the download-ceiling check until the new torrent is stored.
    admission: tokio::sync::Mutex<()>,

    // Runtime state
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Build an engine from `config`.
    ///
    /// `clients` must hold exactly one client per configured provider. The
    /// store is loaded from `torrents.json`; nothing runs until [`start`].
    ///
    /// [`start`]: Engine::start
    pub fn new(
        config: Config,
        clients: Vec<Arc<dyn DebridClient>>,
        content: Arc<dyn ContentSource>,
    ) -> Result<Self, EngineError> {
        let config = Arc::new(SharedConfig::new(config)?);
        let settings = config.settings();

        let pool = Arc::new(ProviderPool::new(&settings.providers, clients)?);
        let store = Arc::new(TorrentStore::load_from(&settings.torrents_file));
        let (repair_trigger, repair_requests) = repair_channel(REPAIR_QUEUE_CAPACITY);

        let links = LinkCache::new(
            Arc::clone(&store),
            Arc::clone(&pool),
            Arc::clone(&config),
            repair_trigger.clone(),
        );
        let sync = Arc::new(TorrentSync::new(
            Arc::clone(&store),
            Arc::clone(&pool),
            links.clone(),
            Arc::clone(&config),
            repair_trigger.clone(),
        ));
        let refresher = Arc::new(LinkRefresher::new(links.clone(), Arc::clone(&pool)));
        let vfs = VirtualFs::new(
            Arc::clone(&store),
            links.clone(),
            Arc::clone(&content),
            Arc::clone(&config),
        );
        let repair = RepairEngine::new(
            Arc::clone(&store),
            Arc::clone(&pool),
            links.clone(),
            content,
            Arc::clone(&config),
            repair_trigger.clone(),
            repair_requests,
        );

        let (shutdown_tx, _) = broadcast::channel(1);

        info!(
            "Engine ready with {} provider(s) and {} stored torrent(s)",
            pool.providers().len(),
            store.len()
        );

        Ok(Self {
            config,
            store,
            pool,
            links,
            sync,
            refresher,
            vfs,
            repair,
            repair_trigger,
            admission: tokio::sync::Mutex::new(()),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the torrent sync, link refresh, persistence and repair loops.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Engine already running");
            return;
        }

        info!("Starting engine");

        let settings = self.config.settings();
        let mut handles = Vec::new();

        let writer = PersistWriter::new(
            Arc::clone(&self.store),
            settings.torrents_file.clone(),
            DEFAULT_PERSIST_DEBOUNCE,
        );
        handles.push(tokio::spawn(writer.run(self.shutdown_tx.subscribe())));

        // Populate the store before the periodic loops take over.
        let sync = Arc::clone(&self.sync);
        handles.push(tokio::spawn(async move {
            for result in sync.run_all().await {
                if let Ok(report) = result {
                    debug!(
                        "Initial sync of {}: {} added, {} removed",
                        report.provider,
                        report.reconcile.added.len(),
                        report.reconcile.removed.len()
                    );
                }
            }
        }));

        handles.extend(Arc::clone(&self.sync).spawn(&self.shutdown_tx));
        handles.extend(Arc::clone(&self.refresher).spawn(&self.shutdown_tx));

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend(handles);
        }

        self.repair.start().await;

        info!("Engine started");
    }

    /// Stop every loop and flush the store.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Engine not running");
            return;
        }

        info!("Stopping engine...");

        self.repair.stop().await;
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!("Background loops did not stop within {:?}", SHUTDOWN_GRACE);
        }

        let path = self.config.settings().torrents_file.clone();
        match self.store.persist(&path).await {
            Ok(()) => info!("Saved {} torrents to {}", self.store.len(), path.display()),
            Err(e) => error!("Failed to save torrent store on shutdown: {}", e),
        }

        info!("Engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn vfs(&self) -> &VirtualFs {
        &self.vfs
    }

    pub fn store(&self) -> &Arc<TorrentStore> {
        &self.store
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.config()
    }

    pub fn settings(&self) -> Arc<EngineSettings> {
        self.config.settings()
    }

    /// Every stored torrent, sorted by id.
    pub fn list_torrents(&self) -> Vec<Arc<Torrent>> {
        let mut torrents = self.store.list();
        torrents.sort_by(|a, b| a.id.cmp(&b.id));
        torrents
    }

    pub fn get_torrent(&self, id: &str) -> Option<Arc<Torrent>> {
        self.store.get(id)
    }

    /// Delete a torrent upstream, then drop it and its links locally.
    ///
    /// A torrent already gone upstream is still removed locally.
    pub async fn delete_torrent(&self, id: &str) -> Result<Arc<Torrent>, EngineError> {
        let torrent = self
            .store
            .get(id)
            .ok_or_else(|| DebridError::TorrentNotFound(id.to_string()))?;
        let provider = self.pool.provider(&torrent.provider)?;
        let timeout = self.config.settings().rate_limit_timeout;

        let torrent_id = torrent.id.clone();
        match provider
            .call(Budget::General, timeout, |client| async move {
                client.delete_torrent(&torrent_id).await
            })
            .await
        {
            Ok(()) | Err(DebridError::TorrentNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        self.store.remove(id);
        let evicted = self.links.evict_torrent(id);
        info!(
            "Deleted torrent {} ({}) from {}, evicted {} link(s)",
            id, torrent.name, torrent.provider, evicted
        );
        Ok(torrent)
    }

    /// Add a magnet to the provider with the most spare capacity.
    pub async fn submit_magnet(&self, magnet: &str) -> Result<Arc<Torrent>, EngineError> {
        let settings = self.config.settings();
        let admission = self.admission.lock().await;
        if settings.max_downloads > 0 {
            let downloading = self
                .store
                .snapshot()
                .iter()
                .filter(|t| t.status == TorrentStatus::Downloading)
                .count();
            if downloading >= settings.max_downloads {
                warn!(
                    "Refusing magnet: {} downloads active (limit {})",
                    downloading, settings.max_downloads
                );
                return Err(DebridError::TooManyActiveDownloads.into());
            }
        }

        let lease = self.pool.select_provider(Budget::General).await?;
        let magnet = magnet.to_string();
        let mut torrent = lease
            .call(Budget::General, settings.rate_limit_timeout, |client| async move {
                client.add_magnet(&magnet).await
            })
            .await?;
        torrent.provider = lease.name().to_string();
        drop(lease);

        let id = torrent.id.clone();
        let status = torrent.status;
        self.store.upsert(torrent);
        drop(admission);
        info!("Added torrent {} ({})", id, status.as_str());

        if status == TorrentStatus::Error && settings.repair.enabled && settings.repair.auto_process
        {
            self.repair_trigger.send(&id, RepairReason::Ingest);
        }

        self.store
            .get(&id)
            .ok_or_else(|| DebridError::TorrentNotFound(id).into())
    }

    /// A servable URL for one file.
    pub async fn resolve(&self, torrent_id: &str, path: &str) -> Result<CachedLink, EngineError> {
        Ok(self.links.resolve(torrent_id, path).await?)
    }

    pub async fn provider_status(&self) -> Vec<ProviderStatus> {
        self.pool.status().await
    }

    pub fn link_stats(&self) -> LinkCacheStats {
        self.links.stats()
    }

    pub fn repair_recent(&self, limit: usize) -> Vec<RepairTask> {
        self.repair.recent(limit)
    }

    pub fn repair_status(&self) -> RepairStatus {
        self.repair.status()
    }

    pub fn trigger_repair(&self, torrent_id: &str) -> Result<(), EngineError> {
        Ok(self.repair.trigger(torrent_id)?)
    }

    pub fn subscribe_repairs(&self) -> broadcast::Receiver<RepairTask> {
        self.repair.subscribe()
    }

    /// The repair engine, for running tasks directly.
    pub fn repair(&self) -> &RepairEngine {
        &self.repair
    }

    /// Sync every provider now instead of waiting for the next tick.
    pub async fn sync_now(&self) -> Vec<Result<SyncReport, DebridError>> {
        self.sync.run_all().await
    }

    /// Swap in a new configuration.
    ///
    /// File filters, filesystem policies and repair settings apply at once.
    /// Providers and their tunables are fixed for the engine's lifetime, so a
    /// config that changes them is rejected.
    pub fn reload_config(&self, config: Config) -> Result<(), EngineError> {
        let next = EngineSettings::resolve(&config)?;
        let current = self.config.settings();
        let names = |providers: &[ProviderSettings]| {
            providers.iter().map(|p| p.name.clone()).collect::<Vec<_>>()
        };
        if names(&current.providers) != names(&next.providers) {
            return Err(ConfigError::ValidationError(
                "providers cannot change without a restart".to_string(),
            )
            .into());
        }
        if current.providers != next.providers {
            return Err(ConfigError::ValidationError(
                "provider settings cannot change without a restart".to_string(),
            )
            .into());
        }
        self.config.reload(config)?;
        info!("Configuration reloaded");
        Ok(())
    }

    pub async fn status(&self) -> EngineStatus {
        let snapshot = self.store.snapshot();
        EngineStatus {
            running: self.is_running(),
            torrents: snapshot.len(),
            downloading: snapshot
                .iter()
                .filter(|t| t.status == TorrentStatus::Downloading)
                .count(),
            links: self.links.stats(),
            providers: self.pool.status().await,
            repair: self.repair.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repair::RepairState;
    use crate::testing::{fixtures, MockContentSource, MockDebridClient};
    use tempfile::TempDir;

    struct Harness {
        engine: Engine,
        client: Arc<MockDebridClient>,
        _dir: TempDir,
    }

    fn harness_with(tune: impl FnOnce(&mut Config)) -> Harness {
        let dir = TempDir::new().unwrap();
        let mut config = fixtures::config(&["rd"]);
        config.path = dir.path().to_path_buf();
        tune(&mut config);
        let client = Arc::new(MockDebridClient::new("rd"));
        let engine = Engine::new(
            config,
            vec![Arc::clone(&client) as Arc<dyn DebridClient>],
            Arc::new(MockContentSource::new()),
        )
        .unwrap();
        Harness {
            engine,
            client,
            _dir: dir,
        }
    }

    fn harness() -> Harness {
        harness_with(|_| {})
    }

    #[tokio::test]
    async fn test_new_rejects_missing_client() {
        let config = fixtures::config(&["rd", "ad"]);
        let result = Engine::new(
            config,
            vec![Arc::new(MockDebridClient::new("rd")) as Arc<dyn DebridClient>],
            Arc::new(MockContentSource::new()),
        );
        assert!(matches!(
            result,
            Err(EngineError::Debrid(DebridError::UnknownProvider(_)))
        ));
    }

    #[tokio::test]
    async fn test_sync_then_delete_cascades() {
        let h = harness();
        h.client
            .add_torrent(fixtures::torrent("T1", "rd", &[("a.mkv", 100)]))
            .await;
        h.engine.sync_now().await;
        h.engine.resolve("T1", "a.mkv").await.unwrap();
        assert_eq!(h.engine.link_stats().entries, 1);

        let deleted = h.engine.delete_torrent("T1").await.unwrap();
        assert_eq!(deleted.id, "T1");
        assert!(h.engine.get_torrent("T1").is_none());
        assert_eq!(h.engine.link_stats().entries, 0);
        assert_eq!(h.client.deleted().await, vec!["T1".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_unknown_torrent() {
        let h = harness();
        let err = h.engine.delete_torrent("NOPE").await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_submit_magnet_respects_download_ceiling() {
        let h = harness_with(|c| c.qbittorrent.max_downloads = 1);
        let first = h
            .engine
            .submit_magnet("magnet:?xt=urn:btih:ABC&dn=First")
            .await
            .unwrap();
        assert_eq!(first.provider, "rd");
        assert_eq!(first.status, TorrentStatus::Downloading);

        let err = h
            .engine
            .submit_magnet("magnet:?xt=urn:btih:DEF&dn=Second")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Debrid(DebridError::TooManyActiveDownloads)
        ));
        assert_eq!(err.status_code(), 509);
        assert_eq!(h.client.added_magnets().await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submissions_share_the_ceiling() {
        let h = harness_with(|c| c.qbittorrent.max_downloads = 1);
        h.client.set_add_delay(Duration::from_millis(50)).await;

        let results = futures::future::join_all((0..4).map(|n| {
            let magnet = format!("magnet:?xt=urn:btih:{:040}&dn=Race{}", n, n);
            let engine = &h.engine;
            async move { engine.submit_magnet(&magnet).await }
        }))
        .await;

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().filter_map(|r| r.as_ref().err()).all(|e| matches!(
            e,
            EngineError::Debrid(DebridError::TooManyActiveDownloads)
        )));
        assert_eq!(h.client.added_magnets().await.len(), 1);
        assert_eq!(h.engine.list_torrents().len(), 1);
    }

    #[tokio::test]
    async fn test_submit_magnet_without_ceiling() {
        let h = harness_with(|c| c.qbittorrent.max_downloads = 0);
        for n in 0..3 {
            h.engine
                .submit_magnet(&format!("magnet:?xt=urn:btih:{:040}", n))
                .await
                .unwrap();
        }
        assert_eq!(h.engine.list_torrents().len(), 3);
    }

    #[tokio::test]
    async fn test_reload_config_rejects_provider_change() {
        let h = harness();
        let err = h
            .engine
            .reload_config(fixtures::config(&["rd", "ad"]))
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));

        let mut next = (*h.engine.config()).clone();
        next.min_file_size = "1KB".to_string();
        h.engine.reload_config(next).unwrap();
        assert_eq!(h.engine.settings().files.min_size, 1024);
    }

    #[tokio::test]
    async fn test_reload_config_rejects_provider_tunable_change() {
        let h = harness();
        let before = h.engine.settings().providers[0].clone();

        let mut next = (*h.engine.config()).clone();
        next.debrids[0].minimum_free_slot = Some(7);
        let err = h.engine.reload_config(next).unwrap_err();
        assert!(matches!(err, EngineError::Config(ConfigError::ValidationError(_))));
        assert_eq!(h.engine.settings().providers[0], before);
    }

    #[tokio::test]
    async fn test_stop_flushes_store() {
        let h = harness();
        h.client
            .add_torrent(fixtures::torrent("T1", "rd", &[("a.mkv", 100)]))
            .await;

        h.engine.start().await;
        assert!(h.engine.is_running());
        h.engine.sync_now().await;
        h.engine.stop().await;
        assert!(!h.engine.is_running());

        let path = h.engine.settings().torrents_file.clone();
        let reloaded = TorrentStore::load_from(&path);
        assert!(reloaded.get("T1").is_some());
    }

    #[tokio::test]
    async fn test_trigger_repair_through_engine() {
        let h = harness_with(|c| {
            c.repair.enabled = true;
            c.repair.interval = "1h".to_string();
        });
        h.client
            .add_torrent(fixtures::torrent("T1", "rd", &[("a.mkv", 100)]))
            .await;
        h.engine.sync_now().await;
        let mut events = h.engine.subscribe_repairs();

        h.engine.start().await;
        h.engine.trigger_repair("T1").unwrap();
        let task = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.state, RepairState::Succeeded);
        assert_eq!(h.engine.repair_recent(5).len(), 1);
        h.engine.stop().await;
    }
}
