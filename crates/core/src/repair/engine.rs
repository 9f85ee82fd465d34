//! Repair engine.
//!
//! Checks torrents for dead content and, when allowed, asks the provider to
//! re-create them. Work arrives three ways:
//! - Requests on the repair channel (broken links, ingest, manual)
//! - A periodic scan of the whole store
//! - Direct calls to [`RepairEngine::repair_now`]
//!
//! At most one task per torrent is queued or running at a time; further
//! requests for it are coalesced into the pending one.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::history::RepairHistory;
use super::types::{
    RepairError, RepairReason, RepairRequest, RepairRequests, RepairState, RepairTask,
    RepairTrigger,
};
use crate::config::{EngineSettings, RepairStrategy, SharedConfig};
use crate::content::ContentSource;
use crate::links::{LinkCache, LinkKey};
use crate::metrics;
use crate::provider::{Budget, DebridError, Provider, ProviderPool};
use crate::store::{Torrent, TorrentFile, TorrentStatus, TorrentStore};

const EVENT_CAPACITY: usize = 64;
const MIN_SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Repair engine status for API responses.
#[derive(Debug, Clone, Serialize)]
pub struct RepairStatus {
    pub running: bool,
    pub enabled: bool,
    pub strategy: RepairStrategy,
    pub reinsert: bool,
    /// Torrents with a queued or running task.
    pub active: Vec<String>,
    pub history: usize,
}

/// Result of probing one file.
#[derive(Debug)]
enum Probe {
    Healthy,
    Broken,
    Inconclusive(DebridError),
}

impl Probe {
    fn as_str(&self) -> &'static str {
        match self {
            Probe::Healthy => "healthy",
            Probe::Broken => "broken",
            Probe::Inconclusive(_) => "inconclusive",
        }
    }
}

/// Shared state used by the dispatcher and every task.
struct Worker {
    store: Arc<TorrentStore>,
    pool: Arc<ProviderPool>,
    links: LinkCache,
    content: Arc<dyn ContentSource>,
    config: Arc<SharedConfig>,
    active: Mutex<HashSet<String>>,
    history: RepairHistory,
    events: broadcast::Sender<RepairTask>,
}

/// Marks a torrent as having a task in the queue; released on drop.
struct ActiveClaim {
    worker: Arc<Worker>,
    torrent_id: String,
}

impl Drop for ActiveClaim {
    fn drop(&mut self) {
        if let Ok(mut active) = self.worker.active.lock() {
            active.remove(&self.torrent_id);
        }
    }
}

pub struct RepairEngine {
    worker: Arc<Worker>,
    trigger: RepairTrigger,
    requests: Arc<Mutex<Option<RepairRequests>>>,

    // Runtime state
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RepairEngine {
    /// `trigger` and `requests` are the two halves of the channel the link
    /// cache and torrent sync report into.
    pub fn new(
        store: Arc<TorrentStore>,
        pool: Arc<ProviderPool>,
        links: LinkCache,
        content: Arc<dyn ContentSource>,
        config: Arc<SharedConfig>,
        trigger: RepairTrigger,
        requests: RepairRequests,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            worker: Arc::new(Worker {
                store,
                pool,
                links,
                content,
                config,
                active: Mutex::new(HashSet::new()),
                history: RepairHistory::default(),
                events,
            }),
            trigger,
            requests: Arc::new(Mutex::new(Some(requests))),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    /// Start the dispatcher.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Repair engine already running");
            return;
        }

        let requests = self.requests.lock().ok().and_then(|mut slot| slot.take());
        let Some(requests) = requests else {
            error!("Repair request channel is not available, repair engine not started");
            self.running.store(false, Ordering::SeqCst);
            return;
        };

        let settings = self.worker.config.settings();
        info!(
            "Starting repair engine (strategy: {}, workers: {}, reinsert: {}, enabled: {})",
            settings.repair.strategy.as_str(),
            settings.repair.workers,
            settings.repair.reinsert,
            settings.repair.enabled
        );

        self.spawn_dispatcher(requests, &settings);

        info!("Repair engine started");
    }

    /// Stop the dispatcher. Running tasks finish; queued ones are dropped.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Repair engine not running");
            return;
        }

        info!("Stopping repair engine...");

        let _ = self.shutdown_tx.send(());

        tokio::time::sleep(Duration::from_millis(100)).await;

        info!("Repair engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Queue a manual repair for a stored torrent.
    pub fn trigger(&self, torrent_id: &str) -> Result<(), RepairError> {
        if !self.worker.config.settings().repair.enabled {
            return Err(RepairError::Disabled);
        }
        if !self.is_running() {
            return Err(RepairError::NotRunning);
        }
        if self.worker.store.get(torrent_id).is_none() {
            return Err(RepairError::TorrentNotFound(torrent_id.to_string()));
        }
        if self.trigger.send(torrent_id, RepairReason::Manual) {
            Ok(())
        } else {
            Err(RepairError::QueueFull)
        }
    }

    /// Run a task right away on the caller's task, outside the worker limit.
    ///
    /// If the torrent already has a task queued or running, a skipped task is
    /// returned and nothing is recorded.
    pub async fn repair_now(&self, request: RepairRequest) -> RepairTask {
        let Some(claim) = self.worker.claim(&request.torrent_id) else {
            let mut task = RepairTask::new(request, self.worker.config.settings().repair.strategy);
            task.finish(RepairState::Skipped, "repair already in progress");
            return task;
        };
        let task = self.worker.run(request).await;
        drop(claim);
        task
    }

    /// Receive every finished task.
    pub fn subscribe(&self) -> broadcast::Receiver<RepairTask> {
        self.worker.events.subscribe()
    }

    /// Up to `limit` finished tasks, newest first.
    pub fn recent(&self, limit: usize) -> Vec<RepairTask> {
        self.worker.history.recent(limit)
    }

    /// Torrents with a task queued or running, sorted.
    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .worker
            .active
            .lock()
            .map(|active| active.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn status(&self) -> RepairStatus {
        let settings = self.worker.config.settings();
        RepairStatus {
            running: self.is_running(),
            enabled: settings.repair.enabled,
            strategy: settings.repair.strategy,
            reinsert: settings.repair.reinsert,
            active: self.active(),
            history: self.worker.history.len(),
        }
    }

    /// Dispatch loop: requests, periodic scans and shutdown.
    ///
    /// Worker count and scan interval are read here, so changing them takes
    /// a restart of the engine.
    fn spawn_dispatcher(&self, mut requests: RepairRequests, settings: &EngineSettings) {
        let worker = Arc::clone(&self.worker);
        let slot = Arc::clone(&self.requests);
        let shutdown_tx = self.shutdown_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let permits = Arc::new(Semaphore::new(settings.repair.workers.max(1)));
        let period = settings.repair.interval.max(MIN_SCAN_INTERVAL);

        tokio::spawn(async move {
            let mut scan = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            scan.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Repair dispatcher received shutdown signal");
                        break;
                    }
                    request = requests.recv() => {
                        let Some(request) = request else {
                            debug!("Repair request channel closed");
                            break;
                        };
                        worker.dispatch(request, &permits, &shutdown_tx);
                    }
                    _ = scan.tick() => {
                        worker.scan(&permits, &shutdown_tx);
                    }
                }
            }

            // Hand the channel back so the engine can be started again.
            if let Ok(mut slot) = slot.lock() {
                *slot = Some(requests);
            }
        });
    }
}

impl Worker {
    fn claim(self: &Arc<Self>, torrent_id: &str) -> Option<ActiveClaim> {
        let mut active = self.active.lock().ok()?;
        if !active.insert(torrent_id.to_string()) {
            return None;
        }
        Some(ActiveClaim {
            worker: Arc::clone(self),
            torrent_id: torrent_id.to_string(),
        })
    }

    /// Queue a task unless the torrent already has one.
    fn dispatch(
        self: &Arc<Self>,
        request: RepairRequest,
        permits: &Arc<Semaphore>,
        shutdown_tx: &broadcast::Sender<()>,
    ) -> bool {
        if !self.config.settings().repair.enabled {
            debug!(
                "Repair disabled, ignoring {} request for {}",
                request.reason.as_str(),
                request.torrent_id
            );
            return false;
        }
        let Some(claim) = self.claim(&request.torrent_id) else {
            debug!(
                "Repair for {} already queued, coalescing {} request",
                request.torrent_id,
                request.reason.as_str()
            );
            return false;
        };

        let worker = Arc::clone(self);
        let permits = Arc::clone(permits);
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let permit = tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Dropping queued repair for {} on shutdown", request.torrent_id);
                    return;
                }
                permit = permits.acquire_owned() => permit,
            };
            let Ok(_permit) = permit else {
                return;
            };
            worker.run(request).await;
            drop(claim);
        });
        true
    }

    /// Queue a scheduled check for every torrent that can be repaired.
    fn scan(self: &Arc<Self>, permits: &Arc<Semaphore>, shutdown_tx: &broadcast::Sender<()>) {
        let settings = self.config.settings();
        if !settings.repair.enabled {
            return;
        }

        let mut torrents = self.store.list();
        torrents.sort_by(|a, b| a.id.cmp(&b.id));
        let total = torrents.len();
        let mut queued = 0;
        for torrent in torrents {
            if torrent.status == TorrentStatus::Downloading
                || settings.repair.is_excluded(&torrent.id, &torrent.name)
            {
                continue;
            }
            let request = RepairRequest {
                torrent_id: torrent.id.clone(),
                reason: RepairReason::Scheduled,
            };
            if self.dispatch(request, permits, shutdown_tx) {
                queued += 1;
            }
        }
        info!("Repair scan queued {} of {} torrents", queued, total);
    }

    /// Run one task to completion and record it.
    async fn run(&self, request: RepairRequest) -> RepairTask {
        let settings = self.config.settings();
        let strategy = settings.repair.strategy;
        let limit = settings.repair.task_timeout;
        let started = Instant::now();

        let mut task = RepairTask::new(request, strategy);
        task.state = RepairState::Running;
        debug!(
            "Repairing {} ({}, {})",
            task.torrent_id,
            task.reason.as_str(),
            strategy.as_str()
        );

        metrics::REPAIRS_ACTIVE.inc();
        if limit.is_zero() {
            self.execute(&settings, &mut task).await;
        } else if tokio::time::timeout(limit, self.execute(&settings, &mut task))
            .await
            .is_err()
        {
            task.finish(
                RepairState::Failed,
                format!("timed out after {}s", limit.as_secs_f64()),
            );
        }
        metrics::REPAIRS_ACTIVE.dec();

        metrics::REPAIR_TASKS
            .with_label_values(&[strategy.as_str(), task.state.as_str()])
            .inc();
        metrics::REPAIR_DURATION
            .with_label_values(&[strategy.as_str()])
            .observe(started.elapsed().as_secs_f64());

        let message = task.message.as_deref().unwrap_or("");
        match task.state {
            RepairState::Failed => warn!("Repair of {} failed: {}", task.torrent_id, message),
            RepairState::Skipped => debug!("Repair of {} skipped: {}", task.torrent_id, message),
            _ => info!("Repair of {} finished: {}", task.torrent_id, message),
        }

        self.history.push(task.clone());
        let _ = self.events.send(task.clone());
        task
    }

    /// Check the torrent and reinsert what is broken. Always finishes `task`.
    async fn execute(&self, settings: &EngineSettings, task: &mut RepairTask) {
        let Some(torrent) = self.store.get(&task.torrent_id) else {
            task.finish(RepairState::Skipped, "torrent no longer exists");
            return;
        };
        task.torrent_name = Some(torrent.name.clone());
        task.provider = Some(torrent.provider.clone());

        if settings.repair.is_excluded(&torrent.id, &torrent.name) {
            task.finish(RepairState::Skipped, "excluded");
            return;
        }
        let Ok(provider) = self.pool.provider(&torrent.provider) else {
            task.finish(
                RepairState::Skipped,
                format!("unknown provider {}", torrent.provider),
            );
            return;
        };
        if torrent.status == TorrentStatus::Downloading {
            task.finish(RepairState::Skipped, "still downloading");
            return;
        }
        let eligible: Vec<&TorrentFile> = torrent
            .files
            .iter()
            .filter(|f| settings.files.is_allowed(&f.path, f.size))
            .collect();
        if eligible.is_empty() {
            task.finish(RepairState::Skipped, "no eligible files");
            return;
        }

        let broken = match self.find_broken(settings, &provider, &torrent, &eligible).await {
            Ok(broken) => broken,
            Err(e) => {
                task.finish(RepairState::Failed, format!("could not verify: {}", e));
                return;
            }
        };
        if broken.is_empty() {
            task.finish(RepairState::Succeeded, "all files healthy");
            return;
        }
        task.broken_files = broken;

        if !settings.repair.reinsert {
            task.finish(
                RepairState::Succeeded,
                format!(
                    "{} broken file(s) found, reinsert disabled",
                    task.broken_files.len()
                ),
            );
            return;
        }

        match self
            .reinsert(settings, &provider, &torrent, &task.broken_files)
            .await
        {
            Ok(new_id) => {
                task.reinserted = true;
                let message = match settings.repair.strategy {
                    RepairStrategy::PerFile => {
                        format!("reinserted {} file(s)", task.broken_files.len())
                    }
                    RepairStrategy::PerTorrent => "reinserted torrent".to_string(),
                };
                if new_id != torrent.id {
                    task.new_torrent_id = Some(new_id);
                }
                task.finish(RepairState::Succeeded, message);
            }
            Err(e) => task.finish(RepairState::Failed, format!("reinsert failed: {}", e)),
        }
    }

    /// Paths of the eligible files that are broken.
    ///
    /// A torrent the provider reports as failed or deleted is broken as a whole without
    /// probing. Otherwise per-file probes every eligible file. Per-torrent
    /// probes the eligible files largest first and stops at the first broken
    /// one, which marks the whole torrent.
    async fn find_broken(
        &self,
        settings: &EngineSettings,
        provider: &Provider,
        torrent: &Torrent,
        eligible: &[&TorrentFile],
    ) -> Result<Vec<String>, DebridError> {
        let all = || eligible.iter().map(|f| f.path.clone()).collect::<Vec<_>>();

        if matches!(
            torrent.status,
            TorrentStatus::Error | TorrentStatus::DeletedUpstream
        ) {
            debug!("Torrent {} is {} upstream", torrent.id, torrent.status.as_str());
            return Ok(all());
        }

        let mut inconclusive = None;
        match settings.repair.strategy {
            RepairStrategy::PerFile => {
                let mut broken = Vec::new();
                for file in eligible {
                    match self.probe(settings, provider, torrent, file).await {
                        Probe::Healthy => {}
                        Probe::Broken => broken.push(file.path.clone()),
                        Probe::Inconclusive(e) => {
                            inconclusive.get_or_insert(e);
                        }
                    }
                }
                match inconclusive {
                    Some(e) if broken.is_empty() => Err(e),
                    _ => Ok(broken),
                }
            }
            RepairStrategy::PerTorrent => {
                let mut by_size = eligible.to_vec();
                by_size.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.path.cmp(&b.path)));
                for file in by_size {
                    match self.probe(settings, provider, torrent, file).await {
                        Probe::Healthy => {}
                        Probe::Broken => return Ok(all()),
                        Probe::Inconclusive(e) => {
                            inconclusive.get_or_insert(e);
                        }
                    }
                }
                match inconclusive {
                    Some(e) => Err(e),
                    None => Ok(Vec::new()),
                }
            }
        }
    }

    /// Resolve a link for `file` and check that its host serves it.
    async fn probe(
        &self,
        settings: &EngineSettings,
        provider: &Provider,
        torrent: &Torrent,
        file: &TorrentFile,
    ) -> Probe {
        let outcome = match provider
            .acquire(Budget::Repair, settings.rate_limit_timeout)
            .await
        {
            Err(e) => Probe::Inconclusive(e),
            Ok(()) => match self.links.resolve(&torrent.id, &file.path).await {
                Ok(link) => match self.content.probe(&link.url).await {
                    Ok(()) => Probe::Healthy,
                    Err(DebridError::LinkBroken(reason)) => {
                        debug!("{}/{} is broken: {}", torrent.id, file.path, reason);
                        self.links
                            .invalidate(&LinkKey::new(torrent.id.as_str(), file.path.as_str()));
                        Probe::Broken
                    }
                    Err(e) => Probe::Inconclusive(e),
                },
                Err(
                    DebridError::LinkBroken(_)
                    | DebridError::TorrentNotFound(_)
                    | DebridError::FileNotFound { .. },
                ) => Probe::Broken,
                Err(e) => Probe::Inconclusive(e),
            },
        };
        metrics::REPAIR_PROBES
            .with_label_values(&[outcome.as_str()])
            .inc();
        outcome
    }

    /// Ask the provider to re-create the broken content and fold the result
    /// into the store. Returns the id of the resulting torrent.
    async fn reinsert(
        &self,
        settings: &EngineSettings,
        provider: &Provider,
        torrent: &Arc<Torrent>,
        broken: &[String],
    ) -> Result<String, DebridError> {
        let strategy = settings.repair.strategy;
        let files = match strategy {
            RepairStrategy::PerFile => Some(broken.to_vec()),
            RepairStrategy::PerTorrent => None,
        };

        let original = Arc::clone(torrent);
        let fresh = provider
            .call(
                Budget::Repair,
                settings.rate_limit_timeout,
                |client| async move { client.reinsert(&original, files.as_deref()).await },
            )
            .await?;

        let new_id = fresh.id.clone();
        if let crate::store::UpsertOutcome::Updated { stale_files } = self.store.upsert(fresh) {
            self.links
                .evict_files(&new_id, stale_files.iter().map(String::as_str));
        }

        if new_id == torrent.id {
            self.links
                .evict_files(&torrent.id, broken.iter().map(String::as_str));
        } else {
            match strategy {
                RepairStrategy::PerTorrent => {
                    self.store.remove(&torrent.id);
                    self.links.evict_torrent(&torrent.id);
                }
                RepairStrategy::PerFile => {
                    self.detach_files(settings, provider, torrent, broken).await;
                }
            }
        }

        info!(
            "Reinserted {} on {} as {} ({} file(s))",
            torrent.id,
            provider.name(),
            new_id,
            broken.len()
        );
        Ok(new_id)
    }

    /// Drop repaired files from the torrent they were copied out of.
    ///
    /// The listed size is kept so the next sync does not re-fetch the dropped
    /// files. A torrent left without files is deleted upstream and locally.
    async fn detach_files(
        &self,
        settings: &EngineSettings,
        provider: &Provider,
        torrent: &Torrent,
        repaired: &[String],
    ) {
        self.links
            .evict_files(&torrent.id, repaired.iter().map(String::as_str));
        let Some(current) = self.store.get(&torrent.id) else {
            return;
        };

        let mut remaining = (*current).clone();
        remaining.files.retain(|f| !repaired.contains(&f.path));
        if !remaining.files.is_empty() {
            self.store.upsert(remaining);
            return;
        }

        let id = torrent.id.clone();
        let deleted = provider
            .call(
                Budget::Repair,
                settings.rate_limit_timeout,
                |client| async move { client.delete_torrent(&id).await },
            )
            .await;
        match deleted {
            Ok(()) | Err(DebridError::TorrentNotFound(_)) => {
                self.store.remove(&torrent.id);
                self.links.evict_torrent(&torrent.id);
            }
            Err(e) => warn!(
                "Failed to delete emptied torrent {} on {}: {}",
                torrent.id,
                provider.name(),
                e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::provider::DebridClient;
    use crate::repair::repair_channel;
    use crate::testing::{fixtures, MockContentSource, MockDebridClient};

    struct Harness {
        engine: RepairEngine,
        store: Arc<TorrentStore>,
        links: LinkCache,
        client: Arc<MockDebridClient>,
        content: Arc<MockContentSource>,
    }

    fn harness_with(tune: impl FnOnce(&mut Config)) -> Harness {
        let mut config = fixtures::config(&["rd"]);
        config.repair.enabled = true;
        config.repair.interval = "1h".to_string();
        config.repair.reinsert = true;
        config.repair.workers = 2;
        tune(&mut config);

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
        let config = Arc::new(SharedConfig::new(config).unwrap());
        let (trigger, requests) = repair_channel(64);
        let links = LinkCache::new(
            Arc::clone(&store),
            Arc::clone(&pool),
            Arc::clone(&config),
            trigger.clone(),
        );
        let content = Arc::new(MockContentSource::new());
        let engine = RepairEngine::new(
            Arc::clone(&store),
            pool,
            links.clone(),
            Arc::clone(&content) as Arc<dyn ContentSource>,
            config,
            trigger,
            requests,
        );
        Harness {
            engine,
            store,
            links,
            client,
            content,
        }
    }

    fn harness() -> Harness {
        harness_with(|_| {})
    }

    impl Harness {
        async fn add(&self, torrent: Torrent) {
            self.client.add_torrent(torrent.clone()).await;
            self.store.upsert(torrent);
        }
    }

    fn manual(id: &str) -> RepairRequest {
        RepairRequest {
            torrent_id: id.to_string(),
            reason: RepairReason::Manual,
        }
    }

    fn two_files(id: &str) -> Torrent {
        fixtures::torrent(id, "rd", &[("a.mkv", 100), ("b.mkv", 200)])
    }

    fn three_files(id: &str) -> Torrent {
        fixtures::torrent(id, "rd", &[("e01.mkv", 100), ("e02.mkv", 200), ("e03.mkv", 300)])
    }

    #[tokio::test]
    async fn test_per_file_reinserts_only_broken_file() {
        let h = harness_with(|c| c.repair.strategy = RepairStrategy::PerFile);
        h.add(two_files("T1")).await;
        h.content.break_urls("/T1/b.mkv").await;

        let task = h.engine.repair_now(manual("T1")).await;

        assert_eq!(task.state, RepairState::Succeeded);
        assert_eq!(task.broken_files, vec!["b.mkv".to_string()]);
        assert!(task.reinserted);

        let reinserts = h.client.reinserts().await;
        assert_eq!(reinserts.len(), 1);
        assert_eq!(reinserts[0].files, Some(vec!["b.mkv".to_string()]));

        // Both torrents remain; the new one holds only the repaired file.
        let new_id = task.new_torrent_id.unwrap();
        assert!(h.store.get("T1").is_some());
        let fresh = h.store.get(&new_id).unwrap();
        assert_eq!(fresh.files.len(), 1);
        assert_eq!(fresh.files[0].path, "b.mkv");

        // The healthy file's link survives, the broken one's is gone.
        assert!(h.links.get(&LinkKey::new("T1", "a.mkv")).is_some());
        assert!(h.links.get(&LinkKey::new("T1", "b.mkv")).is_none());

        // The repaired file now lives only in the new torrent.
        let original = h.store.get("T1").unwrap();
        let paths: Vec<_> = original.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["a.mkv"]);
    }

    #[tokio::test]
    async fn test_per_file_second_file_of_three() {
        let h = harness_with(|c| c.repair.strategy = RepairStrategy::PerFile);
        h.add(three_files("T1")).await;
        h.content.break_urls("/T1/e02.mkv").await;

        let task = h.engine.repair_now(manual("T1")).await;

        assert_eq!(task.broken_files, vec!["e02.mkv".to_string()]);
        let reinserts = h.client.reinserts().await;
        assert_eq!(reinserts.len(), 1);
        assert_eq!(reinserts[0].files, Some(vec!["e02.mkv".to_string()]));
        let original = h.store.get("T1").unwrap();
        let paths: Vec<_> = original.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["e01.mkv", "e03.mkv"]);
    }

    #[tokio::test]
    async fn test_per_file_repeat_pass_does_not_reinsert_again() {
        let h = harness_with(|c| c.repair.strategy = RepairStrategy::PerFile);
        h.add(two_files("T1")).await;
        h.content.break_urls("/T1/b.mkv").await;

        let first = h.engine.repair_now(manual("T1")).await;
        assert!(first.reinserted);
        for _ in 0..2 {
            let again = h.engine.repair_now(manual("T1")).await;
            assert_eq!(again.state, RepairState::Succeeded);
            assert!(!again.reinserted);
        }

        assert_eq!(h.client.reinserts().await.len(), 1);
        assert_eq!(h.store.len(), 2);
    }

    #[tokio::test]
    async fn test_per_file_all_broken_drops_emptied_original() {
        let h = harness_with(|c| c.repair.strategy = RepairStrategy::PerFile);
        h.add(two_files("T1")).await;
        h.content.break_urls("/T1/").await;

        let task = h.engine.repair_now(manual("T1")).await;

        assert_eq!(task.state, RepairState::Succeeded);
        assert_eq!(task.broken_files.len(), 2);
        let new_id = task.new_torrent_id.unwrap();
        assert!(h.store.get("T1").is_none());
        assert!(h.client.torrent("T1").await.is_none());
        assert_eq!(h.store.get(&new_id).unwrap().files.len(), 2);
        assert!(h.links.get(&LinkKey::new("T1", "a.mkv")).is_none());
    }

    #[tokio::test]
    async fn test_per_torrent_reinserts_whole_torrent() {
        let h = harness();
        h.add(two_files("T1")).await;
        // Largest file is the one probed.
        h.content.break_urls("/T1/b.mkv").await;

        let task = h.engine.repair_now(manual("T1")).await;

        assert_eq!(task.state, RepairState::Succeeded);
        assert_eq!(task.broken_files.len(), 2);
        assert_eq!(h.content.probes().await.len(), 1);

        let reinserts = h.client.reinserts().await;
        assert_eq!(reinserts[0].files, None);

        let new_id = task.new_torrent_id.unwrap();
        assert!(h.store.get("T1").is_none());
        assert_eq!(h.store.get(&new_id).unwrap().files.len(), 2);
        assert!(h.links.get(&LinkKey::new("T1", "b.mkv")).is_none());
    }

    #[tokio::test]
    async fn test_per_torrent_finds_broken_smaller_file() {
        let h = harness();
        h.add(three_files("T1")).await;
        h.content.break_urls("/T1/e02.mkv").await;

        let task = h.engine.repair_now(manual("T1")).await;

        assert_eq!(task.state, RepairState::Succeeded);
        assert_eq!(task.broken_files.len(), 3);
        // e03 probed first and healthy, then e02; e01 never probed.
        assert_eq!(h.content.probes().await.len(), 2);
        let reinserts = h.client.reinserts().await;
        assert_eq!(reinserts.len(), 1);
        assert_eq!(reinserts[0].files, None);
        assert!(h.store.get("T1").is_none());
    }

    #[tokio::test]
    async fn test_per_torrent_healthy_probes_every_file() {
        let h = harness();
        h.add(three_files("T1")).await;

        let task = h.engine.repair_now(manual("T1")).await;

        assert_eq!(task.message.as_deref(), Some("all files healthy"));
        assert_eq!(h.content.probes().await.len(), 3);
        assert!(h.client.reinserts().await.is_empty());
    }

    #[tokio::test]
    async fn test_healthy_torrent_untouched() {
        let h = harness_with(|c| c.repair.strategy = RepairStrategy::PerFile);
        h.add(two_files("T1")).await;

        let task = h.engine.repair_now(manual("T1")).await;

        assert_eq!(task.state, RepairState::Succeeded);
        assert_eq!(task.message.as_deref(), Some("all files healthy"));
        assert_eq!(h.content.probes().await.len(), 2);
        assert!(h.client.reinserts().await.is_empty());
        assert_eq!(h.store.len(), 1);
    }

    #[tokio::test]
    async fn test_broken_mint_counts_as_broken() {
        let h = harness_with(|c| c.repair.strategy = RepairStrategy::PerFile);
        h.add(two_files("T1")).await;
        h.client.break_file("T1", "a.mkv").await;

        let task = h.engine.repair_now(manual("T1")).await;

        assert_eq!(task.broken_files, vec!["a.mkv".to_string()]);
        assert!(task.reinserted);
    }

    #[tokio::test]
    async fn test_error_torrent_is_broken_without_probing() {
        let h = harness();
        h.add(fixtures::torrent_with_status(
            "T1",
            "rd",
            TorrentStatus::Error,
            &[("a.mkv", 100)],
        ))
        .await;

        let task = h.engine.repair_now(manual("T1")).await;

        assert_eq!(task.state, RepairState::Succeeded);
        assert!(task.reinserted);
        assert!(h.content.probes().await.is_empty());
        assert_eq!(h.client.mint_count(), 0);
    }

    #[tokio::test]
    async fn test_report_only_without_reinsert() {
        let h = harness_with(|c| c.repair.reinsert = false);
        h.add(two_files("T1")).await;
        h.content.break_urls("/T1/").await;

        let task = h.engine.repair_now(manual("T1")).await;

        assert_eq!(task.state, RepairState::Succeeded);
        assert!(!task.reinserted);
        assert_eq!(task.broken_files.len(), 2);
        assert!(h.client.reinserts().await.is_empty());
        assert!(h.store.get("T1").is_some());
    }

    #[tokio::test]
    async fn test_reinsert_failure_fails_task() {
        let h = harness();
        h.add(two_files("T1")).await;
        h.content.break_urls("/T1/").await;
        h.client
            .set_next_error(DebridError::ProviderUnavailable("maintenance".to_string()))
            .await;

        let task = h.engine.repair_now(manual("T1")).await;

        assert_eq!(task.state, RepairState::Failed);
        assert!(task.message.unwrap().contains("reinsert failed"));
        assert!(h.store.get("T1").is_some());
    }

    #[tokio::test]
    async fn test_inconclusive_probe_fails_task() {
        let h = harness();
        h.add(two_files("T1")).await;
        h.client
            .fail_next_mint(DebridError::ProviderUnavailable("down".to_string()))
            .await;

        let task = h.engine.repair_now(manual("T1")).await;

        assert_eq!(task.state, RepairState::Failed);
        assert!(task.message.unwrap().contains("could not verify"));
        assert!(h.client.reinserts().await.is_empty());
    }

    #[tokio::test]
    async fn test_skip_rules() {
        let h = harness_with(|c| {
            c.repair.exclude = vec!["Torrent EX".to_string()];
            c.allowed_file_types = vec!["mkv".to_string()];
        });
        h.add(fixtures::torrent("EX", "rd", &[("a.mkv", 1)])).await;
        h.add(fixtures::torrent_with_status(
            "DL",
            "rd",
            TorrentStatus::Downloading,
            &[("a.mkv", 1)],
        ))
        .await;
        h.add(fixtures::torrent("NF", "rd", &[("readme.txt", 1)])).await;
        h.store
            .upsert(fixtures::torrent("OT", "other", &[("a.mkv", 1)]));

        let cases = [
            ("EX", "excluded"),
            ("DL", "still downloading"),
            ("NF", "no eligible files"),
            ("OT", "unknown provider other"),
            ("GONE", "torrent no longer exists"),
        ];
        for (id, message) in cases {
            let task = h.engine.repair_now(manual(id)).await;
            assert_eq!(task.state, RepairState::Skipped, "{}", id);
            assert_eq!(task.message.as_deref(), Some(message), "{}", id);
        }
        assert!(h.content.probes().await.is_empty());
    }

    #[tokio::test]
    async fn test_task_timeout() {
        let h = harness_with(|c| c.repair.task_timeout = "100ms".to_string());
        h.add(two_files("T1")).await;
        h.client.set_mint_delay(Duration::from_millis(500)).await;

        let task = h.engine.repair_now(manual("T1")).await;

        assert_eq!(task.state, RepairState::Failed);
        assert!(task.message.unwrap().starts_with("timed out"));
    }

    #[tokio::test]
    async fn test_history_and_events() {
        let h = harness();
        h.add(two_files("T1")).await;
        let mut events = h.engine.subscribe();

        h.engine.repair_now(manual("T1")).await;
        h.engine.repair_now(manual("MISSING")).await;

        let first = events.recv().await.unwrap();
        assert_eq!(first.torrent_id, "T1");
        let recent = h.engine.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].torrent_id, "MISSING");
    }

    #[tokio::test]
    async fn test_trigger_requires_running_and_enabled() {
        let h = harness();
        h.add(two_files("T1")).await;
        assert!(matches!(h.engine.trigger("T1"), Err(RepairError::NotRunning)));

        h.engine.start().await;
        assert!(matches!(
            h.engine.trigger("NOPE"),
            Err(RepairError::TorrentNotFound(_))
        ));
        h.engine.stop().await;

        let disabled = harness_with(|c| c.repair.enabled = false);
        assert!(matches!(disabled.engine.trigger("T1"), Err(RepairError::Disabled)));
    }

    #[tokio::test]
    async fn test_trigger_runs_through_dispatcher() {
        let h = harness();
        h.add(two_files("T1")).await;
        h.content.break_urls("/T1/").await;
        let mut events = h.engine.subscribe();

        h.engine.start().await;
        h.engine.trigger("T1").unwrap();

        let task = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.torrent_id, "T1");
        assert_eq!(task.reason, RepairReason::Manual);
        assert!(task.reinserted);

        h.engine.stop().await;
    }

    #[tokio::test]
    async fn test_requests_for_same_torrent_coalesce() {
        let h = harness();
        h.add(two_files("T1")).await;
        h.client.set_mint_delay(Duration::from_millis(200)).await;
        let mut events = h.engine.subscribe();

        h.engine.start().await;
        for _ in 0..3 {
            h.engine.trigger("T1").unwrap();
        }

        let task = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.torrent_id, "T1");

        // No second task follows.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.engine.recent(10).len(), 1);
        h.engine.stop().await;
    }

    #[tokio::test]
    async fn test_repair_now_skips_when_already_active() {
        let h = harness();
        h.add(two_files("T1")).await;
        let claim = h.engine.worker.claim("T1").unwrap();

        let task = h.engine.repair_now(manual("T1")).await;
        assert_eq!(task.state, RepairState::Skipped);
        assert!(h.engine.recent(10).is_empty());

        drop(claim);
        assert!(h.engine.active().is_empty());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let h = harness();
        h.engine.start().await;
        h.engine.stop().await;
        h.engine.start().await;
        assert!(h.engine.is_running());
        h.engine.stop().await;
    }
}
