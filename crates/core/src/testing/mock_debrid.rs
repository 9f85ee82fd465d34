//! Mock debrid client for testing.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::provider::{DebridClient, DebridError};
use crate::store::{Torrent, TorrentFile, TorrentStatus, TorrentSummary};

/// A recorded reinsert call for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedReinsert {
    pub torrent_id: String,
    /// Paths requested, or `None` for the whole torrent.
    pub files: Option<Vec<String>>,
    /// Id of the torrent the reinsert produced.
    pub new_id: String,
}

/// Mock implementation of the DebridClient trait.
///
/// Holds an in-memory "account" of torrents and provides controllable
/// behavior for testing:
/// - Add, change and remove upstream torrents
/// - Break individual files so minting them fails with `LinkBroken`
/// - Queue mint failures and delay mints
/// - Record mints, deletes and reinserts for assertions
///
/// # Example
///
/// ```rust,ignore
/// let client = MockDebridClient::new("rd");
/// client.add_torrent(fixtures::torrent("T1", "rd", &[("a.mkv", 100)])).await;
///
/// // Minting a.mkv now fails with LinkBroken
/// client.break_file("T1", "a.mkv").await;
///
/// // The next mint fails once, whatever the file
/// client.fail_next_mint(DebridError::TrafficExceeded("quota".into())).await;
///
/// assert_eq!(client.mint_count(), 0);
/// ```
#[derive(Debug)]
pub struct MockDebridClient {
    name: String,
    /// Upstream torrents by id.
    torrents: Arc<RwLock<BTreeMap<String, Torrent>>>,
    /// (torrent id, path) pairs whose mint fails with LinkBroken.
    broken: Arc<RwLock<HashSet<(String, String)>>>,
    /// Errors returned by the next mints, in order.
    mint_errors: Arc<RwLock<VecDeque<DebridError>>>,
    /// If set, the next non-mint operation fails with this error.
    next_error: Arc<RwLock<Option<DebridError>>>,
    mint_delay: Arc<RwLock<Duration>>,
    add_delay: Arc<RwLock<Duration>>,
    slots: Arc<RwLock<usize>>,
    /// Status given to torrents created by `add_magnet`.
    add_status: Arc<RwLock<TorrentStatus>>,
    mint_keys: Arc<RwLock<Vec<String>>>,
    reinserts: Arc<RwLock<Vec<RecordedReinsert>>>,
    deleted: Arc<RwLock<Vec<String>>>,
    added_magnets: Arc<RwLock<Vec<String>>>,
    mints: AtomicUsize,
    lists: AtomicUsize,
    gets: AtomicUsize,
    /// Counter for generating unique ids and URLs.
    counter: AtomicUsize,
}

impl MockDebridClient {
    /// Create a new mock client for provider `name`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            torrents: Arc::new(RwLock::new(BTreeMap::new())),
            broken: Arc::new(RwLock::new(HashSet::new())),
            mint_errors: Arc::new(RwLock::new(VecDeque::new())),
            next_error: Arc::new(RwLock::new(None)),
            mint_delay: Arc::new(RwLock::new(Duration::ZERO)),
            add_delay: Arc::new(RwLock::new(Duration::ZERO)),
            slots: Arc::new(RwLock::new(50)),
            add_status: Arc::new(RwLock::new(TorrentStatus::Downloading)),
            mint_keys: Arc::new(RwLock::new(Vec::new())),
            reinserts: Arc::new(RwLock::new(Vec::new())),
            deleted: Arc::new(RwLock::new(Vec::new())),
            added_magnets: Arc::new(RwLock::new(Vec::new())),
            mints: AtomicUsize::new(0),
            lists: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
            counter: AtomicUsize::new(0),
        }
    }

    /// Put a torrent on the upstream account, replacing any with the same id.
    pub async fn add_torrent(&self, torrent: Torrent) {
        self.torrents
            .write()
            .await
            .insert(torrent.id.clone(), torrent);
    }

    /// Remove a torrent from the upstream account behind the engine's back.
    pub async fn remove_torrent(&self, id: &str) {
        self.torrents.write().await.remove(id);
    }

    /// Current upstream copy of a torrent.
    pub async fn torrent(&self, id: &str) -> Option<Torrent> {
        self.torrents.read().await.get(id).cloned()
    }

    pub async fn torrent_count(&self) -> usize {
        self.torrents.read().await.len()
    }

    /// Make minting `path` of torrent `id` fail with LinkBroken.
    pub async fn break_file(&self, id: &str, path: &str) {
        self.broken
            .write()
            .await
            .insert((id.to_string(), path.to_string()));
    }

    /// Queue an error for the next mint.
    pub async fn fail_next_mint(&self, error: DebridError) {
        self.mint_errors.write().await.push_back(error);
    }

    /// Configure the next non-mint operation to fail with the given error.
    pub async fn set_next_error(&self, error: DebridError) {
        *self.next_error.write().await = Some(error);
    }

    pub async fn set_mint_delay(&self, delay: Duration) {
        *self.mint_delay.write().await = delay;
    }

    pub async fn set_add_delay(&self, delay: Duration) {
        *self.add_delay.write().await = delay;
    }

    pub async fn set_slots(&self, slots: usize) {
        *self.slots.write().await = slots;
    }

    pub async fn set_add_status(&self, status: TorrentStatus) {
        *self.add_status.write().await = status;
    }

    /// Number of mint calls made, failed ones included.
    pub fn mint_count(&self) -> usize {
        self.mints.load(Ordering::SeqCst)
    }

    pub fn list_count(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Download keys used by each mint, in call order.
    pub async fn mint_keys(&self) -> Vec<String> {
        self.mint_keys.read().await.clone()
    }

    pub async fn reinserts(&self) -> Vec<RecordedReinsert> {
        self.reinserts.read().await.clone()
    }

    pub async fn deleted(&self) -> Vec<String> {
        self.deleted.read().await.clone()
    }

    pub async fn added_magnets(&self) -> Vec<String> {
        self.added_magnets.read().await.clone()
    }

    /// Take the next error if set.
    async fn take_error(&self) -> Option<DebridError> {
        self.next_error.write().await.take()
    }

    fn next_number(&self) -> usize {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Extract info hash from magnet URI if present.
    fn extract_hash_from_magnet(uri: &str) -> Option<String> {
        uri.split(['?', '&'])
            .find_map(|part| part.strip_prefix("xt=urn:btih:"))
            .map(|h| h.to_lowercase())
    }

    fn extract_name_from_magnet(uri: &str) -> Option<String> {
        uri.split(['?', '&'])
            .find_map(|part| part.strip_prefix("dn="))
            .and_then(|n| urlencoding::decode(n).ok())
            .map(|n| n.into_owned())
    }
}

fn summary(torrent: &Torrent) -> TorrentSummary {
    TorrentSummary {
        id: torrent.id.clone(),
        name: torrent.name.clone(),
        hash: torrent.hash.clone(),
        status: torrent.status,
        size: torrent.size,
        progress: torrent.progress,
        added_at: torrent.added_at,
    }
}

#[async_trait]
impl DebridClient for MockDebridClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_torrents(&self) -> Result<Vec<TorrentSummary>, DebridError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.take_error().await {
            return Err(error);
        }
        Ok(self.torrents.read().await.values().map(summary).collect())
    }

    async fn get_torrent(&self, id: &str) -> Result<Torrent, DebridError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.take_error().await {
            return Err(error);
        }
        self.torrents
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| DebridError::TorrentNotFound(id.to_string()))
    }

    async fn mint_link(
        &self,
        torrent: &Torrent,
        file: &TorrentFile,
        key: &str,
    ) -> Result<String, DebridError> {
        self.mints.fetch_add(1, Ordering::SeqCst);
        self.mint_keys.write().await.push(key.to_string());

        let delay = *self.mint_delay.read().await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.mint_errors.write().await.pop_front() {
            return Err(error);
        }
        if self
            .broken
            .read()
            .await
            .contains(&(torrent.id.clone(), file.path.clone()))
        {
            return Err(DebridError::LinkBroken(format!(
                "{}/{} is unavailable",
                torrent.id, file.path
            )));
        }

        Ok(format!(
            "https://{}.cdn.test/{}/{}?key={}&n={}",
            self.name,
            torrent.id,
            file.path,
            key,
            self.next_number()
        ))
    }

    async fn delete_torrent(&self, id: &str) -> Result<(), DebridError> {
        if let Some(error) = self.take_error().await {
            return Err(error);
        }
        if self.torrents.write().await.remove(id).is_none() {
            return Err(DebridError::TorrentNotFound(id.to_string()));
        }
        self.deleted.write().await.push(id.to_string());
        Ok(())
    }

    async fn add_magnet(&self, magnet: &str) -> Result<Torrent, DebridError> {
        if let Some(error) = self.take_error().await {
            return Err(error);
        }
        let delay = *self.add_delay.read().await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let hash = Self::extract_hash_from_magnet(magnet)
            .ok_or_else(|| DebridError::Api("invalid magnet".to_string()))?;
        let name = Self::extract_name_from_magnet(magnet).unwrap_or_else(|| hash.clone());
        let status = *self.add_status.read().await;
        let id = format!("M{}", self.next_number());
        let now = Utc::now();

        let files = vec![TorrentFile {
            path: format!("{}.mkv", name),
            size: 1_000_000,
            file_id: "1".to_string(),
            source: Some(format!("https://hoster.example/{}/1", id)),
        }];
        let torrent = Torrent {
            id: id.clone(),
            name,
            provider: self.name.clone(),
            hash,
            status,
            size: 1_000_000,
            progress: if status == TorrentStatus::Cached { 1.0 } else { 0.0 },
            added_at: now,
            updated_at: now,
            files,
        };

        self.added_magnets.write().await.push(magnet.to_string());
        self.torrents.write().await.insert(id, torrent.clone());
        Ok(torrent)
    }

    async fn reinsert(
        &self,
        torrent: &Torrent,
        files: Option<&[String]>,
    ) -> Result<Torrent, DebridError> {
        if let Some(error) = self.take_error().await {
            return Err(error);
        }
        let new_id = format!("{}-r{}", torrent.id, self.next_number());
        let kept: Vec<TorrentFile> = torrent
            .files
            .iter()
            .filter(|f| files.map_or(true, |wanted| wanted.contains(&f.path)))
            .map(|f| TorrentFile {
                source: Some(format!("https://hoster.example/{}/{}", new_id, f.path)),
                ..f.clone()
            })
            .collect();
        let now = Utc::now();
        let fresh = Torrent {
            id: new_id.clone(),
            provider: self.name.clone(),
            status: TorrentStatus::Cached,
            size: kept.iter().map(|f| f.size).sum(),
            progress: 1.0,
            added_at: now,
            updated_at: now,
            files: kept,
            ..torrent.clone()
        };

        let mut torrents = self.torrents.write().await;
        if files.is_none() {
            torrents.remove(&torrent.id);
        }
        torrents.insert(new_id.clone(), fresh.clone());
        drop(torrents);

        self.reinserts.write().await.push(RecordedReinsert {
            torrent_id: torrent.id.clone(),
            files: files.map(|f| f.to_vec()),
            new_id,
        });
        Ok(fresh)
    }

    async fn available_slots(&self) -> Result<usize, DebridError> {
        if let Some(error) = self.take_error().await {
            return Err(error);
        }
        Ok(*self.slots.read().await)
    }
}
