//! Persisting the store to `torrents.json`.
//!
//! Saves go through a synced temp file and a rename so a crash never leaves
//! a half-written file behind. A background writer debounces bursts of
//! changes into one save, off the async worker threads.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::memory::{StoreSnapshot, TorrentStore};
use super::types::{StoreError, Torrent};
use crate::metrics;

const FORMAT_VERSION: u32 = 1;

/// Delay between the first change and the save that covers it.
pub const DEFAULT_PERSIST_DEBOUNCE: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize, Deserialize)]
struct PersistedStore {
    version: u32,
    saved_at: DateTime<Utc>,
    torrents: Vec<Torrent>,
}

/// Read torrents from `path`.
pub fn load(path: &Path) -> Result<Vec<Torrent>, StoreError> {
    let data = std::fs::read(path).map_err(|e| StoreError::Io(e.to_string()))?;
    let persisted: PersistedStore =
        serde_json::from_slice(&data).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    if persisted.version != FORMAT_VERSION {
        return Err(StoreError::Corrupt(format!(
            "unsupported store version {}",
            persisted.version
        )));
    }
    Ok(persisted.torrents)
}

/// Write a snapshot to `path` atomically.
pub fn save(path: &Path, snapshot: &StoreSnapshot) -> Result<(), StoreError> {
    let persisted = PersistedStore {
        version: FORMAT_VERSION,
        saved_at: Utc::now(),
        torrents: snapshot.iter().map(|t| (**t).clone()).collect(),
    };
    let data = serde_json::to_vec_pretty(&persisted)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| StoreError::Io(e.to_string()))?;
    }
    let tmp = temp_path(path);
    let io = |e: std::io::Error| StoreError::Io(e.to_string());
    let mut file = std::fs::File::create(&tmp).map_err(io)?;
    file.write_all(&data).map_err(io)?;
    // Data must reach the disk before the rename makes it visible.
    file.sync_all().map_err(io)?;
    drop(file);
    std::fs::rename(&tmp, path).map_err(io)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "torrents.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}

impl TorrentStore {
    /// Build a store from `path`. A missing or unreadable file yields an
    /// empty store.
    pub fn load_from(path: &Path) -> Self {
        match load(path) {
            Ok(torrents) => {
                info!("Loaded {} torrents from {}", torrents.len(), path.display());
                Self::with_torrents(torrents)
            }
            Err(StoreError::Io(_)) if !path.exists() => {
                debug!("No torrent store at {}, starting empty", path.display());
                Self::new()
            }
            Err(e) => {
                warn!("Ignoring torrent store at {}: {}", path.display(), e);
                Self::new()
            }
        }
    }

    /// Save the current snapshot to `path`, blocking the caller.
    pub fn flush(&self, path: &Path) -> Result<(), StoreError> {
        record_persist(save(path, &self.snapshot()))
    }

    /// Save the current snapshot to `path` on the blocking thread pool.
    pub async fn persist(&self, path: &Path) -> Result<(), StoreError> {
        let snapshot = self.snapshot();
        let path = path.to_path_buf();
        let result = tokio::task::spawn_blocking(move || save(&path, &snapshot))
            .await
            .unwrap_or_else(|e| Err(StoreError::Io(format!("persist task failed: {e}"))));
        record_persist(result)
    }
}

fn record_persist(result: Result<(), StoreError>) -> Result<(), StoreError> {
    let label = if result.is_ok() { "success" } else { "failure" };
    metrics::STORE_PERSISTS.with_label_values(&[label]).inc();
    result
}

/// Background task saving the store after changes settle.
pub struct PersistWriter {
    store: Arc<TorrentStore>,
    path: PathBuf,
    debounce: Duration,
}

impl PersistWriter {
    pub fn new(store: Arc<TorrentStore>, path: PathBuf, debounce: Duration) -> Self {
        Self {
            store,
            path,
            debounce,
        }
    }

    /// Run until shutdown, then save one last time.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut changes = self.store.subscribe();
        let mut saved_generation = self.store.generation();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = tokio::time::sleep(self.debounce) => {}
                    }
                    saved_generation = self.save_if_changed(saved_generation).await;
                }
            }
        }

        self.save_if_changed(saved_generation).await;
        debug!("Persist writer stopped");
    }

    async fn save_if_changed(&self, saved_generation: u64) -> u64 {
        let generation = self.store.generation();
        if generation == saved_generation {
            return saved_generation;
        }
        match self.store.persist(&self.path).await {
            Ok(()) => {
                debug!("Saved torrent store generation {}", generation);
                generation
            }
            Err(e) => {
                error!("Failed to save torrent store: {}", e);
                saved_generation
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;
    use tempfile::TempDir;

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("torrents.json");

        let store = TorrentStore::new();
        store.upsert(fixtures::torrent("T1", "rd", &[("a.mkv", 10), ("dir/b.mkv", 20)]));
        store.upsert(fixtures::torrent("T2", "ad", &[("c.mkv", 30)]));
        store.flush(&path).unwrap();
        assert!(!temp_path(&path).exists());

        let loaded = TorrentStore::load_from(&path);
        assert_eq!(loaded.len(), 2);
        for torrent in store.list() {
            assert_eq!(*loaded.get(&torrent.id).unwrap(), *torrent);
        }
    }

    #[tokio::test]
    async fn test_persist_off_runtime_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("torrents.json");

        let store = TorrentStore::new();
        store.upsert(fixtures::torrent("T1", "rd", &[("a.mkv", 10)]));
        store.persist(&path).await.unwrap();
        assert!(!temp_path(&path).exists());

        // A second save replaces the first in place.
        store.upsert(fixtures::torrent("T2", "rd", &[("b.mkv", 20)]));
        store.persist(&path).await.unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = TorrentStore::load_from(&dir.path().join("torrents.json"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_corrupt_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("torrents.json");
        std::fs::write(&path, b"{\"version\": 1, \"torrents\": [").unwrap();
        assert!(matches!(load(&path), Err(StoreError::Corrupt(_))));
        assert!(TorrentStore::load_from(&path).is_empty());
    }

    #[tokio::test]
    async fn test_writer_saves_after_change_and_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("torrents.json");
        let store = Arc::new(TorrentStore::new());

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let writer = PersistWriter::new(
            Arc::clone(&store),
            path.clone(),
            Duration::from_millis(20),
        );
        let handle = tokio::spawn(writer.run(shutdown_rx));

        store.upsert(fixtures::torrent("T1", "rd", &[("a.mkv", 10)]));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(load(&path).unwrap().len(), 1);

        store.upsert(fixtures::torrent("T2", "rd", &[("b.mkv", 10)]));
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
        assert_eq!(load(&path).unwrap().len(), 2);
    }
}
