//! Copy-on-write torrent store.
//!
//! Readers clone the current snapshot `Arc` once and work against it;
//! writers serialize on a mutex, build the next map and swap it in. A write
//! that changes nothing leaves the snapshot and its generation untouched.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use tokio::sync::watch;

use super::types::Torrent;
use crate::metrics;

/// An immutable view of every torrent at one point in time.
#[derive(Debug, Default)]
pub struct StoreSnapshot {
    generation: u64,
    torrents: BTreeMap<String, Arc<Torrent>>,
}

impl StoreSnapshot {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Torrent>> {
        self.torrents.get(id)
    }

    /// Torrents in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Torrent>> {
        self.torrents.values()
    }

    pub fn by_provider<'a>(&'a self, provider: &'a str) -> impl Iterator<Item = &'a Arc<Torrent>> {
        self.torrents.values().filter(move |t| t.provider == provider)
    }

    pub fn len(&self) -> usize {
        self.torrents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.torrents.is_empty()
    }
}

/// What an upsert did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Added,
    /// Merged into the stored torrent. `stale_files` lists paths that were
    /// removed or whose content changed, so their links must go.
    Updated { stale_files: Vec<String> },
    Unchanged,
}

pub struct TorrentStore {
    current: RwLock<Arc<StoreSnapshot>>,
    writer: Mutex<()>,
    changes: watch::Sender<u64>,
}

impl TorrentStore {
    pub fn new() -> Self {
        Self::with_torrents(Vec::new())
    }

    pub fn with_torrents(torrents: Vec<Torrent>) -> Self {
        let torrents: BTreeMap<String, Arc<Torrent>> = torrents
            .into_iter()
            .map(|t| (t.id.clone(), Arc::new(t)))
            .collect();
        metrics::TORRENTS_STORED.set(torrents.len() as i64);
        let (changes, _) = watch::channel(0);
        Self {
            current: RwLock::new(Arc::new(StoreSnapshot {
                generation: 0,
                torrents,
            })),
            writer: Mutex::new(()),
            changes,
        }
    }

    /// The current snapshot. Cheap: one `Arc` clone.
    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn generation(&self) -> u64 {
        self.snapshot().generation
    }

    pub fn get(&self, id: &str) -> Option<Arc<Torrent>> {
        self.snapshot().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<Torrent>> {
        self.snapshot().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Receives the new generation after every change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Insert `torrent`, or merge it into the stored copy with the same id.
    pub fn upsert(&self, torrent: Torrent) -> UpsertOutcome {
        self.mutate(|torrents| match torrents.get(&torrent.id) {
            None => {
                torrents.insert(torrent.id.clone(), Arc::new(torrent));
                (UpsertOutcome::Added, true)
            }
            Some(stored) => match merge(stored, torrent) {
                Some((merged, stale_files)) => {
                    torrents.insert(merged.id.clone(), Arc::new(merged));
                    (UpsertOutcome::Updated { stale_files }, true)
                }
                None => (UpsertOutcome::Unchanged, false),
            },
        })
    }

    /// Remove a torrent, returning it if it was stored.
    pub fn remove(&self, id: &str) -> Option<Arc<Torrent>> {
        self.mutate(|torrents| {
            let removed = torrents.remove(id);
            let changed = removed.is_some();
            (removed, changed)
        })
    }

    /// Apply `f` to a private copy of the map and publish it if `f` reports a
    /// change.
    pub(crate) fn mutate<R>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, Arc<Torrent>>) -> (R, bool),
    ) -> R {
        let _writer = match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let current = self.snapshot();
        let mut torrents = current.torrents.clone();
        let (result, changed) = f(&mut torrents);
        if !changed {
            return result;
        }

        let next = Arc::new(StoreSnapshot {
            generation: current.generation + 1,
            torrents,
        });
        let generation = next.generation;
        metrics::TORRENTS_STORED.set(next.len() as i64);
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        self.changes.send_replace(generation);
        result
    }
}

impl Default for TorrentStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge an upstream copy into the stored torrent.
///
/// Files are matched by path: new ones are added, changed ones replaced,
/// missing ones dropped. A file that comes back without a provider handle
/// keeps the stored one. Returns `None` when nothing observable changed,
/// otherwise the merged torrent and the paths whose links are now stale.
pub(crate) fn merge(stored: &Torrent, upstream: Torrent) -> Option<(Torrent, Vec<String>)> {
    let mut merged = upstream;
    merged.added_at = stored.added_at;
    merged.provider = stored.provider.clone();

    let mut stale_files = Vec::new();
    for file in merged.files.iter_mut() {
        if let Some(old) = stored.file(&file.path) {
            if file.source.is_none() && old.file_id == file.file_id {
                file.source = old.source.clone();
            }
            if old.file_id != file.file_id || old.size != file.size || old.source != file.source {
                stale_files.push(file.path.clone());
            }
        }
    }
    for old in &stored.files {
        if merged.file(&old.path).is_none() {
            stale_files.push(old.path.clone());
        }
    }

    if !stored.differs_from(&merged) {
        return None;
    }
    merged.updated_at = Utc::now();
    Some((merged, stale_files))
}
