//! The virtual directory tree and file reads.
//!
//! The tree is derived from one store snapshot and the current settings.
//! It is rebuilt only when either changes; every call works against the
//! index it picked up at its start.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, warn};

use super::naming::{FolderNamer, ALL_FOLDER};
use super::types::{DirEntry, FileStream, VfsError, VisibleTorrent};
use crate::config::{DownloadingVisibility, EngineSettings, SharedConfig};
use crate::content::{ByteRange, ContentSource};
use crate::links::LinkCache;
use crate::provider::DebridError;
use crate::store::{StoreSnapshot, TorrentStatus, TorrentStore};

struct Group {
    name: String,
    folders: BTreeMap<String, Arc<VisibleTorrent>>,
    modified: DateTime<Utc>,
}

struct FolderIndex {
    generation: u64,
    settings: Arc<EngineSettings>,
    groups: Vec<Group>,
}

impl FolderIndex {
    fn build(snapshot: &StoreSnapshot, settings: Arc<EngineSettings>) -> Self {
        let mut namer = FolderNamer::new();
        let mut visible = Vec::new();

        for torrent in snapshot.iter() {
            let Some(provider) = settings.provider(&torrent.provider) else {
                continue;
            };
            if !provider.use_webdav {
                continue;
            }
            if torrent.status == TorrentStatus::Downloading
                && settings.downloading_visibility == DownloadingVisibility::Hide
            {
                continue;
            }
            let files: Vec<usize> = torrent
                .files
                .iter()
                .enumerate()
                .filter(|(_, f)| settings.files.is_allowed(&f.path, f.size))
                .map(|(i, _)| i)
                .collect();
            // Placeholders may not know their files yet.
            if files.is_empty() && torrent.status != TorrentStatus::Downloading {
                continue;
            }
            let size = files.iter().map(|i| torrent.files[*i].size).sum();
            visible.push(Arc::new(VisibleTorrent {
                folder: namer.assign(torrent, provider.folder_naming),
                torrent: Arc::clone(torrent),
                files,
                size,
            }));
        }

        let mut groups = vec![group(ALL_FOLDER, visible.iter().cloned())];
        for filter in &settings.directories {
            if filter.name == ALL_FOLDER {
                warn!("Custom directory {} clashes with the built-in one, ignoring", ALL_FOLDER);
                continue;
            }
            groups.push(group(
                &filter.name,
                visible
                    .iter()
                    .filter(|v| filter.matches(&v.torrent.name, v.torrent.size))
                    .cloned(),
            ));
        }

        Self {
            generation: snapshot.generation(),
            settings,
            groups,
        }
    }

    fn group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }

    fn modified(&self) -> DateTime<Utc> {
        self.groups
            .iter()
            .map(|g| g.modified)
            .max()
            .unwrap_or_else(epoch)
    }
}

fn group(name: &str, torrents: impl Iterator<Item = Arc<VisibleTorrent>>) -> Group {
    let folders: BTreeMap<String, Arc<VisibleTorrent>> =
        torrents.map(|v| (v.folder.clone(), v)).collect();
    let modified = folders
        .values()
        .map(|v| v.torrent.updated_at)
        .max()
        .unwrap_or_else(epoch);
    Group {
        name: name.to_string(),
        folders,
        modified,
    }
}

fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).single().unwrap_or_else(Utc::now)
}

/// What a path points at.
enum Node {
    Root,
    Group(usize),
    /// A directory inside a torrent; the prefix is empty or ends in `/`.
    Dir(Arc<VisibleTorrent>, String),
    File(Arc<VisibleTorrent>, usize),
}

/// Split a path into its components, rejecting `..`.
fn components(path: &str) -> Result<Vec<&str>, VfsError> {
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => return Err(VfsError::NotFound(path.to_string())),
            part => parts.push(part),
        }
    }
    Ok(parts)
}

fn resolve(index: &FolderIndex, path: &str) -> Result<Node, VfsError> {
    let not_found = || VfsError::NotFound(path.to_string());
    let parts = components(path)?;
    let Some((group_name, rest)) = parts.split_first() else {
        return Ok(Node::Root);
    };
    let group_idx = index
        .groups
        .iter()
        .position(|g| g.name == *group_name)
        .ok_or_else(not_found)?;
    let Some((folder, inner)) = rest.split_first() else {
        return Ok(Node::Group(group_idx));
    };
    let entry = index.groups[group_idx]
        .folders
        .get(*folder)
        .cloned()
        .ok_or_else(not_found)?;
    if inner.is_empty() {
        return Ok(Node::Dir(entry, String::new()));
    }

    let inner = inner.join("/");
    if let Some(idx) = entry
        .files
        .iter()
        .copied()
        .find(|i| entry.torrent.files[*i].path == inner)
    {
        return Ok(Node::File(entry, idx));
    }
    let prefix = format!("{}/", inner);
    if entry.visible_files().any(|f| f.path.starts_with(&prefix)) {
        return Ok(Node::Dir(entry, prefix));
    }
    Err(not_found())
}

/// A directory listing backed by one index.
///
/// Entries are produced on demand; call [`DirListing::iter`] again to
/// restart from the beginning.
pub struct DirListing {
    path: String,
    index: Arc<FolderIndex>,
    node: Node,
}

impl DirListing {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = DirEntry> + '_> {
        match &self.node {
            Node::Root => Box::new(
                self.index
                    .groups
                    .iter()
                    .map(|g| DirEntry::dir(g.name.clone(), 0, g.modified)),
            ),
            Node::Group(idx) => Box::new(
                self.index.groups[*idx]
                    .folders
                    .values()
                    .map(|v| DirEntry::dir(v.folder.clone(), v.size, v.torrent.updated_at)),
            ),
            Node::Dir(entry, prefix) => Box::new(dir_children(entry, prefix)),
            Node::File(..) => Box::new(std::iter::empty()),
        }
    }
}

impl<'a> IntoIterator for &'a DirListing {
    type Item = DirEntry;
    type IntoIter = Box<dyn Iterator<Item = DirEntry> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Immediate children of `prefix` inside a torrent, files and directories
/// in file order.
fn dir_children<'a>(
    entry: &'a VisibleTorrent,
    prefix: &'a str,
) -> impl Iterator<Item = DirEntry> + 'a {
    let modified = entry.torrent.updated_at;
    let mut seen = HashSet::new();
    entry.visible_files().filter_map(move |file| {
        let rest = file.path.strip_prefix(prefix)?;
        match rest.split_once('/') {
            None => Some(DirEntry::file(rest, file.size, modified)),
            Some((dir, _)) => {
                if !seen.insert(dir.to_string()) {
                    return None;
                }
                let sub = format!("{}{}/", prefix, dir);
                let size = entry
                    .visible_files()
                    .filter(|f| f.path.starts_with(&sub))
                    .map(|f| f.size)
                    .sum();
                Some(DirEntry::dir(dir, size, modified))
            }
        }
    })
}

/// Read-only filesystem view over the store.
pub struct VirtualFs {
    store: Arc<TorrentStore>,
    links: LinkCache,
    content: Arc<dyn ContentSource>,
    config: Arc<SharedConfig>,
    cached: Mutex<Option<Arc<FolderIndex>>>,
}

impl VirtualFs {
    pub fn new(
        store: Arc<TorrentStore>,
        links: LinkCache,
        content: Arc<dyn ContentSource>,
        config: Arc<SharedConfig>,
    ) -> Self {
        Self {
            store,
            links,
            content,
            config,
            cached: Mutex::new(None),
        }
    }

    /// The index for the current snapshot and settings.
    fn index(&self) -> Arc<FolderIndex> {
        let snapshot = self.store.snapshot();
        let settings = self.config.settings();
        let mut cached = match self.cached.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(index) = cached.as_ref() {
            if index.generation == snapshot.generation()
                && Arc::ptr_eq(&index.settings, &settings)
            {
                return Arc::clone(index);
            }
        }
        let index = Arc::new(FolderIndex::build(&snapshot, settings));
        debug!(
            "Rebuilt folder index for generation {} ({} torrents)",
            index.generation,
            index.group(ALL_FOLDER).map_or(0, |g| g.folders.len())
        );
        *cached = Some(Arc::clone(&index));
        index
    }

    pub fn list_directory(&self, path: &str) -> Result<DirListing, VfsError> {
        let index = self.index();
        let node = resolve(&index, path)?;
        if matches!(node, Node::File(..)) {
            return Err(VfsError::NotADirectory(path.to_string()));
        }
        Ok(DirListing {
            path: path.to_string(),
            index,
            node,
        })
    }

    pub fn stat(&self, path: &str) -> Result<DirEntry, VfsError> {
        let index = self.index();
        let name = components(path)?.last().copied().unwrap_or("").to_string();
        Ok(match resolve(&index, path)? {
            Node::Root => DirEntry::dir(name, 0, index.modified()),
            Node::Group(idx) => DirEntry::dir(name, 0, index.groups[idx].modified),
            Node::Dir(entry, prefix) => {
                let size = entry
                    .visible_files()
                    .filter(|f| f.path.starts_with(&prefix))
                    .map(|f| f.size)
                    .sum();
                DirEntry::dir(name, size, entry.torrent.updated_at)
            }
            Node::File(entry, idx) => DirEntry::file(
                name,
                entry.torrent.files[idx].size,
                entry.torrent.updated_at,
            ),
        })
    }

    /// Open a file for reading.
    ///
    /// A link the host reports dead is reported broken and re-minted once
    /// before giving up.
    pub async fn open_file(
        &self,
        path: &str,
        range: Option<ByteRange>,
    ) -> Result<FileStream, VfsError> {
        let index = self.index();
        let (entry, idx) = match resolve(&index, path)? {
            Node::File(entry, idx) => (entry, idx),
            _ => return Err(VfsError::IsADirectory(path.to_string())),
        };
        let torrent = &entry.torrent;
        if torrent.status == TorrentStatus::Downloading {
            return Err(VfsError::NotReady(format!(
                "{} is still downloading ({:.0}%)",
                torrent.name,
                torrent.progress * 100.0
            )));
        }
        let file = &torrent.files[idx];

        let mut retried = false;
        let stream = loop {
            let link = self
                .links
                .resolve(&torrent.id, &file.path)
                .await
                .map_err(|e| map_error(path, e))?;
            match self.content.open(&link.url, range).await {
                Ok(stream) => break stream,
                Err(DebridError::LinkBroken(reason)) => {
                    self.links.report_broken(&torrent.id, &file.path);
                    if retried {
                        return Err(VfsError::Unavailable(format!("{}: {}", path, reason)));
                    }
                    debug!("Link for {} is dead, retrying with a fresh one", path);
                    retried = true;
                }
                Err(e) => return Err(map_error(path, e)),
            }
        };

        let size = if file.size > 0 {
            file.size
        } else {
            stream.total_size.unwrap_or(0)
        };
        Ok(FileStream {
            name: file.name().to_string(),
            size,
            content_length: stream.content_length,
            content_range: stream.content_range,
            partial: stream.partial,
            modified: torrent.updated_at,
            stream: stream.body,
        })
    }
}

fn map_error(path: &str, error: DebridError) -> VfsError {
    match error {
        DebridError::TorrentNotFound(_) | DebridError::FileNotFound { .. } => {
            VfsError::NotFound(path.to_string())
        }
        DebridError::LinkBroken(reason) => VfsError::Unavailable(format!("{}: {}", path, reason)),
        other => VfsError::Upstream(other),
    }
}
