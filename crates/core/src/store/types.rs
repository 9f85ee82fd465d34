//! Types for the torrent store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from loading or saving the store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(String),

    #[error("Store data is corrupt: {0}")]
    Corrupt(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Status of a torrent on the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TorrentStatus {
    /// Still being fetched by the provider.
    Downloading,
    /// Fully available for streaming.
    Cached,
    /// The provider gave up on it.
    Error,
    /// Marked as deleted by the provider but still listed.
    DeletedUpstream,
}

impl TorrentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TorrentStatus::Downloading => "downloading",
            TorrentStatus::Cached => "cached",
            TorrentStatus::Error => "error",
            TorrentStatus::DeletedUpstream => "deleted_upstream",
        }
    }
}

impl std::fmt::Display for TorrentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file inside a torrent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentFile {
    /// Path relative to the torrent root, `/`-separated.
    pub path: String,
    pub size: u64,
    /// Provider-side file id.
    pub file_id: String,
    /// Provider handle a download link is minted from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl TorrentFile {
    /// Last path component.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// A torrent as held by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Torrent {
    /// Provider-assigned id, unique within the provider.
    pub id: String,
    pub name: String,
    /// Name of the provider holding this torrent.
    pub provider: String,
    /// Info hash (lowercase hex).
    pub hash: String,
    pub status: TorrentStatus,
    /// Total size of the selected files in bytes.
    pub size: u64,
    /// Download progress (0.0 - 1.0).
    #[serde(default)]
    pub progress: f64,
    pub added_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub files: Vec<TorrentFile>,
}

impl Torrent {
    pub fn file(&self, path: &str) -> Option<&TorrentFile> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn is_cached(&self) -> bool {
        self.status == TorrentStatus::Cached
    }

    /// Sum of the file sizes.
    pub fn files_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Magnet URI rebuilt from the info hash.
    pub fn magnet(&self) -> String {
        format!(
            "magnet:?xt=urn:btih:{}&dn={}",
            self.hash,
            urlencoding::encode(&self.name)
        )
    }

    /// True when the observable fields of `other` differ from `self`.
    ///
    /// Timestamps are ignored so that re-fetching an unchanged torrent
    /// compares equal.
    pub fn differs_from(&self, other: &Torrent) -> bool {
        self.name != other.name
            || self.hash != other.hash
            || self.status != other.status
            || self.size != other.size
            || self.progress != other.progress
            || self.files != other.files
    }
}

/// Lightweight listing entry returned by a provider's torrent list.
///
/// Carries enough to tell whether the stored copy is still current without
/// fetching the full file list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentSummary {
    pub id: String,
    pub name: String,
    pub hash: String,
    pub status: TorrentStatus,
    pub size: u64,
    pub progress: f64,
    pub added_at: DateTime<Utc>,
}

impl TorrentSummary {
    /// True when the stored torrent still matches this listing entry.
    pub fn matches(&self, stored: &Torrent) -> bool {
        self.name == stored.name
            && self.hash == stored.hash
            && self.status == stored.status
            && self.size == stored.size
            && self.progress == stored.progress
    }
}
