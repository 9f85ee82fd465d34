//! Types for the virtual filesystem.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::Serialize;
use thiserror::Error;

use crate::provider::DebridError;
use crate::store::Torrent;

/// Errors from virtual filesystem operations.
#[derive(Debug, Error)]
pub enum VfsError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    /// The torrent is still downloading upstream.
    #[error("Not ready: {0}")]
    NotReady(String),

    /// The file exists but no working link could be obtained.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Upstream error: {0}")]
    Upstream(DebridError),
}

impl VfsError {
    pub fn status_code(&self) -> u16 {
        match self {
            VfsError::NotFound(_) => 404,
            VfsError::NotADirectory(_) | VfsError::IsADirectory(_) => 400,
            VfsError::NotReady(_) => 425,
            VfsError::Unavailable(_) => 503,
            VfsError::Upstream(e) => e.status_code(),
        }
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    pub modified: DateTime<Utc>,
}

impl DirEntry {
    pub fn dir(name: impl Into<String>, size: u64, modified: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            size,
            is_dir: true,
            modified,
        }
    }

    pub fn file(name: impl Into<String>, size: u64, modified: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            size,
            is_dir: false,
            modified,
        }
    }
}

/// A torrent as shown in the tree: its folder name and the indices of the
/// files that pass the eligibility filter.
#[derive(Debug)]
pub(crate) struct VisibleTorrent {
    pub folder: String,
    pub torrent: Arc<Torrent>,
    pub files: Vec<usize>,
    pub size: u64,
}

impl VisibleTorrent {
    pub fn visible_files(&self) -> impl Iterator<Item = &crate::store::TorrentFile> + '_ {
        self.files.iter().map(|i| &self.torrent.files[*i])
    }
}

/// An open file read.
pub struct FileStream {
    pub name: String,
    /// Full file size.
    pub size: u64,
    /// Bytes the stream will yield, when known.
    pub content_length: Option<u64>,
    /// `Content-Range` value for partial reads.
    pub content_range: Option<String>,
    pub partial: bool,
    pub modified: DateTime<Utc>,
    pub stream: BoxStream<'static, Result<Bytes, DebridError>>,
}

impl std::fmt::Debug for FileStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStream")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("content_length", &self.content_length)
            .field("content_range", &self.content_range)
            .field("partial", &self.partial)
            .finish_non_exhaustive()
    }
}
