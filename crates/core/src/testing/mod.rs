//! Testing utilities and mock implementations.
//!
//! This module provides mock implementations of the provider and content
//! traits, allowing the whole engine to be exercised without network access.
//!
//! # Example
//!
//! ```rust,ignore
//! use debridfs_core::testing::{fixtures, MockContentSource, MockDebridClient};
//!
//! let client = Arc::new(MockDebridClient::new("rd"));
//! client.add_torrent(fixtures::torrent("T1", "rd", &[("movie.mkv", 1000)])).await;
//!
//! let engine = Engine::new(
//!     fixtures::config(&["rd"]),
//!     vec![client.clone()],
//!     Arc::new(MockContentSource::new()),
//! )?;
//! ```

mod mock_content;
mod mock_debrid;

pub use mock_content::{MockContentSource, RecordedOpen};
pub use mock_debrid::{MockDebridClient, RecordedReinsert};

/// Test fixtures and helper functions.
pub mod fixtures {
    use chrono::{DateTime, TimeZone, Utc};

    use crate::config::{Config, DebridConfig, ProviderTunables, QBitTorrentConfig};
    use crate::store::{Torrent, TorrentFile, TorrentStatus};

    /// Fixed timestamp so fixtures compare equal across calls.
    pub fn epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// Create a cached torrent with the given files.
    ///
    /// File ids count from 1 in order; each file gets a hoster handle
    /// derived from the torrent id and path.
    pub fn torrent(id: &str, provider: &str, files: &[(&str, u64)]) -> Torrent {
        let files: Vec<TorrentFile> = files
            .iter()
            .enumerate()
            .map(|(i, (path, size))| TorrentFile {
                path: path.to_string(),
                size: *size,
                file_id: (i + 1).to_string(),
                source: Some(format!("https://hoster.example/{}/{}", id, path)),
            })
            .collect();
        Torrent {
            id: id.to_string(),
            name: format!("Torrent {}", id),
            provider: provider.to_string(),
            hash: format!("{:0>40}", id.to_lowercase()),
            status: TorrentStatus::Cached,
            size: files.iter().map(|f| f.size).sum(),
            progress: 1.0,
            added_at: epoch(),
            updated_at: epoch(),
            files,
        }
    }

    /// Same as [`torrent`] with a custom name.
    pub fn named_torrent(id: &str, provider: &str, name: &str, files: &[(&str, u64)]) -> Torrent {
        Torrent {
            name: name.to_string(),
            ..torrent(id, provider, files)
        }
    }

    /// Same as [`torrent`] with a custom status.
    pub fn torrent_with_status(
        id: &str,
        provider: &str,
        status: TorrentStatus,
        files: &[(&str, u64)],
    ) -> Torrent {
        Torrent {
            status,
            progress: if status == TorrentStatus::Cached { 1.0 } else { 0.0 },
            ..torrent(id, provider, files)
        }
    }

    /// A valid config with one webdav-enabled account per name.
    pub fn config(providers: &[&str]) -> Config {
        Config {
            debrids: providers
                .iter()
                .map(|name| DebridConfig {
                    name: name.to_string(),
                    api_key: format!("{}-key", name),
                    folder: format!("/mnt/{}", name),
                    use_webdav: true,
                    minimum_free_slot: Some(0),
                    tunables: ProviderTunables {
                        workers: Some(4),
                        ..Default::default()
                    },
                    ..Default::default()
                })
                .collect(),
            qbittorrent: QBitTorrentConfig {
                download_folder: std::env::temp_dir(),
                ..Default::default()
            },
            rate_limit_timeout: "1s".to_string(),
            ..Default::default()
        }
    }
}
