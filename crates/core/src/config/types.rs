use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Root configuration, as stored in `config.json`.
///
/// Tunables are kept as strings so the file remains hand-editable; they are
/// parsed into [`EngineSettings`](super::EngineSettings) once at load time.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_url_base")]
    pub url_base: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub debrids: Vec<DebridConfig>,
    #[serde(default)]
    pub qbittorrent: QBitTorrentConfig,
    #[serde(default)]
    pub repair: RepairConfig,
    #[serde(default)]
    pub webdav: WebDavConfig,
    /// File extensions visible in the virtual filesystem (empty = all).
    #[serde(default)]
    pub allowed_file_types: Vec<String>,
    /// Minimum file size, e.g. "10MB" (empty or "0" = no limit).
    #[serde(default)]
    pub min_file_size: String,
    /// Maximum file size, e.g. "50GB" (empty or "0" = no limit).
    #[serde(default)]
    pub max_file_size: String,
    #[serde(default)]
    pub use_auth: bool,
    /// Remove torrents stuck downloading longer than this (empty = never).
    #[serde(default)]
    pub remove_stalled_after: String,
    /// Upper bound on waiting for a local rate-limit token.
    #[serde(default = "default_rate_limit_timeout")]
    pub rate_limit_timeout: String,
    /// Directory holding config.json, auth.json and torrents.json.
    #[serde(skip)]
    pub path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            url_base: default_url_base(),
            log_level: default_log_level(),
            debrids: Vec::new(),
            qbittorrent: QBitTorrentConfig::default(),
            repair: RepairConfig::default(),
            webdav: WebDavConfig::default(),
            allowed_file_types: Vec::new(),
            min_file_size: String::new(),
            max_file_size: String::new(),
            use_auth: false,
            remove_stalled_after: String::new(),
            rate_limit_timeout: default_rate_limit_timeout(),
            path: PathBuf::new(),
        }
    }
}

impl Config {
    pub fn json_file(&self) -> PathBuf {
        self.path.join("config.json")
    }

    pub fn auth_file(&self) -> PathBuf {
        self.path.join("auth.json")
    }

    pub fn torrents_file(&self) -> PathBuf {
        self.path.join("torrents.json")
    }

    /// A fresh configuration for a new installation rooted at `path`.
    pub fn initial(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            use_auth: true,
            qbittorrent: QBitTorrentConfig {
                download_folder: path.join("downloads"),
                categories: vec!["sonarr".to_string(), "radarr".to_string()],
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8282
}

fn default_url_base() -> String {
    "/".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rate_limit_timeout() -> String {
    "30s".to_string()
}

/// One upstream debrid account.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DebridConfig {
    pub name: String,
    pub api_key: String,
    /// Extra keys used only to mint download links.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub download_api_keys: Vec<String>,
    #[serde(default)]
    pub folder: String,
    /// General budget, e.g. "250/minute".
    #[serde(default)]
    pub rate_limit: String,
    #[serde(default)]
    pub download_rate_limit: String,
    #[serde(default)]
    pub repair_rate_limit: String,
    /// Free upstream slots to keep in reserve before this account is skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_free_slot: Option<usize>,
    /// Expose this account through the virtual filesystem.
    #[serde(default)]
    pub use_webdav: bool,
    /// Override for the vendor API base URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(flatten)]
    pub tunables: ProviderTunables,
}

/// Per-provider knobs that fall back to the global `webdav` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProviderTunables {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub torrents_refresh_interval: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub download_links_refresh_interval: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auto_expire_links_after: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_naming: Option<FolderNaming>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
}

/// How a torrent's folder is named in the virtual filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderNaming {
    /// Torrent name verbatim.
    Original,
    /// Torrent name, minus the extension for single-file torrents.
    #[default]
    OriginalNoExt,
    /// Upstream torrent id.
    Id,
}

/// Download-client emulation settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QBitTorrentConfig {
    #[serde(default)]
    pub download_folder: PathBuf,
    #[serde(default)]
    pub categories: Vec<String>,
    /// Seconds between client polls.
    #[serde(default = "default_qbit_refresh")]
    pub refresh_interval: u64,
    /// Ceiling on torrents downloading at once (0 = unlimited).
    #[serde(default)]
    pub max_downloads: usize,
}

impl Default for QBitTorrentConfig {
    fn default() -> Self {
        Self {
            download_folder: PathBuf::new(),
            categories: Vec::new(),
            refresh_interval: default_qbit_refresh(),
            max_downloads: 0,
        }
    }
}

fn default_qbit_refresh() -> u64 {
    15
}

/// Repair granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStrategy {
    PerFile,
    #[default]
    PerTorrent,
}

impl RepairStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepairStrategy::PerFile => "per_file",
            RepairStrategy::PerTorrent => "per_torrent",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RepairConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Scan interval, e.g. "1h". Required when enabled.
    #[serde(default)]
    pub interval: String,
    /// Queue repairs for newly ingested torrents already broken upstream.
    #[serde(default)]
    pub auto_process: bool,
    #[serde(default = "default_repair_workers")]
    pub workers: usize,
    /// Re-submit broken content upstream instead of only reporting it.
    #[serde(default)]
    pub reinsert: bool,
    #[serde(default)]
    pub strategy: RepairStrategy,
    /// Torrent ids or names never repaired.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
    #[serde(default = "default_repair_task_timeout")]
    pub task_timeout: String,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: String::new(),
            auto_process: false,
            workers: default_repair_workers(),
            reinsert: false,
            strategy: RepairStrategy::default(),
            exclude: Vec::new(),
            task_timeout: default_repair_task_timeout(),
        }
    }
}

fn default_repair_workers() -> usize {
    1
}

fn default_repair_task_timeout() -> String {
    "10m".to_string()
}

/// What happens when a cached link is due for refresh but not yet expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleLinkPolicy {
    /// Re-mint before answering.
    #[default]
    Block,
    /// Answer with the still-valid link and refresh in the background.
    ServeStale,
}

/// Whether torrents still downloading upstream appear in the virtual tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadingVisibility {
    #[default]
    Hide,
    /// Listed, but opening a file reports it as not ready.
    Placeholder,
}

/// Global virtual filesystem settings and provider tunable defaults.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WebDavConfig {
    #[serde(flatten)]
    pub tunables: ProviderTunables,
    #[serde(default)]
    pub stale_links: StaleLinkPolicy,
    #[serde(default)]
    pub downloading_visibility: DownloadingVisibility,
    /// Extra top-level folders, each showing the torrents matching its filters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub directories: BTreeMap<String, DirectoryFilterConfig>,
}

/// Filters for a custom virtual directory. All set filters must match.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DirectoryFilterConfig {
    /// Regex the torrent name must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<String>,
    /// Regex the torrent name must not match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub min_size: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub max_size: String,
}

/// Sanitized config for API responses (secrets redacted)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub port: u16,
    pub url_base: String,
    pub debrids: Vec<SanitizedDebridConfig>,
    pub repair: RepairConfig,
    pub webdav: WebDavConfig,
    pub min_file_size: String,
    pub max_file_size: String,
    pub use_auth: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SanitizedDebridConfig {
    pub name: String,
    pub api_key_configured: bool,
    pub download_keys: usize,
    pub use_webdav: bool,
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            port: config.port,
            url_base: config.url_base.clone(),
            debrids: config
                .debrids
                .iter()
                .map(|d| SanitizedDebridConfig {
                    name: d.name.clone(),
                    api_key_configured: !d.api_key.is_empty(),
                    download_keys: d.download_api_keys.len(),
                    use_webdav: d.use_webdav,
                })
                .collect(),
            repair: config.repair.clone(),
            webdav: config.webdav.clone(),
            min_file_size: config.min_file_size.clone(),
            max_file_size: config.max_file_size.clone(),
            use_auth: config.use_auth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_minimal_config() {
        let json = r#"{
            "debrids": [{ "name": "realdebrid", "api_key": "key", "folder": "/mnt/rd" }]
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.port, 8282);
        assert_eq!(config.url_base, "/");
        assert_eq!(config.debrids.len(), 1);
        assert_eq!(config.repair.strategy, RepairStrategy::PerTorrent);
        assert_eq!(config.repair.workers, 1);
        assert_eq!(config.webdav.stale_links, StaleLinkPolicy::Block);
        assert_eq!(
            config.webdav.downloading_visibility,
            DownloadingVisibility::Hide
        );
    }

    #[test]
    fn test_deserialize_flattened_tunables() {
        let json = r#"{
            "webdav": {
                "torrents_refresh_interval": "30s",
                "folder_naming": "original",
                "stale_links": "serve_stale",
                "directories": { "Movies": { "include": "(?i)1080p" } }
            },
            "debrids": [{
                "name": "rd",
                "api_key": "key",
                "folder": "/mnt/rd",
                "use_webdav": true,
                "auto_expire_links_after": "2d",
                "workers": 4
            }]
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.webdav.tunables.torrents_refresh_interval, "30s");
        assert_eq!(
            config.webdav.tunables.folder_naming,
            Some(FolderNaming::Original)
        );
        assert_eq!(config.webdav.stale_links, StaleLinkPolicy::ServeStale);
        assert!(config.webdav.directories.contains_key("Movies"));

        let debrid = &config.debrids[0];
        assert_eq!(debrid.tunables.auto_expire_links_after, "2d");
        assert_eq!(debrid.tunables.workers, Some(4));
        assert!(debrid.tunables.torrents_refresh_interval.is_empty());
    }

    #[test]
    fn test_repair_strategy_serialization() {
        assert_eq!(
            serde_json::to_string(&RepairStrategy::PerFile).unwrap(),
            "\"per_file\""
        );
        let parsed: RepairStrategy = serde_json::from_str("\"per_torrent\"").unwrap();
        assert_eq!(parsed, RepairStrategy::PerTorrent);
        assert_eq!(RepairStrategy::PerFile.as_str(), "per_file");
    }

    #[test]
    fn test_initial_config_paths() {
        let config = Config::initial(Path::new("/data"));
        assert_eq!(config.json_file(), PathBuf::from("/data/config.json"));
        assert_eq!(config.auth_file(), PathBuf::from("/data/auth.json"));
        assert_eq!(config.torrents_file(), PathBuf::from("/data/torrents.json"));
        assert_eq!(
            config.qbittorrent.download_folder,
            PathBuf::from("/data/downloads")
        );
        assert!(config.use_auth);
    }

    #[test]
    fn test_sanitized_config_hides_keys() {
        let config = Config {
            debrids: vec![DebridConfig {
                name: "rd".to_string(),
                api_key: "secret".to_string(),
                download_api_keys: vec!["a".to_string(), "b".to_string()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let sanitized = SanitizedConfig::from(&config);
        let json = serde_json::to_string(&sanitized).unwrap();
        assert!(!json.contains("secret"));
        assert!(sanitized.debrids[0].api_key_configured);
        assert_eq!(sanitized.debrids[0].download_keys, 2);
    }
}
