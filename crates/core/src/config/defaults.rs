//! Default injection and resolution of the string-typed configuration into
//! the typed settings the engine runs on.
//!
//! Every step here is a pure function of its inputs; nothing reads the
//! environment or depends on call order.

use std::path::{Path, PathBuf};
use std::time::Duration;

use regex_lite::Regex;
use serde::Serialize;

use super::units::{self, parse_duration, parse_optional_duration, parse_size, RateSpec};
use super::{
    Config, ConfigError, DebridConfig, DirectoryFilterConfig, DownloadingVisibility,
    FolderNaming, ProviderTunables, RepairStrategy, StaleLinkPolicy,
};

pub const DEFAULT_TORRENTS_REFRESH_INTERVAL: &str = "15s";
pub const DEFAULT_DOWNLOAD_LINKS_REFRESH_INTERVAL: &str = "40m";
pub const DEFAULT_AUTO_EXPIRE_LINKS_AFTER: &str = "3d";
pub const DEFAULT_MINIMUM_FREE_SLOT: usize = 10;
const WORKERS_PER_CPU: usize = 50;

/// Inputs to defaulting that come from outside the config file.
#[derive(Debug, Clone, Copy)]
pub struct DefaultsContext {
    pub provider_count: usize,
    pub cpus: usize,
}

impl DefaultsContext {
    pub fn for_host(provider_count: usize) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            provider_count,
            cpus,
        }
    }
}

/// Merge one provider's tunables over the global ones, then over the fixed
/// defaults. A field set on the provider always wins.
pub fn apply_defaults(
    global: &ProviderTunables,
    local: &ProviderTunables,
    ctx: DefaultsContext,
) -> ProviderTunables {
    fn pick(local: &str, global: &str, fallback: &str) -> String {
        [local, global]
            .into_iter()
            .find(|v| !v.is_empty())
            .unwrap_or(fallback)
            .to_string()
    }

    let per_provider = (ctx.cpus * WORKERS_PER_CPU) / ctx.provider_count.max(1);

    ProviderTunables {
        torrents_refresh_interval: pick(
            &local.torrents_refresh_interval,
            &global.torrents_refresh_interval,
            DEFAULT_TORRENTS_REFRESH_INTERVAL,
        ),
        download_links_refresh_interval: pick(
            &local.download_links_refresh_interval,
            &global.download_links_refresh_interval,
            DEFAULT_DOWNLOAD_LINKS_REFRESH_INTERVAL,
        ),
        auto_expire_links_after: pick(
            &local.auto_expire_links_after,
            &global.auto_expire_links_after,
            DEFAULT_AUTO_EXPIRE_LINKS_AFTER,
        ),
        folder_naming: local
            .folder_naming
            .or(global.folder_naming)
            .or(Some(FolderNaming::default())),
        workers: local.workers.or(global.workers).or(Some(per_provider.max(1))),
    }
}

/// Apply provider-level defaults that don't depend on the global section.
pub fn apply_debrid_defaults(
    global: &ProviderTunables,
    debrid: &DebridConfig,
    ctx: DefaultsContext,
) -> DebridConfig {
    let mut out = debrid.clone();
    if out.download_api_keys.is_empty() {
        out.download_api_keys = vec![out.api_key.clone()];
    }
    if out.minimum_free_slot.is_none() {
        out.minimum_free_slot = Some(DEFAULT_MINIMUM_FREE_SLOT);
    }
    out.tunables = apply_defaults(global, &debrid.tunables, ctx);
    out
}

/// Normalise a URL base to the `/segment/` form.
pub fn normalize_url_base(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", trimmed)
    }
}

impl Config {
    /// Return a copy with every unset tunable filled in.
    pub fn with_defaults(&self) -> Config {
        let ctx = DefaultsContext::for_host(self.debrids.len());
        let mut out = self.clone();
        out.debrids = self
            .debrids
            .iter()
            .map(|d| apply_debrid_defaults(&self.webdav.tunables, d, ctx))
            .collect();
        out.url_base = normalize_url_base(&self.url_base);
        if out.repair.workers == 0 {
            out.repair.workers = 1;
        }
        out
    }
}

/// Fully resolved settings for one provider account.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderSettings {
    pub name: String,
    #[serde(skip)]
    pub api_key: String,
    #[serde(skip)]
    pub download_keys: Vec<String>,
    pub folder: String,
    pub rate_limit: Option<RateSpec>,
    pub download_rate_limit: Option<RateSpec>,
    pub repair_rate_limit: Option<RateSpec>,
    pub minimum_free_slot: usize,
    pub use_webdav: bool,
    #[serde(with = "units::duration_secs")]
    pub torrents_refresh_interval: Duration,
    #[serde(with = "units::duration_secs")]
    pub download_links_refresh_interval: Duration,
    #[serde(with = "units::duration_secs")]
    pub auto_expire_links_after: Duration,
    pub folder_naming: FolderNaming,
    pub workers: usize,
    pub api_url: Option<String>,
}

impl ProviderSettings {
    /// Resolve an already-defaulted debrid config.
    pub fn resolve(debrid: &DebridConfig) -> Result<Self, ConfigError> {
        let tunables = &debrid.tunables;
        let nonzero = |raw: &str| -> Result<Duration, ConfigError> {
            let value = parse_duration(raw)?;
            if value.is_zero() {
                Err(ConfigError::InvalidDuration(raw.to_string()))
            } else {
                Ok(value)
            }
        };

        Ok(Self {
            name: debrid.name.clone(),
            api_key: debrid.api_key.clone(),
            download_keys: if debrid.download_api_keys.is_empty() {
                vec![debrid.api_key.clone()]
            } else {
                debrid.download_api_keys.clone()
            },
            folder: debrid.folder.clone(),
            rate_limit: RateSpec::parse(&debrid.rate_limit)?,
            download_rate_limit: RateSpec::parse(&debrid.download_rate_limit)?,
            repair_rate_limit: RateSpec::parse(&debrid.repair_rate_limit)?,
            minimum_free_slot: debrid
                .minimum_free_slot
                .unwrap_or(DEFAULT_MINIMUM_FREE_SLOT),
            use_webdav: debrid.use_webdav,
            torrents_refresh_interval: nonzero(&tunables.torrents_refresh_interval)?,
            download_links_refresh_interval: nonzero(&tunables.download_links_refresh_interval)?,
            auto_expire_links_after: nonzero(&tunables.auto_expire_links_after)?,
            folder_naming: tunables.folder_naming.unwrap_or_default(),
            workers: tunables.workers.unwrap_or(1).max(1),
            api_url: debrid.api_url.clone(),
        })
    }
}

/// Resolved repair settings.
#[derive(Debug, Clone, Serialize)]
pub struct RepairSettings {
    pub enabled: bool,
    #[serde(with = "units::duration_secs")]
    pub interval: Duration,
    pub auto_process: bool,
    pub workers: usize,
    pub reinsert: bool,
    pub strategy: RepairStrategy,
    pub exclude: Vec<String>,
    #[serde(with = "units::duration_secs")]
    pub task_timeout: Duration,
}

impl RepairSettings {
    pub fn is_excluded(&self, torrent_id: &str, torrent_name: &str) -> bool {
        self.exclude
            .iter()
            .any(|e| e == torrent_id || e.eq_ignore_ascii_case(torrent_name))
    }
}

/// Size and type window deciding which files are eligible.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FileFilter {
    pub min_size: u64,
    pub max_size: u64,
    /// Lowercase extensions without the dot; empty allows every type.
    pub allowed_extensions: Vec<String>,
}

impl FileFilter {
    pub fn is_size_allowed(&self, size: u64) -> bool {
        // Zero usually means the provider hasn't reported a size yet.
        if size == 0 {
            return true;
        }
        if self.min_size > 0 && size < self.min_size {
            return false;
        }
        if self.max_size > 0 && size > self.max_size {
            return false;
        }
        true
    }

    pub fn is_type_allowed(&self, path: &str) -> bool {
        if self.allowed_extensions.is_empty() {
            return true;
        }
        Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.allowed_extensions.iter().any(|a| *a == ext)
            })
            .unwrap_or(false)
    }

    pub fn is_allowed(&self, path: &str, size: u64) -> bool {
        self.is_size_allowed(size) && self.is_type_allowed(path)
    }
}

/// A compiled custom directory filter.
#[derive(Debug, Clone)]
pub struct DirectoryFilter {
    pub name: String,
    pub include: Option<Regex>,
    pub exclude: Option<Regex>,
    pub min_size: u64,
    pub max_size: u64,
}

impl DirectoryFilter {
    pub fn compile(name: &str, raw: &DirectoryFilterConfig) -> Result<Self, ConfigError> {
        let compile = |pattern: &Option<String>| -> Result<Option<Regex>, ConfigError> {
            pattern
                .as_deref()
                .map(|p| {
                    Regex::new(p).map_err(|e| {
                        ConfigError::ValidationError(format!(
                            "webdav.directories.{}: invalid regex {:?}: {}",
                            name, p, e
                        ))
                    })
                })
                .transpose()
        };

        Ok(Self {
            name: name.to_string(),
            include: compile(&raw.include)?,
            exclude: compile(&raw.exclude)?,
            min_size: parse_size(&raw.min_size)?,
            max_size: parse_size(&raw.max_size)?,
        })
    }

    pub fn matches(&self, torrent_name: &str, total_size: u64) -> bool {
        if let Some(include) = &self.include {
            if !include.is_match(torrent_name) {
                return false;
            }
        }
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(torrent_name) {
                return false;
            }
        }
        if self.min_size > 0 && total_size < self.min_size {
            return false;
        }
        if self.max_size > 0 && total_size > self.max_size {
            return false;
        }
        true
    }
}

/// Everything the engine needs, parsed and defaulted.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub providers: Vec<ProviderSettings>,
    pub repair: RepairSettings,
    pub files: FileFilter,
    pub stale_links: StaleLinkPolicy,
    pub downloading_visibility: DownloadingVisibility,
    pub directories: Vec<DirectoryFilter>,
    pub remove_stalled_after: Option<Duration>,
    pub rate_limit_timeout: Duration,
    pub max_downloads: usize,
    pub torrents_file: PathBuf,
}

impl EngineSettings {
    /// Resolve a config into typed settings. Defaults are applied first, so
    /// a raw config read straight from disk is accepted.
    pub fn resolve(config: &Config) -> Result<Self, ConfigError> {
        let config = config.with_defaults();

        let providers = config
            .debrids
            .iter()
            .map(ProviderSettings::resolve)
            .collect::<Result<Vec<_>, _>>()?;

        let repair = &config.repair;
        let interval = match parse_optional_duration(&repair.interval)? {
            Some(d) => d,
            None if repair.enabled => {
                return Err(ConfigError::ValidationError(
                    "repair interval is required".to_string(),
                ))
            }
            None => Duration::from_secs(3600),
        };

        let directories = config
            .webdav
            .directories
            .iter()
            .map(|(name, raw)| DirectoryFilter::compile(name, raw))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            providers,
            repair: RepairSettings {
                enabled: repair.enabled,
                interval,
                auto_process: repair.auto_process,
                workers: repair.workers.max(1),
                reinsert: repair.reinsert,
                strategy: repair.strategy,
                exclude: repair.exclude.clone(),
                task_timeout: parse_duration(&repair.task_timeout)?,
            },
            files: FileFilter {
                min_size: parse_size(&config.min_file_size)?,
                max_size: parse_size(&config.max_file_size)?,
                allowed_extensions: config
                    .allowed_file_types
                    .iter()
                    .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                    .collect(),
            },
            stale_links: config.webdav.stale_links,
            downloading_visibility: config.webdav.downloading_visibility,
            directories,
            remove_stalled_after: parse_optional_duration(&config.remove_stalled_after)?,
            rate_limit_timeout: parse_duration(&config.rate_limit_timeout)?,
            max_downloads: config.qbittorrent.max_downloads,
            torrents_file: config.torrents_file(),
        })
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderSettings> {
        self.providers.iter().find(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> DefaultsContext {
        DefaultsContext {
            provider_count: 2,
            cpus: 4,
        }
    }

    #[test]
    fn test_apply_defaults_local_wins() {
        let global = ProviderTunables {
            torrents_refresh_interval: "30s".to_string(),
            ..Default::default()
        };
        let local = ProviderTunables {
            torrents_refresh_interval: "5s".to_string(),
            ..Default::default()
        };
        let merged = apply_defaults(&global, &local, ctx());
        assert_eq!(merged.torrents_refresh_interval, "5s");
    }

    #[test]
    fn test_apply_defaults_global_fallback() {
        let global = ProviderTunables {
            download_links_refresh_interval: "1h".to_string(),
            folder_naming: Some(FolderNaming::Id),
            ..Default::default()
        };
        let merged = apply_defaults(&global, &ProviderTunables::default(), ctx());
        assert_eq!(merged.download_links_refresh_interval, "1h");
        assert_eq!(merged.folder_naming, Some(FolderNaming::Id));
    }

    #[test]
    fn test_apply_defaults_fixed_fallbacks() {
        let merged = apply_defaults(
            &ProviderTunables::default(),
            &ProviderTunables::default(),
            ctx(),
        );
        assert_eq!(merged.torrents_refresh_interval, "15s");
        assert_eq!(merged.download_links_refresh_interval, "40m");
        assert_eq!(merged.auto_expire_links_after, "3d");
        assert_eq!(merged.folder_naming, Some(FolderNaming::OriginalNoExt));
        // 4 cpus * 50 / 2 providers
        assert_eq!(merged.workers, Some(100));
    }

    #[test]
    fn test_apply_defaults_is_order_independent() {
        let global = ProviderTunables {
            auto_expire_links_after: "2d".to_string(),
            ..Default::default()
        };
        let local = ProviderTunables {
            workers: Some(3),
            ..Default::default()
        };
        let first = apply_defaults(&global, &local, ctx());
        let second = apply_defaults(&global, &local, ctx());
        assert_eq!(first, second);
        assert_eq!(first.workers, Some(3));
        assert_eq!(first.auto_expire_links_after, "2d");
    }

    #[test]
    fn test_debrid_defaults_download_keys_and_slots() {
        let debrid = DebridConfig {
            name: "rd".to_string(),
            api_key: "main".to_string(),
            ..Default::default()
        };
        let out = apply_debrid_defaults(&ProviderTunables::default(), &debrid, ctx());
        assert_eq!(out.download_api_keys, vec!["main".to_string()]);
        assert_eq!(out.minimum_free_slot, Some(DEFAULT_MINIMUM_FREE_SLOT));

        let debrid = DebridConfig {
            download_api_keys: vec!["d1".to_string()],
            minimum_free_slot: Some(2),
            ..debrid
        };
        let out = apply_debrid_defaults(&ProviderTunables::default(), &debrid, ctx());
        assert_eq!(out.download_api_keys, vec!["d1".to_string()]);
        assert_eq!(out.minimum_free_slot, Some(2));
    }

    #[test]
    fn test_normalize_url_base() {
        assert_eq!(normalize_url_base(""), "/");
        assert_eq!(normalize_url_base("/"), "/");
        assert_eq!(normalize_url_base("debrid"), "/debrid/");
        assert_eq!(normalize_url_base("/debrid"), "/debrid/");
        assert_eq!(normalize_url_base("debrid/"), "/debrid/");
    }

    #[test]
    fn test_file_filter_size_window() {
        let filter = FileFilter {
            min_size: 100,
            max_size: 1000,
            allowed_extensions: Vec::new(),
        };
        assert!(filter.is_size_allowed(0));
        assert!(!filter.is_size_allowed(99));
        assert!(filter.is_size_allowed(100));
        assert!(filter.is_size_allowed(1000));
        assert!(!filter.is_size_allowed(1001));

        let unbounded = FileFilter::default();
        assert!(unbounded.is_size_allowed(u64::MAX));
    }

    #[test]
    fn test_file_filter_types() {
        let filter = FileFilter {
            allowed_extensions: vec!["mkv".to_string(), "mp4".to_string()],
            ..Default::default()
        };
        assert!(filter.is_type_allowed("Show/S01E01.MKV"));
        assert!(filter.is_type_allowed("movie.mp4"));
        assert!(!filter.is_type_allowed("sample.txt"));
        assert!(!filter.is_type_allowed("README"));
    }

    #[test]
    fn test_directory_filter_matches() {
        let filter = DirectoryFilter::compile(
            "HD",
            &DirectoryFilterConfig {
                include: Some("(?i)1080p".to_string()),
                exclude: Some("(?i)cam".to_string()),
                min_size: "1GB".to_string(),
                max_size: String::new(),
            },
        )
        .unwrap();
        let gb = 1024 * 1024 * 1024;
        assert!(filter.matches("Movie.2020.1080p.BluRay", 2 * gb));
        assert!(!filter.matches("Movie.2020.720p", 2 * gb));
        assert!(!filter.matches("Movie.2020.1080p.CAM", 2 * gb));
        assert!(!filter.matches("Movie.2020.1080p", gb / 2));
    }

    #[test]
    fn test_directory_filter_invalid_regex() {
        let err = DirectoryFilter::compile(
            "bad",
            &DirectoryFilterConfig {
                include: Some("(unclosed".to_string()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_engine_settings_resolve() {
        let config: Config = serde_json::from_str(
            r#"{
                "min_file_size": "10MB",
                "allowed_file_types": [".MKV"],
                "remove_stalled_after": "2h",
                "repair": { "enabled": true, "interval": "6h", "strategy": "per_file" },
                "debrids": [{
                    "name": "rd",
                    "api_key": "key",
                    "folder": "/mnt/rd",
                    "rate_limit": "250/minute",
                    "download_rate_limit": "10/second"
                }]
            }"#,
        )
        .unwrap();
        let settings = EngineSettings::resolve(&config).unwrap();
        assert_eq!(settings.files.min_size, 10 * 1024 * 1024);
        assert_eq!(settings.files.allowed_extensions, vec!["mkv".to_string()]);
        assert_eq!(settings.remove_stalled_after, Some(Duration::from_secs(7200)));
        assert_eq!(settings.repair.interval, Duration::from_secs(6 * 3600));
        assert_eq!(settings.repair.strategy, RepairStrategy::PerFile);

        let rd = settings.provider("rd").unwrap();
        assert_eq!(rd.rate_limit.unwrap().count, 250);
        assert_eq!(rd.download_rate_limit.unwrap().per, Duration::from_secs(1));
        assert!(rd.repair_rate_limit.is_none());
        assert_eq!(rd.download_keys, vec!["key".to_string()]);
        assert_eq!(rd.torrents_refresh_interval, Duration::from_secs(15));
        assert_eq!(rd.auto_expire_links_after, Duration::from_secs(3 * 86_400));
    }

    #[test]
    fn test_engine_settings_rejects_bad_rate() {
        let config: Config = serde_json::from_str(
            r#"{ "debrids": [{ "name": "rd", "api_key": "k", "rate_limit": "lots" }] }"#,
        )
        .unwrap();
        let err = EngineSettings::resolve(&config).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRateLimit(_)));
    }

    #[test]
    fn test_repair_exclusion() {
        let settings = RepairSettings {
            enabled: true,
            interval: Duration::from_secs(60),
            auto_process: false,
            workers: 1,
            reinsert: false,
            strategy: RepairStrategy::PerTorrent,
            exclude: vec!["abc".to_string(), "Some Show".to_string()],
            task_timeout: Duration::from_secs(60),
        };
        assert!(settings.is_excluded("abc", "whatever"));
        assert!(settings.is_excluded("zzz", "some show"));
        assert!(!settings.is_excluded("zzz", "other"));
    }
}
