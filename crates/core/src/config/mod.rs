mod auth;
mod defaults;
mod loader;
mod shared;
mod types;
mod units;
mod validate;

pub use auth::{AuthStore, Credentials};
pub use defaults::{
    apply_debrid_defaults, apply_defaults, normalize_url_base, DefaultsContext, DirectoryFilter,
    EngineSettings, FileFilter, ProviderSettings, RepairSettings,
    DEFAULT_AUTO_EXPIRE_LINKS_AFTER, DEFAULT_DOWNLOAD_LINKS_REFRESH_INTERVAL,
    DEFAULT_MINIMUM_FREE_SLOT, DEFAULT_TORRENTS_REFRESH_INTERVAL,
};
pub use loader::{
    config_file_path, load_config, load_config_from_str, load_or_create, save_config, ENV_PREFIX,
};
pub use shared::SharedConfig;
pub use types::*;
pub use units::{parse_duration, parse_size, RateSpec};
pub use validate::validate_config;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    #[error("Invalid rate limit {0:?}, expected e.g. \"200/minute\"")]
    InvalidRateLimit(String),

    #[error("Invalid duration {0:?}, expected e.g. \"15s\", \"40m\", \"3d\"")]
    InvalidDuration(String),

    #[error("Invalid size {0:?}, expected e.g. \"10MB\"")]
    InvalidSize(String),

    #[error("Config I/O error: {0}")]
    Io(String),
}
