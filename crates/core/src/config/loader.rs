use figment::{
    providers::{Env, Format, Json, Toml},
    Figment,
};
use std::path::{Path, PathBuf};

use super::{types::Config, ConfigError};

/// Environment variable prefix for overrides, e.g. `DEBRIDFS_REPAIR__ENABLED`.
pub const ENV_PREFIX: &str = "DEBRIDFS_";

/// Resolve a config location to the config file path.
///
/// A directory means `<dir>/config.json`; anything else is taken as the file.
pub fn config_file_path(location: &Path) -> PathBuf {
    if location.is_dir() || location.extension().is_none() {
        location.join("config.json")
    } else {
        location.to_path_buf()
    }
}

/// Load configuration from file with environment variable overrides.
///
/// JSON unless the file ends in `.toml`. The directory holding the file
/// becomes `Config::path`.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }

    let figment = if path.extension().and_then(|e| e.to_str()) == Some("toml") {
        Figment::new().merge(Toml::file(path))
    } else {
        Figment::new().merge(Json::file(path))
    };

    let mut config: Config = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.path = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    Ok(config.with_defaults())
}

/// Load the config at `location`, writing a fresh default one first if none
/// exists yet.
pub fn load_or_create(location: &Path) -> Result<Config, ConfigError> {
    let file = config_file_path(location);
    if !file.exists() {
        let dir = file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        tracing::info!("Config file not found, creating a new one at {:?}", file);
        std::fs::create_dir_all(&dir).map_err(|e| ConfigError::Io(e.to_string()))?;
        save_config(&Config::initial(&dir))?;
    }
    load_config(&file)
}

/// Write the config (with defaults filled in) to `config.json`.
pub fn save_config(config: &Config) -> Result<(), ConfigError> {
    let data = serde_json::to_string_pretty(&config.with_defaults())
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;
    std::fs::write(config.json_file(), data).map_err(|e| ConfigError::Io(e.to_string()))
}

/// Load configuration from a JSON string (useful for testing)
pub fn load_config_from_str(json: &str) -> Result<Config, ConfigError> {
    serde_json::from_str::<Config>(json)
        .map(|c| c.with_defaults())
        .map_err(|e| ConfigError::ParseError(e.to_string()))
}
