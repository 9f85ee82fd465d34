use std::collections::HashSet;

use super::{defaults::EngineSettings, types::Config, ConfigError};

/// Validate configuration
/// Currently validates:
/// - At least one debrid, each with a name, API key and mount folder
/// - Debrid names are unique
/// - The download folder is set and exists
/// - Repair has an interval when enabled
/// - Every rate limit, size and duration string parses
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    validate_debrids(config)?;
    validate_qbittorrent(config)?;
    validate_repair(config)?;

    if config.port == 0 {
        return Err(ConfigError::ValidationError(
            "port cannot be 0".to_string(),
        ));
    }

    EngineSettings::resolve(config)?;
    Ok(())
}

fn validate_debrids(config: &Config) -> Result<(), ConfigError> {
    if config.debrids.is_empty() {
        return Err(ConfigError::ValidationError(
            "no debrids configured".to_string(),
        ));
    }

    let mut names = HashSet::new();
    for debrid in &config.debrids {
        if debrid.name.is_empty() {
            return Err(ConfigError::ValidationError(
                "debrid name is required".to_string(),
            ));
        }
        if debrid.api_key.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "debrid {} api key is required",
                debrid.name
            )));
        }
        if debrid.folder.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "debrid {} folder is required",
                debrid.name
            )));
        }
        if !names.insert(debrid.name.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "debrid name {} is used more than once",
                debrid.name
            )));
        }
    }
    Ok(())
}

fn validate_qbittorrent(config: &Config) -> Result<(), ConfigError> {
    let folder = &config.qbittorrent.download_folder;
    if folder.as_os_str().is_empty() {
        return Err(ConfigError::ValidationError(
            "qbittorrent download folder is required".to_string(),
        ));
    }
    if !folder.exists() {
        return Err(ConfigError::ValidationError(format!(
            "qbittorrent download folder({}) does not exist",
            folder.display()
        )));
    }
    Ok(())
}

fn validate_repair(config: &Config) -> Result<(), ConfigError> {
    if config.repair.enabled && config.repair.interval.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "repair interval is required".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DebridConfig;
    use tempfile::TempDir;

    fn valid_config(dir: &TempDir) -> Config {
        Config {
            debrids: vec![DebridConfig {
                name: "rd".to_string(),
                api_key: "key".to_string(),
                folder: "/mnt/rd".to_string(),
                ..Default::default()
            }],
            qbittorrent: crate::config::QBitTorrentConfig {
                download_folder: dir.path().to_path_buf(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_valid_config() {
        let dir = TempDir::new().unwrap();
        assert!(validate_config(&valid_config(&dir)).is_ok());
    }

    #[test]
    fn test_validate_no_debrids() {
        let dir = TempDir::new().unwrap();
        let mut config = valid_config(&dir);
        config.debrids.clear();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("no debrids"));
    }

    #[test]
    fn test_validate_missing_api_key() {
        let dir = TempDir::new().unwrap();
        let mut config = valid_config(&dir);
        config.debrids[0].api_key.clear();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("api key"));
    }

    #[test]
    fn test_validate_duplicate_names() {
        let dir = TempDir::new().unwrap();
        let mut config = valid_config(&dir);
        config.debrids.push(config.debrids[0].clone());
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_validate_missing_download_folder() {
        let dir = TempDir::new().unwrap();
        let mut config = valid_config(&dir);
        config.qbittorrent.download_folder = dir.path().join("nope");
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_validate_repair_needs_interval() {
        let dir = TempDir::new().unwrap();
        let mut config = valid_config(&dir);
        config.repair.enabled = true;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("repair interval"));

        config.repair.interval = "1h".to_string();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_unparseable_tunable() {
        let dir = TempDir::new().unwrap();
        let mut config = valid_config(&dir);
        config.debrids[0].download_rate_limit = "fast".to_string();
        let err = validate_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRateLimit(_)));
    }
}
