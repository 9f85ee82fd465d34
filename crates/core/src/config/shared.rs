use std::sync::{Arc, RwLock};

use super::{defaults::EngineSettings, types::Config, ConfigError};

/// The live configuration, handed explicitly to every component that reads it.
///
/// `reload` resolves the new config first and swaps both values in one step,
/// so readers see either the old pair or the new pair, never a mix. A config
/// that fails to resolve leaves the current one in place.
pub struct SharedConfig {
    current: RwLock<(Arc<Config>, Arc<EngineSettings>)>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        let settings = EngineSettings::resolve(&config)?;
        Ok(Self {
            current: RwLock::new((Arc::new(config), Arc::new(settings))),
        })
    }

    pub fn config(&self) -> Arc<Config> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard.0),
            Err(poisoned) => Arc::clone(&poisoned.into_inner().0),
        }
    }

    pub fn settings(&self) -> Arc<EngineSettings> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard.1),
            Err(poisoned) => Arc::clone(&poisoned.into_inner().1),
        }
    }

    pub fn reload(&self, config: Config) -> Result<(), ConfigError> {
        let settings = EngineSettings::resolve(&config)?;
        let next = (Arc::new(config), Arc::new(settings));
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DebridConfig;

    fn config(min_size: &str) -> Config {
        Config {
            min_file_size: min_size.to_string(),
            debrids: vec![DebridConfig {
                name: "rd".to_string(),
                api_key: "k".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_reload_swaps_settings() {
        let shared = SharedConfig::new(config("1MB")).unwrap();
        let before = shared.settings();
        assert_eq!(before.files.min_size, 1024 * 1024);

        shared.reload(config("2MB")).unwrap();
        assert_eq!(shared.settings().files.min_size, 2 * 1024 * 1024);
        assert_eq!(shared.config().min_file_size, "2MB");
        // Earlier handles keep their snapshot.
        assert_eq!(before.files.min_size, 1024 * 1024);
    }

    #[test]
    fn test_reload_rejects_invalid_and_keeps_current() {
        let shared = SharedConfig::new(config("1MB")).unwrap();
        assert!(shared.reload(config("one megabyte")).is_err());
        assert_eq!(shared.settings().files.min_size, 1024 * 1024);
    }
}
