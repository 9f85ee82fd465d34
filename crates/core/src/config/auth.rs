//! Credentials for the client-facing API, kept in `auth.json`.
//!
//! The file is read lazily on first use and rewritten whenever the
//! credentials change. Passwords are stored as SHA-256 hex digests.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password_sha256: String,
}

pub struct AuthStore {
    path: PathBuf,
    cached: RwLock<Option<Credentials>>,
}

impl AuthStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current credentials, loading them from disk on first call.
    ///
    /// A missing or unreadable file yields empty credentials.
    pub fn credentials(&self) -> Credentials {
        if let Ok(guard) = self.cached.read() {
            if let Some(creds) = guard.as_ref() {
                return creds.clone();
            }
        }

        let loaded = std::fs::read(&self.path)
            .ok()
            .and_then(|data| serde_json::from_slice::<Credentials>(&data).ok())
            .unwrap_or_default();

        if let Ok(mut guard) = self.cached.write() {
            *guard = Some(loaded.clone());
        }
        loaded
    }

    /// True until a username has been saved.
    pub fn needs_setup(&self) -> bool {
        self.credentials().username.is_empty()
    }

    pub fn save(&self, username: &str, password: &str) -> Result<(), ConfigError> {
        let creds = Credentials {
            username: username.to_string(),
            password_sha256: hash_password(password),
        };
        let data =
            serde_json::to_vec(&creds).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        std::fs::write(&self.path, data).map_err(|e| ConfigError::Io(e.to_string()))?;

        if let Ok(mut guard) = self.cached.write() {
            *guard = Some(creds);
        }
        Ok(())
    }

    pub fn verify(&self, username: &str, password: &str) -> bool {
        let creds = self.credentials();
        !creds.username.is_empty()
            && creds.username == username
            && creds.password_sha256 == hash_password(password)
    }
}

fn hash_password(password: &str) -> String {
    format!("{:x}", Sha256::digest(password.as_bytes()))
}
