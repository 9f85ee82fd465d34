//! Types for debrid provider operations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{Torrent, TorrentFile, TorrentSummary};

/// Errors that can occur during debrid provider operations.
///
/// Cloneable so a single upstream failure can be handed to every caller
/// waiting on the same request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DebridError {
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Traffic exceeded: {0}")]
    TrafficExceeded(String),

    #[error("Link broken: {0}")]
    LinkBroken(String),

    #[error("Torrent not found: {0}")]
    TorrentNotFound(String),

    #[error("File not found: {torrent_id}/{path}")]
    FileNotFound { torrent_id: String, path: String },

    #[error("No provider available")]
    NoProviderAvailable,

    #[error("Too many active downloads")]
    TooManyActiveDownloads,

    #[error("Rate limited: {provider} {budget} budget exhausted")]
    RateLimited { provider: String, budget: Budget },

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Request timeout")]
    Timeout,

    #[error("API error: {0}")]
    Api(String),
}

impl DebridError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            DebridError::ProviderUnavailable(_) => "hoster_unavailable",
            DebridError::TrafficExceeded(_) => "traffic_exceeded",
            DebridError::LinkBroken(_) => "file_unavailable",
            DebridError::TorrentNotFound(_) => "torrent_not_found",
            DebridError::FileNotFound { .. } => "file_not_found",
            DebridError::NoProviderAvailable => "no_provider_available",
            DebridError::TooManyActiveDownloads => "too_many_active_downloads",
            DebridError::RateLimited { .. } => "rate_limited",
            DebridError::UnknownProvider(_) => "unknown_provider",
            DebridError::AuthenticationFailed(_) => "authentication_failed",
            DebridError::Timeout => "timeout",
            DebridError::Api(_) => "api_error",
        }
    }

    /// HTTP status a client-facing surface reports for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            DebridError::ProviderUnavailable(_) => 503,
            DebridError::TrafficExceeded(_) => 503,
            DebridError::LinkBroken(_) => 404,
            DebridError::TorrentNotFound(_) | DebridError::FileNotFound { .. } => 404,
            DebridError::NoProviderAvailable => 503,
            DebridError::TooManyActiveDownloads => 509,
            DebridError::RateLimited { .. } => 429,
            DebridError::UnknownProvider(_) => 400,
            DebridError::AuthenticationFailed(_) => 502,
            DebridError::Timeout => 504,
            DebridError::Api(_) => 502,
        }
    }

    /// Whether trying again later can succeed without outside intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DebridError::ProviderUnavailable(_)
                | DebridError::TrafficExceeded(_)
                | DebridError::NoProviderAvailable
                | DebridError::TooManyActiveDownloads
                | DebridError::RateLimited { .. }
                | DebridError::Timeout
        )
    }

    /// Map an upstream HTTP status plus optional vendor error code onto the
    /// error taxonomy. The code wins when it is recognized.
    pub fn from_status(status: u16, code: &str, message: &str) -> Self {
        let message = if message.is_empty() {
            format!("HTTP {}", status)
        } else {
            message.to_string()
        };

        match code {
            "hoster_unavailable" | "service_unavailable" => {
                return DebridError::ProviderUnavailable(message)
            }
            "traffic_exceeded" | "too_many_requests" => {
                return DebridError::TrafficExceeded(message)
            }
            "file_unavailable" | "link_broken" => return DebridError::LinkBroken(message),
            "torrent_not_found" | "unknown_ressource" | "unknown_resource" => {
                return DebridError::TorrentNotFound(message)
            }
            "too_many_active_downloads" => return DebridError::TooManyActiveDownloads,
            "bad_token" | "permission_denied" => {
                return DebridError::AuthenticationFailed(message)
            }
            _ => {}
        }

        match status {
            401 | 403 => DebridError::AuthenticationFailed(message),
            404 | 410 => DebridError::LinkBroken(message),
            429 => DebridError::TrafficExceeded(message),
            503 => DebridError::ProviderUnavailable(message),
            509 => DebridError::TooManyActiveDownloads,
            408 | 504 => DebridError::Timeout,
            _ => DebridError::Api(message),
        }
    }
}

/// The rate budget a provider call draws from.
///
/// Also used as the intent when selecting a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Budget {
    /// Listing, info, add and delete calls.
    General,
    /// Minting download links.
    Download,
    /// Calls made on behalf of the repair engine.
    Repair,
}

impl Budget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Budget::General => "general",
            Budget::Download => "download",
            Budget::Repair => "repair",
        }
    }
}

impl std::fmt::Display for Budget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for debrid provider clients.
///
/// Implementations speak one vendor's API and translate its responses into
/// store types and [`DebridError`]. They do not rate limit; the pool does.
#[async_trait]
pub trait DebridClient: Send + Sync {
    /// Configured provider name.
    fn name(&self) -> &str;

    /// List every torrent on the account.
    async fn list_torrents(&self) -> Result<Vec<TorrentSummary>, DebridError>;

    /// Fetch one torrent with its file list.
    async fn get_torrent(&self, id: &str) -> Result<Torrent, DebridError>;

    /// Mint a time-limited download URL for `file` using download key `key`.
    async fn mint_link(
        &self,
        torrent: &Torrent,
        file: &TorrentFile,
        key: &str,
    ) -> Result<String, DebridError>;

    /// Delete a torrent from the account.
    async fn delete_torrent(&self, id: &str) -> Result<(), DebridError>;

    /// Add a magnet and select all of its files.
    async fn add_magnet(&self, magnet: &str) -> Result<Torrent, DebridError>;

    /// Re-submit a torrent so the provider refreshes its content.
    ///
    /// `files` limits the new torrent to those paths; `None` reinserts
    /// everything that was selected. Returns the torrent as the provider now
    /// reports it, which may carry a new id.
    async fn reinsert(
        &self,
        torrent: &Torrent,
        files: Option<&[String]>,
    ) -> Result<Torrent, DebridError>;

    /// Free active-download slots on the account.
    async fn available_slots(&self) -> Result<usize, DebridError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_prefers_vendor_code() {
        assert_eq!(
            DebridError::from_status(503, "traffic_exceeded", "quota"),
            DebridError::TrafficExceeded("quota".to_string())
        );
        assert_eq!(
            DebridError::from_status(400, "too_many_active_downloads", ""),
            DebridError::TooManyActiveDownloads
        );
    }

    #[test]
    fn test_from_status_falls_back_to_http_status() {
        assert_eq!(
            DebridError::from_status(404, "", ""),
            DebridError::LinkBroken("HTTP 404".to_string())
        );
        assert_eq!(
            DebridError::from_status(503, "", "down"),
            DebridError::ProviderUnavailable("down".to_string())
        );
        assert_eq!(
            DebridError::from_status(509, "", ""),
            DebridError::TooManyActiveDownloads
        );
        assert!(matches!(
            DebridError::from_status(500, "", "boom"),
            DebridError::Api(_)
        ));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(DebridError::ProviderUnavailable(String::new()).is_retryable());
        assert!(DebridError::Timeout.is_retryable());
        assert!(!DebridError::LinkBroken(String::new()).is_retryable());
        assert!(!DebridError::TorrentNotFound("x".to_string()).is_retryable());
    }

    #[test]
    fn test_codes_and_statuses() {
        let err = DebridError::TooManyActiveDownloads;
        assert_eq!(err.code(), "too_many_active_downloads");
        assert_eq!(err.status_code(), 509);
        assert_eq!(
            DebridError::ProviderUnavailable(String::new()).code(),
            "hoster_unavailable"
        );
        assert_eq!(DebridError::LinkBroken(String::new()).status_code(), 404);

        let err = DebridError::RateLimited {
            provider: "rd".to_string(),
            budget: Budget::Download,
        };
        assert_eq!(err.to_string(), "Rate limited: rd download budget exhausted");
    }
}
