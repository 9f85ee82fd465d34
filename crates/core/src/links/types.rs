//! Types for the link cache.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Identifies one file of one torrent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LinkKey {
    pub torrent_id: String,
    pub path: String,
}

impl LinkKey {
    pub fn new(torrent_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            torrent_id: torrent_id.into(),
            path: path.into(),
        }
    }
}

impl std::fmt::Display for LinkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.torrent_id, self.path)
    }
}

/// A minted download URL and its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedLink {
    pub url: String,
    pub provider: String,
    /// Download key the link was minted with.
    #[serde(skip)]
    pub download_key: String,
    pub obtained_at: DateTime<Utc>,
    /// Never served at or after this instant.
    pub expires_at: DateTime<Utc>,
    /// Due for a refresh from this instant: one refresh interval before
    /// `expires_at`, never before `obtained_at`.
    pub refresh_due_at: DateTime<Utc>,
}

impl CachedLink {
    pub fn new(
        url: String,
        provider: String,
        download_key: String,
        obtained_at: DateTime<Utc>,
        expire_after: Duration,
        refresh_interval: Duration,
    ) -> Self {
        let expires_at = obtained_at + to_chrono(expire_after);
        let refresh_due_at = expires_at
            .checked_sub_signed(to_chrono(refresh_interval))
            .unwrap_or(obtained_at)
            .max(obtained_at);
        Self {
            url,
            provider,
            download_key,
            obtained_at,
            expires_at,
            refresh_due_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_refresh_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.refresh_due_at
    }

    /// Usable and not yet due for refresh.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        !self.is_refresh_due(now) && !self.is_expired(now)
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}
