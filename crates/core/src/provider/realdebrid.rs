//! Real-Debrid client implementation.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::types::{DebridClient, DebridError};
use crate::config::ProviderSettings;
use crate::store::{Torrent, TorrentFile, TorrentStatus, TorrentSummary};

pub const DEFAULT_API_URL: &str = "https://api.real-debrid.com/rest/1.0";

/// Page size used when listing torrents.
const LIST_PAGE_SIZE: usize = 1000;

/// Attempts to wait for a freshly added magnet to finish converting.
const CONVERSION_POLLS: usize = 10;

/// Real-Debrid REST client.
pub struct RealDebridClient {
    client: Client,
    name: String,
    api_key: String,
    base_url: String,
    conversion_poll_interval: Duration,
}

impl RealDebridClient {
    /// Create a new client for a configured provider.
    pub fn new(settings: &ProviderSettings) -> Result<Self, DebridError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| DebridError::Api(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            name: settings.name.clone(),
            api_key: settings.api_key.clone(),
            base_url: settings
                .api_url
                .clone()
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            conversion_poll_interval: Duration::from_secs(1),
        })
    }

    /// Get the base URL without trailing slash.
    fn base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    fn get(&self, endpoint: &str) -> RequestBuilder {
        self.client
            .get(format!("{}{}", self.base_url(), endpoint))
            .bearer_auth(&self.api_key)
    }

    fn post(&self, endpoint: &str) -> RequestBuilder {
        self.client
            .post(format!("{}{}", self.base_url(), endpoint))
            .bearer_auth(&self.api_key)
    }

    /// Send a request and turn any non-success response into a [`DebridError`].
    async fn send(&self, request: RequestBuilder) -> Result<Response, DebridError> {
        let response = request.send().await.map_err(map_transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(parse_error(status, &body))
    }

    async fn torrent_info(&self, id: &str) -> Result<RdTorrent, DebridError> {
        let response = self
            .send(self.get(&format!("/torrents/info/{}", id)))
            .await
            .map_err(|e| match e {
                DebridError::LinkBroken(_) => DebridError::TorrentNotFound(id.to_string()),
                other => other,
            })?;
        response
            .json::<RdTorrent>()
            .await
            .map_err(|e| DebridError::Api(format!("invalid torrent info: {}", e)))
    }

    async fn add_magnet_raw(&self, magnet: &str) -> Result<String, DebridError> {
        let response = self
            .send(self.post("/torrents/addMagnet").form(&[("magnet", magnet)]))
            .await?;
        let added: RdAddMagnet = response
            .json()
            .await
            .map_err(|e| DebridError::Api(format!("invalid addMagnet response: {}", e)))?;
        debug!("Added magnet to {} as {}", self.name, added.id);
        Ok(added.id)
    }

    /// Wait until the provider has resolved the magnet's file list.
    async fn wait_for_files(&self, id: &str) -> Result<RdTorrent, DebridError> {
        for _ in 0..CONVERSION_POLLS {
            let info = self.torrent_info(id).await?;
            if info.status != "magnet_conversion" {
                return Ok(info);
            }
            tokio::time::sleep(self.conversion_poll_interval).await;
        }
        Err(DebridError::ProviderUnavailable(format!(
            "magnet {} is still converting",
            id
        )))
    }

    async fn select_files(&self, id: &str, files: &str) -> Result<(), DebridError> {
        self.send(
            self.post(&format!("/torrents/selectFiles/{}", id))
                .form(&[("files", files)]),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DebridClient for RealDebridClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_torrents(&self) -> Result<Vec<TorrentSummary>, DebridError> {
        let mut summaries = Vec::new();
        let mut page = 1;
        loop {
            let response = self
                .send(self.get("/torrents").query(&[
                    ("page", page.to_string()),
                    ("limit", LIST_PAGE_SIZE.to_string()),
                ]))
                .await?;

            if response.status() == StatusCode::NO_CONTENT {
                break;
            }

            let batch: Vec<RdTorrent> = response
                .json()
                .await
                .map_err(|e| DebridError::Api(format!("invalid torrent list: {}", e)))?;
            let count = batch.len();
            summaries.extend(batch.into_iter().map(RdTorrent::into_summary));

            if count < LIST_PAGE_SIZE {
                break;
            }
            page += 1;
        }
        Ok(summaries)
    }

    async fn get_torrent(&self, id: &str) -> Result<Torrent, DebridError> {
        let info = self.torrent_info(id).await?;
        Ok(info.into_torrent(&self.name))
    }

    async fn mint_link(
        &self,
        torrent: &Torrent,
        file: &TorrentFile,
        key: &str,
    ) -> Result<String, DebridError> {
        let link = file.source.as_deref().ok_or_else(|| {
            DebridError::LinkBroken(format!("{}/{} has no hoster link", torrent.id, file.path))
        })?;

        let request = self
            .client
            .post(format!("{}/unrestrict/link", self.base_url()))
            .bearer_auth(key)
            .form(&[("link", link)]);
        let unrestricted: RdUnrestrict = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(|e| DebridError::Api(format!("invalid unrestrict response: {}", e)))?;

        Ok(unrestricted.download)
    }

    async fn delete_torrent(&self, id: &str) -> Result<(), DebridError> {
        let request = self
            .client
            .delete(format!("{}/torrents/delete/{}", self.base_url(), id))
            .bearer_auth(&self.api_key);
        self.send(request).await.map_err(|e| match e {
            DebridError::LinkBroken(_) => DebridError::TorrentNotFound(id.to_string()),
            other => other,
        })?;
        info!("Deleted torrent {} from {}", id, self.name);
        Ok(())
    }

    async fn add_magnet(&self, magnet: &str) -> Result<Torrent, DebridError> {
        let id = self.add_magnet_raw(magnet).await?;
        let info = self.wait_for_files(&id).await?;
        if info.status == "waiting_files_selection" {
            self.select_files(&id, "all").await?;
        }
        self.get_torrent(&id).await
    }

    async fn reinsert(
        &self,
        torrent: &Torrent,
        files: Option<&[String]>,
    ) -> Result<Torrent, DebridError> {
        let wanted: HashSet<&str> = match files {
            Some(paths) => paths.iter().map(String::as_str).collect(),
            None => torrent.files.iter().map(|f| f.path.as_str()).collect(),
        };

        let new_id = self.add_magnet_raw(&torrent.magnet()).await?;
        let info = self.wait_for_files(&new_id).await?;

        let ids: Vec<String> = info
            .files
            .iter()
            .filter(|f| wanted.contains(f.relative_path()))
            .map(|f| f.id.to_string())
            .collect();
        if ids.is_empty() {
            let _ = self.delete_torrent(&new_id).await;
            return Err(DebridError::Api(format!(
                "reinserted torrent {} has none of the requested files",
                torrent.id
            )));
        }

        if info.status == "waiting_files_selection" {
            self.select_files(&new_id, &ids.join(",")).await?;
        }

        let reinserted = self.get_torrent(&new_id).await?;
        if reinserted.status == TorrentStatus::Error {
            let _ = self.delete_torrent(&new_id).await;
            return Err(DebridError::Api(format!(
                "reinserted torrent {} failed upstream",
                torrent.id
            )));
        }

        if files.is_none() && new_id != torrent.id {
            match self.delete_torrent(&torrent.id).await {
                Ok(()) | Err(DebridError::TorrentNotFound(_)) => {}
                Err(e) => warn!("Failed to delete old torrent {}: {}", torrent.id, e),
            }
        }

        Ok(reinserted)
    }

    async fn available_slots(&self) -> Result<usize, DebridError> {
        let count: RdActiveCount = self
            .send(self.get("/torrents/activeCount"))
            .await?
            .json()
            .await
            .map_err(|e| DebridError::Api(format!("invalid activeCount response: {}", e)))?;
        Ok(count.limit.saturating_sub(count.nb))
    }
}

fn map_transport_error(e: reqwest::Error) -> DebridError {
    if e.is_timeout() {
        DebridError::Timeout
    } else if e.is_connect() {
        DebridError::ProviderUnavailable(e.to_string())
    } else {
        DebridError::Api(e.to_string())
    }
}

/// Map an error response onto [`DebridError`], using the vendor error code
/// when the body carries one.
fn parse_error(status: StatusCode, body: &str) -> DebridError {
    match serde_json::from_str::<RdError>(body) {
        Ok(err) => DebridError::from_status(
            status.as_u16(),
            err.error_code.map(error_code_name).unwrap_or(""),
            &err.error,
        ),
        Err(_) => DebridError::from_status(status.as_u16(), "", ""),
    }
}

/// Real-Debrid numeric error codes.
fn error_code_name(code: i64) -> &'static str {
    match code {
        5 | 34 => "too_many_requests",
        7 => "unknown_resource",
        8 | 9 => "bad_token",
        17 | 19 | 25 => "hoster_unavailable",
        21 => "too_many_active_downloads",
        23 | 36 => "traffic_exceeded",
        24 | 35 => "file_unavailable",
        _ => "",
    }
}

fn parse_rd_status(status: &str) -> TorrentStatus {
    match status {
        "downloaded" => TorrentStatus::Cached,
        "error" | "magnet_error" | "virus" | "dead" => TorrentStatus::Error,
        _ => TorrentStatus::Downloading,
    }
}

/// Real-Debrid torrent, as returned by both the list and info endpoints.
#[derive(Debug, Deserialize)]
struct RdTorrent {
    id: String,
    filename: String,
    #[serde(default)]
    hash: String,
    #[serde(default)]
    bytes: u64,
    status: String,
    #[serde(default)]
    added: Option<String>,
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    links: Vec<String>,
    #[serde(default)]
    files: Vec<RdFile>,
}

impl RdTorrent {
    fn added_at(&self) -> DateTime<Utc> {
        self.added
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now)
    }

    fn into_summary(self) -> TorrentSummary {
        TorrentSummary {
            added_at: self.added_at(),
            status: parse_rd_status(&self.status),
            id: self.id,
            name: self.filename,
            hash: self.hash.to_lowercase(),
            size: self.bytes,
            progress: self.progress / 100.0,
        }
    }

    /// Convert to a store torrent. Hoster links are paired with the selected
    /// files in file id order.
    fn into_torrent(self, provider: &str) -> Torrent {
        let added_at = self.added_at();
        let status = parse_rd_status(&self.status);

        let mut selected: Vec<&RdFile> = self.files.iter().filter(|f| f.selected == 1).collect();
        selected.sort_by_key(|f| f.id);
        let links_complete = selected.len() == self.links.len();

        let files = selected
            .iter()
            .enumerate()
            .map(|(i, f)| TorrentFile {
                path: f.relative_path().to_string(),
                size: f.bytes,
                file_id: f.id.to_string(),
                source: if links_complete {
                    self.links.get(i).cloned()
                } else {
                    None
                },
            })
            .collect();

        Torrent {
            id: self.id,
            name: self.filename,
            provider: provider.to_string(),
            hash: self.hash.to_lowercase(),
            status,
            size: self.bytes,
            progress: self.progress / 100.0,
            added_at,
            updated_at: Utc::now(),
            files,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RdFile {
    id: u64,
    path: String,
    bytes: u64,
    #[serde(default)]
    selected: u8,
}

impl RdFile {
    fn relative_path(&self) -> &str {
        self.path.trim_start_matches('/')
    }
}

#[derive(Debug, Deserialize)]
struct RdAddMagnet {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RdUnrestrict {
    download: String,
}

#[derive(Debug, Deserialize)]
struct RdActiveCount {
    nb: usize,
    limit: usize,
}

#[derive(Debug, Deserialize)]
struct RdError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_code: Option<i64>,
}
