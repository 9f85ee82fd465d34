//! reqwest-backed content source.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use tracing::debug;

use super::{ByteRange, ContentSource, ContentStream};
use crate::provider::DebridError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpContentSource {
    client: Client,
}

impl HttpContentSource {
    pub fn new() -> Result<Self, DebridError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| DebridError::Api(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

/// Map a link host status onto the error taxonomy.
fn status_error(status: StatusCode, url: &str) -> DebridError {
    match status.as_u16() {
        404 | 410 => DebridError::LinkBroken(format!("{} returned {}", url, status)),
        429 | 509 => DebridError::TrafficExceeded(format!("{} returned {}", url, status)),
        503 => DebridError::ProviderUnavailable(format!("{} returned {}", url, status)),
        408 | 504 => DebridError::Timeout,
        _ => DebridError::Api(format!("{} returned {}", url, status)),
    }
}

fn transport_error(e: reqwest::Error) -> DebridError {
    if e.is_timeout() {
        DebridError::Timeout
    } else if e.is_connect() {
        DebridError::ProviderUnavailable(e.to_string())
    } else {
        DebridError::Api(e.to_string())
    }
}

/// Total size from `Content-Range: bytes a-b/total`.
fn total_from_content_range(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

#[async_trait]
impl ContentSource for HttpContentSource {
    async fn open(&self, url: &str, range: Option<ByteRange>) -> Result<ContentStream, DebridError> {
        let mut request = self.client.get(url);
        if let Some(range) = range {
            request = request.header(header::RANGE, range.header_value());
        }
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, url));
        }

        let content_range = response
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_length = response.content_length();
        let partial = status == StatusCode::PARTIAL_CONTENT;
        let total_size = match &content_range {
            Some(value) => total_from_content_range(value),
            None if !partial => content_length,
            None => None,
        };
        debug!(
            "Opened {} (status {}, length {:?})",
            url, status, content_length
        );

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(transport_error))
            .boxed();
        Ok(ContentStream {
            total_size,
            content_length,
            content_range,
            partial,
            body,
        })
    }

    async fn probe(&self, url: &str) -> Result<(), DebridError> {
        // Hosts vary in HEAD support; a one-byte ranged GET works everywhere.
        let response = self
            .client
            .get(url)
            .header(header::RANGE, "bytes=0-0")
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(status_error(status, url))
        }
    }
}
