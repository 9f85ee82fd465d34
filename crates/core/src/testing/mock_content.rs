//! Mock content source for testing.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tokio::sync::RwLock;

use crate::content::{ByteRange, ContentSource, ContentStream};
use crate::provider::DebridError;

/// A recorded open call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedOpen {
    pub url: String,
    pub range: Option<ByteRange>,
}

/// Mock implementation of the ContentSource trait.
///
/// Every URL serves the same body. URLs containing a "broken" pattern fail
/// with `LinkBroken`, both on open and on probe.
///
/// # Example
///
/// ```rust,ignore
/// let content = MockContentSource::new();
/// content.set_body(b"hello world".to_vec()).await;
///
/// // Every URL minted for T1/a.mkv is now dead
/// content.break_urls("/T1/a.mkv").await;
///
/// // Only the next open fails
/// content.fail_next_open(DebridError::LinkBroken("gone".into())).await;
/// ```
#[derive(Debug)]
pub struct MockContentSource {
    body: Arc<RwLock<Bytes>>,
    broken: Arc<RwLock<Vec<String>>>,
    next_open_error: Arc<RwLock<Option<DebridError>>>,
    opens: Arc<RwLock<Vec<RecordedOpen>>>,
    probes: Arc<RwLock<Vec<String>>>,
}

impl Default for MockContentSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MockContentSource {
    pub fn new() -> Self {
        Self {
            body: Arc::new(RwLock::new(Bytes::from_static(b"0123456789abcdef"))),
            broken: Arc::new(RwLock::new(Vec::new())),
            next_open_error: Arc::new(RwLock::new(None)),
            opens: Arc::new(RwLock::new(Vec::new())),
            probes: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn set_body(&self, body: Vec<u8>) {
        *self.body.write().await = Bytes::from(body);
    }

    /// Make every URL containing `pattern` fail with LinkBroken.
    pub async fn break_urls(&self, pattern: &str) {
        self.broken.write().await.push(pattern.to_string());
    }

    /// Undo every `break_urls`.
    pub async fn heal_all(&self) {
        self.broken.write().await.clear();
    }

    pub async fn fail_next_open(&self, error: DebridError) {
        *self.next_open_error.write().await = Some(error);
    }

    pub async fn opens(&self) -> Vec<RecordedOpen> {
        self.opens.read().await.clone()
    }

    pub async fn probes(&self) -> Vec<String> {
        self.probes.read().await.clone()
    }

    async fn check(&self, url: &str) -> Result<(), DebridError> {
        if self.broken.read().await.iter().any(|p| url.contains(p)) {
            return Err(DebridError::LinkBroken(format!("{} returned 404", url)));
        }
        Ok(())
    }
}

#[async_trait]
impl ContentSource for MockContentSource {
    async fn open(&self, url: &str, range: Option<ByteRange>) -> Result<ContentStream, DebridError> {
        self.opens.write().await.push(RecordedOpen {
            url: url.to_string(),
            range,
        });
        if let Some(error) = self.next_open_error.write().await.take() {
            return Err(error);
        }
        self.check(url).await?;

        let body = self.body.read().await.clone();
        let size = body.len() as u64;
        let (slice, content_range) = match range {
            Some(range) => {
                let len = range.len_within(size);
                let start = range.start.min(size);
                let end = start + len;
                let content_range = if len == 0 {
                    format!("bytes */{}", size)
                } else {
                    format!("bytes {}-{}/{}", start, end - 1, size)
                };
                (body.slice(start as usize..end as usize), Some(content_range))
            }
            None => (body, None),
        };

        Ok(ContentStream {
            total_size: Some(size),
            content_length: Some(slice.len() as u64),
            partial: content_range.is_some(),
            content_range,
            body: stream::iter(vec![Ok(slice)]).boxed(),
        })
    }

    async fn probe(&self, url: &str) -> Result<(), DebridError> {
        self.probes.write().await.push(url.to_string());
        self.check(url).await
    }
}
