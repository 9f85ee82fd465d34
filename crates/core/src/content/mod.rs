//! Byte access to link hosts.
//!
//! Everything that reads file content from a minted URL goes through
//! [`ContentSource`], so tests can swap the network for a fake.

mod http;

pub use http::HttpContentSource;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::provider::DebridError;

/// An inclusive byte range as sent in a `Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    /// Last byte, inclusive. `None` reads to the end.
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    /// Parse a single `bytes=start-[end]` range. Suffix and multi-range
    /// forms are not supported and yield `None`.
    pub fn parse(header: &str) -> Option<Self> {
        let spec = header.trim().strip_prefix("bytes=")?;
        if spec.contains(',') {
            return None;
        }
        let (start, end) = spec.split_once('-')?;
        let start: u64 = start.trim().parse().ok()?;
        let end = match end.trim() {
            "" => None,
            end => Some(end.parse::<u64>().ok()?),
        };
        if matches!(end, Some(end) if end < start) {
            return None;
        }
        Some(Self { start, end })
    }

    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }

    /// Number of bytes covered within a file of `size` bytes.
    pub fn len_within(&self, size: u64) -> u64 {
        if self.start >= size {
            return 0;
        }
        let last = self.end.map_or(size - 1, |e| e.min(size - 1));
        last - self.start + 1
    }
}

/// An open byte stream from a link host.
pub struct ContentStream {
    /// Full size of the resource, when the host reports it.
    pub total_size: Option<u64>,
    pub content_length: Option<u64>,
    /// `Content-Range` value for partial responses.
    pub content_range: Option<String>,
    pub partial: bool,
    pub body: BoxStream<'static, Result<Bytes, DebridError>>,
}

impl std::fmt::Debug for ContentStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStream")
            .field("total_size", &self.total_size)
            .field("content_length", &self.content_length)
            .field("content_range", &self.content_range)
            .field("partial", &self.partial)
            .finish_non_exhaustive()
    }
}

/// Opens and checks minted URLs.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Open `url`, optionally at a byte range. Never buffers the body.
    async fn open(&self, url: &str, range: Option<ByteRange>) -> Result<ContentStream, DebridError>;

    /// Check that `url` still serves content without reading the body.
    async fn probe(&self, url: &str) -> Result<(), DebridError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range() {
        assert_eq!(ByteRange::parse("bytes=0-99"), Some(ByteRange::new(0, Some(99))));
        assert_eq!(ByteRange::parse("bytes=100-"), Some(ByteRange::new(100, None)));
        assert_eq!(ByteRange::parse("bytes=-500"), None);
        assert_eq!(ByteRange::parse("bytes=0-1,5-6"), None);
        assert_eq!(ByteRange::parse("bytes=9-3"), None);
        assert_eq!(ByteRange::parse("items=0-1"), None);
    }

    #[test]
    fn test_header_value_and_len() {
        let range = ByteRange::new(10, Some(19));
        assert_eq!(range.header_value(), "bytes=10-19");
        assert_eq!(range.len_within(100), 10);
        assert_eq!(range.len_within(15), 5);
        assert_eq!(ByteRange::new(50, None).len_within(100), 50);
        assert_eq!(ByteRange::new(200, None).len_within(100), 0);
    }
}
