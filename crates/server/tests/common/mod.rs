//! Common test utilities for API testing with mocks.
//!
//! This module provides a test fixture that builds the router around a real
//! engine wired to a mock provider and a mock link host, so requests run
//! in-process without network access.

#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use debridfs_core::{
    testing::{MockContentSource, MockDebridClient},
    Config, ContentSource, DebridClient, Engine,
};
use debridfs_server::state::AppState;

/// Re-export fixtures for test convenience
pub use debridfs_core::testing::fixtures;

/// Test fixture for API testing with mock dependencies.
///
/// # Example
///
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_listing() {
///     let fixture = TestFixture::new().await;
///     fixture.add_torrent(fixtures::torrent("T1", "rd", &[("a.mkv", 16)])).await;
///
///     let response = fixture.get("/api/v1/fs/__all__").await;
///     assert_eq!(response.status, 200);
/// }
/// ```
pub struct TestFixture {
    /// The Axum router for testing
    pub router: Router,
    pub engine: Arc<Engine>,
    /// Mock provider - seed torrents and inject failures
    pub client: Arc<MockDebridClient>,
    /// Mock link host - controls file bytes and dead links
    pub content: Arc<MockContentSource>,
    /// Holds config.json, auth.json and torrents.json
    pub temp_dir: TempDir,
}

/// Response from a test request
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
    pub bytes: Vec<u8>,
}

impl TestFixture {
    /// Create a new test fixture with default configuration.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test fixture after adjusting the configuration.
    pub async fn with_config(tune: impl FnOnce(&mut Config)) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let mut config = fixtures::config(&["rd"]);
        config.path = temp_dir.path().to_path_buf();
        tune(&mut config);

        let client = Arc::new(MockDebridClient::new("rd"));
        let content = Arc::new(MockContentSource::new());
        let engine = Arc::new(
            Engine::new(
                config,
                vec![Arc::clone(&client) as Arc<dyn DebridClient>],
                Arc::clone(&content) as Arc<dyn ContentSource>,
            )
            .expect("Failed to create engine"),
        );

        let state = Arc::new(AppState::new(Arc::clone(&engine)));
        let router = debridfs_server::api::create_router(state);

        Self {
            router,
            engine,
            client,
            content,
            temp_dir,
        }
    }

    /// Add a torrent upstream and sync it into the store.
    pub async fn add_torrent(&self, torrent: debridfs_core::Torrent) {
        self.client.add_torrent(torrent).await;
        self.engine.sync_now().await;
    }

    /// Send a GET request to the test server.
    pub async fn get(&self, path: &str) -> TestResponse {
        self.request("GET", path, None, &[]).await
    }

    /// Send a GET request with extra headers.
    pub async fn get_with_headers(&self, path: &str, headers: &[(&str, &str)]) -> TestResponse {
        self.request("GET", path, None, headers).await
    }

    /// Send a POST request with JSON body.
    pub async fn post(&self, path: &str, body: Value) -> TestResponse {
        self.request("POST", path, Some(body), &[]).await
    }

    /// Send a POST request without a body.
    pub async fn post_empty(&self, path: &str) -> TestResponse {
        self.request("POST", path, None, &[]).await
    }

    /// Send a DELETE request.
    pub async fn delete(&self, path: &str) -> TestResponse {
        self.request("DELETE", path, None, &[]).await
    }

    /// Send a request to the test server.
    pub async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> TestResponse {
        let mut request_builder = Request::builder().method(method).uri(path);
        for (name, value) in headers {
            request_builder = request_builder.header(*name, *value);
        }

        let body = if let Some(json_body) = body {
            request_builder = request_builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&json_body).unwrap())
        } else {
            Body::empty()
        };

        let request = request_builder.body(body).unwrap();

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes()
            .to_vec();

        let body: Value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };

        TestResponse {
            status,
            headers,
            body,
            bytes,
        }
    }
}
