//! Virtual filesystem over HTTP.
//!
//! Directories answer with a JSON listing. Files are proxied from the link
//! host as a byte stream, honouring a single `Range`.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use debridfs_core::{ByteRange, DirEntry, EngineError};

use super::handlers::{engine_error, ApiError, ErrorResponse};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ListingResponse {
    pub path: String,
    pub entries: Vec<DirEntry>,
    pub count: usize,
}

/// GET /api/v1/fs/
pub async fn get_root(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    serve(&state, "/".to_string(), &HeaderMap::new()).await
}

/// GET /api/v1/fs/{*path}
pub async fn get_path(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    serve(&state, format!("/{}", path.trim_end_matches('/')), &headers).await
}

async fn serve(state: &AppState, path: String, headers: &HeaderMap) -> Result<Response, ApiError> {
    let vfs = state.engine().vfs();
    let entry = vfs
        .stat(&path)
        .map_err(|e| engine_error(EngineError::from(e)))?;

    if entry.is_dir {
        let listing = vfs
            .list_directory(&path)
            .map_err(|e| engine_error(EngineError::from(e)))?;
        let entries: Vec<DirEntry> = listing.iter().collect();
        let count = entries.len();
        return Ok(Json(ListingResponse {
            path,
            entries,
            count,
        })
        .into_response());
    }

    // Unsupported range forms are ignored and the whole file is served.
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(ByteRange::parse);
    if let Some(range) = range {
        if entry.size > 0 && range.start >= entry.size {
            return Ok((
                StatusCode::RANGE_NOT_SATISFIABLE,
                [(header::CONTENT_RANGE, format!("bytes */{}", entry.size))],
            )
                .into_response());
        }
    }

    let file = vfs
        .open_file(&path, range)
        .await
        .map_err(|e| engine_error(EngineError::from(e)))?;

    let status = if file.partial {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::ACCEPT_RANGES, "bytes")
        .header(
            header::LAST_MODIFIED,
            file.modified
                .format("%a, %d %b %Y %H:%M:%S GMT")
                .to_string(),
        );
    if let Some(length) = file.content_length {
        builder = builder.header(header::CONTENT_LENGTH, length);
    }
    if let Some(content_range) = &file.content_range {
        builder = builder.header(header::CONTENT_RANGE, content_range.as_str());
    }

    builder.body(Body::from_stream(file.stream)).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new(e.to_string())),
        )
    })
}
