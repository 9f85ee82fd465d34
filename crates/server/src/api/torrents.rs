//! Torrent API handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use debridfs_core::{Torrent, TorrentStatus};

use super::handlers::{engine_error, ApiError, ErrorResponse};
use super::middleware::AuthUser;
use crate::state::AppState;

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AddMagnetRequest {
    pub uri: String,
}

#[derive(Debug, Serialize)]
pub struct AddTorrentResponse {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub status: TorrentStatus,
}

#[derive(Debug, Serialize)]
pub struct TorrentListResponse {
    pub torrents: Vec<Torrent>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub message: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/v1/torrents
///
/// List every stored torrent, ordered by name.
pub async fn list_torrents(State(state): State<Arc<AppState>>) -> Json<TorrentListResponse> {
    let torrents: Vec<Torrent> = state
        .engine()
        .list_torrents()
        .iter()
        .map(|t| t.as_ref().clone())
        .collect();
    let count = torrents.len();
    Json(TorrentListResponse { torrents, count })
}

/// GET /api/v1/torrents/{id}
pub async fn get_torrent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Torrent>, ApiError> {
    match state.engine().get_torrent(&id) {
        Some(torrent) => Ok(Json(torrent.as_ref().clone())),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(format!("Torrent not found: {}", id))),
        )),
    }
}

/// DELETE /api/v1/torrents/{id}
///
/// Remove the torrent upstream and from the store.
pub async fn delete_torrent(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let torrent = state
        .engine()
        .delete_torrent(&id)
        .await
        .map_err(engine_error)?;
    info!("Torrent {} ({}) deleted by {}", id, torrent.name, user);
    Ok(Json(SuccessResponse {
        message: format!("Deleted {}", torrent.name),
    }))
}

/// POST /api/v1/torrents/add/magnet
pub async fn add_magnet(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(request): Json<AddMagnetRequest>,
) -> Result<(StatusCode, Json<AddTorrentResponse>), ApiError> {
    if !request.uri.starts_with("magnet:") {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("uri must be a magnet link")),
        ));
    }

    let torrent = state
        .engine()
        .submit_magnet(&request.uri)
        .await
        .map_err(engine_error)?;
    info!(
        "Magnet for {} submitted by {} to {}",
        torrent.name, user, torrent.provider
    );
    Ok((
        StatusCode::CREATED,
        Json(AddTorrentResponse {
            id: torrent.id.clone(),
            name: torrent.name.clone(),
            provider: torrent.provider.clone(),
            status: torrent.status,
        }),
    ))
}
