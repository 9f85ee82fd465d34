//! Repair API handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use debridfs_core::{RepairStatus, RepairTask};

use super::handlers::{engine_error, ApiError};
use super::middleware::AuthUser;
use crate::state::AppState;

const DEFAULT_RECENT_LIMIT: usize = 50;

#[derive(Debug, Deserialize)]
pub struct RecentParams {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RecentRepairsResponse {
    pub tasks: Vec<RepairTask>,
    pub count: usize,
    pub status: RepairStatus,
}

#[derive(Debug, Serialize)]
pub struct RepairQueuedResponse {
    pub torrent_id: String,
    pub message: String,
}

/// POST /api/v1/repair/{id}
///
/// Queue a manual repair. Progress shows up in the recent list.
pub async fn trigger(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<RepairQueuedResponse>), ApiError> {
    state.engine().trigger_repair(&id).map_err(engine_error)?;
    info!("Repair of {} requested by {}", id, user);
    Ok((
        StatusCode::ACCEPTED,
        Json(RepairQueuedResponse {
            torrent_id: id,
            message: "repair queued".to_string(),
        }),
    ))
}

/// GET /api/v1/repair/recent
pub async fn recent(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RecentParams>,
) -> Json<RecentRepairsResponse> {
    let engine = state.engine();
    let tasks = engine.repair_recent(params.limit.unwrap_or(DEFAULT_RECENT_LIMIT));
    let count = tasks.len();
    Json(RecentRepairsResponse {
        tasks,
        count,
        status: engine.repair_status(),
    })
}
