use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use debridfs_core::{EngineError, EngineStatus, RepairTask, SanitizedConfig};

use crate::metrics::{collect_dynamic_metrics, encode_metrics};
use crate::state::AppState;

/// Recent repairs included in the status response.
const STATUS_RECENT_REPAIRS: usize = 10;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Stable upstream error code, when the failure came from a provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

/// Map an engine error onto its HTTP status and JSON body.
pub fn engine_error(err: EngineError) -> ApiError {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let code = match &err {
        EngineError::Debrid(e) => Some(e.code()),
        _ => None,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code,
        }),
    )
}

#[derive(Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub engine: EngineStatus,
    pub recent_repairs: Vec<RepairTask>,
}

#[derive(Debug, Deserialize)]
pub struct SetupRequest {
    pub username: String,
    pub password: String,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<SanitizedConfig> {
    Json(state.sanitized_config())
}

/// GET /api/v1/status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let engine = state.engine();
    Json(StatusResponse {
        engine: engine.status().await,
        recent_repairs: engine.repair_recent(STATUS_RECENT_REPAIRS),
    })
}

/// GET /api/v1/metrics
pub async fn get_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    collect_dynamic_metrics(&state).await;
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        encode_metrics(),
    )
}

/// POST /api/v1/auth/setup
///
/// Set the API credentials. Only allowed while none are configured.
pub async fn setup_auth(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SetupRequest>,
) -> Result<StatusCode, ApiError> {
    if !state.auth().needs_setup() {
        return Err((
            StatusCode::CONFLICT,
            Json(ErrorResponse::new("credentials are already configured")),
        ));
    }
    if request.username.trim().is_empty() || request.password.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("username and password are required")),
        ));
    }
    state
        .auth()
        .save(request.username.trim(), &request.password)
        .map_err(|e| {
            error!("Failed to save credentials: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new(e.to_string())),
            )
        })?;
    info!("API credentials configured for {}", request.username.trim());
    Ok(StatusCode::CREATED)
}
