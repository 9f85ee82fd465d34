use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::middleware::{auth_middleware, metrics_middleware};
use super::{fs, handlers, repair, torrents};
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let url_base = state
        .engine()
        .config()
        .url_base
        .trim_end_matches('/')
        .to_string();

    // Routes behind authentication
    let protected = Router::new()
        // Status and config
        .route("/status", get(handlers::get_status))
        .route("/config", get(handlers::get_config))
        // Torrents
        .route("/torrents", get(torrents::list_torrents))
        .route(
            "/torrents/{id}",
            get(torrents::get_torrent).delete(torrents::delete_torrent),
        )
        .route("/torrents/add/magnet", post(torrents::add_magnet))
        // Repair
        .route("/repair/recent", get(repair::recent))
        .route("/repair/{id}", post(repair::trigger))
        // Filesystem
        .route("/fs", get(fs::get_root))
        .route("/fs/", get(fs::get_root))
        .route("/fs/{*path}", get(fs::get_path))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth_middleware,
        ));

    let api_routes = Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::get_metrics))
        .route("/auth/setup", post(handlers::setup_auth))
        .merge(protected)
        .with_state(state);

    let app = Router::new().nest("/api/v1", api_routes);
    let app = if url_base.is_empty() {
        app
    } else {
        Router::new().nest(&url_base, app)
    };

    app.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .layer(middleware::from_fn(metrics_middleware)),
    )
}
