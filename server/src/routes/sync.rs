//! Sync endpoint routes.

use axum::{
    extract::State,
    routing::{get, post, put},
    Json, Router,
};
use branchsync_engine::SyncStatus;

use crate::error::Result;
use crate::handlers::{self, NetworkRequest, NetworkResponse, SyncResponse};
use crate::AppState;

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sync", post(sync_handler))
        .route("/sync/status", get(status_handler))
        .route("/sync/network", put(network_handler))
}

/// POST /sync - Drain the queue now.
async fn sync_handler(State(state): State<AppState>) -> Result<Json<SyncResponse>> {
    Ok(Json(handlers::handle_manual_sync(&state.ctx).await?))
}

/// GET /sync/status - Counts for the status badges.
async fn status_handler(State(state): State<AppState>) -> Result<Json<SyncStatus>> {
    Ok(Json(handlers::handle_status(&state.ctx).await?))
}

/// PUT /sync/network - Device network signal.
async fn network_handler(
    State(state): State<AppState>,
    Json(request): Json<NetworkRequest>,
) -> Json<NetworkResponse> {
    Json(handlers::handle_network(&state.ctx, request).await)
}
