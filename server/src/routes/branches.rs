//! Branch endpoint routes.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use branchsync_engine::{LocalId, Record};
use serde_json::Value;

use crate::error::Result;
use crate::handlers::{self, ResubmitResponse};
use crate::AppState;

/// Create branch routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/branches", get(list_handler).post(create_handler))
        .route(
            "/branches/{id}",
            get(get_handler).put(update_handler).delete(delete_handler),
        )
        .route("/branches/{id}/resubmit", post(resubmit_handler))
}

/// GET /branches
async fn list_handler(State(state): State<AppState>) -> Result<Json<Vec<Record>>> {
    Ok(Json(handlers::list_branches(&state.ctx).await?))
}

/// POST /branches
async fn create_handler(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<Record>)> {
    let record = handlers::create_branch(&state.ctx, payload).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// GET /branches/{id}
async fn get_handler(
    State(state): State<AppState>,
    Path(id): Path<LocalId>,
) -> Result<Json<Record>> {
    Ok(Json(handlers::get_branch(&state.ctx, id).await?))
}

/// PUT /branches/{id}
async fn update_handler(
    State(state): State<AppState>,
    Path(id): Path<LocalId>,
    Json(payload): Json<Value>,
) -> Result<Json<Record>> {
    Ok(Json(handlers::update_branch(&state.ctx, id, payload).await?))
}

/// DELETE /branches/{id}
async fn delete_handler(
    State(state): State<AppState>,
    Path(id): Path<LocalId>,
) -> Result<StatusCode> {
    handlers::delete_branch(&state.ctx, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /branches/{id}/resubmit
async fn resubmit_handler(
    State(state): State<AppState>,
    Path(id): Path<LocalId>,
) -> Result<Json<ResubmitResponse>> {
    Ok(Json(handlers::resubmit_branch(&state.ctx, id).await?))
}
