//! Branchsync Server - HTTP and WebSocket front end for the branch sync engine.
//!
//! The server owns one [`SyncContext`] backed by SQLite tables and exposes
//! its operations to browser clients. Every engine state change is pushed to
//! connected WebSocket clients.

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod websocket;

use crate::websocket::ConnectionManager;
use axum::Router;
use branchsync_engine::SyncContext;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<SyncContext>,
    pub conn_manager: Arc<ConnectionManager>,
}

impl AppState {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self {
            ctx,
            conn_manager: ConnectionManager::new_shared(),
        }
    }
}

/// Build the application router.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
