//! HTTP route definitions.

mod branches;
mod health;
mod sync;
mod ws;

use crate::AppState;
use axum::Router;

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(branches::routes())
        .merge(sync::routes())
        .merge(ws::routes())
}
