//! Branchsync Server binary.

use branchsync_engine::SyncContext;
use branchsync_server::config::Config;
use branchsync_server::db::{self, SqliteQueue, SqliteRemote, SqliteStore};
use branchsync_server::websocket::spawn_change_forwarder;
use branchsync_server::{build_app, AppState};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "branchsync_server=debug,branchsync_engine=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Branchsync Server on {}:{}", config.host, config.port);

    let pool = db::create_pool(&config.database_url).await?;

    tracing::info!("Running database migrations...");
    db::run_migrations(&pool).await?;

    let sync_config = config.sync_config();
    let store = Arc::new(SqliteStore::new(pool.clone()));
    let queue = Arc::new(SqliteQueue::with_retry_ceiling(
        pool.clone(),
        sync_config.retry_ceiling,
    ));

    // No document database is wired in; the loopback remote stands in for it
    let remote = Arc::new(SqliteRemote::load(pool.clone()).await?);
    let ctx = Arc::new(SyncContext::start(sync_config, store, queue, remote).await?);

    let state = AppState::new(ctx.clone());
    let forwarder = spawn_change_forwarder(ctx.subscribe_changes(), state.conn_manager.clone());
    let app = build_app(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    ctx.shutdown().await;
    forwarder.abort();
    pool.close().await;
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
