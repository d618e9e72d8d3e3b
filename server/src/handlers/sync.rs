//! Sync handlers - manual sync, status badges and the network signal.

use crate::error::Result;
use branchsync_engine::{ConnectivityState, SyncContext, SyncOutcome, SyncStatus};
use serde::{Deserialize, Serialize};

/// Response for a manual sync.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub outcome: SyncOutcome,
}

/// Request body for the network signal.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRequest {
    pub online: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkResponse {
    pub connectivity: ConnectivityState,
}

/// Drain the queue now, on the user's request.
pub async fn handle_manual_sync(ctx: &SyncContext) -> Result<SyncResponse> {
    let outcome = ctx.request_manual_sync().await?;
    Ok(SyncResponse { outcome })
}

pub async fn handle_status(ctx: &SyncContext) -> Result<SyncStatus> {
    Ok(ctx.status().await?)
}

/// Feed the device network signal, probing the remote store when it comes up.
pub async fn handle_network(ctx: &SyncContext, request: NetworkRequest) -> NetworkResponse {
    let connectivity = ctx.set_network_available(request.online).await;
    tracing::info!(online = request.online, state = %connectivity, "Network signal changed");
    NetworkResponse { connectivity }
}
