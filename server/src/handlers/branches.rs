//! Branch handlers - the create/edit/delete surface of the branch list.

use crate::error::Result;
use branchsync_engine::{Error, Fields, LocalId, Record, SyncContext};
use serde::Serialize;
use serde_json::Value;

/// Response for a resubmit request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResubmitResponse {
    /// Whether a new operation was queued
    pub queued: bool,
}

fn into_fields(payload: Value) -> Result<Fields> {
    match payload {
        Value::Object(fields) => Ok(fields),
        _ => Err(Error::InvalidPayload("branch payload must be a JSON object".into()).into()),
    }
}

/// All branches, ordered by local id.
pub async fn list_branches(ctx: &SyncContext) -> Result<Vec<Record>> {
    Ok(ctx.list_all().await?)
}

pub async fn get_branch(ctx: &SyncContext, local_id: LocalId) -> Result<Record> {
    Ok(ctx
        .get(local_id)
        .await?
        .ok_or(Error::RecordNotFound(local_id))?)
}

/// Create a branch locally; it syncs in the background.
pub async fn create_branch(ctx: &SyncContext, payload: Value) -> Result<Record> {
    let local_id = ctx.submit_create(into_fields(payload)?).await?;
    tracing::debug!(local_id, "Branch created");
    get_branch(ctx, local_id).await
}

pub async fn update_branch(ctx: &SyncContext, local_id: LocalId, payload: Value) -> Result<Record> {
    Ok(ctx.submit_update(local_id, into_fields(payload)?).await?)
}

pub async fn delete_branch(ctx: &SyncContext, local_id: LocalId) -> Result<()> {
    ctx.submit_delete(local_id).await?;
    Ok(())
}

/// Queue an unsynced branch again after its operations were abandoned.
pub async fn resubmit_branch(ctx: &SyncContext, local_id: LocalId) -> Result<ResubmitResponse> {
    let queued = ctx.resubmit(local_id).await?;
    Ok(ResubmitResponse { queued })
}
