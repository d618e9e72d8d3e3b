//! Operation types for expressing queued changes.
//!
//! Every local mutation produces an operation that waits in the sync queue
//! until the remote store confirms it.

use crate::{Fields, LocalId, QueueId, RemoteId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Create,
    Update,
    Delete,
}

impl OpKind {
    /// Stable lowercase name, used for persistence.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Create => "create",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
        }
    }

    /// Parse the persisted name.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(OpKind::Create),
            "update" => Some(OpKind::Update),
            "delete" => Some(OpKind::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operation about to be enqueued. The queue assigns the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOperation {
    pub kind: OpKind,
    pub local_id: LocalId,
    /// Remote identifier known at enqueue time, if any
    pub remote_id: Option<RemoteId>,
    pub payload: Fields,
    pub enqueued_at: Timestamp,
}

impl NewOperation {
    /// A create of a new local record.
    pub fn create(local_id: LocalId, payload: Fields, timestamp: Timestamp) -> Self {
        Self {
            kind: OpKind::Create,
            local_id,
            remote_id: None,
            payload,
            enqueued_at: timestamp,
        }
    }

    /// An update carrying the changed fields.
    pub fn update(
        local_id: LocalId,
        remote_id: Option<RemoteId>,
        payload: Fields,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            kind: OpKind::Update,
            local_id,
            remote_id,
            payload,
            enqueued_at: timestamp,
        }
    }

    /// A delete. The local record is already gone when this is enqueued,
    /// so the remote id must be captured here.
    pub fn delete(local_id: LocalId, remote_id: Option<RemoteId>, timestamp: Timestamp) -> Self {
        Self {
            kind: OpKind::Delete,
            local_id,
            remote_id,
            payload: Fields::new(),
            enqueued_at: timestamp,
        }
    }

    /// Attach the queue id, producing a pending operation.
    pub fn into_queued(self, queue_id: QueueId) -> QueuedOperation {
        QueuedOperation {
            queue_id,
            kind: self.kind,
            local_id: self.local_id,
            remote_id: self.remote_id,
            payload: self.payload,
            enqueued_at: self.enqueued_at,
            attempts: 0,
            last_error: None,
        }
    }
}

/// A mutation waiting to be confirmed by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    /// Strictly increasing position in the queue
    pub queue_id: QueueId,
    pub kind: OpKind,
    pub local_id: LocalId,
    pub remote_id: Option<RemoteId>,
    pub payload: Fields,
    pub enqueued_at: Timestamp,
    /// Failed drain attempts so far
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl QueuedOperation {
    /// Whether this operation targets the given remote document.
    pub fn targets_remote(&self, remote_id: &str) -> bool {
        self.remote_id.as_deref() == Some(remote_id)
    }
}

/// What `record_failure` did with the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureOutcome {
    /// Still queued, will be retried on the next drain
    Retrying { attempts: u32 },
    /// Reached the retry ceiling and was evicted
    Abandoned { attempts: u32 },
    /// The operation was no longer queued
    Missing,
}
