//! Snapshot types for persisting and restoring the in-memory stores.
//!
//! Snapshots are the bridge between [`MemoryStore`] / [`MemoryQueue`] and
//! whatever persistent storage an embedder has at hand (a file, browser
//! storage, a key-value blob). They serialize deterministically.

use crate::{
    error::Result, Error, LocalId, MemoryQueue, MemoryStore, QueueId, QueuedOperation, Record,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time snapshot of both local tables.
///
/// Uses BTreeMap instead of HashMap for deterministic serialization order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Next local id the store will hand out
    pub next_local_id: LocalId,
    /// Next queue id the queue will hand out
    pub next_queue_id: QueueId,
    /// Records by local id
    pub records: BTreeMap<LocalId, Record>,
    /// Pending operations, oldest first
    pub pending_ops: Vec<QueuedOperation>,
}

impl StoreSnapshot {
    /// Capture the current state of a store and its queue.
    pub fn capture(store: &MemoryStore, queue: &MemoryQueue) -> Result<Self> {
        let store_state = store.lock()?;
        let queue_state = queue.lock()?;

        Ok(Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            next_local_id: store_state.next_id,
            next_queue_id: queue_state.next_id,
            records: store_state.records.clone(),
            pending_ops: queue_state.ops.values().cloned().collect(),
        })
    }

    /// Rebuild a store and queue from this snapshot.
    pub fn restore(self, retry_ceiling: u32) -> Result<(MemoryStore, MemoryQueue)> {
        self.validate()?;

        let store = MemoryStore::from_records(self.next_local_id, self.records.into_values());
        let queue = MemoryQueue::from_operations(self.next_queue_id, self.pending_ops, retry_ceiling);
        Ok((store, queue))
    }

    /// Count records.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Count records not yet confirmed by the remote store.
    pub fn unsynced_count(&self) -> usize {
        self.records.values().filter(|r| !r.is_synced).count()
    }

    /// Check the snapshot's internal consistency.
    pub fn validate(&self) -> Result<()> {
        for (local_id, record) in &self.records {
            if *local_id != record.local_id {
                return Err(Error::InvalidSnapshot(format!(
                    "record keyed {} carries local id {}",
                    local_id, record.local_id
                )));
            }
            if record.local_id >= self.next_local_id {
                return Err(Error::InvalidSnapshot(format!(
                    "local id {} is not below next id {}",
                    record.local_id, self.next_local_id
                )));
            }
            if record.is_synced && record.remote_id.is_none() {
                return Err(Error::InvalidSnapshot(format!(
                    "record {} is synced without a remote id",
                    record.local_id
                )));
            }
        }

        let mut previous: Option<QueueId> = None;
        for op in &self.pending_ops {
            if previous.is_some_and(|p| p >= op.queue_id) {
                return Err(Error::InvalidSnapshot(format!(
                    "queue id {} is out of order",
                    op.queue_id
                )));
            }
            if op.queue_id >= self.next_queue_id {
                return Err(Error::InvalidSnapshot(format!(
                    "queue id {} is not below next id {}",
                    op.queue_id, self.next_queue_id
                )));
            }
            previous = Some(op.queue_id);
        }

        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}
