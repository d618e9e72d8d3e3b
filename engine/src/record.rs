//! Record types for storing data.

use crate::{Fields, LocalId, RemoteId, Timestamp};
use serde::{Deserialize, Serialize};

/// A locally stored record (e.g. a branch).
///
/// A record with `is_synced == true` always carries a `remote_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Identifier assigned by the local store, stable for the record's lifetime
    pub local_id: LocalId,
    /// Identifier assigned by the remote store once it accepted the create
    pub remote_id: Option<RemoteId>,
    /// The record's fields
    pub fields: Fields,
    /// Whether the local state is confirmed by the remote store
    pub is_synced: bool,
    /// When the record was last written locally (milliseconds since epoch)
    pub last_updated: Timestamp,
}

impl Record {
    /// Create a new, not yet synced, local record.
    pub fn new_local(local_id: LocalId, fields: Fields, timestamp: Timestamp) -> Self {
        Self {
            local_id,
            remote_id: None,
            fields,
            is_synced: false,
            last_updated: timestamp,
        }
    }

    /// Create a record mirroring a remote document.
    pub fn from_remote(
        local_id: LocalId,
        remote_id: impl Into<RemoteId>,
        fields: Fields,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            local_id,
            remote_id: Some(remote_id.into()),
            fields,
            is_synced: true,
            last_updated: timestamp,
        }
    }

    /// Merge a local edit into the record. The record becomes unsynced.
    pub fn apply_local_edit(&mut self, fields: Fields, timestamp: Timestamp) {
        for (key, value) in fields {
            self.fields.insert(key, value);
        }
        self.is_synced = false;
        self.last_updated = timestamp;
    }

    /// Replace the fields with the remote document's and mark synced.
    pub fn overwrite_from_remote(&mut self, fields: Fields, timestamp: Timestamp) {
        self.fields = fields;
        self.is_synced = true;
        self.last_updated = timestamp;
    }

    /// Attach the remote identifier, optionally marking the record synced.
    pub fn confirm(&mut self, remote_id: impl Into<RemoteId>, synced: bool) {
        self.remote_id = Some(remote_id.into());
        self.is_synced = synced;
    }

    /// Whether the record mirrors `fields` exactly and is already synced.
    pub fn matches_remote(&self, fields: &Fields) -> bool {
        self.is_synced && &self.fields == fields
    }

    /// Convenience accessor for a string field.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|v| v.as_str())
    }
}
