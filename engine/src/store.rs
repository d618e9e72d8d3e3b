//! Local store - the durable record table on the device.
//!
//! [`LocalStore`] is the contract the engine relies on. [`MemoryStore`] is the
//! in-process implementation; durable backends live with their runtime (the
//! server ships a SQLite one).

use crate::{error::Result, Error, Fields, LocalId, Record, RemoteId, Timestamp};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Record storage on the client device.
///
/// Every method is atomic with respect to the others: no partial write is
/// ever observable. Failures of the underlying storage surface as
/// [`Error::StorageFault`].
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Insert a new unsynced record and return its local id.
    async fn create(&self, fields: Fields, timestamp: Timestamp) -> Result<LocalId>;

    /// Merge `fields` into an existing record and mark it unsynced.
    ///
    /// # Errors
    /// - [`Error::RecordNotFound`] if no record has this id
    async fn update(&self, local_id: LocalId, fields: Fields, timestamp: Timestamp)
        -> Result<Record>;

    /// Remove a record, returning what was removed.
    ///
    /// # Errors
    /// - [`Error::RecordNotFound`] if no record has this id
    async fn delete(&self, local_id: LocalId) -> Result<Record>;

    /// Get a record by local id.
    async fn get(&self, local_id: LocalId) -> Result<Option<Record>>;

    /// Get a record by the id the remote store assigned to it.
    async fn get_by_remote_id(&self, remote_id: &str) -> Result<Option<Record>>;

    /// All records, in no meaningful order.
    async fn list(&self) -> Result<Vec<Record>>;

    /// Attach the remote id to a record and set its sync flag.
    ///
    /// Returns `false` if the record no longer exists.
    async fn confirm(&self, local_id: LocalId, remote_id: &str, synced: bool) -> Result<bool>;

    /// Mirror a remote document: overwrite the record holding `remote_id`,
    /// or insert a new synced record. Returns the local id.
    async fn upsert_remote(
        &self,
        remote_id: &str,
        fields: Fields,
        timestamp: Timestamp,
    ) -> Result<LocalId>;
}

#[derive(Debug)]
pub(crate) struct StoreState {
    pub(crate) next_id: LocalId,
    pub(crate) records: BTreeMap<LocalId, Record>,
    by_remote: HashMap<RemoteId, LocalId>,
}

impl StoreState {
    fn new(next_id: LocalId) -> Self {
        Self {
            next_id,
            records: BTreeMap::new(),
            by_remote: HashMap::new(),
        }
    }

    fn allocate_id(&mut self) -> LocalId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn insert(&mut self, record: Record) {
        if let Some(remote_id) = &record.remote_id {
            self.by_remote.insert(remote_id.clone(), record.local_id);
        }
        self.records.insert(record.local_id, record);
    }

    fn remove(&mut self, local_id: LocalId) -> Option<Record> {
        let record = self.records.remove(&local_id)?;
        if let Some(remote_id) = &record.remote_id {
            self.by_remote.remove(remote_id);
        }
        Some(record)
    }
}

/// In-memory [`LocalStore`].
///
/// Use [`crate::StoreSnapshot`] to persist and restore it.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    unavailable: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store. Local ids start at 1.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::new(1)),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Rebuild a store from records, e.g. a restored snapshot.
    pub(crate) fn from_records(next_id: LocalId, records: impl IntoIterator<Item = Record>) -> Self {
        let mut state = StoreState::new(next_id);
        for record in records {
            state.insert(record);
        }
        Self {
            state: Mutex::new(state),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate the underlying storage going away: every call fails with
    /// [`Error::StorageFault`] until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.records.len()).unwrap_or(0)
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, StoreState>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StorageFault("local store unavailable".into()));
        }
        self.state
            .lock()
            .map_err(|_| Error::StorageFault("local store lock poisoned".into()))
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn create(&self, fields: Fields, timestamp: Timestamp) -> Result<LocalId> {
        let mut state = self.lock()?;
        let local_id = state.allocate_id();
        state.insert(Record::new_local(local_id, fields, timestamp));
        Ok(local_id)
    }

    async fn update(
        &self,
        local_id: LocalId,
        fields: Fields,
        timestamp: Timestamp,
    ) -> Result<Record> {
        let mut state = self.lock()?;
        let record = state
            .records
            .get_mut(&local_id)
            .ok_or(Error::RecordNotFound(local_id))?;

        record.apply_local_edit(fields, timestamp);
        Ok(record.clone())
    }

    async fn delete(&self, local_id: LocalId) -> Result<Record> {
        let mut state = self.lock()?;
        state
            .remove(local_id)
            .ok_or(Error::RecordNotFound(local_id))
    }

    async fn get(&self, local_id: LocalId) -> Result<Option<Record>> {
        let state = self.lock()?;
        Ok(state.records.get(&local_id).cloned())
    }

    async fn get_by_remote_id(&self, remote_id: &str) -> Result<Option<Record>> {
        let state = self.lock()?;
        Ok(state
            .by_remote
            .get(remote_id)
            .and_then(|id| state.records.get(id))
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Record>> {
        let state = self.lock()?;
        Ok(state.records.values().cloned().collect())
    }

    async fn confirm(&self, local_id: LocalId, remote_id: &str, synced: bool) -> Result<bool> {
        let mut state = self.lock()?;
        let Some(mut record) = state.remove(local_id) else {
            return Ok(false);
        };

        record.confirm(remote_id, synced);
        state.insert(record);
        Ok(true)
    }

    async fn upsert_remote(
        &self,
        remote_id: &str,
        fields: Fields,
        timestamp: Timestamp,
    ) -> Result<LocalId> {
        let mut state = self.lock()?;

        if let Some(&local_id) = state.by_remote.get(remote_id) {
            if let Some(record) = state.records.get_mut(&local_id) {
                record.overwrite_from_remote(fields, timestamp);
                return Ok(local_id);
            }
        }

        let local_id = state.allocate_id();
        state.insert(Record::from_remote(local_id, remote_id, fields, timestamp));
        Ok(local_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn create_assigns_increasing_ids() {
        let store = MemoryStore::new();

        let a = store.create(fields(json!({"name": "A"})), 1000).await.unwrap();
        let b = store.create(fields(json!({"name": "B"})), 1000).await.unwrap();

        assert!(b > a);
        let record = store.get(a).await.unwrap().unwrap();
        assert_eq!(record.field_str("name"), Some("A"));
        assert!(!record.is_synced);
        assert!(record.remote_id.is_none());
    }

    #[tokio::test]
    async fn update_merges_fields() {
        let store = MemoryStore::new();
        let id = store
            .create(fields(json!({"name": "A", "address": "Old"})), 1000)
            .await
            .unwrap();
        store.confirm(id, "doc-1", true).await.unwrap();

        let updated = store
            .update(id, fields(json!({"address": "New"})), 2000)
            .await
            .unwrap();

        assert_eq!(updated.fields, fields(json!({"name": "A", "address": "New"})));
        assert!(!updated.is_synced);
        assert_eq!(updated.remote_id.as_deref(), Some("doc-1"));
    }

    #[tokio::test]
    async fn update_missing_record() {
        let store = MemoryStore::new();
        let result = store.update(42, Fields::new(), 1000).await;
        assert!(matches!(result, Err(Error::RecordNotFound(42))));
    }

    #[tokio::test]
    async fn delete_removes_remote_index() {
        let store = MemoryStore::new();
        let id = store.create(fields(json!({"name": "A"})), 1000).await.unwrap();
        store.confirm(id, "doc-1", true).await.unwrap();

        let removed = store.delete(id).await.unwrap();
        assert_eq!(removed.remote_id.as_deref(), Some("doc-1"));
        assert!(store.get(id).await.unwrap().is_none());
        assert!(store.get_by_remote_id("doc-1").await.unwrap().is_none());

        let again = store.delete(id).await;
        assert!(matches!(again, Err(Error::RecordNotFound(_))));
    }

    #[tokio::test]
    async fn confirm_reports_vanished_record() {
        let store = MemoryStore::new();
        assert!(!store.confirm(9, "doc-9", true).await.unwrap());
    }

    #[tokio::test]
    async fn upsert_remote_inserts_then_overwrites() {
        let store = MemoryStore::new();

        let id = store
            .upsert_remote("doc-1", fields(json!({"name": "Remote"})), 1000)
            .await
            .unwrap();
        let record = store.get_by_remote_id("doc-1").await.unwrap().unwrap();
        assert_eq!(record.local_id, id);
        assert!(record.is_synced);

        let same = store
            .upsert_remote("doc-1", fields(json!({"name": "Renamed"})), 2000)
            .await
            .unwrap();
        assert_eq!(same, id);
        assert_eq!(store.len(), 1);
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.field_str("name"), Some("Renamed"));
    }

    #[tokio::test]
    async fn unavailable_store_faults() {
        let store = MemoryStore::new();
        store.set_unavailable(true);

        let result = store.create(Fields::new(), 1000).await;
        assert!(matches!(result, Err(Error::StorageFault(_))));
        assert!(matches!(store.list().await, Err(Error::StorageFault(_))));

        store.set_unavailable(false);
        assert!(store.list().await.unwrap().is_empty());
    }
}
