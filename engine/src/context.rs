//! The sync context: the single entry point a presentation layer talks to.
//!
//! A context owns the local store, the queue, the engine and the
//! connectivity monitor, and runs the background driver between
//! [`SyncContext::start`] and [`SyncContext::shutdown`].

use crate::driver::{spawn_drain, Driver};
use crate::{
    error::Result, Clock, CollectionSchema, ConnectivityMonitor, ConnectivityState, Error, Fields,
    LocalId, LocalStore, MemoryQueue, MemoryStore, NewOperation, Record, RemoteStore, StateChange,
    SyncConfig, SyncEngine, SyncOutcome, SyncQueue, SystemClock,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Counts shown next to the record list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub connectivity: ConnectivityState,
    pub records: usize,
    pub unsynced: usize,
    pub pending_operations: usize,
    pub draining: bool,
}

/// Builder for [`SyncContext`].
pub struct SyncContextBuilder {
    store: Arc<dyn LocalStore>,
    queue: Arc<dyn SyncQueue>,
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
    schema: Option<CollectionSchema>,
    clock: Arc<dyn Clock>,
}

impl SyncContextBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Validation schema. Defaults to the branch form.
    pub fn schema(mut self, schema: CollectionSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Open the remote subscription and start the background driver.
    ///
    /// # Errors
    /// - [`Error::ConfigurationFault`] if the configuration is invalid or
    ///   the remote subscription cannot be opened
    /// - [`Error::StorageFault`] if the local store cannot be read
    pub async fn start(self) -> Result<SyncContext> {
        self.config.validate()?;
        let collection = self.config.collection.clone();
        let schema = self
            .schema
            .unwrap_or_else(|| CollectionSchema::branches(collection.clone()));

        let monitor = Arc::new(ConnectivityMonitor::new(
            self.remote.clone(),
            self.config.start_online,
        ));
        let engine = Arc::new(SyncEngine::new(
            self.store.clone(),
            self.queue.clone(),
            self.remote.clone(),
            monitor.clone(),
            self.clock.clone(),
            collection.clone(),
        ));

        let known = engine.prime_seen().await?;

        let subscription = self.remote.subscribe(&collection).await.map_err(|e| {
            Error::ConfigurationFault(format!("cannot subscribe to '{collection}': {e}"))
        })?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let driver = Driver::new(
            engine.clone(),
            subscription,
            self.config.sync_interval,
            shutdown_rx,
        )
        .spawn();

        info!(
            collection = %collection,
            known_documents = known,
            online = self.config.start_online,
            "Sync context started"
        );

        if self.config.start_online {
            monitor.probe().await;
        }

        Ok(SyncContext {
            config: self.config,
            schema,
            store: self.store,
            queue: self.queue,
            engine,
            monitor,
            clock: self.clock,
            shutdown,
            driver: Mutex::new(Some(driver)),
        })
    }
}

/// Owns the sync components for one collection.
pub struct SyncContext {
    config: SyncConfig,
    schema: CollectionSchema,
    store: Arc<dyn LocalStore>,
    queue: Arc<dyn SyncQueue>,
    engine: Arc<SyncEngine>,
    monitor: Arc<ConnectivityMonitor>,
    clock: Arc<dyn Clock>,
    shutdown: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl SyncContext {
    pub fn builder(
        store: Arc<dyn LocalStore>,
        queue: Arc<dyn SyncQueue>,
        remote: Arc<dyn RemoteStore>,
    ) -> SyncContextBuilder {
        SyncContextBuilder {
            store,
            queue,
            remote,
            config: SyncConfig::default(),
            schema: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Start a context with the given stores and configuration.
    pub async fn start(
        config: SyncConfig,
        store: Arc<dyn LocalStore>,
        queue: Arc<dyn SyncQueue>,
        remote: Arc<dyn RemoteStore>,
    ) -> Result<Self> {
        Self::builder(store, queue, remote).config(config).start().await
    }

    /// Start a context backed by in-memory local tables.
    pub async fn in_memory(config: SyncConfig, remote: Arc<dyn RemoteStore>) -> Result<Self> {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::with_retry_ceiling(config.retry_ceiling));
        Self::start(config, store, queue, remote).await
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn schema(&self) -> &CollectionSchema {
        &self.schema
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn SyncQueue> {
        &self.queue
    }

    /// Create a record locally and queue it for the remote store.
    pub async fn submit_create(&self, fields: Fields) -> Result<LocalId> {
        self.schema.validate_fields(&fields)?;

        let now = self.clock.now();
        let local_id = self.store.create(fields.clone(), now).await?;
        self.queue
            .enqueue(NewOperation::create(local_id, fields, now))
            .await?;

        debug!(local_id, "Record created locally");
        self.after_mutation(local_id);
        Ok(local_id)
    }

    /// Merge `fields` into a record and queue the change.
    pub async fn submit_update(&self, local_id: LocalId, fields: Fields) -> Result<Record> {
        self.schema.validate_partial(&fields)?;

        let now = self.clock.now();
        let record = self.store.update(local_id, fields.clone(), now).await?;
        self.queue
            .enqueue(NewOperation::update(
                local_id,
                record.remote_id.clone(),
                fields,
                now,
            ))
            .await?;

        debug!(local_id, "Record updated locally");
        self.after_mutation(local_id);
        Ok(record)
    }

    /// Delete a record locally and queue the remote delete.
    pub async fn submit_delete(&self, local_id: LocalId) -> Result<()> {
        let removed = self.store.delete(local_id).await?;
        self.queue
            .enqueue(NewOperation::delete(
                local_id,
                removed.remote_id,
                self.clock.now(),
            ))
            .await?;

        debug!(local_id, "Record deleted locally");
        self.after_mutation(local_id);
        Ok(())
    }

    /// Queue an unsynced record again after its operations were abandoned.
    ///
    /// Returns `false` when there is nothing to do: the record is synced or
    /// still has operations queued.
    pub async fn resubmit(&self, local_id: LocalId) -> Result<bool> {
        let record = self
            .store
            .get(local_id)
            .await?
            .ok_or(Error::RecordNotFound(local_id))?;

        if record.is_synced || self.queue.has_pending_for_local(local_id).await? {
            return Ok(false);
        }

        let now = self.clock.now();
        let op = match record.remote_id {
            Some(remote_id) => NewOperation::update(local_id, Some(remote_id), record.fields, now),
            None => NewOperation::create(local_id, record.fields, now),
        };
        info!(local_id, kind = %op.kind, "Resubmitting record");
        self.queue.enqueue(op).await?;

        self.after_mutation(local_id);
        Ok(true)
    }

    /// [`resubmit`](Self::resubmit) every unsynced record. Returns how many
    /// were queued.
    pub async fn resubmit_all_unsynced(&self) -> Result<usize> {
        let mut queued = 0;
        for record in self.store.list().await? {
            if !record.is_synced && self.resubmit(record.local_id).await? {
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// Drain now, on the user's request.
    pub async fn request_manual_sync(&self) -> Result<SyncOutcome> {
        let mut state = self.monitor.state();
        if !state.is_online() {
            info!("Manual sync requested while offline");
            return Ok(SyncOutcome::Offline);
        }
        if !state.is_reachable() {
            state = self.monitor.probe().await;
        }

        let outcome = self.engine.drain_now().await?;
        let outcome = SyncOutcome::from_drain(outcome, state);
        info!(?outcome, "Manual sync finished");
        Ok(outcome)
    }

    /// All records, ordered by local id.
    pub async fn list_all(&self) -> Result<Vec<Record>> {
        let mut records = self.store.list().await?;
        records.sort_by_key(|r| r.local_id);
        Ok(records)
    }

    pub async fn get(&self, local_id: LocalId) -> Result<Option<Record>> {
        self.store.get(local_id).await
    }

    pub async fn status(&self) -> Result<SyncStatus> {
        let records = self.store.list().await?;
        Ok(SyncStatus {
            connectivity: self.monitor.state(),
            records: records.len(),
            unsynced: records.iter().filter(|r| !r.is_synced).count(),
            pending_operations: self.queue.len().await?,
            draining: self.engine.is_draining(),
        })
    }

    /// Feed the device network signal.
    pub async fn set_network_available(&self, available: bool) -> ConnectivityState {
        self.monitor.set_network_available(available).await
    }

    /// Receive "state changed" notifications.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<StateChange> {
        self.engine.subscribe_changes()
    }

    /// Stop the driver and release the remote subscription.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);

        let driver = self.driver.lock().ok().and_then(|mut d| d.take());
        if let Some(driver) = driver {
            let _ = driver.await;
            info!(collection = %self.config.collection, "Sync context stopped");
        }
    }

    fn after_mutation(&self, local_id: LocalId) {
        self.engine.notify(StateChange::LocalMutation { local_id });
        if self.monitor.is_reachable() {
            spawn_drain(self.engine.clone(), "local mutation");
        }
    }
}

impl Drop for SyncContext {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryRemote;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn start_rejects_empty_collection() {
        let remote = MemoryRemote::new_shared();
        let config = SyncConfig::default().with_collection("");

        let result = SyncContext::in_memory(config, remote).await;
        assert!(matches!(result, Err(Error::ConfigurationFault(_))));
    }

    #[tokio::test]
    async fn validation_rejects_before_writing() {
        let remote = MemoryRemote::new_shared();
        let config = SyncConfig::default().with_start_online(false);
        let ctx = SyncContext::in_memory(config, remote).await.unwrap();

        let result = ctx.submit_create(fields(json!({"address": "No name"}))).await;
        assert!(matches!(result, Err(Error::MissingRequiredField(_))));
        assert!(ctx.list_all().await.unwrap().is_empty());
        assert_eq!(ctx.queue().len().await.unwrap(), 0);

        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn offline_mutations_are_queued() {
        let remote = MemoryRemote::new_shared();
        let config = SyncConfig::default().with_start_online(false);
        let ctx = SyncContext::in_memory(config, remote.clone()).await.unwrap();

        let id = ctx
            .submit_create(fields(json!({"name": "Branch A"})))
            .await
            .unwrap();
        ctx.submit_update(id, fields(json!({"address": "Main St"})))
            .await
            .unwrap();

        let status = ctx.status().await.unwrap();
        assert_eq!(status.connectivity, ConnectivityState::Offline);
        assert_eq!(status.records, 1);
        assert_eq!(status.unsynced, 1);
        assert_eq!(status.pending_operations, 2);
        assert_eq!(remote.write_calls(), 0);

        assert_eq!(
            ctx.request_manual_sync().await.unwrap(),
            SyncOutcome::Offline
        );

        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn update_and_delete_of_unknown_record() {
        let remote = MemoryRemote::new_shared();
        let config = SyncConfig::default().with_start_online(false);
        let ctx = SyncContext::in_memory(config, remote).await.unwrap();

        assert!(matches!(
            ctx.submit_update(99, fields(json!({"name": "X"}))).await,
            Err(Error::RecordNotFound(99))
        ));
        assert!(matches!(
            ctx.submit_delete(99).await,
            Err(Error::RecordNotFound(99))
        ));
        assert!(matches!(
            ctx.resubmit(99).await,
            Err(Error::RecordNotFound(99))
        ));

        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn local_mutation_is_announced() {
        let remote = MemoryRemote::new_shared();
        let config = SyncConfig::default().with_start_online(false);
        let ctx = SyncContext::in_memory(config, remote).await.unwrap();
        let mut changes = ctx.subscribe_changes();

        let id = ctx
            .submit_create(fields(json!({"name": "Branch A"})))
            .await
            .unwrap();

        assert_eq!(
            changes.recv().await.unwrap(),
            StateChange::LocalMutation { local_id: id }
        );

        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_releases_subscription() {
        let remote = MemoryRemote::new_shared();
        let ctx = SyncContext::in_memory(SyncConfig::default(), remote.clone())
            .await
            .unwrap();
        assert_eq!(remote.subscriber_count(), 1);

        ctx.shutdown().await;
        assert_eq!(remote.subscriber_count(), 0);
    }
}
