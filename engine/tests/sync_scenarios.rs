//! End-to-end sync scenarios for branchsync-engine
//!
//! Engine-level tests drive [`SyncEngine`] directly so every remote call is
//! accounted for; context-level tests go through [`SyncContext`] and its
//! background driver.

use async_trait::async_trait;
use branchsync_engine::{
    error::Result, Clock, ConnectivityMonitor, ConnectivityState, DrainOutcome, Fields, LocalId,
    LocalStore, ManualClock, MemoryQueue, MemoryRemote, MemoryStore, NewOperation, OpKind,
    RemoteDocument, RemoteId, RemoteStore, StateChange, Subscription, SyncConfig, SyncContext,
    SyncEngine, SyncOutcome, SyncQueue, SyncSummary,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn fields(value: serde_json::Value) -> Fields {
    value.as_object().cloned().unwrap()
}

struct Harness {
    store: Arc<MemoryStore>,
    queue: Arc<MemoryQueue>,
    remote: Arc<MemoryRemote>,
    clock: Arc<ManualClock>,
    engine: SyncEngine,
}

async fn harness_with(remote: Arc<dyn RemoteStore>, memory: Arc<MemoryRemote>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let clock = Arc::new(ManualClock::new(1_000));
    let monitor = Arc::new(ConnectivityMonitor::new(remote.clone(), true));
    monitor.probe().await;

    let engine = SyncEngine::new(
        store.clone(),
        queue.clone(),
        remote,
        monitor,
        clock.clone(),
        "branches",
    );
    Harness {
        store,
        queue,
        remote: memory,
        clock,
        engine,
    }
}

async fn harness() -> Harness {
    let remote = MemoryRemote::new_shared();
    harness_with(remote.clone(), remote).await
}

impl Harness {
    async fn create(&self, name: &str) -> LocalId {
        let payload = fields(json!({ "name": name }));
        let now = self.clock.now();
        let id = self.store.create(payload.clone(), now).await.unwrap();
        self.queue
            .enqueue(NewOperation::create(id, payload, now))
            .await
            .unwrap();
        id
    }

    async fn update(&self, id: LocalId, payload: Fields) {
        let now = self.clock.now();
        let record = self.store.update(id, payload.clone(), now).await.unwrap();
        self.queue
            .enqueue(NewOperation::update(id, record.remote_id, payload, now))
            .await
            .unwrap();
    }

    async fn delete(&self, id: LocalId) {
        let removed = self.store.delete(id).await.unwrap();
        self.queue
            .enqueue(NewOperation::delete(id, removed.remote_id, self.clock.now()))
            .await
            .unwrap();
    }

    async fn remote_id_of(&self, id: LocalId) -> RemoteId {
        self.store
            .get(id)
            .await
            .unwrap()
            .and_then(|r| r.remote_id)
            .expect("record has a remote id")
    }
}

async fn wait_for<F>(changes: &mut broadcast::Receiver<StateChange>, mut matches: F) -> StateChange
where
    F: FnMut(&StateChange) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match changes.recv().await {
                Ok(change) if matches(&change) => return change,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("change channel closed"),
            }
        }
    })
    .await
    .expect("state change within timeout")
}

// ============================================================================
// Drain
// ============================================================================

#[tokio::test]
async fn draining_empty_queue_makes_no_remote_calls() {
    let h = harness().await;

    assert_eq!(h.engine.drain().await.unwrap(), DrainOutcome::NothingToSync);
    assert_eq!(h.remote.write_calls(), 0);
}

#[tokio::test]
async fn update_uses_remote_id_returned_by_create() {
    let h = harness().await;
    let id = h.create("Branch A").await;
    h.update(id, fields(json!({"address": "Mall Road"}))).await;

    let DrainOutcome::Completed(report) = h.engine.drain().await.unwrap() else {
        panic!("expected a completed drain");
    };
    assert_eq!(report.succeeded, 2);

    let remote_id = h.remote_id_of(id).await;
    let calls = h.remote.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].kind, OpKind::Create);
    assert_eq!(calls[1].kind, OpKind::Update);
    assert_eq!(calls[1].remote_id.as_deref(), Some(remote_id.as_str()));

    assert_eq!(
        h.remote.document("branches", &remote_id),
        Some(fields(json!({"name": "Branch A", "address": "Mall Road"})))
    );
    assert!(h.store.get(id).await.unwrap().unwrap().is_synced);
}

#[tokio::test]
async fn operation_failing_three_times_is_dropped() {
    let h = harness().await;
    let id = h.create("Branch A").await;
    h.remote.reject_writes(Some("permission denied".into()));

    for attempt in 1..=3u32 {
        let DrainOutcome::Completed(report) = h.engine.drain().await.unwrap() else {
            panic!("expected a completed drain");
        };
        assert_eq!(report.failed, 1);
        assert_eq!(report.summary(), SyncSummary::Failure);
        assert_eq!(report.abandoned, usize::from(attempt == 3));
    }

    assert_eq!(h.queue.len().await.unwrap(), 0);
    let record = h.store.get(id).await.unwrap().unwrap();
    assert!(!record.is_synced);
    assert_eq!(h.remote.write_calls(), 3);

    // Nothing left to retry until the record is edited again.
    assert_eq!(h.engine.drain().await.unwrap(), DrainOutcome::NothingToSync);

    h.remote.reject_writes(None);
    h.update(id, fields(json!({"address": "Main St"}))).await;
    assert_eq!(h.queue.len().await.unwrap(), 1);

    h.engine.drain().await.unwrap();
    let record = h.store.get(id).await.unwrap().unwrap();
    assert!(record.is_synced);
    // The create was never accepted, so the whole record was sent.
    assert_eq!(
        h.remote.document("branches", record.remote_id.as_deref().unwrap()),
        Some(fields(json!({"name": "Branch A", "address": "Main St"})))
    );
}

#[tokio::test]
async fn failures_do_not_block_other_records() {
    let h = harness().await;
    let a = h.create("Branch A").await;
    h.engine.drain().await.unwrap();
    let remote_a = h.remote_id_of(a).await;

    // Another client deleted A; updating it is rejected.
    h.remote.remove_external("branches", &remote_a);
    h.update(a, fields(json!({"name": "A2"}))).await;
    let b = h.create("Branch B").await;

    let DrainOutcome::Completed(report) = h.engine.drain().await.unwrap() else {
        panic!("expected a completed drain");
    };
    assert_eq!(report.failed, 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.summary(), SyncSummary::Partial);
    assert!(h.store.get(b).await.unwrap().unwrap().is_synced);
    assert!(!h.store.get(a).await.unwrap().unwrap().is_synced);
}

#[tokio::test]
async fn deleting_never_synced_record_makes_no_remote_calls() {
    let h = harness().await;
    let id = h.create("Draft").await;
    h.delete(id).await;

    let DrainOutcome::Completed(report) = h.engine.drain().await.unwrap() else {
        panic!("expected a completed drain");
    };
    assert_eq!(report.superseded, 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.summary(), SyncSummary::Success);
    assert_eq!(h.remote.write_calls(), 0);
    assert_eq!(h.queue.len().await.unwrap(), 0);
}

#[tokio::test]
async fn deleting_synced_record_deletes_document() {
    let h = harness().await;
    let id = h.create("Branch A").await;
    h.engine.drain().await.unwrap();
    let remote_id = h.remote_id_of(id).await;

    h.delete(id).await;
    h.engine.drain().await.unwrap();

    assert!(h.remote.document("branches", &remote_id).is_none());
    assert_eq!(h.queue.len().await.unwrap(), 0);
}

/// Remote store that lets the user delete the record while its create is
/// in flight.
struct DeleteDuringCreate {
    inner: Arc<MemoryRemote>,
    store: Arc<MemoryStore>,
    queue: Arc<MemoryQueue>,
}

#[async_trait]
impl RemoteStore for DeleteDuringCreate {
    async fn add(&self, collection: &str, payload: &Fields) -> Result<RemoteId> {
        let remote_id = self.inner.add(collection, payload).await?;
        for record in self.store.list().await? {
            let removed = self.store.delete(record.local_id).await?;
            self.queue
                .enqueue(NewOperation::delete(removed.local_id, removed.remote_id, 2_000))
                .await?;
        }
        Ok(remote_id)
    }

    async fn update(&self, collection: &str, remote_id: &str, payload: &Fields) -> Result<()> {
        self.inner.update(collection, remote_id, payload).await
    }

    async fn delete(&self, collection: &str, remote_id: &str) -> Result<()> {
        self.inner.delete(collection, remote_id).await
    }

    async fn subscribe(&self, collection: &str) -> Result<Subscription> {
        self.inner.subscribe(collection).await
    }

    async fn probe_reachable(&self) -> bool {
        self.inner.probe_reachable().await
    }
}

#[tokio::test]
async fn delete_during_in_flight_create_removes_document() {
    let memory = MemoryRemote::new_shared();
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let remote = Arc::new(DeleteDuringCreate {
        inner: memory.clone(),
        store: store.clone(),
        queue: queue.clone(),
    });
    let monitor = Arc::new(ConnectivityMonitor::new(remote.clone(), true));
    monitor.probe().await;
    let engine = SyncEngine::new(
        store.clone(),
        queue.clone(),
        remote,
        monitor,
        Arc::new(ManualClock::new(1_000)),
        "branches",
    );

    let payload = fields(json!({"name": "Short-lived"}));
    let id = store.create(payload.clone(), 1_000).await.unwrap();
    queue
        .enqueue(NewOperation::create(id, payload, 1_000))
        .await
        .unwrap();

    let DrainOutcome::Completed(report) = engine.drain().await.unwrap() else {
        panic!("expected a completed drain");
    };

    assert_eq!(report.passes, 2);
    assert!(memory.documents("branches").is_empty());
    assert!(store.is_empty());
    assert_eq!(queue.len().await.unwrap(), 0);
}

#[tokio::test]
async fn unreachable_remote_leaves_queue_untouched() {
    let h = harness().await;
    h.create("Branch A").await;
    h.engine.monitor().set_network_available(false).await;

    assert_eq!(h.engine.drain().await.unwrap(), DrainOutcome::NotReachable);
    let pending = h.queue.peek_all().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 0);
}

// ============================================================================
// Reconciliation
// ============================================================================

#[tokio::test]
async fn inbound_change_with_pending_operation_is_ignored() {
    let h = harness().await;
    let id = h.create("Branch A").await;
    h.engine.drain().await.unwrap();
    let remote_id = h.remote_id_of(id).await;

    h.update(id, fields(json!({"name": "Local name"}))).await;
    let summary = h
        .engine
        .reconcile(&[RemoteDocument::new(
            remote_id,
            fields(json!({"name": "Branch A"})),
        )])
        .await
        .unwrap();

    assert_eq!(summary.skipped_echo, 1);
    let record = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(record.field_str("name"), Some("Local name"));
    assert!(!record.is_synced);
}

#[tokio::test]
async fn unchanged_snapshot_mutates_nothing() {
    let h = harness().await;
    let docs = vec![
        RemoteDocument::new("doc-1", fields(json!({"name": "A"}))),
        RemoteDocument::new("doc-2", fields(json!({"name": "B"}))),
    ];

    let first = h.engine.reconcile(&docs).await.unwrap();
    assert_eq!(first.inserted, 2);
    let before = h.store.list().await.unwrap();

    h.clock.advance(60_000);
    let second = h.engine.reconcile(&docs).await.unwrap();

    assert!(!second.has_changes());
    assert_eq!(second.unchanged, 2);
    assert_eq!(h.store.list().await.unwrap(), before);
}

#[tokio::test]
async fn abandoned_edit_survives_unrelated_remote_changes() {
    let h = harness().await;
    let id = h.create("A").await;
    h.engine.drain().await.unwrap();

    h.update(id, fields(json!({"name": "Local edit"}))).await;
    h.remote.reject_writes(Some("permission denied".into()));
    for _ in 0..3 {
        h.engine.drain().await.unwrap();
    }
    assert_eq!(h.queue.len().await.unwrap(), 0);
    h.remote.reject_writes(None);

    h.remote
        .insert_external("branches", "other-doc", fields(json!({"name": "Other"})));
    let summary = h
        .engine
        .reconcile(&h.remote.documents("branches"))
        .await
        .unwrap();

    assert_eq!(summary.inserted, 1);
    assert_eq!(summary.overwritten, 0);
    let record = h.store.get(id).await.unwrap().unwrap();
    assert!(!record.is_synced);
    assert_eq!(record.field_str("name"), Some("Local edit"));
}

#[tokio::test]
async fn remote_changes_overwrite_synced_records() {
    let h = harness().await;
    let docs = vec![RemoteDocument::new("doc-1", fields(json!({"name": "A"})))];
    h.engine.reconcile(&docs).await.unwrap();

    let renamed = vec![RemoteDocument::new(
        "doc-1",
        fields(json!({"name": "A", "address": "New"})),
    )];
    let summary = h.engine.reconcile(&renamed).await.unwrap();
    assert_eq!(summary.overwritten, 1);

    let record = h.store.get_by_remote_id("doc-1").await.unwrap().unwrap();
    assert_eq!(record.field_str("address"), Some("New"));
    assert!(record.is_synced);

    let summary = h.engine.reconcile(&[]).await.unwrap();
    assert_eq!(summary.removed, 1);
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn remote_deletion_waits_for_pending_local_delete() {
    let h = harness().await;
    h.engine
        .reconcile(&[RemoteDocument::new("doc-1", fields(json!({"name": "A"})))])
        .await
        .unwrap();
    let record = h.store.get_by_remote_id("doc-1").await.unwrap().unwrap();
    h.delete(record.local_id).await;

    // The pending delete keeps the document from being inserted again.
    let summary = h
        .engine
        .reconcile(&[RemoteDocument::new("doc-1", fields(json!({"name": "A"})))])
        .await
        .unwrap();
    assert_eq!(summary.skipped_echo, 1);
    assert!(h.store.is_empty());
}

// ============================================================================
// Context
// ============================================================================

#[tokio::test]
async fn offline_create_syncs_when_back_online() {
    let remote = MemoryRemote::new_shared();
    let config = SyncConfig::default().with_start_online(false);
    let ctx = SyncContext::in_memory(config, remote.clone()).await.unwrap();

    let id = ctx
        .submit_create(fields(json!({"name": "Branch A"})))
        .await
        .unwrap();

    let records = ctx.list_all().await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(!records[0].is_synced);
    let pending = ctx.queue().peek_all().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, OpKind::Create);

    assert_eq!(
        ctx.set_network_available(true).await,
        ConnectivityState::OnlineReachable
    );
    let outcome = ctx.request_manual_sync().await.unwrap();
    assert!(matches!(
        outcome,
        SyncOutcome::Success | SyncOutcome::NothingToSync
    ));

    let record = ctx.get(id).await.unwrap().unwrap();
    assert!(record.is_synced);
    assert!(record.remote_id.is_some());
    assert_eq!(ctx.queue().len().await.unwrap(), 0);
    assert_eq!(remote.documents("branches").len(), 1);

    ctx.shutdown().await;
}

#[tokio::test]
async fn manual_sync_with_empty_queue() {
    let remote = MemoryRemote::new_shared();
    let ctx = SyncContext::in_memory(SyncConfig::default(), remote.clone())
        .await
        .unwrap();

    assert_eq!(
        ctx.request_manual_sync().await.unwrap(),
        SyncOutcome::NothingToSync
    );
    assert_eq!(remote.write_calls(), 0);

    ctx.shutdown().await;
}

#[tokio::test]
async fn manual_sync_reports_unreachable_remote() {
    let remote = MemoryRemote::new_shared();
    remote.set_reachable(false);
    let ctx = SyncContext::in_memory(SyncConfig::default(), remote.clone())
        .await
        .unwrap();
    assert_eq!(ctx.monitor().state(), ConnectivityState::OnlineUnverified);

    ctx.submit_create(fields(json!({"name": "Branch A"})))
        .await
        .unwrap();
    assert_eq!(
        ctx.request_manual_sync().await.unwrap(),
        SyncOutcome::Unreachable
    );
    assert_eq!(ctx.queue().len().await.unwrap(), 1);

    ctx.shutdown().await;
}

#[tokio::test]
async fn remote_changes_reach_local_store() {
    let remote = MemoryRemote::new_shared();
    let ctx = SyncContext::in_memory(SyncConfig::default(), remote.clone())
        .await
        .unwrap();
    let mut changes = ctx.subscribe_changes();

    remote.insert_external("branches", "doc-x", fields(json!({"name": "From elsewhere"})));
    wait_for(&mut changes, |c| matches!(c, StateChange::Reconciled { .. })).await;

    let records = ctx.list_all().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].remote_id.as_deref(), Some("doc-x"));
    assert!(records[0].is_synced);

    remote.remove_external("branches", "doc-x");
    wait_for(&mut changes, |c| matches!(c, StateChange::Reconciled { .. })).await;
    assert!(ctx.list_all().await.unwrap().is_empty());

    ctx.shutdown().await;
}

#[tokio::test]
async fn resubmit_requeues_abandoned_record() {
    let remote = MemoryRemote::new_shared();
    let config = SyncConfig::default().with_retry_ceiling(1);
    let ctx = SyncContext::in_memory(config, remote.clone()).await.unwrap();
    remote.reject_writes(Some("quota exceeded".into()));

    let id = ctx
        .submit_create(fields(json!({"name": "Branch A"})))
        .await
        .unwrap();
    ctx.request_manual_sync().await.unwrap();
    assert_eq!(ctx.queue().len().await.unwrap(), 0);
    assert!(!ctx.get(id).await.unwrap().unwrap().is_synced);

    remote.reject_writes(None);
    assert!(ctx.resubmit(id).await.unwrap());
    // Already queued
    assert!(!ctx.resubmit(id).await.unwrap());

    ctx.request_manual_sync().await.unwrap();
    assert!(ctx.get(id).await.unwrap().unwrap().is_synced);
    assert_eq!(ctx.resubmit_all_unsynced().await.unwrap(), 0);

    ctx.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn timer_reprobes_and_drains() {
    let remote = MemoryRemote::new_shared();
    remote.set_reachable(false);
    let ctx = SyncContext::in_memory(SyncConfig::default(), remote.clone())
        .await
        .unwrap();
    let id = ctx
        .submit_create(fields(json!({"name": "Branch A"})))
        .await
        .unwrap();
    let mut changes = ctx.subscribe_changes();

    remote.set_reachable(true);
    tokio::time::sleep(Duration::from_secs(121)).await;
    wait_for(&mut changes, |c| matches!(c, StateChange::Drained { .. })).await;

    assert_eq!(ctx.monitor().state(), ConnectivityState::OnlineReachable);
    assert!(ctx.get(id).await.unwrap().unwrap().is_synced);

    ctx.shutdown().await;
}
