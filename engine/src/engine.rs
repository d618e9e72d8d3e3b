//! The sync engine: drains the queue to the remote store and reconciles
//! remote snapshots back into the local store.
//!
//! # Drain
//!
//! 1. Skip unless the remote store is reachable, and skip if a drain is
//!    already running.
//! 2. Send every pending operation oldest-first. Failures are counted
//!    against the operation and the pass moves on; once an operation of a
//!    record fails, later operations of that record wait for the next drain.
//! 3. Operations enqueued while the pass ran are sent by a follow-up pass.
//! 4. Publish [`StateChange::Drained`].
//!
//! # Reconciliation
//!
//! Each remote snapshot is planned by [`Reconciler`] and applied here.
//! Drain passes and reconciliation batches hold the same lock, so a
//! snapshot never sees a create that was sent but not yet confirmed. Every
//! accepted write is remembered as the document's last known contents, so
//! only documents that changed remotely since are applied.

use crate::{
    error::Result, Clock, CollectionName, ConnectivityMonitor, ConnectivityState, Error,
    FailureOutcome, Fields, LocalId, LocalStore, OpKind, PendingIndex, QueueId, QueuedOperation,
    ReconcileAction, ReconcileSummary, Reconciler, RemoteDocument, RemoteId, RemoteStore,
    SeenDocuments, SyncQueue,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, warn};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Notification that records or sync status changed and views should be
/// refreshed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StateChange {
    /// A local create, update or delete was applied
    LocalMutation { local_id: LocalId },
    /// A drain finished
    Drained { report: DrainReport },
    /// A remote snapshot changed local records
    Reconciled { summary: ReconcileSummary },
    /// Connectivity moved to a new state
    Connectivity { state: ConnectivityState },
}

/// What a single drain did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    /// Passes over the queue, including follow-ups
    pub passes: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Failed operations that hit the retry ceiling and were evicted
    pub abandoned: usize,
    /// Operations dropped because their record no longer exists
    pub superseded: usize,
    /// Operations held back behind a failed operation of the same record
    pub deferred: usize,
}

impl DrainReport {
    pub fn summary(&self) -> SyncSummary {
        if self.failed == 0 {
            SyncSummary::Success
        } else if self.succeeded + self.superseded == 0 {
            SyncSummary::Failure
        } else {
            SyncSummary::Partial
        }
    }
}

/// Overall result of a completed drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncSummary {
    Success,
    Partial,
    Failure,
}

/// Result of a drain request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The remote store is not known to be reachable; the queue is untouched
    NotReachable,
    /// Another drain is running
    Busy,
    /// The queue was empty
    NothingToSync,
    Completed(DrainReport),
}

/// What the user sees after asking for a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// The device has no network
    Offline,
    /// The network is up but the remote store did not answer
    Unreachable,
    Busy,
    NothingToSync,
    Success,
    Partial,
    Failure,
}

impl SyncOutcome {
    pub fn from_drain(outcome: DrainOutcome, connectivity: ConnectivityState) -> Self {
        match outcome {
            DrainOutcome::NotReachable if connectivity.is_online() => SyncOutcome::Unreachable,
            DrainOutcome::NotReachable => SyncOutcome::Offline,
            DrainOutcome::Busy => SyncOutcome::Busy,
            DrainOutcome::NothingToSync => SyncOutcome::NothingToSync,
            DrainOutcome::Completed(report) => match report.summary() {
                SyncSummary::Success => SyncOutcome::Success,
                SyncSummary::Partial => SyncOutcome::Partial,
                SyncSummary::Failure => SyncOutcome::Failure,
            },
        }
    }
}

enum Processed {
    Sent,
    Superseded,
}

/// State guarded by the exclusive lock.
#[derive(Debug, Default)]
struct Exclusive {
    /// Documents in the last processed snapshot
    seen: SeenDocuments,
}

/// Per-drain bookkeeping.
struct DrainPass<'a> {
    handled: HashSet<QueueId>,
    /// Records with an operation that failed during this drain
    blocked: HashSet<LocalId>,
    /// Remote ids returned by creates during this drain
    assigned: HashMap<LocalId, RemoteId>,
    saw_unreachable: bool,
    /// Documents known to reconciliation, updated with every accepted write
    seen: &'a mut SeenDocuments,
}

impl<'a> DrainPass<'a> {
    fn new(seen: &'a mut SeenDocuments) -> Self {
        Self {
            handled: HashSet::new(),
            blocked: HashSet::new(),
            assigned: HashMap::new(),
            saw_unreachable: false,
            seen,
        }
    }

    /// The remote document now holds exactly `fields`.
    fn wrote(&mut self, remote_id: &str, fields: &Fields) {
        self.seen.insert(remote_id.to_string(), Some(fields.clone()));
    }

    /// `payload` was merged into the remote document; `local` stands in for
    /// contents never observed.
    fn merged(&mut self, remote_id: &str, payload: &Fields, local: &Fields) {
        if let Some(Some(doc)) = self.seen.get_mut(remote_id) {
            for (key, value) in payload {
                doc.insert(key.clone(), value.clone());
            }
            return;
        }
        self.wrote(remote_id, local);
    }

    fn deleted(&mut self, remote_id: &str) {
        self.seen.remove(remote_id);
    }
}

/// Clears the draining flag and publishes the outcome when a drain ends,
/// including by error.
struct DrainFlag<'a> {
    engine: &'a SyncEngine,
    outcome: Option<DrainOutcome>,
}

impl Drop for DrainFlag<'_> {
    fn drop(&mut self) {
        self.engine.draining.store(false, Ordering::SeqCst);
        self.engine.drain_finished.send_replace(self.outcome);
    }
}

/// Drains the sync queue and reconciles remote snapshots.
pub struct SyncEngine {
    store: Arc<dyn LocalStore>,
    queue: Arc<dyn SyncQueue>,
    remote: Arc<dyn RemoteStore>,
    monitor: Arc<ConnectivityMonitor>,
    clock: Arc<dyn Clock>,
    collection: CollectionName,
    draining: AtomicBool,
    /// Outcome of the most recently finished drain; `None` if it failed
    drain_finished: watch::Sender<Option<DrainOutcome>>,
    exclusive: Mutex<Exclusive>,
    changes: broadcast::Sender<StateChange>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn LocalStore>,
        queue: Arc<dyn SyncQueue>,
        remote: Arc<dyn RemoteStore>,
        monitor: Arc<ConnectivityMonitor>,
        clock: Arc<dyn Clock>,
        collection: impl Into<CollectionName>,
    ) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let (drain_finished, _) = watch::channel(None);
        Self {
            store,
            queue,
            remote,
            monitor,
            clock,
            collection: collection.into(),
            draining: AtomicBool::new(false),
            drain_finished,
            exclusive: Mutex::new(Exclusive::default()),
            changes,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    /// Whether a drain is running.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Receive state change notifications.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    /// Publish a state change. Having no listeners is fine.
    pub fn notify(&self, change: StateChange) {
        let _ = self.changes.send(change);
    }

    /// Seed the seen documents with the remote ids of local records, so
    /// documents deleted remotely while the app was closed are removed by the
    /// first snapshot. Their contents count as unobserved, so the first
    /// snapshot also applies remote edits made meanwhile.
    pub async fn prime_seen(&self) -> Result<usize> {
        let mut exclusive = self.exclusive.lock().await;
        let records = self.store.list().await?;
        exclusive.seen = records
            .into_iter()
            .filter_map(|r| r.remote_id)
            .map(|remote_id| (remote_id, None))
            .collect();
        Ok(exclusive.seen.len())
    }

    /// Send pending operations to the remote store.
    pub async fn drain(&self) -> Result<DrainOutcome> {
        if !self.monitor.is_reachable() {
            debug!("Skipping drain: remote store not reachable");
            return Ok(DrainOutcome::NotReachable);
        }

        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Skipping drain: already draining");
            return Ok(DrainOutcome::Busy);
        }
        let mut flag = DrainFlag {
            engine: self,
            outcome: None,
        };
        let mut exclusive = self.exclusive.lock().await;

        let mut pass = DrainPass::new(&mut exclusive.seen);
        let mut report = DrainReport::default();

        loop {
            let ops: Vec<QueuedOperation> = self
                .queue
                .peek_all()
                .await?
                .into_iter()
                .filter(|op| !pass.handled.contains(&op.queue_id))
                .collect();

            if ops.is_empty() {
                break;
            }
            report.passes += 1;

            for op in ops {
                pass.handled.insert(op.queue_id);
                self.drain_one(&op, &mut pass, &mut report).await?;
            }
        }

        if pass.saw_unreachable {
            self.monitor.report_unreachable();
        }

        if report.passes == 0 {
            debug!("Nothing to sync");
            flag.outcome = Some(DrainOutcome::NothingToSync);
            return Ok(DrainOutcome::NothingToSync);
        }

        info!(
            passes = report.passes,
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            abandoned = report.abandoned,
            superseded = report.superseded,
            "Drain completed"
        );
        self.notify(StateChange::Drained { report });
        flag.outcome = Some(DrainOutcome::Completed(report));

        Ok(DrainOutcome::Completed(report))
    }

    /// Like [`drain`](Self::drain), but if a drain is already running, wait
    /// for it and report its outcome instead of [`DrainOutcome::Busy`].
    pub async fn drain_now(&self) -> Result<DrainOutcome> {
        let mut finished = self.drain_finished.subscribe();

        match self.drain().await? {
            DrainOutcome::Busy => {
                if finished.changed().await.is_err() {
                    return Ok(DrainOutcome::Busy);
                }
                let last = *finished.borrow_and_update();
                Ok(last.unwrap_or(DrainOutcome::Busy))
            }
            outcome => Ok(outcome),
        }
    }

    async fn drain_one(
        &self,
        op: &QueuedOperation,
        pass: &mut DrainPass<'_>,
        report: &mut DrainReport,
    ) -> Result<()> {
        if pass.blocked.contains(&op.local_id) {
            debug!(queue_id = op.queue_id, local_id = op.local_id, "Deferring operation behind failed one");
            report.deferred += 1;
            return Ok(());
        }

        report.attempted += 1;
        let result = match op.kind {
            OpKind::Create => self.send_create(op, pass).await,
            OpKind::Update => self.send_update(op, pass).await,
            OpKind::Delete => self.send_delete(op, pass).await,
        };

        match result {
            Ok(Processed::Sent) => {
                report.succeeded += 1;
                Ok(())
            }
            Ok(Processed::Superseded) => {
                report.superseded += 1;
                Ok(())
            }
            Err(e) if e.is_remote() => {
                report.failed += 1;
                pass.blocked.insert(op.local_id);
                if e.is_transient() {
                    pass.saw_unreachable = true;
                }

                match self.queue.record_failure(op.queue_id, &e.to_string()).await? {
                    FailureOutcome::Retrying { attempts } => {
                        warn!(
                            queue_id = op.queue_id,
                            local_id = op.local_id,
                            kind = %op.kind,
                            attempts,
                            error = %e,
                            "Operation failed, will retry"
                        );
                    }
                    FailureOutcome::Abandoned { attempts } => {
                        report.abandoned += 1;
                        warn!(
                            queue_id = op.queue_id,
                            local_id = op.local_id,
                            kind = %op.kind,
                            attempts,
                            error = %e,
                            "Operation abandoned after reaching retry ceiling"
                        );
                    }
                    FailureOutcome::Missing => {}
                }
                Ok(())
            }
            Err(e) => {
                error!(queue_id = op.queue_id, local_id = op.local_id, error = %e, "Drain aborted");
                Err(e)
            }
        }
    }

    async fn send_create(
        &self,
        op: &QueuedOperation,
        pass: &mut DrainPass<'_>,
    ) -> Result<Processed> {
        let Some(record) = self.store.get(op.local_id).await? else {
            return self.supersede(op).await;
        };

        // Resubmitted record whose document already exists
        if let Some(remote_id) = record.remote_id {
            self.remote
                .update(&self.collection, &remote_id, &op.payload)
                .await?;
            pass.merged(&remote_id, &op.payload, &record.fields);
            self.confirm_sent(op, &remote_id).await?;
            return Ok(Processed::Sent);
        }

        let remote_id = self.remote.add(&self.collection, &op.payload).await?;
        debug!(queue_id = op.queue_id, local_id = op.local_id, remote_id = %remote_id, "Create accepted");
        pass.assigned.insert(op.local_id, remote_id.clone());
        pass.wrote(&remote_id, &op.payload);

        self.queue.assign_remote_id(op.local_id, &remote_id).await?;
        self.confirm_sent(op, &remote_id).await?;
        Ok(Processed::Sent)
    }

    async fn send_update(
        &self,
        op: &QueuedOperation,
        pass: &mut DrainPass<'_>,
    ) -> Result<Processed> {
        let Some(record) = self.store.get(op.local_id).await? else {
            return self.supersede(op).await;
        };

        let remote_id = record
            .remote_id
            .clone()
            .or_else(|| op.remote_id.clone())
            .or_else(|| pass.assigned.get(&op.local_id).cloned());

        let remote_id = match remote_id {
            Some(remote_id) => {
                self.remote
                    .update(&self.collection, &remote_id, &op.payload)
                    .await?;
                pass.merged(&remote_id, &op.payload, &record.fields);
                remote_id
            }
            None => {
                // The record's create was abandoned, so the document never
                // existed; send the whole record instead.
                let remote_id = self.remote.add(&self.collection, &record.fields).await?;
                pass.assigned.insert(op.local_id, remote_id.clone());
                pass.wrote(&remote_id, &record.fields);
                self.queue.assign_remote_id(op.local_id, &remote_id).await?;
                remote_id
            }
        };

        debug!(queue_id = op.queue_id, local_id = op.local_id, remote_id = %remote_id, "Update accepted");
        self.confirm_sent(op, &remote_id).await?;
        Ok(Processed::Sent)
    }

    async fn send_delete(
        &self,
        op: &QueuedOperation,
        pass: &mut DrainPass<'_>,
    ) -> Result<Processed> {
        let remote_id = op
            .remote_id
            .clone()
            .or_else(|| pass.assigned.get(&op.local_id).cloned());

        match remote_id {
            Some(remote_id) => {
                self.remote.delete(&self.collection, &remote_id).await?;
                pass.deleted(&remote_id);
                debug!(queue_id = op.queue_id, local_id = op.local_id, remote_id = %remote_id, "Delete accepted");
            }
            None => {
                debug!(queue_id = op.queue_id, local_id = op.local_id, "Record never synced, nothing to delete remotely");
            }
        }

        self.queue.remove(op.queue_id).await?;
        Ok(Processed::Sent)
    }

    async fn supersede(&self, op: &QueuedOperation) -> Result<Processed> {
        debug!(queue_id = op.queue_id, local_id = op.local_id, kind = %op.kind, "Record gone, dropping operation");
        self.queue.remove(op.queue_id).await?;
        Ok(Processed::Superseded)
    }

    async fn confirm_sent(&self, op: &QueuedOperation, remote_id: &str) -> Result<()> {
        self.queue.remove(op.queue_id).await?;
        let still_pending = self.queue.has_pending_for_local(op.local_id).await?;

        if !self
            .store
            .confirm(op.local_id, remote_id, !still_pending)
            .await?
        {
            // Deleted while the call was in flight; make sure the queued
            // delete targets the document that now exists.
            self.queue.assign_remote_id(op.local_id, remote_id).await?;
        }
        Ok(())
    }

    /// Merge a remote snapshot into the local store.
    pub async fn reconcile(&self, docs: &[RemoteDocument]) -> Result<ReconcileSummary> {
        let mut exclusive = self.exclusive.lock().await;
        self.reconcile_locked(&mut exclusive, docs).await
    }

    /// Reconcile the newest available snapshot.
    ///
    /// `newer` is polled once the lock is held and should return snapshots
    /// that arrived meanwhile; only the last one is applied. Every write a
    /// drain made has been announced by then, so older snapshots cannot
    /// roll confirmed records back.
    pub async fn reconcile_latest<F>(
        &self,
        docs: Vec<RemoteDocument>,
        mut newer: F,
    ) -> Result<ReconcileSummary>
    where
        F: FnMut() -> Option<Vec<RemoteDocument>> + Send,
    {
        let mut exclusive = self.exclusive.lock().await;

        let mut docs = docs;
        let mut skipped = 0usize;
        while let Some(next) = newer() {
            docs = next;
            skipped += 1;
        }
        if skipped > 0 {
            debug!(skipped, "Coalesced queued remote snapshots");
        }

        self.reconcile_locked(&mut exclusive, &docs).await
    }

    async fn reconcile_locked(
        &self,
        exclusive: &mut Exclusive,
        docs: &[RemoteDocument],
    ) -> Result<ReconcileSummary> {
        let records = self.store.list().await?;
        let ops = self.queue.peek_all().await?;
        let pending = PendingIndex::from_ops(&ops);
        let plan = Reconciler::new(&records, &pending, &exclusive.seen).plan(docs);
        let mut summary = plan.summary;
        let now = self.clock.now();

        for action in plan.actions {
            match action {
                ReconcileAction::Insert { remote_id, fields } => {
                    // A local write may have been queued since planning
                    if self.queue.has_pending_for_remote(&remote_id).await? {
                        summary.inserted -= 1;
                        summary.skipped_echo += 1;
                        continue;
                    }
                    let local_id = self.store.upsert_remote(&remote_id, fields, now).await?;
                    debug!(local_id, remote_id = %remote_id, "Inserted remote document");
                }
                ReconcileAction::Overwrite {
                    local_id,
                    remote_id,
                    fields,
                } => {
                    if self.queue.has_pending_for_remote(&remote_id).await? {
                        summary.overwritten -= 1;
                        summary.skipped_echo += 1;
                        continue;
                    }
                    self.store.upsert_remote(&remote_id, fields, now).await?;
                    debug!(local_id, remote_id = %remote_id, "Overwrote record from remote");
                }
                ReconcileAction::Remove {
                    local_id,
                    remote_id,
                } => {
                    if self.queue.has_pending_delete_for_remote(&remote_id).await? {
                        summary.removed -= 1;
                        summary.kept_pending_delete += 1;
                        continue;
                    }
                    match self.store.delete(local_id).await {
                        Ok(_) | Err(Error::RecordNotFound(_)) => {
                            debug!(local_id, remote_id = %remote_id, "Removed record deleted remotely");
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        exclusive.seen = plan.seen;

        if summary.has_changes() {
            info!(
                inserted = summary.inserted,
                overwritten = summary.overwritten,
                removed = summary.removed,
                skipped_echo = summary.skipped_echo,
                "Reconciled remote snapshot"
            );
            self.notify(StateChange::Reconciled { summary });
        } else {
            debug!(
                unchanged = summary.unchanged,
                skipped_echo = summary.skipped_echo,
                "Remote snapshot brought no changes"
            );
        }

        Ok(summary)
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("collection", &self.collection)
            .field("draining", &self.is_draining())
            .finish()
    }
}
