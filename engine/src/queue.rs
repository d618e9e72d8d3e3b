//! Sync queue - the ordered log of mutations the remote store has not yet
//! confirmed.
//!
//! Operations are drained oldest-first. A failed operation stays in place
//! with its attempt count bumped; once it reaches the retry ceiling it is
//! evicted and its record stays unsynced until the user resubmits it.

use crate::{
    error::Result, Error, FailureOutcome, LocalId, NewOperation, OpKind, QueueId, QueuedOperation,
    RemoteId,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Failed attempts after which an operation is abandoned.
pub const DEFAULT_RETRY_CEILING: u32 = 3;

/// Persistent queue of pending operations.
#[async_trait]
pub trait SyncQueue: Send + Sync {
    /// Append an operation. Queue ids are strictly increasing.
    async fn enqueue(&self, op: NewOperation) -> Result<QueueId>;

    /// All pending operations, oldest first.
    async fn peek_all(&self) -> Result<Vec<QueuedOperation>>;

    /// Remove an operation. Removing an unknown id is not an error.
    async fn remove(&self, queue_id: QueueId) -> Result<()>;

    /// Count a failed attempt, evicting the operation at the retry ceiling.
    async fn record_failure(&self, queue_id: QueueId, error: &str) -> Result<FailureOutcome>;

    /// Fill `remote_id` into pending operations of `local_id` that lack one.
    /// Returns how many operations were updated.
    async fn assign_remote_id(&self, local_id: LocalId, remote_id: &str) -> Result<usize>;

    /// Whether any pending operation targets `remote_id`.
    async fn has_pending_for_remote(&self, remote_id: &str) -> Result<bool>;

    /// Whether a pending delete targets `remote_id`.
    async fn has_pending_delete_for_remote(&self, remote_id: &str) -> Result<bool>;

    /// Whether any pending operation belongs to `local_id`.
    async fn has_pending_for_local(&self, local_id: LocalId) -> Result<bool>;

    /// Number of pending operations.
    async fn len(&self) -> Result<usize>;
}

#[derive(Debug)]
pub(crate) struct QueueState {
    pub(crate) next_id: QueueId,
    pub(crate) ops: BTreeMap<QueueId, QueuedOperation>,
    by_remote: HashMap<RemoteId, BTreeSet<QueueId>>,
}

impl QueueState {
    fn new(next_id: QueueId) -> Self {
        Self {
            next_id,
            ops: BTreeMap::new(),
            by_remote: HashMap::new(),
        }
    }

    fn insert(&mut self, op: QueuedOperation) {
        if let Some(remote_id) = &op.remote_id {
            self.by_remote
                .entry(remote_id.clone())
                .or_default()
                .insert(op.queue_id);
        }
        self.ops.insert(op.queue_id, op);
    }

    fn remove(&mut self, queue_id: QueueId) -> Option<QueuedOperation> {
        let op = self.ops.remove(&queue_id)?;
        if let Some(remote_id) = &op.remote_id {
            if let Some(ids) = self.by_remote.get_mut(remote_id) {
                ids.remove(&queue_id);
                if ids.is_empty() {
                    self.by_remote.remove(remote_id);
                }
            }
        }
        Some(op)
    }

    fn pending_for_remote(&self, remote_id: &str) -> impl Iterator<Item = &QueuedOperation> {
        self.by_remote
            .get(remote_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.ops.get(id))
    }
}

/// In-memory [`SyncQueue`] with a remote-id index.
#[derive(Debug)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    retry_ceiling: u32,
    unavailable: AtomicBool,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    /// Create an empty queue with the default retry ceiling.
    pub fn new() -> Self {
        Self::with_retry_ceiling(DEFAULT_RETRY_CEILING)
    }

    /// Create an empty queue that abandons operations after `ceiling`
    /// failed attempts.
    pub fn with_retry_ceiling(ceiling: u32) -> Self {
        Self {
            state: Mutex::new(QueueState::new(1)),
            retry_ceiling: ceiling.max(1),
            unavailable: AtomicBool::new(false),
        }
    }

    pub(crate) fn from_operations(
        next_id: QueueId,
        ops: impl IntoIterator<Item = QueuedOperation>,
        retry_ceiling: u32,
    ) -> Self {
        let mut state = QueueState::new(next_id);
        for op in ops {
            state.insert(op);
        }
        Self {
            state: Mutex::new(state),
            retry_ceiling: retry_ceiling.max(1),
            unavailable: AtomicBool::new(false),
        }
    }

    /// The configured retry ceiling.
    pub fn retry_ceiling(&self) -> u32 {
        self.retry_ceiling
    }

    /// Simulate storage failure, see [`crate::MemoryStore::set_unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, QueueState>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StorageFault("sync queue unavailable".into()));
        }
        self.state
            .lock()
            .map_err(|_| Error::StorageFault("sync queue lock poisoned".into()))
    }
}

#[async_trait]
impl SyncQueue for MemoryQueue {
    async fn enqueue(&self, op: NewOperation) -> Result<QueueId> {
        let mut state = self.lock()?;
        let queue_id = state.next_id;
        state.next_id += 1;
        state.insert(op.into_queued(queue_id));
        Ok(queue_id)
    }

    async fn peek_all(&self) -> Result<Vec<QueuedOperation>> {
        let state = self.lock()?;
        Ok(state.ops.values().cloned().collect())
    }

    async fn remove(&self, queue_id: QueueId) -> Result<()> {
        let mut state = self.lock()?;
        state.remove(queue_id);
        Ok(())
    }

    async fn record_failure(&self, queue_id: QueueId, error: &str) -> Result<FailureOutcome> {
        let mut state = self.lock()?;
        let Some(op) = state.ops.get_mut(&queue_id) else {
            return Ok(FailureOutcome::Missing);
        };

        op.attempts += 1;
        op.last_error = Some(error.to_string());
        let attempts = op.attempts;

        if attempts >= self.retry_ceiling {
            state.remove(queue_id);
            Ok(FailureOutcome::Abandoned { attempts })
        } else {
            Ok(FailureOutcome::Retrying { attempts })
        }
    }

    async fn assign_remote_id(&self, local_id: LocalId, remote_id: &str) -> Result<usize> {
        let mut state = self.lock()?;
        let targets: Vec<QueueId> = state
            .ops
            .values()
            .filter(|op| op.local_id == local_id && op.remote_id.is_none())
            .map(|op| op.queue_id)
            .collect();

        for queue_id in &targets {
            if let Some(mut op) = state.remove(*queue_id) {
                op.remote_id = Some(remote_id.to_string());
                state.insert(op);
            }
        }

        Ok(targets.len())
    }

    async fn has_pending_for_remote(&self, remote_id: &str) -> Result<bool> {
        let state = self.lock()?;
        let found = state.pending_for_remote(remote_id).next().is_some();
        Ok(found)
    }

    async fn has_pending_delete_for_remote(&self, remote_id: &str) -> Result<bool> {
        let state = self.lock()?;
        let found = state
            .pending_for_remote(remote_id)
            .any(|op| op.kind == OpKind::Delete);
        Ok(found)
    }

    async fn has_pending_for_local(&self, local_id: LocalId) -> Result<bool> {
        let state = self.lock()?;
        Ok(state.ops.values().any(|op| op.local_id == local_id))
    }

    async fn len(&self) -> Result<usize> {
        let state = self.lock()?;
        Ok(state.ops.len())
    }
}
