//! Reconciliation of remote snapshots into local state.
//!
//! Planning is pure: given the local records, the index of pending
//! operations and the documents seen in the previous snapshot, the
//! [`Reconciler`] decides what to write. The engine applies the plan.
//!
//! # Rules
//!
//! 1. A document whose remote id has a pending operation is an echo of a
//!    local write that has not drained yet, and is skipped.
//! 2. A document that is neither new nor changed since the previous
//!    snapshot is left alone, so a local edit whose operation was abandoned
//!    stays unsynced until it is queued again.
//! 3. A new or changed document with no local record is inserted as a
//!    synced record.
//! 4. A new or changed document whose record already matches it is left
//!    alone; otherwise the record's fields are overwritten (last write wins).
//! 5. A record whose remote id was in the previous snapshot but is missing
//!    from this one was deleted remotely and is removed, unless a local
//!    delete for it is still pending.

use crate::{Fields, LocalId, QueuedOperation, Record, RemoteDocument, RemoteId, OpKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Remote documents present in the last processed snapshot, with the fields
/// they had. `None` marks a document known to exist whose contents have not
/// been observed yet.
pub type SeenDocuments = BTreeMap<RemoteId, Option<Fields>>;

/// Pending operations indexed by the remote document they target.
#[derive(Debug, Clone, Default)]
pub struct PendingIndex {
    touched: HashSet<RemoteId>,
    deletes: HashSet<RemoteId>,
}

impl PendingIndex {
    pub fn from_ops<'a>(ops: impl IntoIterator<Item = &'a QueuedOperation>) -> Self {
        let mut index = Self::default();
        for op in ops {
            if let Some(remote_id) = &op.remote_id {
                index.touched.insert(remote_id.clone());
                if op.kind == OpKind::Delete {
                    index.deletes.insert(remote_id.clone());
                }
            }
        }
        index
    }

    /// Whether any pending operation targets `remote_id`.
    pub fn touches(&self, remote_id: &str) -> bool {
        self.touched.contains(remote_id)
    }

    /// Whether a pending delete targets `remote_id`.
    pub fn has_delete(&self, remote_id: &str) -> bool {
        self.deletes.contains(remote_id)
    }
}

/// A single local write decided by reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileAction {
    /// Mirror a document the local store has never seen
    Insert { remote_id: RemoteId, fields: Fields },
    /// Replace a record's fields with the remote ones
    Overwrite {
        local_id: LocalId,
        remote_id: RemoteId,
        fields: Fields,
    },
    /// Drop a record whose document was deleted remotely
    Remove { local_id: LocalId, remote_id: RemoteId },
}

/// Counts of what a reconciliation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSummary {
    pub inserted: usize,
    pub overwritten: usize,
    pub removed: usize,
    pub unchanged: usize,
    /// Documents skipped because a local write to them is still queued
    pub skipped_echo: usize,
    /// Remote deletions ignored because a local delete is still queued
    pub kept_pending_delete: usize,
}

impl ReconcileSummary {
    /// Whether the pass changed any local record.
    pub fn has_changes(&self) -> bool {
        self.inserted + self.overwritten + self.removed > 0
    }
}

/// The outcome of planning: writes to apply and the new seen set.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilePlan {
    pub actions: Vec<ReconcileAction>,
    pub summary: ReconcileSummary,
    /// Documents present in the snapshot
    pub seen: SeenDocuments,
}

/// Plans reconciliation of one snapshot.
pub struct Reconciler<'a> {
    records: &'a [Record],
    pending: &'a PendingIndex,
    seen: &'a SeenDocuments,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        records: &'a [Record],
        pending: &'a PendingIndex,
        seen: &'a SeenDocuments,
    ) -> Self {
        Self {
            records,
            pending,
            seen,
        }
    }

    /// Decide what the snapshot `docs` changes locally.
    pub fn plan(&self, docs: &[RemoteDocument]) -> ReconcilePlan {
        let by_remote: HashMap<&str, &Record> = self
            .records
            .iter()
            .filter_map(|r| r.remote_id.as_deref().map(|id| (id, r)))
            .collect();

        let mut actions = Vec::new();
        let mut summary = ReconcileSummary::default();
        let mut present = SeenDocuments::new();

        for doc in docs {
            // A snapshot lists each document once; ignore repeats
            if present.contains_key(&doc.id) {
                continue;
            }
            present.insert(doc.id.clone(), Some(doc.fields.clone()));

            if self.pending.touches(&doc.id) {
                summary.skipped_echo += 1;
                continue;
            }

            let changed = !matches!(self.seen.get(&doc.id), Some(Some(prev)) if *prev == doc.fields);
            if !changed {
                summary.unchanged += 1;
                continue;
            }

            match by_remote.get(doc.id.as_str()) {
                None => {
                    summary.inserted += 1;
                    actions.push(ReconcileAction::Insert {
                        remote_id: doc.id.clone(),
                        fields: doc.fields.clone(),
                    });
                }
                Some(record) if record.matches_remote(&doc.fields) => {
                    summary.unchanged += 1;
                }
                Some(record) => {
                    summary.overwritten += 1;
                    actions.push(ReconcileAction::Overwrite {
                        local_id: record.local_id,
                        remote_id: doc.id.clone(),
                        fields: doc.fields.clone(),
                    });
                }
            }
        }

        for record in self.records {
            let Some(remote_id) = record.remote_id.as_deref() else {
                continue;
            };
            if present.contains_key(remote_id) || !self.seen.contains_key(remote_id) {
                continue;
            }
            if self.pending.has_delete(remote_id) {
                summary.kept_pending_delete += 1;
                continue;
            }
            summary.removed += 1;
            actions.push(ReconcileAction::Remove {
                local_id: record.local_id,
                remote_id: remote_id.to_string(),
            });
        }

        ReconcilePlan {
            actions,
            summary,
            seen: present,
        }
    }
}
