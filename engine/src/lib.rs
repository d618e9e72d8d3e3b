//! # Branchsync Engine
//!
//! An offline-tolerant write queue with eventual reconciliation against a
//! remote document store.
//!
//! Local edits are applied to the [`LocalStore`] immediately and queued in
//! the [`SyncQueue`]. The [`SyncEngine`] drains the queue to the
//! [`RemoteStore`] whenever the [`ConnectivityMonitor`] says the remote is
//! reachable, and merges the remote store's snapshots back into the local
//! store without reapplying the device's own writes.
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`Record`] carries:
//! - a local id assigned by the local store
//! - the remote id, once the remote store accepted the create
//! - its fields (a JSON object)
//! - an `is_synced` flag and a last-updated timestamp
//!
//! ### Operations
//!
//! Every local mutation enqueues a [`QueuedOperation`] of kind
//! [`OpKind::Create`], [`OpKind::Update`] or [`OpKind::Delete`]. Operations
//! are drained oldest-first; an operation that fails
//! [`DEFAULT_RETRY_CEILING`] times is dropped and its record stays unsynced
//! until it is resubmitted.
//!
//! ### Reconciliation
//!
//! The [`Reconciler`] plans how a remote snapshot changes local records.
//! Documents with a pending local operation are echoes and are skipped;
//! everything else is last-write-wins.
//!
//! ## Quick Start
//!
//! ```rust
//! use branchsync_engine::{MemoryRemote, SyncConfig, SyncContext, SyncOutcome};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> branchsync_engine::error::Result<()> {
//! let remote = MemoryRemote::new_shared();
//! let config = SyncConfig::default().with_start_online(false);
//! let ctx = SyncContext::in_memory(config, remote.clone()).await?;
//!
//! // Offline: applied locally and queued.
//! let fields = json!({"name": "Branch A"}).as_object().cloned().unwrap();
//! let id = ctx.submit_create(fields).await?;
//! assert!(!ctx.get(id).await?.unwrap().is_synced);
//!
//! // Back online: the queue drains.
//! ctx.set_network_available(true).await;
//! let _ = ctx.request_manual_sync().await?;
//! assert!(ctx.get(id).await?.unwrap().is_synced);
//!
//! ctx.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Persistence
//!
//! [`MemoryStore`] and [`MemoryQueue`] can be exported and restored with
//! [`StoreSnapshot`]. Durable backends implement [`LocalStore`] and
//! [`SyncQueue`] directly.

pub mod clock;
pub mod config;
pub mod connectivity;
pub mod context;
mod driver;
pub mod engine;
pub mod error;
pub mod form;
pub mod operation;
pub mod queue;
pub mod reconcile;
pub mod record;
pub mod remote;
pub mod schema;
pub mod snapshot;
pub mod store;

// Re-export main types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{SyncConfig, DEFAULT_COLLECTION, DEFAULT_SYNC_INTERVAL};
pub use connectivity::{ConnectivityMonitor, ConnectivityState};
pub use context::{SyncContext, SyncContextBuilder, SyncStatus};
pub use engine::{DrainOutcome, DrainReport, StateChange, SyncEngine, SyncOutcome, SyncSummary};
pub use error::Error;
pub use form::{BranchForm, FormMode, FormSubmission};
pub use operation::{FailureOutcome, NewOperation, OpKind, QueuedOperation};
pub use queue::{MemoryQueue, SyncQueue, DEFAULT_RETRY_CEILING};
pub use reconcile::{
    PendingIndex, ReconcileAction, ReconcilePlan, ReconcileSummary, Reconciler, SeenDocuments,
};
pub use record::Record;
pub use remote::{MemoryRemote, RemoteCall, RemoteDocument, RemoteEvent, RemoteStore, Subscription};
pub use schema::{CollectionSchema, FieldDef, FieldType};
pub use snapshot::{StoreSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use store::{LocalStore, MemoryStore};

/// Type aliases for clarity
pub type LocalId = u64;
pub type QueueId = u64;
pub type RemoteId = String;
pub type CollectionName = String;
pub type Timestamp = u64;
pub type Fields = serde_json::Map<String, serde_json::Value>;
