//! Remote document store contract and an in-process loopback implementation.
//!
//! The remote store is a capability: it accepts writes, pushes full
//! collection snapshots to subscribers and answers reachability probes. How
//! it talks to a real database is not the engine's concern.

use crate::{error::Result, CollectionName, Error, Fields, OpKind, RemoteId};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// A document as the remote store holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDocument {
    pub id: RemoteId,
    pub fields: Fields,
}

impl RemoteDocument {
    pub fn new(id: impl Into<RemoteId>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }
}

/// Change notification delivered to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    /// The authoritative contents of the collection
    Snapshot(Vec<RemoteDocument>),
    /// The listener hit an error; the subscription stays open
    Error(String),
}

/// A live subscription to a remote collection.
///
/// Dropping the subscription releases it.
pub struct Subscription {
    events: mpsc::UnboundedReceiver<RemoteEvent>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wrap an event stream with a callback run when the subscription is
    /// released.
    pub fn new(
        events: mpsc::UnboundedReceiver<RemoteEvent>,
        on_close: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            events,
            on_close: Some(Box::new(on_close)),
        }
    }

    /// Next event, or `None` once the remote side has gone away.
    pub async fn recv(&mut self) -> Option<RemoteEvent> {
        self.events.recv().await
    }

    /// Next event if one is already waiting.
    pub fn try_recv(&mut self) -> Option<RemoteEvent> {
        self.events.try_recv().ok()
    }

    /// Release the subscription.
    pub fn unsubscribe(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
        self.events.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("open", &self.on_close.is_some())
            .finish()
    }
}

/// The remote document database.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Add a document, returning the id the store assigned.
    async fn add(&self, collection: &str, payload: &Fields) -> Result<RemoteId>;

    /// Merge `payload` into an existing document.
    async fn update(&self, collection: &str, remote_id: &str, payload: &Fields) -> Result<()>;

    /// Delete a document. Deleting an absent document succeeds.
    async fn delete(&self, collection: &str, remote_id: &str) -> Result<()>;

    /// Subscribe to snapshots of a collection. The current contents are
    /// delivered first.
    async fn subscribe(&self, collection: &str) -> Result<Subscription>;

    /// Whether the store can be reached right now.
    async fn probe_reachable(&self) -> bool;
}

/// A write call as seen by [`MemoryRemote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    pub kind: OpKind,
    pub collection: CollectionName,
    pub remote_id: Option<RemoteId>,
}

#[derive(Debug)]
struct Subscriber {
    collection: CollectionName,
    sender: mpsc::UnboundedSender<RemoteEvent>,
}

type Collections = HashMap<CollectionName, BTreeMap<RemoteId, Fields>>;

/// In-process [`RemoteStore`].
///
/// Backs the server binary's loopback mode and the test suite. Reachability
/// and write rejection can be toggled to exercise the drain paths, and
/// documents can be changed "by another client" to exercise reconciliation.
#[derive(Debug)]
pub struct MemoryRemote {
    collections: Mutex<Collections>,
    subscribers: Arc<DashMap<u64, Subscriber>>,
    next_subscriber: AtomicU64,
    reachable: AtomicBool,
    rejection: Mutex<Option<String>>,
    calls: Mutex<Vec<RemoteCall>>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    /// Create an empty, reachable remote store.
    pub fn new() -> Self {
        Self {
            collections: Mutex::new(HashMap::new()),
            subscribers: Arc::new(DashMap::new()),
            next_subscriber: AtomicU64::new(1),
            reachable: AtomicBool::new(true),
            rejection: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Create a remote store wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Toggle reachability. While unreachable, writes fail with
    /// [`Error::RemoteUnreachable`] and no snapshots are delivered; coming
    /// back delivers the current contents to every subscriber.
    pub fn set_reachable(&self, reachable: bool) {
        let was = self.reachable.swap(reachable, Ordering::SeqCst);
        if reachable && !was {
            if let Ok(collections) = self.collections.lock() {
                let names: BTreeSet<_> = self
                    .subscribers
                    .iter()
                    .map(|s| s.collection.clone())
                    .collect();
                for name in names {
                    self.emit_snapshot(&collections, &name);
                }
            }
        }
    }

    /// Whether the store currently accepts calls.
    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Reject every write with [`Error::RemoteRejected`] carrying `reason`,
    /// or accept writes again with `None`.
    pub fn reject_writes(&self, reason: Option<String>) {
        if let Ok(mut rejection) = self.rejection.lock() {
            *rejection = reason;
        }
    }

    /// Every write call received so far, including failed ones.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of write calls received so far.
    pub fn write_calls(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Number of open subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Documents of a collection, ordered by id.
    pub fn documents(&self, collection: &str) -> Vec<RemoteDocument> {
        self.collections
            .lock()
            .map(|c| snapshot_of(&c, collection))
            .unwrap_or_default()
    }

    /// A single document's fields.
    pub fn document(&self, collection: &str, remote_id: &str) -> Option<Fields> {
        self.collections
            .lock()
            .ok()?
            .get(collection)?
            .get(remote_id)
            .cloned()
    }

    /// Write a document as another client would, bypassing reachability
    /// and the call log. Subscribers are notified.
    pub fn insert_external(&self, collection: &str, remote_id: &str, fields: Fields) {
        if let Ok(mut collections) = self.collections.lock() {
            collections
                .entry(collection.to_string())
                .or_default()
                .insert(remote_id.to_string(), fields);
            self.emit_snapshot(&collections, collection);
        }
    }

    /// Delete a document as another client would.
    pub fn remove_external(&self, collection: &str, remote_id: &str) {
        if let Ok(mut collections) = self.collections.lock() {
            if let Some(docs) = collections.get_mut(collection) {
                docs.remove(remote_id);
            }
            self.emit_snapshot(&collections, collection);
        }
    }

    /// Push a listener error to every subscriber of `collection`.
    pub fn emit_error(&self, collection: &str, message: &str) {
        for entry in self.subscribers.iter() {
            if entry.collection == collection {
                let _ = entry.sender.send(RemoteEvent::Error(message.to_string()));
            }
        }
    }

    fn record_call(&self, kind: OpKind, collection: &str, remote_id: Option<&str>) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RemoteCall {
                kind,
                collection: collection.to_string(),
                remote_id: remote_id.map(str::to_string),
            });
        }
    }

    fn check_writable(&self) -> Result<()> {
        if !self.is_reachable() {
            return Err(Error::RemoteUnreachable("remote store is offline".into()));
        }
        let rejection = self
            .rejection
            .lock()
            .map_err(|_| Error::RemoteRejected("remote store lock poisoned".into()))?;
        match rejection.as_ref() {
            Some(reason) => Err(Error::RemoteRejected(reason.clone())),
            None => Ok(()),
        }
    }

    fn lock_collections(&self) -> Result<MutexGuard<'_, Collections>> {
        self.collections
            .lock()
            .map_err(|_| Error::RemoteUnreachable("remote store lock poisoned".into()))
    }

    // Called with the collections lock held so snapshots reach subscribers
    // in write order.
    fn emit_snapshot(&self, collections: &Collections, collection: &str) {
        if !self.is_reachable() {
            return;
        }

        let docs = snapshot_of(collections, collection);
        let mut delivered = 0;
        for entry in self.subscribers.iter() {
            if entry.collection == collection
                && entry.sender.send(RemoteEvent::Snapshot(docs.clone())).is_ok()
            {
                delivered += 1;
            }
        }

        tracing::trace!(
            collection = %collection,
            documents = docs.len(),
            subscribers = delivered,
            "Delivered remote snapshot"
        );
    }
}

fn snapshot_of(collections: &Collections, collection: &str) -> Vec<RemoteDocument> {
    collections
        .get(collection)
        .map(|docs| {
            docs.iter()
                .map(|(id, fields)| RemoteDocument::new(id.clone(), fields.clone()))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn add(&self, collection: &str, payload: &Fields) -> Result<RemoteId> {
        self.record_call(OpKind::Create, collection, None);
        self.check_writable()?;

        let remote_id = uuid::Uuid::new_v4().simple().to_string();
        let mut collections = self.lock_collections()?;
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(remote_id.clone(), payload.clone());
        self.emit_snapshot(&collections, collection);

        Ok(remote_id)
    }

    async fn update(&self, collection: &str, remote_id: &str, payload: &Fields) -> Result<()> {
        self.record_call(OpKind::Update, collection, Some(remote_id));
        self.check_writable()?;

        let mut collections = self.lock_collections()?;
        let doc = collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(remote_id))
            .ok_or_else(|| Error::RemoteRejected(format!("no document to update: {remote_id}")))?;
        for (key, value) in payload {
            doc.insert(key.clone(), value.clone());
        }
        self.emit_snapshot(&collections, collection);

        Ok(())
    }

    async fn delete(&self, collection: &str, remote_id: &str) -> Result<()> {
        self.record_call(OpKind::Delete, collection, Some(remote_id));
        self.check_writable()?;

        let mut collections = self.lock_collections()?;
        if let Some(docs) = collections.get_mut(collection) {
            docs.remove(remote_id);
        }
        self.emit_snapshot(&collections, collection);

        Ok(())
    }

    async fn subscribe(&self, collection: &str) -> Result<Subscription> {
        let (sender, events) = mpsc::unbounded_channel();
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);

        {
            let collections = self.lock_collections()?;
            if self.is_reachable() {
                let _ = sender.send(RemoteEvent::Snapshot(snapshot_of(&collections, collection)));
            }
            self.subscribers.insert(
                id,
                Subscriber {
                    collection: collection.to_string(),
                    sender,
                },
            );
        }

        tracing::debug!(collection = %collection, subscriber = id, "Remote subscription opened");

        let subscribers = Arc::clone(&self.subscribers);
        Ok(Subscription::new(events, move || {
            subscribers.remove(&id);
            tracing::debug!(subscriber = id, "Remote subscription released");
        }))
    }

    async fn probe_reachable(&self) -> bool {
        self.is_reachable()
    }
}
