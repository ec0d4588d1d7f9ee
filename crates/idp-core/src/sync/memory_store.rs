//! In-process document store
//!
//! Backs local-only deployments and tests. Connectivity, rejection and
//! latency can be switched at runtime.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::remote::{
    ChangeEvent, ChangeFeed, ChangeKind, DocumentStore, Fields, RemoteDocument, RemoteError,
};

#[derive(Default)]
pub struct MemoryDocumentStore {
    collections: Mutex<HashMap<String, BTreeMap<String, Fields>>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<ChangeEvent>>>>,
    offline: AtomicBool,
    rejecting: AtomicBool,
    latency_ms: AtomicU64,
    upserts: AtomicU64,
    probes: AtomicU64,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing or regaining connectivity
    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    /// Make every write fail as a permanent rejection
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    /// Delay every operation by `latency`
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::SeqCst);
    }

    /// Upserts that reached the store (including rejected ones)
    pub fn upsert_count(&self) -> u64 {
        self.upserts.load(Ordering::SeqCst)
    }

    /// Probes that reached the store
    pub fn probe_count(&self) -> u64 {
        self.probes.load(Ordering::SeqCst)
    }

    /// Current copy of a document
    pub async fn document(&self, collection: &str, id: &str) -> Option<RemoteDocument> {
        let collections = self.collections.lock().await;
        collections
            .get(collection)
            .and_then(|documents| documents.get(id))
            .map(|fields| RemoteDocument::new(id, fields.clone()))
    }

    /// Number of documents in a collection
    pub async fn len(&self, collection: &str) -> usize {
        let collections = self.collections.lock().await;
        collections.get(collection).map_or(0, BTreeMap::len)
    }

    /// Open change feeds for a collection
    pub async fn subscriber_count(&self, collection: &str) -> usize {
        let subscribers = self.subscribers.lock().await;
        subscribers
            .get(collection)
            .map_or(0, |senders| senders.iter().filter(|tx| !tx.is_closed()).count())
    }

    /// Write on behalf of another client, notifying subscribers
    pub async fn external_write(&self, collection: &str, id: &str, fields: Fields) {
        self.store(collection, id, fields).await;
    }

    /// Delete a document, notifying subscribers
    pub async fn remove(&self, collection: &str, id: &str) -> bool {
        let removed = {
            let mut collections = self.collections.lock().await;
            collections
                .get_mut(collection)
                .and_then(|documents| documents.remove(id))
        };
        let Some(fields) = removed else {
            return false;
        };
        self.emit(ChangeEvent {
            kind: ChangeKind::Removed,
            collection: collection.to_string(),
            document: RemoteDocument::new(id, fields),
        })
        .await;
        true
    }

    async fn store(&self, collection: &str, id: &str, fields: Fields) {
        let previous = {
            let mut collections = self.collections.lock().await;
            collections
                .entry(collection.to_string())
                .or_default()
                .insert(id.to_string(), fields.clone())
        };
        let kind = if previous.is_some() {
            ChangeKind::Modified
        } else {
            ChangeKind::Added
        };
        self.emit(ChangeEvent {
            kind,
            collection: collection.to_string(),
            document: RemoteDocument::new(id, fields),
        })
        .await;
    }

    async fn emit(&self, event: ChangeEvent) {
        let mut subscribers = self.subscribers.lock().await;
        if let Some(senders) = subscribers.get_mut(&event.collection) {
            senders.retain(|sender| sender.send(event.clone()).is_ok());
        }
    }

    async fn simulate_network(&self) -> Result<(), RemoteError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("store is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn upsert(&self, collection: &str, id: &str, fields: Fields) -> Result<(), RemoteError> {
        self.simulate_network().await?;
        self.upserts.fetch_add(1, Ordering::SeqCst);
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(RemoteError::Rejected("permission denied".to_string()));
        }
        self.store(collection, id, fields).await;
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<RemoteDocument>, RemoteError> {
        self.simulate_network().await?;
        Ok(self.document(collection, id).await)
    }

    async fn probe(&self, _collection: &str) -> Result<(), RemoteError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.simulate_network().await
    }

    async fn subscribe(&self, collection: &str) -> Result<ChangeFeed, RemoteError> {
        self.simulate_network().await?;
        let (tx, feed) = ChangeFeed::channel();
        let mut subscribers = self.subscribers.lock().await;
        subscribers
            .entry(collection.to_string())
            .or_default()
            .push(tx);
        Ok(feed)
    }
}
