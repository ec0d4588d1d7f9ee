//! Remote document store boundary

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Document body: camelCase field names to JSON values
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// A document read from the mirror
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDocument {
    pub id: String,
    #[serde(default)]
    pub fields: Fields,
}

impl RemoteDocument {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// String field, ignoring nulls and other types
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(serde_json::Value::as_str)
    }
}

/// Kind of change delivered by a change feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One change-feed notification
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub collection: String,
    pub document: RemoteDocument,
}

/// Push-driven stream of changes for one collection
///
/// Ends when the store side drops its sender.
pub struct ChangeFeed {
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl ChangeFeed {
    pub const fn new(rx: mpsc::UnboundedReceiver<ChangeEvent>) -> Self {
        Self { rx }
    }

    /// Create a connected sender/feed pair
    pub fn channel() -> (mpsc::UnboundedSender<ChangeEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::new(rx))
    }

    /// Next event, or `None` once the feed is closed
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }
}

/// Errors reported by a document store
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Network failure or server-side outage
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),
    /// The store refused the request (invalid payload, permission denied)
    #[error("Remote store rejected the request: {0}")]
    Rejected(String),
    /// The store answered with something unreadable
    #[error("Invalid remote response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Whether the failure says something about connectivity
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Black-box document store: CRUD plus change feeds
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Idempotent full-document write
    async fn upsert(&self, collection: &str, id: &str, fields: Fields) -> Result<(), RemoteError>;

    /// Point read
    async fn get(&self, collection: &str, id: &str) -> Result<Option<RemoteDocument>, RemoteError>;

    /// Lightweight reachability check: read at most one document
    async fn probe(&self, collection: &str) -> Result<(), RemoteError>;

    /// Subscribe to changes in a collection
    async fn subscribe(&self, collection: &str) -> Result<ChangeFeed, RemoteError>;
}
