//! Replication between the local store and the remote mirror
//!
//! The local database is the source of truth. Local changes are pushed as
//! full snapshots; remote changes are merged field by field.

pub mod connectivity;
pub mod documents;
pub mod http_store;
pub mod identity;
pub mod memory_store;
pub mod merge;
pub mod pull;
pub mod push;
pub mod remote;
pub mod runtime;
pub mod scheduler;
#[cfg(test)]
pub(crate) mod test_support;
pub mod tracker;

use std::time::Duration;

use thiserror::Error;

pub use connectivity::ConnectivityMonitor;
pub use documents::MirrorDocument;
pub use http_store::HttpDocumentStore;
pub use identity::{HttpIdentityProvider, IdentityError, IdentityProvider, IdentityRequest};
pub use memory_store::MemoryDocumentStore;
pub use merge::MergeError;
pub use pull::{FeedEnd, PullIngestor, PullOutcome};
pub use push::{PushOutcome, PushSummary, PushSyncer};
pub use remote::{ChangeEvent, ChangeFeed, ChangeKind, DocumentStore, Fields, RemoteDocument, RemoteError};
pub use runtime::SyncRuntime;
pub use scheduler::{RetryScheduler, SchedulerHandle};

/// Errors surfaced by a single sync operation
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Mirror is offline")]
    Offline,
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("Mirror write timed out after {0:?}")]
    Timeout(Duration),
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] crate::Error),
}

impl SyncError {
    /// Whether the failure points at connectivity rather than the record
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Offline | Self::Timeout(_) => true,
            Self::Remote(error) => error.is_transient(),
            Self::NotFound(_) | Self::Store(_) => false,
        }
    }
}
