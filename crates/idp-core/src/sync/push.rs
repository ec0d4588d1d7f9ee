//! Outbound replication of local records
//!
//! A push never fails the caller's primary operation: offline records stay
//! `PENDING`, rejected or timed-out writes become `FAILED`, and both are
//! retried by the scheduler.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use super::connectivity::ConnectivityMonitor;
use super::documents::{MirrorDocument, LOCAL_ID_FIELD, SOURCE_FIELD, UPDATED_AT_FIELD};
use super::identity::IdentityProvider;
use super::remote::{DocumentStore, Fields};
use super::{tracker, SyncError};
use crate::models::{LoginAttempt, RecordId, SyncStatus, User, UserSession};
use crate::services::DatabaseService;
use crate::util::now_millis;

/// Records loaded per collection and per batch
const DEFAULT_BATCH_SIZE: usize = 200;

/// Result of pushing one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// The mirror holds this snapshot and the record is `SYNCED`
    Synced { remote_id: String },
    /// No remote call was made; the record is `PENDING`
    SkippedOffline,
    /// The write landed but the record changed meanwhile; still `PENDING`
    Superseded { remote_id: String },
}

/// Tally of a batch push
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PushSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped_offline: usize,
}

impl PushSummary {
    fn record(&mut self, result: &Result<PushOutcome, SyncError>) {
        match result {
            Ok(PushOutcome::Synced { .. } | PushOutcome::Superseded { .. }) => self.succeeded += 1,
            Ok(PushOutcome::SkippedOffline) => self.skipped_offline += 1,
            Err(_) => self.failed += 1,
        }
    }

    fn absorb(&mut self, other: Self) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped_offline += other.skipped_offline;
    }

    pub const fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped_offline
    }
}

pub struct PushSyncer {
    db: DatabaseService,
    store: Arc<dyn DocumentStore>,
    connectivity: Arc<ConnectivityMonitor>,
    identity: Option<Arc<dyn IdentityProvider>>,
    push_timeout: Duration,
    batch_size: usize,
}

impl PushSyncer {
    pub fn new(
        db: DatabaseService,
        store: Arc<dyn DocumentStore>,
        connectivity: Arc<ConnectivityMonitor>,
        push_timeout: Duration,
    ) -> Self {
        Self {
            db,
            store,
            connectivity,
            identity: None,
            push_timeout,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Provision linked identity accounts for users before pushing them
    #[must_use]
    pub fn with_identity_provider(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = Some(identity);
        self
    }

    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = if batch_size == 0 { 1 } else { batch_size };
        self
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub const fn database(&self) -> &DatabaseService {
        &self.db
    }

    /// Push one record's full snapshot to its mirror document.
    ///
    /// Errors are reported to the caller after the record has been marked
    /// `FAILED`; nothing here panics or leaves the record `SYNCED` without a
    /// confirmed write.
    pub async fn push_one<R: MirrorDocument>(&self, record: &R) -> Result<PushOutcome, SyncError> {
        let local_id = record.meta().local_id;

        if !self.connectivity.is_online().await {
            self.requeue::<R>(&local_id).await?;
            tracing::debug!(
                collection = R::COLLECTION,
                local_id = %local_id,
                "Mirror offline, push deferred"
            );
            return Ok(PushOutcome::SkippedOffline);
        }

        let snapshot = self.link_identity(record).await;
        let document_id = snapshot.meta().document_id();
        let payload = self.payload(&snapshot).await;

        let write = tokio::time::timeout(
            self.push_timeout,
            self.store.upsert(R::COLLECTION, &document_id, payload),
        )
        .await;

        let error = match write {
            Ok(Ok(())) => return Ok(self.confirm(&snapshot, &document_id).await?),
            Ok(Err(error)) => {
                if error.is_transient() {
                    self.connectivity.mark_offline().await;
                }
                SyncError::Remote(error)
            }
            Err(_) => {
                self.connectivity.mark_offline().await;
                SyncError::Timeout(self.push_timeout)
            }
        };

        tracing::warn!(
            collection = R::COLLECTION,
            local_id = %local_id,
            "Push failed: {error}"
        );
        self.fail(&snapshot).await?;
        Err(error)
    }

    /// Push every record whose status is one of `statuses`.
    ///
    /// Users go first so owned records never reference an unmirrored user.
    /// Individual failures are counted, never propagated.
    pub async fn push_by_status(&self, statuses: &[SyncStatus]) -> PushSummary {
        let mut summary = PushSummary::default();
        summary.absorb(self.push_collection::<User>(statuses).await);
        summary.absorb(self.push_collection::<UserSession>(statuses).await);
        summary.absorb(self.push_collection::<LoginAttempt>(statuses).await);
        if summary.total() > 0 {
            tracing::info!(
                succeeded = summary.succeeded,
                failed = summary.failed,
                skipped_offline = summary.skipped_offline,
                "Push batch finished"
            );
        }
        summary
    }

    /// Push everything still waiting for the mirror
    pub async fn push_all_pending(&self) -> PushSummary {
        self.push_by_status(&[SyncStatus::Pending, SyncStatus::Failed])
            .await
    }

    /// Requeue `SYNCED` users whose mirror document disappeared.
    ///
    /// Returns how many users were requeued.
    pub async fn verify_mirror(&self) -> Result<usize, SyncError> {
        if !self.connectivity.is_online().await {
            return Err(SyncError::Offline);
        }

        let users = self
            .db
            .list_by_status::<User>(&[SyncStatus::Synced], self.batch_size)
            .await?;
        let mut requeued = 0;
        for user in users {
            let Some(remote_id) = user.meta.remote_id.as_deref() else {
                continue;
            };
            let found = tokio::time::timeout(
                self.push_timeout,
                self.store.get(User::COLLECTION, remote_id),
            )
            .await;
            match found {
                Ok(Ok(Some(_))) => {}
                Ok(Ok(None)) => {
                    tracing::info!(local_id = %user.meta.local_id, "Mirror document missing, requeued");
                    if self.requeue_synced::<User>(&user.meta.local_id).await? {
                        requeued += 1;
                    }
                }
                Ok(Err(error)) => {
                    if error.is_transient() {
                        self.connectivity.mark_offline().await;
                    }
                    return Err(error.into());
                }
                Err(_) => {
                    self.connectivity.mark_offline().await;
                    return Err(SyncError::Timeout(self.push_timeout));
                }
            }
        }
        Ok(requeued)
    }

    async fn push_collection<R: MirrorDocument>(&self, statuses: &[SyncStatus]) -> PushSummary {
        let mut summary = PushSummary::default();
        let records = match self.db.list_by_status::<R>(statuses, self.batch_size).await {
            Ok(records) => records,
            Err(error) => {
                tracing::error!(collection = R::COLLECTION, "Failed to load records to push: {error}");
                return summary;
            }
        };
        for record in records {
            let result = self.push_one(&record).await;
            summary.record(&result);
        }
        summary
    }

    async fn payload<R: MirrorDocument>(&self, record: &R) -> Fields {
        let mut fields = record.to_fields();
        if let (Some(field), Some(owner)) = (R::OWNER_FIELD, record.owner()) {
            match self.db.get_user(owner).await {
                Ok(Some(user)) => {
                    fields.insert(field.to_string(), Value::from(user.meta.document_id()));
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(local_id = %owner, "Failed to resolve owner document: {error}");
                }
            }
        }
        fields.insert(
            SOURCE_FIELD.to_string(),
            Value::from(self.db.source_tag()),
        );
        fields.insert(
            UPDATED_AT_FIELD.to_string(),
            Value::from(record.meta().updated_at),
        );
        fields.insert(
            LOCAL_ID_FIELD.to_string(),
            Value::from(record.meta().local_id.as_str()),
        );
        fields
    }

    /// Best-effort identity provisioning; returns the snapshot to push.
    async fn link_identity<R: MirrorDocument>(&self, record: &R) -> R {
        let (Some(identity), Some(request)) = (&self.identity, record.identity_request()) else {
            return record.clone();
        };
        let local_id = record.meta().local_id;

        let uid = match tokio::time::timeout(self.push_timeout, identity.provision(&request)).await
        {
            Ok(Ok(uid)) => uid,
            Ok(Err(error)) => {
                tracing::warn!(local_id = %local_id, "Identity provisioning failed: {error}");
                return record.clone();
            }
            Err(_) => {
                tracing::warn!(local_id = %local_id, "Identity provisioning timed out");
                return record.clone();
            }
        };

        if let Err(error) = self.db.link_identity(&local_id, &uid, now_millis()).await {
            tracing::warn!(local_id = %local_id, "Failed to store linked identity: {error}");
            return record.clone();
        }
        match self.db.get_record::<R>(&local_id).await {
            Ok(Some(updated)) => updated,
            _ => record.clone(),
        }
    }

    /// Mark the pushed snapshot `SYNCED` unless the record moved on meanwhile.
    async fn confirm<R: MirrorDocument>(
        &self,
        snapshot: &R,
        document_id: &str,
    ) -> crate::Result<PushOutcome> {
        let local_id = snapshot.meta().local_id;
        let tx = self.db.begin().await?;
        let result: crate::Result<PushOutcome> = async {
            let repo = tx.records();
            let Some(mut current) = repo.get::<R>(&local_id).await? else {
                return Ok(PushOutcome::Synced {
                    remote_id: document_id.to_string(),
                });
            };

            if current.meta().updated_at == snapshot.meta().updated_at {
                tracker::mark_synced(current.meta_mut(), document_id);
                repo.save(&current).await?;
                return Ok(PushOutcome::Synced {
                    remote_id: current.meta().document_id(),
                });
            }

            if current.meta().remote_id.is_none() {
                current.meta_mut().remote_id = Some(document_id.to_string());
                repo.save(&current).await?;
            }
            Ok(PushOutcome::Superseded {
                remote_id: current.meta().document_id(),
            })
        }
        .await;
        let outcome = tx.finish(result).await?;
        if matches!(outcome, PushOutcome::Superseded { .. }) {
            tracing::debug!(
                collection = R::COLLECTION,
                local_id = %local_id,
                "Record changed during push, left pending"
            );
        }
        Ok(outcome)
    }

    /// Mark `FAILED` unless a newer local change is already queued.
    async fn fail<R: MirrorDocument>(&self, snapshot: &R) -> crate::Result<()> {
        let local_id = snapshot.meta().local_id;
        let tx = self.db.begin().await?;
        let result: crate::Result<()> = async {
            let repo = tx.records();
            let Some(mut current) = repo.get::<R>(&local_id).await? else {
                return Ok(());
            };
            if current.meta().updated_at == snapshot.meta().updated_at {
                tracker::mark_failed(current.meta_mut());
                repo.save(&current).await?;
            }
            Ok(())
        }
        .await;
        tx.finish(result).await
    }

    async fn requeue<R: MirrorDocument>(&self, local_id: &RecordId) -> crate::Result<()> {
        let tx = self.db.begin().await?;
        let result: crate::Result<()> = async {
            let repo = tx.records();
            let Some(mut current) = repo.get::<R>(local_id).await? else {
                return Ok(());
            };
            if current.meta().sync_status != SyncStatus::Pending {
                tracker::requeue(current.meta_mut());
                repo.save(&current).await?;
            }
            Ok(())
        }
        .await;
        tx.finish(result).await
    }

    async fn requeue_synced<R: MirrorDocument>(&self, local_id: &RecordId) -> crate::Result<bool> {
        let tx = self.db.begin().await?;
        let result: crate::Result<bool> = async {
            let repo = tx.records();
            let Some(mut current) = repo.get::<R>(local_id).await? else {
                return Ok(false);
            };
            if current.meta().sync_status != SyncStatus::Synced {
                return Ok(false);
            }
            tracker::requeue(current.meta_mut());
            repo.save(&current).await?;
            Ok(true)
        }
        .await;
        tx.finish(result).await
    }
}
