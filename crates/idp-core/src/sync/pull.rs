//! Inbound replication from mirror change feeds
//!
//! Remote changes are merged into the local store field by field. Nothing
//! here deletes local data or blanks a local value. A document older than the
//! local record is never merged.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use super::documents::{MirrorDocument, SOURCE_FIELD, UPDATED_AT_FIELD};
use super::merge::merge_fields;
use super::remote::{ChangeEvent, ChangeFeed, ChangeKind, RemoteDocument};
use super::{tracker, SyncError};
use crate::db::RecordRepository;
use crate::models::{LoginAttempt, RecordId, SyncStatus, User, UserSession};
use crate::services::DatabaseService;
use crate::util::now_millis;

/// What one change event did to the local store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// Our own write coming back; nothing done
    Echo,
    /// A new local record was created from the document
    Created,
    /// An existing record took new values
    Merged,
    /// The document predates the local record; local values were kept
    Stale,
    /// The document matched local values
    Unchanged,
    /// The mirror document was removed; the record is queued for re-mirroring
    Remirror,
    /// The document references a user not stored yet; it is held and
    /// applied once that user arrives
    Parked,
    /// The document could not be applied and was skipped
    Skipped,
    /// Unknown collection, or a removal of something never stored locally
    Ignored,
}

/// Why a change-feed loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedEnd {
    Shutdown,
    Closed,
}

/// Upper bound on documents held for owners that have not arrived
const MAX_PARKED: usize = 1_000;

/// Owned-record events waiting for their user, keyed by the owner reference
type ParkedEvents = HashMap<String, Vec<ChangeEvent>>;

#[derive(Clone)]
pub struct PullIngestor {
    db: DatabaseService,
    parked: Arc<Mutex<ParkedEvents>>,
}

impl PullIngestor {
    pub fn new(db: DatabaseService) -> Self {
        Self {
            db,
            parked: Arc::default(),
        }
    }

    /// Number of events waiting for an owner
    pub async fn parked_count(&self) -> usize {
        self.parked.lock().await.values().map(Vec::len).sum()
    }

    /// Apply one change event.
    ///
    /// Malformed documents are logged and reported as [`PullOutcome::Skipped`];
    /// only local storage failures are errors.
    pub async fn on_remote_change(&self, event: &ChangeEvent) -> Result<PullOutcome, SyncError> {
        if event.kind != ChangeKind::Removed
            && event.document.str_field(SOURCE_FIELD) == Some(self.db.source_tag())
        {
            return Ok(PullOutcome::Echo);
        }

        let outcome = self.dispatch(event).await?;
        if event.collection == User::COLLECTION
            && matches!(
                outcome,
                PullOutcome::Created
                    | PullOutcome::Merged
                    | PullOutcome::Unchanged
                    | PullOutcome::Stale
            )
        {
            self.release_parked(&event.document.id).await;
        }
        Ok(outcome)
    }

    async fn dispatch(&self, event: &ChangeEvent) -> Result<PullOutcome, SyncError> {
        let collection = event.collection.as_str();
        if collection == User::COLLECTION {
            self.ingest::<User>(event).await
        } else if collection == UserSession::COLLECTION {
            self.ingest::<UserSession>(event).await
        } else if collection == LoginAttempt::COLLECTION {
            self.ingest::<LoginAttempt>(event).await
        } else {
            tracing::debug!(collection, "Ignoring change for unknown collection");
            Ok(PullOutcome::Ignored)
        }
    }

    async fn park(&self, reference: &str, event: &ChangeEvent) {
        let mut parked = self.parked.lock().await;
        if parked.values().map(Vec::len).sum::<usize>() >= MAX_PARKED {
            tracing::warn!(
                collection = %event.collection,
                document_id = %event.document.id,
                "Too many documents waiting for their user, dropping"
            );
            return;
        }
        parked
            .entry(reference.to_string())
            .or_default()
            .push(event.clone());
    }

    /// Apply events that were waiting for the user mirrored as `user_document_id`.
    async fn release_parked(&self, user_document_id: &str) {
        let Some(events) = self.parked.lock().await.remove(user_document_id) else {
            return;
        };
        for event in events {
            match self.dispatch(&event).await {
                Ok(outcome) => tracing::debug!(
                    collection = %event.collection,
                    document_id = %event.document.id,
                    ?outcome,
                    "Applied parked change"
                ),
                Err(error) => tracing::error!(
                    collection = %event.collection,
                    document_id = %event.document.id,
                    "Failed to apply parked change: {error}"
                ),
            }
        }
    }

    /// Consume `feed` until it closes or `shutdown` flips to `true`.
    pub async fn run(&self, mut feed: ChangeFeed, mut shutdown: watch::Receiver<bool>) -> FeedEnd {
        if *shutdown.borrow() {
            return FeedEnd::Shutdown;
        }
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return FeedEnd::Shutdown;
                    }
                }
                event = feed.next() => {
                    let Some(event) = event else {
                        return FeedEnd::Closed;
                    };
                    match self.on_remote_change(&event).await {
                        Ok(outcome) => tracing::debug!(
                            collection = %event.collection,
                            document_id = %event.document.id,
                            ?outcome,
                            "Applied remote change"
                        ),
                        Err(error) => tracing::error!(
                            collection = %event.collection,
                            document_id = %event.document.id,
                            "Failed to apply remote change: {error}"
                        ),
                    }
                }
            }
        }
    }

    async fn ingest<R: MirrorDocument>(&self, event: &ChangeEvent) -> Result<PullOutcome, SyncError> {
        let document = &event.document;
        let tx = self.db.begin().await?;
        let result: crate::Result<PullOutcome> = async {
            let repo = tx.records();
            if event.kind == ChangeKind::Removed {
                return remirror::<R>(&repo, &document.id).await;
            }

            let mut existing = repo.find_by_remote_id::<R>(&document.id).await?;
            if existing.is_none() {
                if let Some(key) = R::document_key(document) {
                    existing = repo.find_by_natural_key::<R>(&key).await?;
                }
            }

            match existing {
                Some(record) => self.merge_into(&repo, record, document).await,
                None => create::<R>(&repo, document).await,
            }
        }
        .await;
        let outcome = tx.finish(result).await?;

        if outcome == PullOutcome::Parked {
            if let Some(reference) = R::OWNER_FIELD.and_then(|field| document.str_field(field)) {
                self.park(reference, event).await;
            }
        }
        Ok(outcome)
    }

    async fn merge_into<R: MirrorDocument>(
        &self,
        repo: &RecordRepository<'_>,
        mut record: R,
        document: &RemoteDocument,
    ) -> crate::Result<PullOutcome> {
        if let Some(remote_updated_at) = document_updated_at(document) {
            if remote_updated_at < record.meta().updated_at {
                if record.meta().remote_id.is_none() {
                    record.meta_mut().remote_id = Some(document.id.clone());
                    repo.save(&record).await?;
                }
                tracing::debug!(
                    collection = R::COLLECTION,
                    local_id = %record.meta().local_id,
                    remote_updated_at,
                    local_updated_at = record.meta().updated_at,
                    "Keeping newer local record"
                );
                return Ok(PullOutcome::Stale);
            }
        }

        let changed = match merge_fields(&mut record, &document.fields, &R::mergeable_fields()) {
            Ok(changed) => changed,
            Err(error) => {
                tracing::warn!(
                    collection = R::COLLECTION,
                    document_id = %document.id,
                    "Skipping malformed document: {error}"
                );
                return Ok(PullOutcome::Skipped);
            }
        };
        let newly_linked = record.meta().remote_id.is_none();

        if changed.is_empty() {
            if !newly_linked {
                return Ok(PullOutcome::Unchanged);
            }
            record.meta_mut().remote_id = Some(document.id.clone());
            repo.save(&record).await?;
            return Ok(PullOutcome::Unchanged);
        }

        let prior = record.meta().sync_status;
        match document_updated_at(document) {
            Some(remote_updated_at) => {
                let meta = record.meta_mut();
                meta.updated_at = meta.updated_at.max(remote_updated_at);
                if prior != SyncStatus::Synced {
                    tracker::requeue(meta);
                }
            }
            None => self.db.touch(record.meta_mut(), now_millis()),
        }
        if let Some(source) = document.str_field(SOURCE_FIELD) {
            record.meta_mut().source = source.to_string();
        }
        if prior == SyncStatus::Synced {
            tracker::mark_synced(record.meta_mut(), &document.id);
        } else if newly_linked {
            record.meta_mut().remote_id = Some(document.id.clone());
        }
        repo.save(&record).await?;

        tracing::debug!(
            collection = R::COLLECTION,
            local_id = %record.meta().local_id,
            fields = ?changed,
            "Merged remote document"
        );
        Ok(PullOutcome::Merged)
    }
}

/// Last local change carried by `document`, when it has one
fn document_updated_at(document: &RemoteDocument) -> Option<i64> {
    document
        .fields
        .get(UPDATED_AT_FIELD)
        .and_then(serde_json::Value::as_i64)
}

async fn create<R: MirrorDocument>(
    repo: &RecordRepository<'_>,
    document: &RemoteDocument,
) -> crate::Result<PullOutcome> {
    let reference = R::OWNER_FIELD.and_then(|field| document.str_field(field));
    let mut owner = resolve_owner(repo, reference).await?;
    if owner.is_none() {
        if let Some(email) = R::owner_email(document) {
            owner = repo
                .find_by_natural_key::<User>(&email)
                .await?
                .map(|user| user.meta.local_id);
        }
    }
    if R::OWNER_REQUIRED && owner.is_none() {
        if reference.is_some() {
            tracing::debug!(
                collection = R::COLLECTION,
                document_id = %document.id,
                "Holding document until its user arrives"
            );
            return Ok(PullOutcome::Parked);
        }
        tracing::warn!(
            collection = R::COLLECTION,
            document_id = %document.id,
            "Skipping document without a user reference"
        );
        return Ok(PullOutcome::Skipped);
    }

    match R::from_document(document, owner) {
        Ok(record) => {
            repo.save(&record).await?;
            tracing::debug!(
                collection = R::COLLECTION,
                local_id = %record.meta().local_id,
                "Created record from remote document"
            );
            Ok(PullOutcome::Created)
        }
        Err(error) => {
            tracing::warn!(
                collection = R::COLLECTION,
                document_id = %document.id,
                "Skipping malformed document: {error}"
            );
            Ok(PullOutcome::Skipped)
        }
    }
}

/// A removed mirror document never deletes local data; a `SYNCED` record is
/// queued so the next push recreates it.
async fn remirror<R: MirrorDocument>(
    repo: &RecordRepository<'_>,
    document_id: &str,
) -> crate::Result<PullOutcome> {
    let Some(mut record) = repo.find_by_remote_id::<R>(document_id).await? else {
        return Ok(PullOutcome::Ignored);
    };
    if record.meta().sync_status != SyncStatus::Synced {
        return Ok(PullOutcome::Ignored);
    }
    tracker::requeue(record.meta_mut());
    repo.save(&record).await?;
    tracing::info!(
        collection = R::COLLECTION,
        local_id = %record.meta().local_id,
        "Mirror document removed, requeued"
    );
    Ok(PullOutcome::Remirror)
}

/// Local id of the user a document references, by mirror id or local id
async fn resolve_owner(
    repo: &RecordRepository<'_>,
    reference: Option<&str>,
) -> crate::Result<Option<RecordId>> {
    let Some(reference) = reference else {
        return Ok(None);
    };
    if let Some(user) = repo.find_by_remote_id::<User>(reference).await? {
        return Ok(Some(user.meta.local_id));
    }
    let Ok(local_id) = reference.parse::<RecordId>() else {
        return Ok(None);
    };
    Ok(repo
        .get::<User>(&local_id)
        .await?
        .map(|user| user.meta.local_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::remote::Fields;
    use crate::sync::test_support::SyncFixture;
    use crate::sync::DocumentStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn event(kind: ChangeKind, collection: &str, id: &str, value: serde_json::Value) -> ChangeEvent {
        ChangeEvent {
            kind,
            collection: collection.to_string(),
            document: RemoteDocument::new(id, fields(value)),
        }
    }

    async fn synced_user(fx: &SyncFixture, email: &str) -> User {
        let user = fx.user(email).await;
        fx.pusher().push_one(&user).await.unwrap();
        fx.db.get_user(&user.meta.local_id).await.unwrap().unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn own_writes_are_ignored_as_echoes() {
        let fx = SyncFixture::new().await;
        let ingestor = PullIngestor::new(fx.db.clone());

        let outcome = ingestor
            .on_remote_change(&event(
                ChangeKind::Added,
                "users",
                "doc-1",
                json!({"email": "echo@example.com", "source": "LOCAL"}),
            ))
            .await
            .unwrap();

        assert_eq!(outcome, PullOutcome::Echo);
        assert!(fx.db.get_user_by_email("echo@example.com").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn echo_of_stored_record_changes_nothing() {
        let fx = SyncFixture::new().await;
        let alice = synced_user(&fx, "alice@example.com").await;
        let ingestor = PullIngestor::new(fx.db.clone());

        let outcome = ingestor
            .on_remote_change(&event(
                ChangeKind::Modified,
                "users",
                alice.meta.remote_id.as_deref().unwrap(),
                json!({"fullName": "Someone Else", "updatedAt": alice.meta.updated_at + 10, "source": "LOCAL"}),
            ))
            .await
            .unwrap();

        assert_eq!(outcome, PullOutcome::Echo);
        let after = fx.db.get_user(&alice.meta.local_id).await.unwrap().unwrap();
        assert_eq!(after, alice);
        assert_eq!(after.meta.updated_at, alice.meta.updated_at);
        let queued = fx
            .db
            .list_by_status::<User>(&[SyncStatus::Pending, SyncStatus::Failed], 10)
            .await
            .unwrap();
        assert!(queued.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_document_creates_synced_record() {
        let fx = SyncFixture::new().await;
        let ingestor = PullIngestor::new(fx.db.clone());

        let outcome = ingestor
            .on_remote_change(&event(
                ChangeKind::Added,
                "users",
                "doc-1",
                json!({"email": "Bob@Example.com", "fullName": "Bob", "source": "BACKOFFICE"}),
            ))
            .await
            .unwrap();

        assert_eq!(outcome, PullOutcome::Created);
        let bob = fx.db.get_user_by_email("bob@example.com").await.unwrap().unwrap();
        assert_eq!(bob.meta.sync_status, SyncStatus::Synced);
        assert_eq!(bob.meta.remote_id.as_deref(), Some("doc-1"));
        assert_eq!(bob.meta.source, "BACKOFFICE");
        assert_eq!(bob.full_name.as_deref(), Some("Bob"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn merge_overwrites_only_present_differing_fields() {
        let fx = SyncFixture::new().await;
        let alice = synced_user(&fx, "alice@example.com").await;
        fx.db
            .update_profile(
                &alice.meta.local_id,
                crate::services::ProfileUpdate {
                    full_name: None,
                    phone: Some("+15550100199".to_string()),
                },
                crate::util::now_millis(),
            )
            .await
            .unwrap();
        fx.pusher().push_all_pending().await;
        let before = fx.db.get_user(&alice.meta.local_id).await.unwrap().unwrap();
        let remote_id = before.meta.remote_id.clone().unwrap();
        let ingestor = PullIngestor::new(fx.db.clone());

        let outcome = ingestor
            .on_remote_change(&event(
                ChangeKind::Modified,
                "users",
                &remote_id,
                json!({"fullName": "Alice Liddell", "phone": null, "source": "BACKOFFICE"}),
            ))
            .await
            .unwrap();

        assert_eq!(outcome, PullOutcome::Merged);
        let after = fx.db.get_user(&alice.meta.local_id).await.unwrap().unwrap();
        assert_eq!(after.full_name.as_deref(), Some("Alice Liddell"));
        assert_eq!(after.phone.as_deref(), Some("+15550100199"));
        assert_eq!(after.password_hash, before.password_hash);
        assert_eq!(after.meta.sync_status, SyncStatus::Synced);
        assert_eq!(after.meta.source, "BACKOFFICE");
        assert!(after.meta.updated_at > before.meta.updated_at);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn identical_document_writes_nothing() {
        let fx = SyncFixture::new().await;
        let alice = synced_user(&fx, "alice@example.com").await;
        let ingestor = PullIngestor::new(fx.db.clone());
        let remote_id = alice.meta.remote_id.clone().unwrap();

        let outcome = ingestor
            .on_remote_change(&event(
                ChangeKind::Modified,
                "users",
                &remote_id,
                json!({"fullName": "Test User", "isActive": true, "source": "BACKOFFICE"}),
            ))
            .await
            .unwrap();

        assert_eq!(outcome, PullOutcome::Unchanged);
        let after = fx.db.get_user(&alice.meta.local_id).await.unwrap().unwrap();
        assert_eq!(after, alice);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn older_document_keeps_unpushed_local_edit() {
        let fx = SyncFixture::new().await;
        let alice = synced_user(&fx, "alice@example.com").await;
        let edited_at = alice.meta.updated_at + 5_000;
        fx.db
            .update_profile(
                &alice.meta.local_id,
                crate::services::ProfileUpdate {
                    full_name: None,
                    phone: Some("+15550000002".to_string()),
                },
                edited_at,
            )
            .await
            .unwrap();
        let ingestor = PullIngestor::new(fx.db.clone());

        let outcome = ingestor
            .on_remote_change(&event(
                ChangeKind::Modified,
                "users",
                alice.meta.remote_id.as_deref().unwrap(),
                json!({
                    "phone": "+15550000001",
                    "updatedAt": alice.meta.updated_at + 2_000,
                    "source": "MOBILE"
                }),
            ))
            .await
            .unwrap();

        assert_eq!(outcome, PullOutcome::Stale);
        let after = fx.db.get_user(&alice.meta.local_id).await.unwrap().unwrap();
        assert_eq!(after.phone.as_deref(), Some("+15550000002"));
        assert_eq!(after.meta.sync_status, SyncStatus::Pending);
        assert_eq!(after.meta.updated_at, edited_at);
        assert_eq!(after.meta.source, "LOCAL");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn older_document_cannot_reset_failed_attempts() {
        let fx = SyncFixture::new().await;
        let alice = synced_user(&fx, "alice@example.com").await;
        let context = crate::models::AttemptContext {
            email: "alice@example.com".to_string(),
            ip_address: None,
            user_agent: None,
        };
        let now = crate::util::now_millis();
        for offset in 0..2 {
            fx.db
                .apply_login_attempt(&context, false, now + offset)
                .await
                .unwrap();
        }
        fx.pusher().push_all_pending().await;
        let before = fx.db.get_user(&alice.meta.local_id).await.unwrap().unwrap();
        assert_eq!(before.meta.sync_status, SyncStatus::Synced);
        assert_eq!(before.login.failed_attempts, 2);
        let ingestor = PullIngestor::new(fx.db.clone());

        let outcome = ingestor
            .on_remote_change(&event(
                ChangeKind::Modified,
                "users",
                alice.meta.remote_id.as_deref().unwrap(),
                json!({
                    "failedLoginAttempts": 0,
                    "isLocked": false,
                    "updatedAt": alice.meta.updated_at,
                    "source": "MOBILE"
                }),
            ))
            .await
            .unwrap();

        assert_eq!(outcome, PullOutcome::Stale);
        let after = fx.db.get_user(&alice.meta.local_id).await.unwrap().unwrap();
        assert_eq!(after, before);

        fx.db
            .apply_login_attempt(&context, false, now + 2)
            .await
            .unwrap();
        let locked = fx.db.get_user(&alice.meta.local_id).await.unwrap().unwrap();
        assert_eq!(locked.login.failed_attempts, 3);
        assert!(locked.login.is_locked);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn newer_document_takes_its_timestamp() {
        let fx = SyncFixture::new().await;
        let alice = synced_user(&fx, "alice@example.com").await;
        let ingestor = PullIngestor::new(fx.db.clone());
        let remote_updated_at = alice.meta.updated_at + 10_000;

        let outcome = ingestor
            .on_remote_change(&event(
                ChangeKind::Modified,
                "users",
                alice.meta.remote_id.as_deref().unwrap(),
                json!({"fullName": "Alice L.", "updatedAt": remote_updated_at, "source": "MOBILE"}),
            ))
            .await
            .unwrap();

        assert_eq!(outcome, PullOutcome::Merged);
        let after = fx.db.get_user(&alice.meta.local_id).await.unwrap().unwrap();
        assert_eq!(after.full_name.as_deref(), Some("Alice L."));
        assert_eq!(after.meta.updated_at, remote_updated_at);
        assert_eq!(after.meta.sync_status, SyncStatus::Synced);
        assert_eq!(after.meta.source, "MOBILE");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unpushed_record_stays_pending_after_merge() {
        let fx = SyncFixture::new().await;
        let carol = fx.user("carol@example.com").await;
        let ingestor = PullIngestor::new(fx.db.clone());

        let outcome = ingestor
            .on_remote_change(&event(
                ChangeKind::Added,
                "users",
                "their-doc",
                json!({"email": "CAROL@example.com", "fullName": "Carol", "source": "MOBILE"}),
            ))
            .await
            .unwrap();

        assert_eq!(outcome, PullOutcome::Merged);
        let after = fx.db.get_user(&carol.meta.local_id).await.unwrap().unwrap();
        assert_eq!(after.meta.sync_status, SyncStatus::Pending);
        assert_eq!(after.meta.remote_id.as_deref(), Some("their-doc"));
        assert_eq!(after.full_name.as_deref(), Some("Carol"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn malformed_documents_are_skipped() {
        let fx = SyncFixture::new().await;
        let alice = synced_user(&fx, "alice@example.com").await;
        let ingestor = PullIngestor::new(fx.db.clone());
        let remote_id = alice.meta.remote_id.clone().unwrap();

        let bad_type = ingestor
            .on_remote_change(&event(
                ChangeKind::Modified,
                "users",
                &remote_id,
                json!({"fullName": "Mallory", "failedLoginAttempts": "three"}),
            ))
            .await
            .unwrap();
        let missing_key = ingestor
            .on_remote_change(&event(ChangeKind::Added, "users", "doc-x", json!({"fullName": "?"})))
            .await
            .unwrap();

        assert_eq!(bad_type, PullOutcome::Skipped);
        assert_eq!(missing_key, PullOutcome::Skipped);
        let after = fx.db.get_user(&alice.meta.local_id).await.unwrap().unwrap();
        assert_eq!(after, alice);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn owned_records_resolve_their_user() {
        let fx = SyncFixture::new().await;
        let alice = synced_user(&fx, "alice@example.com").await;
        let ingestor = PullIngestor::new(fx.db.clone());
        let session = |user_id: &str| {
            json!({
                "userId": user_id,
                "sessionToken": format!("token-{user_id}"),
                "refreshToken": "refresh",
                "expiresAt": 1_000,
                "isValid": true,
                "source": "MOBILE"
            })
        };

        let orphan = ingestor
            .on_remote_change(&event(ChangeKind::Added, "user_sessions", "s-1", session("nobody")))
            .await
            .unwrap();
        let owned = ingestor
            .on_remote_change(&event(
                ChangeKind::Added,
                "user_sessions",
                "s-2",
                session(alice.meta.remote_id.as_deref().unwrap()),
            ))
            .await
            .unwrap();
        let attempt = ingestor
            .on_remote_change(&event(
                ChangeKind::Added,
                "login_attempts",
                "a-1",
                json!({"userId": "nobody", "email": "ghost@example.com", "success": false, "source": "MOBILE"}),
            ))
            .await
            .unwrap();

        assert_eq!(orphan, PullOutcome::Parked);
        assert_eq!(ingestor.parked_count().await, 1);
        assert_eq!(owned, PullOutcome::Created);
        assert_eq!(attempt, PullOutcome::Created);
        let stored = fx
            .db
            .find_session(&format!("token-{}", alice.meta.remote_id.as_deref().unwrap()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.user_id, alice.meta.local_id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn session_arriving_before_its_user_is_applied_later() {
        let fx = SyncFixture::new().await;
        let ingestor = PullIngestor::new(fx.db.clone());

        let early = ingestor
            .on_remote_change(&event(
                ChangeKind::Added,
                "user_sessions",
                "s-early",
                json!({
                    "userId": "mobile-user",
                    "sessionToken": "mobile-token",
                    "refreshToken": "mobile-refresh",
                    "expiresAt": 9_000,
                    "isValid": true,
                    "source": "MOBILE"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(early, PullOutcome::Parked);
        assert!(fx.db.find_session("mobile-token").await.unwrap().is_none());

        let user = ingestor
            .on_remote_change(&event(
                ChangeKind::Added,
                "users",
                "mobile-user",
                json!({"email": "erin@example.com", "source": "MOBILE"}),
            ))
            .await
            .unwrap();

        assert_eq!(user, PullOutcome::Created);
        let erin = fx.db.get_user_by_email("erin@example.com").await.unwrap().unwrap();
        let session = fx.db.find_session("mobile-token").await.unwrap().unwrap();
        assert_eq!(session.user_id, erin.meta.local_id);
        assert_eq!(session.meta.remote_id.as_deref(), Some("s-early"));
        assert_eq!(ingestor.parked_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn attempt_with_unknown_user_reference_links_by_email() {
        let fx = SyncFixture::new().await;
        let alice = synced_user(&fx, "alice@example.com").await;
        let ingestor = PullIngestor::new(fx.db.clone());

        let outcome = ingestor
            .on_remote_change(&event(
                ChangeKind::Added,
                "login_attempts",
                "a-9",
                json!({
                    "userId": "not-a-user",
                    "email": "ALICE@example.com",
                    "success": false,
                    "source": "MOBILE"
                }),
            ))
            .await
            .unwrap();

        assert_eq!(outcome, PullOutcome::Created);
        let attempts = fx
            .db
            .list_by_status::<LoginAttempt>(&[SyncStatus::Synced], 10)
            .await
            .unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].user_id, Some(alice.meta.local_id));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn removed_documents_requeue_instead_of_deleting() {
        let fx = SyncFixture::new().await;
        let alice = synced_user(&fx, "alice@example.com").await;
        let ingestor = PullIngestor::new(fx.db.clone());
        let remote_id = alice.meta.remote_id.clone().unwrap();

        let outcome = ingestor
            .on_remote_change(&event(ChangeKind::Removed, "users", &remote_id, json!({})))
            .await
            .unwrap();
        let unknown = ingestor
            .on_remote_change(&event(ChangeKind::Removed, "users", "never-seen", json!({})))
            .await
            .unwrap();

        assert_eq!(outcome, PullOutcome::Remirror);
        assert_eq!(unknown, PullOutcome::Ignored);
        let after = fx.db.get_user(&alice.meta.local_id).await.unwrap().unwrap();
        assert_eq!(after.meta.sync_status, SyncStatus::Pending);
        assert_eq!(after.meta.updated_at, alice.meta.updated_at);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn run_applies_feed_until_shutdown() {
        let fx = SyncFixture::new().await;
        let feed = fx.store.subscribe("users").await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ingestor = PullIngestor::new(fx.db.clone());
        let task = tokio::spawn(async move { ingestor.run(feed, shutdown_rx).await });

        fx.store
            .external_write(
                "users",
                "doc-dave",
                fields(json!({"email": "dave@example.com", "source": "BACKOFFICE"})),
            )
            .await;

        let mut found = None;
        for _ in 0..50 {
            found = fx.db.get_user_by_email("dave@example.com").await.unwrap();
            if found.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(found.is_some());

        shutdown_tx.send(true).unwrap();
        assert_eq!(task.await.unwrap(), FeedEnd::Shutdown);
    }
}
