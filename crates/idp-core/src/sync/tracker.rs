//! Sync status lifecycle
//!
//! The only functions allowed to move a record between `PENDING`, `SYNCED`
//! and `FAILED`. No I/O; store-level code loads the record, calls one of
//! these and saves it in the same transaction.

use crate::models::{SyncMeta, SyncStatus};

/// A local mutation happened: the record needs pushing.
///
/// `updated_at` moves to `now_ms`, or one past its previous value when the
/// clock has not advanced, so it stays strictly increasing.
pub fn mark_dirty(meta: &mut SyncMeta, now_ms: i64) {
    meta.sync_status = SyncStatus::Pending;
    meta.updated_at = now_ms.max(meta.updated_at.saturating_add(1));
}

/// A write to the mirror was confirmed.
///
/// `remote_id` is recorded only when none is set yet.
pub fn mark_synced(meta: &mut SyncMeta, remote_id: &str) {
    if meta.remote_id.is_none() {
        meta.remote_id = Some(remote_id.to_string());
    }
    meta.sync_status = SyncStatus::Synced;
}

/// The last push errored. Keeps `remote_id`.
pub fn mark_failed(meta: &mut SyncMeta) {
    meta.sync_status = SyncStatus::Failed;
}

/// Queue an unchanged record for another push without touching `updated_at`.
pub fn requeue(meta: &mut SyncMeta) {
    meta.sync_status = SyncStatus::Pending;
}

/// Whether the record still has to reach the mirror
pub const fn needs_push(meta: &SyncMeta) -> bool {
    matches!(meta.sync_status, SyncStatus::Pending | SyncStatus::Failed)
}
