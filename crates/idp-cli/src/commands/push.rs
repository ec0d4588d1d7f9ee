use std::path::Path;
use std::sync::Arc;

use idp_core::models::SyncStatus;
use idp_core::sync::{DocumentStore, IdentityProvider, PushSummary};
use idp_core::DatabaseService;

use crate::commands::common::{build_runtime, open_database, RemoteSettings};
use crate::error::CliError;

pub async fn run_push(include_failed: bool, db_path: &Path) -> Result<(), CliError> {
    let remote = RemoteSettings::from_env();
    let store = remote.document_store()?.ok_or(CliError::SyncNotConfigured)?;
    let db = open_database(db_path, &remote).await?;

    let summary = push_queued(db, store, remote.identity_provider(), include_failed).await;

    println!(
        "Pushed {} record(s): {} failed, {} skipped (offline)",
        summary.succeeded, summary.failed, summary.skipped_offline
    );
    if summary.skipped_offline > 0 {
        println!("Mirror is unreachable; records stay queued.");
    }
    Ok(())
}

/// Push `PENDING` records, plus `FAILED` ones when asked.
pub async fn push_queued(
    db: DatabaseService,
    store: Arc<dyn DocumentStore>,
    identity: Option<Arc<dyn IdentityProvider>>,
    include_failed: bool,
) -> PushSummary {
    let runtime = build_runtime(db, store, identity);
    let statuses: &[SyncStatus] = if include_failed {
        &[SyncStatus::Pending, SyncStatus::Failed]
    } else {
        &[SyncStatus::Pending]
    };
    runtime.pusher().push_by_status(statuses).await
}
