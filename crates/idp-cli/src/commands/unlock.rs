use std::path::Path;
use std::sync::Arc;

use idp_core::sync::DocumentStore;
use idp_core::util::now_millis;
use idp_core::{DatabaseService, SyncStatus, User};

use crate::commands::common::{
    build_runtime, normalize_email_argument, open_database, RemoteSettings,
};
use crate::error::CliError;

pub async fn run_unlock(email: &str, db_path: &Path) -> Result<(), CliError> {
    let email = normalize_email_argument(email)?;
    let remote = RemoteSettings::from_env();
    let db = open_database(db_path, &remote).await?;

    let user = unlock_account(db, &email, remote.document_store()?).await?;

    let mirror = if user.meta.sync_status == SyncStatus::Synced {
        "mirrored"
    } else {
        "queued for sync"
    };
    println!("Unlocked {} ({mirror})", user.email);
    Ok(())
}

/// Reset the account's lockout state and push it when a mirror is available.
pub async fn unlock_account(
    db: DatabaseService,
    email: &str,
    store: Option<Arc<dyn DocumentStore>>,
) -> Result<User, CliError> {
    let user = db
        .unlock_user(email, now_millis())
        .await?
        .ok_or_else(|| CliError::UserNotFound(email.to_string()))?;
    tracing::info!(user = %user.meta.local_id, "Account unlocked from CLI");

    let Some(store) = store else {
        return Ok(user);
    };
    let runtime = build_runtime(db, store, None);
    runtime.push_quietly(&user).await;
    Ok(runtime
        .database()
        .get_user(&user.meta.local_id)
        .await?
        .unwrap_or(user))
}
