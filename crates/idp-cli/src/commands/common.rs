use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use idp_core::services::{CollectionCounts, DEFAULT_SOURCE_TAG};
use idp_core::sync::{
    DocumentStore, HttpDocumentStore, HttpIdentityProvider, IdentityProvider, SyncRuntime,
};
use idp_core::{DatabaseService, SyncSettings, User};
use serde::Serialize;

use crate::error::CliError;

/// Mirror and identity endpoints read from the environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteSettings {
    pub store_url: Option<String>,
    pub store_token: Option<String>,
    pub identity_url: Option<String>,
    pub identity_token: Option<String>,
    pub source_tag: String,
}

impl RemoteSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        Self {
            store_url: read("DOCUMENT_STORE_URL"),
            store_token: read("DOCUMENT_STORE_TOKEN"),
            identity_url: read("IDENTITY_PROVIDER_URL"),
            identity_token: read("IDENTITY_PROVIDER_TOKEN"),
            source_tag: read("SYNC_SOURCE_TAG").unwrap_or_else(|| DEFAULT_SOURCE_TAG.to_string()),
        }
    }

    pub fn document_store(&self) -> Result<Option<Arc<dyn DocumentStore>>, CliError> {
        let Some(url) = self.store_url.as_ref() else {
            return Ok(None);
        };
        let store = HttpDocumentStore::new(url.clone(), self.store_token.clone())?;
        Ok(Some(Arc::new(store)))
    }

    pub fn identity_provider(&self) -> Option<Arc<dyn IdentityProvider>> {
        let url = self.identity_url.as_ref()?;
        match HttpIdentityProvider::new(url.clone(), self.identity_token.clone()) {
            Ok(provider) => Some(Arc::new(provider)),
            Err(error) => {
                tracing::warn!("Identity provider disabled: {error}");
                None
            }
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedUserItem {
    pub id: String,
    pub email: String,
    pub failed_attempts: u32,
    pub locked_at: Option<i64>,
    pub locked_until: Option<i64>,
    pub expired: bool,
}

pub fn locked_user_to_item(user: &User, now_ms: i64) -> LockedUserItem {
    LockedUserItem {
        id: user.meta.local_id.as_str(),
        email: user.email.clone(),
        failed_attempts: user.login.failed_attempts,
        locked_at: user.login.locked_at,
        locked_until: user.login.locked_until,
        expired: user
            .login
            .locked_until
            .map_or(true, |until| until <= now_ms),
    }
}

pub fn format_locked_lines(users: &[User], now_ms: i64) -> Vec<String> {
    users
        .iter()
        .map(|user| {
            let item = locked_user_to_item(user, now_ms);
            let until = item
                .locked_until
                .map_or_else(|| "unknown".to_string(), format_timestamp);
            let state = if item.expired { " (expired)" } else { "" };
            format!(
                "{}  failed={}  until={until}{state}",
                item.email, item.failed_attempts
            )
        })
        .collect()
}

pub fn format_count_lines(counts: &[CollectionCounts]) -> Vec<String> {
    counts
        .iter()
        .map(|count| {
            format!(
                "{:<16} pending={:<5} failed={:<5} synced={}",
                count.table, count.pending, count.failed, count.synced
            )
        })
        .collect()
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |timestamp| timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn normalize_email_argument(email: &str) -> Result<String, CliError> {
    let trimmed = email.trim();
    if trimmed.is_empty() {
        return Err(CliError::EmptyEmail);
    }
    Ok(trimmed.to_string())
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("IDP_DATABASE_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir().map_or_else(
        || PathBuf::from("idp.db"),
        |dir| dir.join("idp").join("idp.db"),
    )
}

pub async fn open_database(path: &Path, remote: &RemoteSettings) -> Result<DatabaseService, CliError> {
    Ok(DatabaseService::open_path(path.to_path_buf())
        .await?
        .with_source_tag(&remote.source_tag))
}

/// Sync components over `store`, tagged like the API so pulls see our writes
/// as echoes.
pub fn build_runtime(
    db: DatabaseService,
    store: Arc<dyn DocumentStore>,
    identity: Option<Arc<dyn IdentityProvider>>,
) -> SyncRuntime {
    let settings = SyncSettings::default().with_source_tag(db.source_tag());
    SyncRuntime::new(db, store, identity, settings)
}
