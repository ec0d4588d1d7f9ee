use std::path::Path;
use std::sync::Arc;

use idp_core::services::CollectionCounts;
use idp_core::sync::DocumentStore;
use idp_core::DatabaseService;
use serde::Serialize;

use crate::commands::common::{
    build_runtime, format_count_lines, open_database, RemoteSettings,
};
use crate::error::CliError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub database: String,
    pub source_tag: String,
    /// `None` when no mirror is configured
    pub mirror_online: Option<bool>,
    pub collections: Vec<CollectionCounts>,
}

pub async fn run_status(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let remote = RemoteSettings::from_env();
    let db = open_database(db_path, &remote).await?;
    let report = collect_status(db, remote.document_store()?).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Database: {}", report.database);
    println!("Source tag: {}", report.source_tag);
    let mirror = match report.mirror_online {
        Some(true) => "online",
        Some(false) => "offline",
        None => "not configured",
    };
    println!("Mirror: {mirror}");
    for line in format_count_lines(&report.collections) {
        println!("{line}");
    }
    Ok(())
}

pub async fn collect_status(
    db: DatabaseService,
    store: Option<Arc<dyn DocumentStore>>,
) -> Result<StatusReport, CliError> {
    let collections = db.sync_counts().await?;
    let database = db
        .db_path()
        .map_or_else(|| ":memory:".to_string(), |path| path.display().to_string());
    let source_tag = db.source_tag().to_string();

    let mirror_online = match store {
        Some(store) => {
            let runtime = build_runtime(db, store, None);
            Some(runtime.connectivity().is_online().await)
        }
        None => None,
    };

    Ok(StatusReport {
        database,
        source_tag,
        mirror_online,
        collections,
    })
}
