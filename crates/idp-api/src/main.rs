mod auth;
mod config;
mod error;
mod flow;
mod routes;

use std::sync::Arc;

use config::AppConfig;
use idp_core::sync::{
    DocumentStore, HttpDocumentStore, HttpIdentityProvider, IdentityProvider,
    MemoryDocumentStore, SyncRuntime,
};
use idp_core::DatabaseService;
use routes::{app_router, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production uses platform-native env injection.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("idp_api=info".parse().expect("valid directive"))
                .add_directive("idp_core=info".parse().expect("valid directive")),
        )
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!("Starting idp-api with config: {:?}", config);

    let runtime = Arc::new(build_runtime(&config).await?);
    runtime.start().await;

    let state = AppState::new(Arc::clone(&config), Arc::clone(&runtime));
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("idp-api listening on {}", config.bind_addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    runtime.shutdown().await;
    tracing::info!("idp-api stopped");
    Ok(())
}

async fn build_runtime(config: &AppConfig) -> Result<SyncRuntime, Box<dyn std::error::Error>> {
    let db = DatabaseService::open_path(&config.database_path)
        .await?
        .with_default_settings(config.security_defaults);

    let store: Arc<dyn DocumentStore> = match &config.document_store {
        Some(endpoint) => Arc::new(HttpDocumentStore::new(
            endpoint.url.clone(),
            endpoint.token.clone(),
        )?),
        None => {
            tracing::warn!("DOCUMENT_STORE_URL is not set; mirroring to an in-process store");
            Arc::new(MemoryDocumentStore::new())
        }
    };
    let identity = match &config.identity_provider {
        Some(endpoint) => Some(Arc::new(HttpIdentityProvider::new(
            endpoint.url.clone(),
            endpoint.token.clone(),
        )?) as Arc<dyn IdentityProvider>),
        None => None,
    };

    Ok(SyncRuntime::new(db, store, identity, config.sync_settings()))
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {error}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
