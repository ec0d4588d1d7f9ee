use std::hash::{Hash, Hasher};
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use idp_core::services::CollectionCounts;
use idp_core::sync::{PushSummary, SyncRuntime};
use idp_core::SecuritySettings;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{extract_bearer_token, AuthenticatedUser, TokenIssuer};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::flow::{
    AuthFlow, ClientInfo, LoginRequest, ProfileRequest, RefreshRequest, RegisterRequest,
    TokenPair, UserView,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    flow: AuthFlow,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, runtime: Arc<SyncRuntime>) -> Self {
        let tokens = TokenIssuer::from_config(&config);
        Self {
            flow: AuthFlow::new(runtime, tokens),
            config,
        }
    }

    pub const fn runtime(&self) -> &Arc<SyncRuntime> {
        self.flow.runtime()
    }
}

pub fn app_router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh));

    let protected_routes = Router::new()
        .route("/auth/logout", post(logout))
        .route("/me", get(profile).patch(update_profile))
        .route("/admin/users/locked", get(locked_users))
        .route("/admin/users/unlock", post(unlock_user))
        .route(
            "/admin/security-settings",
            get(security_settings).put(update_security_settings),
        )
        .route("/admin/sync/run", post(run_sync))
        .route("/admin/sync/reconnect", post(reconnect))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", public_routes.merge(protected_routes))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    online: Option<bool>,
    connectivity_probes: u64,
    sync_running: bool,
    collections: Vec<CollectionCounts>,
}

async fn healthz(State(state): State<AppState>) -> Result<Json<HealthResponse>, AppError> {
    let runtime = state.runtime();
    Ok(Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        online: runtime.connectivity().last_known().await,
        connectivity_probes: runtime.connectivity().probe_count(),
        sync_running: runtime.is_running().await,
        collections: runtime.database().sync_counts().await?,
    }))
}

/// Verify the access token and that its session is still valid locally.
async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(request.headers())?;
    let user = state.flow.tokens().verify(token)?;
    if !state
        .flow
        .session_is_usable(&user.user_id, &user.session_token)
        .await?
    {
        return Err(AppError::unauthorized("Session has ended"));
    }
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<UserView>), AppError> {
    let user_hash = user_fingerprint(&request.email);
    let user = state.flow.register(request).await?;
    tracing::info!(endpoint = "register", user = user_hash, "Registered user");
    Ok((StatusCode::CREATED, Json(user)))
}

async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<LoginRequest>,
) -> Result<Json<TokenPair>, AppError> {
    let user_hash = user_fingerprint(&request.email);
    match state.flow.login(request, client_info(&headers)).await {
        Ok(pair) => {
            tracing::info!(endpoint = "login", user = user_hash, "Login succeeded");
            Ok(Json(pair))
        }
        Err(error) => {
            tracing::warn!(endpoint = "login", user = user_hash, "Login refused: {error}");
            Err(error)
        }
    }
}

async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<TokenPair>, AppError> {
    let pair = state.flow.refresh(request, client_info(&headers)).await?;
    Ok(Json(pair))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LogoutResponse {
    sessions_invalidated: usize,
}

async fn logout(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<LogoutResponse>, AppError> {
    let sessions_invalidated = state.flow.logout(&user.user_id).await?;
    tracing::info!(
        endpoint = "logout",
        user = user_fingerprint(&user.user_id.as_str()),
        sessions_invalidated,
        "Logged out"
    );
    Ok(Json(LogoutResponse {
        sessions_invalidated,
    }))
}

async fn profile(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<UserView>, AppError> {
    Ok(Json(state.flow.profile(&user.user_id).await?))
}

async fn update_profile(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(request): Json<ProfileRequest>,
) -> Result<Json<UserView>, AppError> {
    Ok(Json(state.flow.update_profile(&user.user_id, request).await?))
}

async fn locked_users(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<Vec<UserView>>, AppError> {
    user.require_manager()?;
    Ok(Json(state.flow.locked_users().await?))
}

#[derive(Debug, Deserialize)]
struct UnlockRequest {
    email: String,
}

async fn unlock_user(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(request): Json<UnlockRequest>,
) -> Result<Json<UserView>, AppError> {
    user.require_manager()?;
    let unlocked = state.flow.unlock(&request.email).await?;
    tracing::info!(
        endpoint = "admin_unlock",
        operator = user_fingerprint(&user.user_id.as_str()),
        user = user_fingerprint(&unlocked.email),
        "Unlocked account"
    );
    Ok(Json(unlocked))
}

async fn security_settings(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<SecuritySettings>, AppError> {
    user.require_manager()?;
    Ok(Json(state.flow.security_settings().await?))
}

async fn update_security_settings(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(settings): Json<SecuritySettings>,
) -> Result<Json<SecuritySettings>, AppError> {
    user.require_manager()?;
    Ok(Json(state.flow.update_security_settings(settings).await?))
}

async fn run_sync(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<PushSummary>, AppError> {
    user.require_manager()?;
    let summary = state.runtime().push_now().await;
    tracing::info!(
        endpoint = "admin_sync_run",
        succeeded = summary.succeeded,
        failed = summary.failed,
        skipped_offline = summary.skipped_offline,
        "Manual push finished"
    );
    Ok(Json(summary))
}

#[derive(Debug, Serialize)]
struct ReconnectResponse {
    online: bool,
}

async fn reconnect(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<ReconnectResponse>, AppError> {
    user.require_manager()?;
    let connectivity = state.runtime().connectivity();
    connectivity.invalidate().await;
    let online = connectivity.is_online().await;
    Ok(Json(ReconnectResponse { online }))
}

fn client_info(headers: &HeaderMap) -> ClientInfo {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };
    ClientInfo {
        ip_address: header("x-forwarded-for")
            .and_then(|value| value.split(',').next())
            .map(|value| value.trim().to_string()),
        user_agent: header("user-agent").map(str::to_string),
    }
}

fn user_fingerprint(value: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.trim().to_lowercase().hash(&mut hasher);
    hasher.finish()
}
