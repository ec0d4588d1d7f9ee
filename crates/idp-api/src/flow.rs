//! Registration, login, session and account administration over the local
//! store. Every mutation is pushed to the mirror right away on a best-effort
//! basis; anything that does not get through is left for the scheduler.

use std::sync::Arc;

use idp_core::models::{AttemptContext, FailureReason, Role};
use idp_core::services::{NewSession, NewUser, ProfileUpdate};
use idp_core::sync::SyncRuntime;
use idp_core::sync::tracker::needs_push;
use idp_core::util::{normalize_email, now_millis};
use idp_core::{Gate, LockoutPolicy, RecordId, SecuritySettings, User, UserSession};
use serde::{Deserialize, Serialize};

use crate::auth::{generate_opaque_token, hash_password, verify_password, TokenIssuer};
use crate::error::AppError;

pub const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub full_name: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    pub device_info: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRequest {
    pub full_name: Option<String>,
    pub phone: Option<String>,
}

/// Network details of the caller, recorded on attempts and sessions
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub id: String,
    pub email: String,
    pub full_name: Option<String>,
    pub phone: Option<String>,
    pub role: Role,
    pub is_active: bool,
    pub is_locked: bool,
    pub failed_attempts: u32,
    pub locked_until: Option<i64>,
    pub last_login: Option<i64>,
    pub sync_status: String,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        Self {
            id: user.meta.local_id.as_str(),
            email: user.email.clone(),
            full_name: user.full_name.clone(),
            phone: user.phone.clone(),
            role: user.role,
            is_active: user.is_active,
            is_locked: user.login.is_locked,
            failed_attempts: user.login.failed_attempts,
            locked_until: user.login.locked_until,
            last_login: user.login.last_login,
            sync_status: user.meta.sync_status.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
    pub session_expires_at: i64,
    pub user: UserView,
}

#[derive(Clone)]
pub struct AuthFlow {
    runtime: Arc<SyncRuntime>,
    tokens: TokenIssuer,
}

impl AuthFlow {
    pub const fn new(runtime: Arc<SyncRuntime>, tokens: TokenIssuer) -> Self {
        Self { runtime, tokens }
    }

    pub const fn runtime(&self) -> &Arc<SyncRuntime> {
        &self.runtime
    }

    pub const fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    pub async fn register(&self, request: RegisterRequest) -> Result<UserView, AppError> {
        if request.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AppError::bad_request(format!(
                "Password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }
        let password_hash = hash_password(&request.password)?;
        let user = self
            .runtime
            .database()
            .create_user(
                NewUser {
                    email: request.email,
                    password_hash: Some(password_hash),
                    full_name: request.full_name,
                    phone: request.phone,
                    role: Role::User,
                },
                now_millis(),
            )
            .await?;

        let user = self.push_user(user).await?;
        Ok(UserView::from(&user))
    }

    /// Check credentials under the lockout policy and open a session.
    ///
    /// A locked account is refused before its password is looked at.
    pub async fn login(
        &self,
        request: LoginRequest,
        client: ClientInfo,
    ) -> Result<TokenPair, AppError> {
        let db = self.runtime.database();
        let now = now_millis();
        let context = AttemptContext {
            email: normalize_email(&request.email),
            ip_address: client.ip_address.clone(),
            user_agent: client.user_agent.clone(),
        };

        let known = db.get_user_by_email(&context.email).await?;
        let credential_ok = match &known {
            Some(user) if !self.is_gated(user, now).await? => user
                .password_hash
                .as_deref()
                .is_some_and(|hash| verify_password(&request.password, hash)),
            _ => false,
        };

        let result = db.apply_login_attempt(&context, credential_ok, now).await?;
        self.runtime.push_quietly(&result.attempt).await;
        if let Some(user) = result.user.as_ref().filter(|user| needs_push(&user.meta)) {
            self.runtime.push_quietly(user).await;
        }

        let user = match (result.failure, result.user) {
            (None, Some(user)) => user,
            (Some(FailureReason::InactiveAccount), _) => {
                return Err(AppError::forbidden("Account is inactive"));
            }
            (_, _) => {
                return Err(match result.outcome {
                    Some(outcome) if outcome.locked => AppError::Locked {
                        minutes_remaining: outcome.minutes_remaining.unwrap_or(1),
                    },
                    _ => AppError::unauthorized("Invalid email or password"),
                });
            }
        };

        let session = db
            .create_session(
                NewSession {
                    user_id: user.meta.local_id,
                    session_token: generate_opaque_token(),
                    refresh_token: generate_opaque_token(),
                    device_info: request.device_info,
                    ip_address: client.ip_address,
                },
                result.settings.session_duration_minutes,
                now,
            )
            .await?;
        self.runtime.push_quietly(&session).await;

        self.token_pair(&user, &session)
    }

    /// Invalidate every session of the caller.
    pub async fn logout(&self, user_id: &RecordId) -> Result<usize, AppError> {
        let sessions = self
            .runtime
            .database()
            .invalidate_sessions(user_id, now_millis())
            .await?;
        for session in &sessions {
            self.runtime.push_quietly(session).await;
        }
        Ok(sessions.len())
    }

    /// Trade a refresh token for a new session; the old one is invalidated.
    pub async fn refresh(
        &self,
        request: RefreshRequest,
        client: ClientInfo,
    ) -> Result<TokenPair, AppError> {
        let db = self.runtime.database();
        let now = now_millis();
        let session = db
            .find_session_by_refresh_token(request.refresh_token.trim())
            .await?
            .filter(|session| session.is_usable(now))
            .ok_or_else(|| AppError::unauthorized("Refresh token is invalid or expired"))?;

        let user = db
            .get_user(&session.user_id)
            .await?
            .filter(|user| user.is_active)
            .ok_or_else(|| AppError::unauthorized("Account is no longer active"))?;
        if let Gate::Locked { minutes_remaining } = self.policy().await?.gate(&user.login, now) {
            return Err(AppError::Locked { minutes_remaining });
        }

        if let Some(old) = db.invalidate_session(&session.session_token, now).await? {
            self.runtime.push_quietly(&old).await;
        }
        let settings = db.security_settings().await?;
        let renewed = db
            .create_session(
                NewSession {
                    user_id: user.meta.local_id,
                    session_token: generate_opaque_token(),
                    refresh_token: generate_opaque_token(),
                    device_info: session.device_info,
                    ip_address: client.ip_address.or(session.ip_address),
                },
                settings.session_duration_minutes,
                now,
            )
            .await?;
        self.runtime.push_quietly(&renewed).await;

        self.token_pair(&user, &renewed)
    }

    /// Whether `session_token` still belongs to a usable session of `user_id`.
    pub async fn session_is_usable(
        &self,
        user_id: &RecordId,
        session_token: &str,
    ) -> Result<bool, AppError> {
        let session = self.runtime.database().find_session(session_token).await?;
        Ok(session.is_some_and(|session| {
            session.user_id == *user_id && session.is_usable(now_millis())
        }))
    }

    pub async fn profile(&self, user_id: &RecordId) -> Result<UserView, AppError> {
        let user = self
            .runtime
            .database()
            .get_user(user_id)
            .await?
            .ok_or_else(|| AppError::not_found("User not found"))?;
        Ok(UserView::from(&user))
    }

    pub async fn update_profile(
        &self,
        user_id: &RecordId,
        request: ProfileRequest,
    ) -> Result<UserView, AppError> {
        let user = self
            .runtime
            .database()
            .update_profile(
                user_id,
                ProfileUpdate {
                    full_name: request.full_name,
                    phone: request.phone,
                },
                now_millis(),
            )
            .await?;
        let user = self.push_user(user).await?;
        Ok(UserView::from(&user))
    }

    pub async fn locked_users(&self) -> Result<Vec<UserView>, AppError> {
        let users = self.runtime.database().list_locked_users().await?;
        Ok(users.iter().map(UserView::from).collect())
    }

    /// Operator unlock: clears the lock and the failure counter.
    pub async fn unlock(&self, email: &str) -> Result<UserView, AppError> {
        let user = self
            .runtime
            .database()
            .unlock_user(email, now_millis())
            .await?
            .ok_or_else(|| AppError::not_found("User not found"))?;
        let user = self.push_user(user).await?;
        tracing::info!(user = %user.meta.local_id, "Account unlocked by operator");
        Ok(UserView::from(&user))
    }

    pub async fn security_settings(&self) -> Result<SecuritySettings, AppError> {
        Ok(self.runtime.database().security_settings().await?)
    }

    pub async fn update_security_settings(
        &self,
        settings: SecuritySettings,
    ) -> Result<SecuritySettings, AppError> {
        self.runtime
            .database()
            .save_security_settings(&settings, now_millis())
            .await?;
        tracing::info!(
            max_login_attempts = settings.max_login_attempts,
            lock_duration_minutes = settings.lock_duration_minutes,
            session_duration_minutes = settings.session_duration_minutes,
            "Security settings updated"
        );
        Ok(settings)
    }

    /// Push a changed user and return the stored copy, sync status included.
    async fn push_user(&self, user: User) -> Result<User, AppError> {
        if !needs_push(&user.meta) {
            return Ok(user);
        }
        self.runtime.push_quietly(&user).await;
        Ok(self
            .runtime
            .database()
            .get_user(&user.meta.local_id)
            .await?
            .unwrap_or(user))
    }

    async fn policy(&self) -> Result<LockoutPolicy, AppError> {
        let settings = self.runtime.database().security_settings().await?;
        Ok(LockoutPolicy::from_settings(&settings))
    }

    async fn is_gated(&self, user: &User, now_ms: i64) -> Result<bool, AppError> {
        Ok(matches!(
            self.policy().await?.gate(&user.login, now_ms),
            Gate::Locked { .. }
        ))
    }

    fn token_pair(&self, user: &User, session: &UserSession) -> Result<TokenPair, AppError> {
        Ok(TokenPair {
            access_token: self
                .tokens
                .issue(&user.meta.local_id, &session.session_token, user.role)?,
            refresh_token: session.refresh_token.clone(),
            token_type: "Bearer",
            expires_in: self.tokens.ttl().as_secs(),
            session_expires_at: session.expires_at,
            user: UserView::from(user),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use idp_core::sync::{DocumentStore, MemoryDocumentStore};
    use idp_core::{DatabaseService, SyncSettings, SyncStatus};
    use pretty_assertions::assert_eq;

    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    async fn test_flow() -> (AuthFlow, Arc<MemoryDocumentStore>) {
        let db = DatabaseService::open_in_memory().await.unwrap();
        let store = Arc::new(MemoryDocumentStore::new());
        let runtime = SyncRuntime::new(
            db,
            Arc::clone(&store) as Arc<dyn DocumentStore>,
            None,
            SyncSettings::default()
                .with_source_tag("API")
                .with_connectivity(Duration::ZERO, Duration::from_secs(1)),
        );
        let tokens = TokenIssuer::new(SECRET, "idp-test", Duration::from_secs(300));
        (AuthFlow::new(Arc::new(runtime), tokens), store)
    }

    fn register_request(email: &str) -> RegisterRequest {
        RegisterRequest {
            email: email.to_string(),
            password: "correct horse".to_string(),
            full_name: Some("Alice Example".to_string()),
            phone: None,
        }
    }

    fn login_request(email: &str, password: &str) -> LoginRequest {
        LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
            device_info: Some("test-suite".to_string()),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn register_stores_and_mirrors_the_user() {
        let (flow, store) = test_flow().await;

        let user = flow.register(register_request("Alice@Example.com")).await.unwrap();

        assert_eq!(user.email, "alice@example.com");
        assert_eq!(user.sync_status, SyncStatus::Synced.to_string());
        assert_eq!(store.len("users").await, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn register_rejects_short_password_and_duplicate_email() {
        let (flow, _store) = test_flow().await;

        let mut short = register_request("alice@example.com");
        short.password = "short".to_string();
        assert!(matches!(
            flow.register(short).await,
            Err(AppError::BadRequest(_))
        ));

        flow.register(register_request("alice@example.com")).await.unwrap();
        assert!(matches!(
            flow.register(register_request("ALICE@example.com")).await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn login_issues_tokens_and_mirrors_session() {
        let (flow, store) = test_flow().await;
        flow.register(register_request("alice@example.com")).await.unwrap();

        let pair = flow
            .login(login_request("alice@example.com", "correct horse"), ClientInfo::default())
            .await
            .unwrap();

        let caller = flow.tokens().verify(&pair.access_token).unwrap();
        assert_eq!(caller.user_id.as_str(), pair.user.id);
        assert!(flow
            .session_is_usable(&caller.user_id, &caller.session_token)
            .await
            .unwrap());
        assert_eq!(store.len("user_sessions").await, 1);
        assert_eq!(store.len("login_attempts").await, 1);
        assert!(pair.user.last_login.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn repeated_failures_lock_the_account() {
        let (flow, _store) = test_flow().await;
        flow.register(register_request("alice@example.com")).await.unwrap();

        for _ in 0..2 {
            let error = flow
                .login(login_request("alice@example.com", "wrong"), ClientInfo::default())
                .await
                .unwrap_err();
            assert!(matches!(error, AppError::Unauthorized(_)));
        }
        let error = flow
            .login(login_request("alice@example.com", "wrong"), ClientInfo::default())
            .await
            .unwrap_err();
        assert!(matches!(error, AppError::Locked { minutes_remaining: 30 }));

        // Correct password is not even considered while locked.
        let error = flow
            .login(login_request("alice@example.com", "correct horse"), ClientInfo::default())
            .await
            .unwrap_err();
        assert!(matches!(error, AppError::Locked { .. }));

        let locked = flow.locked_users().await.unwrap();
        assert_eq!(locked.len(), 1);
        assert_eq!(locked[0].failed_attempts, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unlock_restores_login() {
        let (flow, _store) = test_flow().await;
        flow.register(register_request("alice@example.com")).await.unwrap();
        for _ in 0..3 {
            let _ = flow
                .login(login_request("alice@example.com", "wrong"), ClientInfo::default())
                .await;
        }

        let user = flow.unlock("ALICE@example.com").await.unwrap();
        assert!(!user.is_locked);
        assert_eq!(user.failed_attempts, 0);

        assert!(flow
            .login(login_request("alice@example.com", "correct horse"), ClientInfo::default())
            .await
            .is_ok());
        assert!(matches!(
            flow.unlock("nobody@example.com").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_email_is_a_generic_failure() {
        let (flow, store) = test_flow().await;

        let error = flow
            .login(login_request("ghost@example.com", "whatever"), ClientInfo::default())
            .await
            .unwrap_err();

        assert!(matches!(error, AppError::Unauthorized(_)));
        assert_eq!(store.len("login_attempts").await, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn refresh_rotates_the_session_and_logout_ends_it() {
        let (flow, _store) = test_flow().await;
        flow.register(register_request("alice@example.com")).await.unwrap();
        let first = flow
            .login(login_request("alice@example.com", "correct horse"), ClientInfo::default())
            .await
            .unwrap();

        let second = flow
            .refresh(
                RefreshRequest {
                    refresh_token: first.refresh_token.clone(),
                },
                ClientInfo::default(),
            )
            .await
            .unwrap();
        assert_ne!(second.refresh_token, first.refresh_token);

        let reused = flow
            .refresh(
                RefreshRequest {
                    refresh_token: first.refresh_token,
                },
                ClientInfo::default(),
            )
            .await;
        assert!(matches!(reused, Err(AppError::Unauthorized(_))));

        let caller = flow.tokens().verify(&second.access_token).unwrap();
        assert_eq!(flow.logout(&caller.user_id).await.unwrap(), 1);
        assert!(!flow
            .session_is_usable(&caller.user_id, &caller.session_token)
            .await
            .unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn profile_update_is_pushed() {
        let (flow, store) = test_flow().await;
        let user = flow.register(register_request("alice@example.com")).await.unwrap();
        let user_id: RecordId = user.id.parse().unwrap();

        let updated = flow
            .update_profile(
                &user_id,
                ProfileRequest {
                    full_name: Some("Alice Cooper".to_string()),
                    phone: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.full_name.as_deref(), Some("Alice Cooper"));
        assert_eq!(updated.sync_status, SyncStatus::Synced.to_string());
        assert_eq!(store.upsert_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lowered_threshold_applies_to_the_next_attempt() {
        let (flow, _store) = test_flow().await;
        flow.register(register_request("alice@example.com")).await.unwrap();
        flow.update_security_settings(SecuritySettings {
            max_login_attempts: 1,
            ..SecuritySettings::default()
        })
        .await
        .unwrap();

        let error = flow
            .login(login_request("alice@example.com", "wrong"), ClientInfo::default())
            .await
            .unwrap_err();

        assert!(matches!(error, AppError::Locked { .. }));
    }
}
