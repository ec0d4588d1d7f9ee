//! Shared database service wrapper used across clients.
//!
//! Every read-modify-write runs as one `BEGIN IMMEDIATE` transaction while
//! holding the service mutex, so concurrent login attempts, pushes and pulls
//! never compute a next state from a stale read.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

use crate::db::{
    values, Database, LibSqlSettingsRepository, RecordRepository, SettingsRepository, SyncRecord,
};
use crate::lockout::{self, Gate, LockoutPolicy, LoginOutcome};
use crate::models::{
    AttemptContext, FailureReason, LoginAttempt, RecordId, Role, SecuritySettings, SyncMeta,
    SyncStatus, User, UserSession,
};
use crate::sync::tracker;
use crate::util::{normalize_email, normalize_text_option};
use crate::{Error, Result};

/// Origin tag for values produced by this process
pub const DEFAULT_SOURCE_TAG: &str = "LOCAL";

/// Thread-safe service for DB and repository operations.
#[derive(Clone)]
pub struct DatabaseService {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
    source_tag: Arc<str>,
    default_settings: SecuritySettings,
}

/// An open `BEGIN IMMEDIATE` transaction holding the service lock
pub struct StoreTransaction<'a> {
    guard: MutexGuard<'a, Database>,
}

impl StoreTransaction<'_> {
    /// Repository bound to this transaction
    pub fn records(&self) -> RecordRepository<'_> {
        RecordRepository::new(self.guard.connection())
    }

    /// Settings repository bound to this transaction
    pub fn settings(&self) -> LibSqlSettingsRepository<'_> {
        LibSqlSettingsRepository::new(self.guard.connection())
    }

    /// Commit on `Ok`, roll back on `Err`, and hand the result back
    pub async fn finish<T>(self, result: Result<T>) -> Result<T> {
        let conn = self.guard.connection();
        match result {
            Ok(value) => {
                if let Err(error) = conn.execute("COMMIT", ()).await {
                    conn.execute("ROLLBACK", ()).await.ok();
                    return Err(error.into());
                }
                Ok(value)
            }
            Err(error) => {
                conn.execute("ROLLBACK", ()).await.ok();
                Err(error)
            }
        }
    }
}

/// Input for [`DatabaseService::create_user`]
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub email: String,
    pub password_hash: Option<String>,
    pub full_name: Option<String>,
    pub phone: Option<String>,
    pub role: Role,
}

/// Profile fields a user may change; `None` leaves a field as is
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub full_name: Option<String>,
    pub phone: Option<String>,
}

/// Input for [`DatabaseService::create_session`]
#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: RecordId,
    pub session_token: String,
    pub refresh_token: String,
    pub device_info: Option<String>,
    pub ip_address: Option<String>,
}

/// Everything decided and written by one login attempt
#[derive(Debug, Clone)]
pub struct LoginAttemptResult {
    /// The user after the attempt, when the email matched one
    pub user: Option<User>,
    /// Lockout decision; `None` when the policy was never consulted
    pub outcome: Option<LoginOutcome>,
    /// Why the attempt was refused, if it was
    pub failure: Option<FailureReason>,
    /// The audit record written for this attempt
    pub attempt: LoginAttempt,
    /// Settings in effect for the attempt
    pub settings: SecuritySettings,
}

impl LoginAttemptResult {
    pub const fn is_allowed(&self) -> bool {
        self.failure.is_none()
    }
}

/// Sync status counts for one mirrored table
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CollectionCounts {
    pub table: &'static str,
    pub pending: u64,
    pub failed: u64,
    pub synced: u64,
}

impl DatabaseService {
    /// Open a database service at the given filesystem path.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Database::open(&db_path).await?;
        tracing::info!("Opened local database at {}", db_path.display());
        Ok(Self::from_database(db, Some(db_path)))
    }

    /// Open an in-memory database service (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self::from_database(db, None))
    }

    fn from_database(db: Database, db_path: Option<PathBuf>) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            db_path,
            source_tag: Arc::from(DEFAULT_SOURCE_TAG),
            default_settings: SecuritySettings::default(),
        }
    }

    /// Tag local mutations with `tag` instead of the default
    #[must_use]
    pub fn with_source_tag(mut self, tag: impl AsRef<str>) -> Self {
        self.source_tag = Arc::from(tag.as_ref());
        self
    }

    /// Settings used for keys never stored in the database
    #[must_use]
    pub const fn with_default_settings(mut self, settings: SecuritySettings) -> Self {
        self.default_settings = settings;
        self
    }

    /// Origin tag written on local mutations
    pub fn source_tag(&self) -> &str {
        &self.source_tag
    }

    /// Backing file, if any
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Start a write transaction.
    ///
    /// A transaction abandoned by a cancelled caller is rolled back first.
    pub async fn begin(&self) -> Result<StoreTransaction<'_>> {
        let guard = self.db.lock().await;
        let conn = guard.connection();
        if let Err(error) = conn.execute("BEGIN IMMEDIATE", ()).await {
            tracing::warn!("Rolling back abandoned transaction: {error}");
            conn.execute("ROLLBACK", ()).await.ok();
            conn.execute("BEGIN IMMEDIATE", ()).await?;
        }
        Ok(StoreTransaction { guard })
    }

    /// Record a local mutation on `meta`
    pub fn touch(&self, meta: &mut SyncMeta, now_ms: i64) {
        tracker::mark_dirty(meta, now_ms);
        meta.source = self.source_tag.to_string();
    }

    /// Fetch any mirrored record by local id.
    pub async fn get_record<R: SyncRecord>(&self, local_id: &RecordId) -> Result<Option<R>> {
        let db = self.db.lock().await;
        let repo = RecordRepository::new(db.connection());
        repo.get(local_id).await
    }

    /// Mirrored records in any of `statuses`, oldest change first.
    pub async fn list_by_status<R: SyncRecord>(
        &self,
        statuses: &[SyncStatus],
        limit: usize,
    ) -> Result<Vec<R>> {
        let db = self.db.lock().await;
        let repo = RecordRepository::new(db.connection());
        repo.list_by_status(statuses, limit).await
    }

    /// Per-table sync status counts.
    pub async fn sync_counts(&self) -> Result<Vec<CollectionCounts>> {
        let db = self.db.lock().await;
        let repo = RecordRepository::new(db.connection());
        let mut counts = Vec::new();
        for table in [User::TABLE, UserSession::TABLE, LoginAttempt::TABLE] {
            counts.push(CollectionCounts {
                table,
                pending: repo.count_by_status(table, SyncStatus::Pending).await?,
                failed: repo.count_by_status(table, SyncStatus::Failed).await?,
                synced: repo.count_by_status(table, SyncStatus::Synced).await?,
            });
        }
        Ok(counts)
    }

    /// Create a new user in `PENDING` state.
    pub async fn create_user(&self, new_user: NewUser, now_ms: i64) -> Result<User> {
        let email = normalize_email(&new_user.email);
        if email.is_empty() || !email.contains('@') {
            return Err(Error::InvalidInput(format!("invalid email `{email}`")));
        }

        let mut user = User::new(email, self.source_tag(), now_ms);
        user.password_hash = new_user.password_hash;
        user.full_name = normalize_text_option(new_user.full_name);
        user.phone = normalize_text_option(new_user.phone);
        user.role = new_user.role;

        let tx = self.begin().await?;
        let result: Result<User> = async {
            let repo = tx.records();
            if repo
                .find_by_natural_key::<User>(&user.email)
                .await?
                .is_some()
            {
                return Err(Error::Conflict(format!(
                    "email {} is already registered",
                    user.email
                )));
            }
            repo.save(&user).await?;
            Ok(user)
        }
        .await;
        tx.finish(result).await
    }

    /// Fetch a user by local id.
    pub async fn get_user(&self, local_id: &RecordId) -> Result<Option<User>> {
        self.get_record(local_id).await
    }

    /// Fetch a user by email (case-insensitive).
    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let db = self.db.lock().await;
        let repo = RecordRepository::new(db.connection());
        repo.find_by_natural_key(&normalize_email(email)).await
    }

    /// Apply a profile change and mark the user dirty when anything changed.
    pub async fn update_profile(
        &self,
        local_id: &RecordId,
        update: ProfileUpdate,
        now_ms: i64,
    ) -> Result<User> {
        let tx = self.begin().await?;
        let result: Result<User> = async {
            let repo = tx.records();
            let mut user: User = repo
                .get(local_id)
                .await?
                .ok_or_else(|| Error::NotFound(local_id.to_string()))?;

            let mut changed = false;
            if let Some(full_name) = normalize_text_option(update.full_name) {
                if user.full_name.as_deref() != Some(full_name.as_str()) {
                    user.full_name = Some(full_name);
                    changed = true;
                }
            }
            if let Some(phone) = normalize_text_option(update.phone) {
                if user.phone.as_deref() != Some(phone.as_str()) {
                    user.phone = Some(phone);
                    changed = true;
                }
            }

            if changed {
                self.touch(&mut user.meta, now_ms);
                repo.save(&user).await?;
            }
            Ok(user)
        }
        .await;
        tx.finish(result).await
    }

    /// Current security settings (stored values over configured defaults).
    pub async fn security_settings(&self) -> Result<SecuritySettings> {
        let db = self.db.lock().await;
        let repo = LibSqlSettingsRepository::new(db.connection());
        repo.load(self.default_settings).await
    }

    /// Persist security settings; applies to the next login attempt.
    pub async fn save_security_settings(
        &self,
        settings: &SecuritySettings,
        now_ms: i64,
    ) -> Result<()> {
        let tx = self.begin().await?;
        let result = tx.settings().save(settings, now_ms).await;
        tx.finish(result).await
    }

    /// Run one login attempt through the lockout policy.
    ///
    /// Reads the user and the settings, evaluates, writes the new login state
    /// and the audit record, all in one transaction.
    pub async fn apply_login_attempt(
        &self,
        context: &AttemptContext,
        credential_ok: bool,
        now_ms: i64,
    ) -> Result<LoginAttemptResult> {
        let tx = self.begin().await?;
        let result: Result<LoginAttemptResult> = async {
            let repo = tx.records();
            let settings = tx.settings().load(self.default_settings).await?;
            let email = normalize_email(&context.email);

            let Some(mut user) = repo.find_by_natural_key::<User>(&email).await? else {
                let attempt = LoginAttempt::new(
                    context,
                    None,
                    Some(FailureReason::UnknownUser),
                    self.source_tag(),
                    now_ms,
                );
                repo.save(&attempt).await?;
                return Ok(LoginAttemptResult {
                    user: None,
                    outcome: None,
                    failure: Some(FailureReason::UnknownUser),
                    attempt,
                    settings,
                });
            };

            if !user.is_active {
                let attempt = LoginAttempt::new(
                    context,
                    Some(user.meta.local_id),
                    Some(FailureReason::InactiveAccount),
                    self.source_tag(),
                    now_ms,
                );
                repo.save(&attempt).await?;
                return Ok(LoginAttemptResult {
                    user: Some(user),
                    outcome: None,
                    failure: Some(FailureReason::InactiveAccount),
                    attempt,
                    settings,
                });
            }

            let policy = LockoutPolicy::from_settings(&settings);
            let gated = matches!(policy.gate(&user.login, now_ms), Gate::Locked { .. });
            let mut state = user.login.clone();
            let outcome = policy.evaluate(&mut state, credential_ok, now_ms);
            if state != user.login {
                user.login = state;
                self.touch(&mut user.meta, now_ms);
                repo.save(&user).await?;
            }

            let failure = if outcome.allowed {
                None
            } else if gated {
                Some(FailureReason::AccountLocked)
            } else {
                Some(FailureReason::InvalidPassword)
            };
            let attempt = LoginAttempt::new(
                context,
                Some(user.meta.local_id),
                failure,
                self.source_tag(),
                now_ms,
            );
            repo.save(&attempt).await?;

            if outcome.locked && !gated {
                tracing::warn!(
                    user = %user.meta.local_id,
                    failed_attempts = outcome.failed_attempts,
                    "Account locked after repeated failed logins"
                );
            }

            Ok(LoginAttemptResult {
                user: Some(user),
                outcome: Some(outcome),
                failure,
                attempt,
                settings,
            })
        }
        .await;
        tx.finish(result).await
    }

    /// Append an audit record for an attempt rejected before evaluation.
    pub async fn record_login_attempt(
        &self,
        context: &AttemptContext,
        user_id: Option<RecordId>,
        failure: Option<FailureReason>,
        now_ms: i64,
    ) -> Result<LoginAttempt> {
        let attempt = LoginAttempt::new(context, user_id, failure, self.source_tag(), now_ms);
        let tx = self.begin().await?;
        let result = tx.records().save(&attempt).await;
        tx.finish(result).await?;
        Ok(attempt)
    }

    /// Create a session lasting `duration_minutes`.
    pub async fn create_session(
        &self,
        new_session: NewSession,
        duration_minutes: u32,
        now_ms: i64,
    ) -> Result<UserSession> {
        let session = UserSession {
            meta: SyncMeta::new(self.source_tag(), now_ms),
            user_id: new_session.user_id,
            session_token: new_session.session_token,
            refresh_token: new_session.refresh_token,
            device_info: normalize_text_option(new_session.device_info),
            ip_address: normalize_text_option(new_session.ip_address),
            created_at: now_ms,
            expires_at: now_ms.saturating_add(i64::from(duration_minutes) * 60_000),
            is_valid: true,
        };

        let tx = self.begin().await?;
        let result = tx.records().save(&session).await;
        tx.finish(result).await?;
        Ok(session)
    }

    /// Fetch a session by its session token.
    pub async fn find_session(&self, session_token: &str) -> Result<Option<UserSession>> {
        let db = self.db.lock().await;
        let repo = RecordRepository::new(db.connection());
        repo.find_by_natural_key(session_token).await
    }

    /// Fetch a session by its refresh token.
    pub async fn find_session_by_refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<Option<UserSession>> {
        let db = self.db.lock().await;
        let repo = RecordRepository::new(db.connection());
        let sessions = repo
            .list_where::<UserSession>(
                "refresh_token = ? LIMIT 1",
                vec![values::text(refresh_token)],
            )
            .await?;
        Ok(sessions.into_iter().next())
    }

    /// Invalidate every valid session of a user; returns the changed sessions.
    pub async fn invalidate_sessions(
        &self,
        user_id: &RecordId,
        now_ms: i64,
    ) -> Result<Vec<UserSession>> {
        let tx = self.begin().await?;
        let result: Result<Vec<UserSession>> = async {
            let repo = tx.records();
            let mut sessions = repo
                .list_where::<UserSession>(
                    "user_id = ? AND is_valid = 1",
                    vec![values::text(&user_id.as_str())],
                )
                .await?;
            for session in &mut sessions {
                session.is_valid = false;
                self.touch(&mut session.meta, now_ms);
                repo.save(&*session).await?;
            }
            Ok(sessions)
        }
        .await;
        tx.finish(result).await
    }

    /// Invalidate one session; `None` when it does not exist or was already invalid.
    pub async fn invalidate_session(
        &self,
        session_token: &str,
        now_ms: i64,
    ) -> Result<Option<UserSession>> {
        let tx = self.begin().await?;
        let result: Result<Option<UserSession>> = async {
            let repo = tx.records();
            let Some(mut session) = repo.find_by_natural_key::<UserSession>(session_token).await?
            else {
                return Ok(None);
            };
            if !session.is_valid {
                return Ok(None);
            }
            session.is_valid = false;
            self.touch(&mut session.meta, now_ms);
            repo.save(&session).await?;
            Ok(Some(session))
        }
        .await;
        tx.finish(result).await
    }

    /// Operator unlock; `None` when no user has this email.
    pub async fn unlock_user(&self, email: &str, now_ms: i64) -> Result<Option<User>> {
        let tx = self.begin().await?;
        let result: Result<Option<User>> = async {
            let repo = tx.records();
            let Some(mut user) = repo
                .find_by_natural_key::<User>(&normalize_email(email))
                .await?
            else {
                return Ok(None);
            };
            let before = user.login.clone();
            lockout::reset(&mut user.login);
            if user.login != before {
                self.touch(&mut user.meta, now_ms);
                repo.save(&user).await?;
            }
            Ok(Some(user))
        }
        .await;
        tx.finish(result).await
    }

    /// Users whose lock flag is set, including locks that already expired.
    pub async fn list_locked_users(&self) -> Result<Vec<User>> {
        let db = self.db.lock().await;
        let repo = RecordRepository::new(db.connection());
        repo.list_where("is_locked = 1 ORDER BY email", Vec::new())
            .await
    }

    /// Store the external identity linked to a user.
    pub async fn link_identity(
        &self,
        local_id: &RecordId,
        external_uid: &str,
        now_ms: i64,
    ) -> Result<Option<User>> {
        let tx = self.begin().await?;
        let result: Result<Option<User>> = async {
            let repo = tx.records();
            let Some(mut user) = repo.get::<User>(local_id).await? else {
                return Ok(None);
            };
            if user.external_uid.as_deref() != Some(external_uid) {
                user.external_uid = Some(external_uid.to_string());
                self.touch(&mut user.meta, now_ms);
                repo.save(&user).await?;
            }
            Ok(Some(user))
        }
        .await;
        tx.finish(result).await
    }
}
