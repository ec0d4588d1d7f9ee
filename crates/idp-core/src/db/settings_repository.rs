//! Security settings repository implementation

use crate::error::Result;
use crate::models::SecuritySettings;
use libsql::Connection;

const MAX_LOGIN_ATTEMPTS: &str = "MAX_LOGIN_ATTEMPTS";
const LOCK_DURATION_MINUTES: &str = "LOCK_DURATION_MINUTES";
const SESSION_DURATION_MINUTES: &str = "SESSION_DURATION_MINUTES";

/// Trait for security settings storage operations (async)
#[allow(async_fn_in_trait)]
pub trait SettingsRepository {
    /// Load settings, falling back to `defaults` for keys never stored
    async fn load(&self, defaults: SecuritySettings) -> Result<SecuritySettings>;

    /// Save settings to the database
    async fn save(&self, settings: &SecuritySettings, now_ms: i64) -> Result<()>;
}

/// libSQL implementation of `SettingsRepository`
pub struct LibSqlSettingsRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlSettingsRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl SettingsRepository for LibSqlSettingsRepository<'_> {
    async fn load(&self, defaults: SecuritySettings) -> Result<SecuritySettings> {
        let mut settings = defaults;

        if let Some(value) = self.get_number(MAX_LOGIN_ATTEMPTS).await? {
            settings.max_login_attempts = value;
        }
        if let Some(value) = self.get_number(LOCK_DURATION_MINUTES).await? {
            settings.lock_duration_minutes = value;
        }
        if let Some(value) = self.get_number(SESSION_DURATION_MINUTES).await? {
            settings.session_duration_minutes = value;
        }

        Ok(settings)
    }

    async fn save(&self, settings: &SecuritySettings, now_ms: i64) -> Result<()> {
        settings.validate()?;
        self.set_setting(
            MAX_LOGIN_ATTEMPTS,
            &settings.max_login_attempts.to_string(),
            now_ms,
        )
        .await?;
        self.set_setting(
            LOCK_DURATION_MINUTES,
            &settings.lock_duration_minutes.to_string(),
            now_ms,
        )
        .await?;
        self.set_setting(
            SESSION_DURATION_MINUTES,
            &settings.session_duration_minutes.to_string(),
            now_ms,
        )
        .await?;
        Ok(())
    }
}

impl LibSqlSettingsRepository<'_> {
    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query("SELECT value FROM security_settings WHERE key = ?", [key])
            .await?;

        if let Some(row) = rows.next().await? {
            let value: String = row.get(0)?;
            Ok(Some(value))
        } else {
            Ok(None)
        }
    }

    /// Stored numeric value; unparsable rows are ignored
    async fn get_number(&self, key: &str) -> Result<Option<u32>> {
        let value = self.get_setting(key).await?;
        Ok(value.and_then(|value| match value.trim().parse::<u32>() {
            Ok(number) if number > 0 => Some(number),
            _ => {
                tracing::warn!(key, value = %value, "Ignoring invalid security setting");
                None
            }
        }))
    }

    async fn set_setting(&self, key: &str, value: &str, now_ms: i64) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO security_settings (key, value, updated_at) VALUES (?, ?, ?)",
                libsql::params![key, value, now_ms],
            )
            .await?;
        Ok(())
    }
}
