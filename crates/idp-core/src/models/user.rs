//! User model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::SyncMeta;

/// Account role
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    #[default]
    User,
    Manager,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Manager => "MANAGER",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "USER" => Ok(Self::User),
            "MANAGER" => Ok(Self::Manager),
            other => Err(format!("unknown role `{other}`")),
        }
    }
}

/// Failed-login bookkeeping embedded in a user
///
/// Created zeroed with the user and changed only through the lockout policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginState {
    /// Consecutive failed attempts
    pub failed_attempts: u32,
    /// Whether the account is currently locked
    pub is_locked: bool,
    /// When the lock started (Unix ms)
    pub locked_at: Option<i64>,
    /// When the lock ends (Unix ms), fixed at lock time
    pub locked_until: Option<i64>,
    /// Last failed attempt (Unix ms)
    pub last_failed_login: Option<i64>,
    /// Last successful login (Unix ms)
    pub last_login: Option<i64>,
}

/// A user account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub meta: SyncMeta,
    /// Natural key, stored lowercase
    pub email: String,
    /// Argon2 PHC string; never leaves the local store
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub full_name: Option<String>,
    pub phone: Option<String>,
    pub role: Role,
    pub is_active: bool,
    pub login: LoginState,
    /// Linked account id in the external identity provider
    pub external_uid: Option<String>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
}

impl User {
    /// Create a new active user
    #[must_use]
    pub fn new(email: impl Into<String>, source: impl Into<String>, now_ms: i64) -> Self {
        Self {
            meta: SyncMeta::new(source, now_ms),
            email: crate::util::normalize_email(&email.into()),
            password_hash: None,
            full_name: None,
            phone: None,
            role: Role::User,
            is_active: true,
            login: LoginState::default(),
            external_uid: None,
            created_at: now_ms,
        }
    }
}
