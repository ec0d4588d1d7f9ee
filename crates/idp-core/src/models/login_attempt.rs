//! Login attempt audit record

use serde::{Deserialize, Serialize};

use super::{RecordId, SyncMeta};

/// One login attempt, successful or not; append-only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginAttempt {
    pub meta: SyncMeta,
    /// Matching local user, when the email was known
    pub user_id: Option<RecordId>,
    pub email: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub success: bool,
    pub failure_reason: Option<String>,
    /// Attempt timestamp (Unix ms)
    pub attempted_at: i64,
}

/// Why a login attempt was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    UnknownUser,
    InactiveAccount,
    InvalidPassword,
    AccountLocked,
}

impl FailureReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnknownUser => "USER_NOT_FOUND",
            Self::InactiveAccount => "ACCOUNT_INACTIVE",
            Self::InvalidPassword => "INVALID_PASSWORD",
            Self::AccountLocked => "ACCOUNT_LOCKED",
        }
    }
}

/// Request context recorded alongside an attempt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptContext {
    pub email: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl LoginAttempt {
    /// Build a new attempt record for `context`
    pub fn new(
        context: &AttemptContext,
        user_id: Option<RecordId>,
        failure: Option<FailureReason>,
        source: impl Into<String>,
        now_ms: i64,
    ) -> Self {
        Self {
            meta: SyncMeta::new(source, now_ms),
            user_id,
            email: crate::util::normalize_email(&context.email),
            ip_address: context.ip_address.clone(),
            user_agent: context.user_agent.clone(),
            success: failure.is_none(),
            failure_reason: failure.map(|reason| reason.as_str().to_string()),
            attempted_at: now_ms,
        }
    }
}
