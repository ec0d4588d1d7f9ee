//! Runtime-adjustable security settings

use serde::{Deserialize, Serialize};

/// Lockout and session settings, persisted locally and read on every attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SecuritySettings {
    /// Failed attempts that lock an account
    pub max_login_attempts: u32,
    /// How long a lock lasts
    pub lock_duration_minutes: u32,
    /// Lifetime of a login session
    pub session_duration_minutes: u32,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            max_login_attempts: 3,
            lock_duration_minutes: 30,
            session_duration_minutes: 60,
        }
    }
}

impl SecuritySettings {
    /// Reject values that would make the lockout policy meaningless
    pub fn validate(&self) -> crate::Result<()> {
        if !(1..=100).contains(&self.max_login_attempts) {
            return Err(crate::Error::InvalidInput(
                "max_login_attempts must be in [1, 100]".to_string(),
            ));
        }
        if !(1..=10_080).contains(&self.lock_duration_minutes) {
            return Err(crate::Error::InvalidInput(
                "lock_duration_minutes must be in [1, 10080]".to_string(),
            ));
        }
        if !(1..=43_200).contains(&self.session_duration_minutes) {
            return Err(crate::Error::InvalidInput(
                "session_duration_minutes must be in [1, 43200]".to_string(),
            ));
        }
        Ok(())
    }
}
