//! Login session model

use serde::{Deserialize, Serialize};

use super::{RecordId, SyncMeta};

/// An issued login session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSession {
    pub meta: SyncMeta,
    /// Owning user (local id)
    pub user_id: RecordId,
    /// Natural key
    pub session_token: String,
    pub refresh_token: String,
    pub device_info: Option<String>,
    pub ip_address: Option<String>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Expiry timestamp (Unix ms)
    pub expires_at: i64,
    pub is_valid: bool,
}

impl UserSession {
    /// Whether the session can still be used at `now_ms`
    pub const fn is_usable(&self, now_ms: i64) -> bool {
        self.is_valid && now_ms < self.expires_at
    }
}
