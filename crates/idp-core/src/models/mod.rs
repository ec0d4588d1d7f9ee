//! Data models for idp

mod login_attempt;
mod security_settings;
mod session;
mod sync_meta;
mod user;

pub use login_attempt::{AttemptContext, FailureReason, LoginAttempt};
pub use security_settings::SecuritySettings;
pub use session::UserSession;
pub use sync_meta::{RecordId, SyncMeta, SyncStatus};
pub use user::{LoginState, Role, User};
