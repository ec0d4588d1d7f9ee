//! idp-core - Core library for the identity service
//!
//! Local-first user, session and login-attempt storage, account lockout,
//! and replication of every record to a remote document mirror.

pub mod config;
pub mod db;
pub mod error;
pub mod lockout;
pub mod models;
pub mod services;
pub mod sync;
pub mod util;

pub use config::SyncSettings;
pub use error::{Error, Result};
pub use lockout::{Gate, LockoutPolicy, LoginOutcome};
pub use models::{LoginAttempt, RecordId, SecuritySettings, SyncStatus, User, UserSession};
pub use services::DatabaseService;
