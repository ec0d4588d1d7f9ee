use std::io;

use idp_core::sync::{RemoteError, SyncError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] idp_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("No account found for {0}")]
    UserNotFound(String),
    #[error("Email cannot be empty")]
    EmptyEmail,
    #[error("Nothing to change. Pass at least one setting flag")]
    NothingToUpdate,
    #[error("Mirror is not configured. Set DOCUMENT_STORE_URL (and DOCUMENT_STORE_TOKEN) to enable `idp push`.")]
    SyncNotConfigured,
}
