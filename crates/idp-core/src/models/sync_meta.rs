//! Mirror bookkeeping shared by every synchronized record

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A unique local identifier, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Create a new unique record ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Where a record stands relative to its remote mirror
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    /// Local state is newer than the mirror, or never reached it
    #[default]
    Pending,
    /// Local and mirror agreed as of the last confirmed write
    Synced,
    /// Last push attempt errored
    Failed,
}

impl SyncStatus {
    /// Column representation
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Synced => "SYNCED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "SYNCED" => Ok(Self::Synced),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown sync status `{other}`")),
        }
    }
}

/// Sync columns carried by every mirrored record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMeta {
    /// Stable local primary key
    pub local_id: RecordId,
    /// Mirror document id, fixed after the first successful push
    pub remote_id: Option<String>,
    /// Current sync status
    pub sync_status: SyncStatus,
    /// Last local modification (Unix ms), strictly increasing per record
    pub updated_at: i64,
    /// Origin tag of the values currently held locally
    pub source: String,
}

impl SyncMeta {
    /// Metadata for a freshly created local record
    pub fn new(source: impl Into<String>, now_ms: i64) -> Self {
        Self {
            local_id: RecordId::new(),
            remote_id: None,
            sync_status: SyncStatus::Pending,
            updated_at: now_ms,
            source: source.into(),
        }
    }

    /// Document id used for mirror writes
    pub fn document_id(&self) -> String {
        self.remote_id
            .clone()
            .unwrap_or_else(|| self.local_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_id_round_trips_through_string() {
        let id = RecordId::new();
        let parsed: RecordId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn sync_status_parses_column_values() {
        assert_eq!("SYNCED".parse::<SyncStatus>(), Ok(SyncStatus::Synced));
        assert_eq!("failed".parse::<SyncStatus>(), Ok(SyncStatus::Failed));
        assert!("LOST".parse::<SyncStatus>().is_err());
    }

    #[test]
    fn document_id_prefers_remote_id() {
        let mut meta = SyncMeta::new("LOCAL", 1);
        assert_eq!(meta.document_id(), meta.local_id.as_str());

        meta.remote_id = Some("remote-1".to_string());
        assert_eq!(meta.document_id(), "remote-1");
    }
}
