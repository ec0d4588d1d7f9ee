//! Sync engine configuration
//!
//! Plain values with defaults; binaries fill them from their own
//! environment handling.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::services::DEFAULT_SOURCE_TAG;

/// Timing and identity of the sync engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Origin tag written into pushed documents, used for echo detection
    pub source_tag: String,
    /// How long a connectivity probe result is trusted
    pub connectivity_cache_ttl: Duration,
    /// Hard cutoff for one connectivity probe
    pub probe_timeout: Duration,
    /// Hard cutoff for one mirror write
    pub push_timeout: Duration,
    /// Cadence of `PENDING` retries
    pub pending_retry_interval: Duration,
    /// Cadence of `FAILED` retries and mirror verification
    pub failed_retry_interval: Duration,
    /// Delay before re-subscribing to a closed change feed
    pub resubscribe_delay: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            source_tag: DEFAULT_SOURCE_TAG.to_string(),
            connectivity_cache_ttl: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
            push_timeout: Duration::from_secs(5),
            pending_retry_interval: Duration::from_secs(30),
            failed_retry_interval: Duration::from_secs(60),
            resubscribe_delay: Duration::from_secs(10),
        }
    }
}

impl SyncSettings {
    #[must_use]
    pub fn with_source_tag(mut self, tag: impl Into<String>) -> Self {
        self.source_tag = tag.into();
        self
    }

    #[must_use]
    pub const fn with_connectivity(mut self, cache_ttl: Duration, probe_timeout: Duration) -> Self {
        self.connectivity_cache_ttl = cache_ttl;
        self.probe_timeout = probe_timeout;
        self
    }

    #[must_use]
    pub const fn with_push_timeout(mut self, timeout: Duration) -> Self {
        self.push_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_retry_intervals(mut self, pending: Duration, failed: Duration) -> Self {
        self.pending_retry_interval = pending;
        self.failed_retry_interval = failed;
        self
    }

    #[must_use]
    pub const fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }
}
