//! Cached reachability of the mirror
//!
//! One slow probe per TTL window instead of one per sync call. Probe errors
//! and timeouts mean "offline" and never reach callers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use super::remote::DocumentStore;

#[derive(Debug, Clone, Copy, Default)]
struct ProbeCache {
    online: bool,
    checked_at: Option<Instant>,
}

pub struct ConnectivityMonitor {
    store: Arc<dyn DocumentStore>,
    probe_collection: String,
    cache_ttl: Duration,
    probe_timeout: Duration,
    cache: Mutex<ProbeCache>,
    probes: AtomicU64,
}

impl ConnectivityMonitor {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        probe_collection: impl Into<String>,
        cache_ttl: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            store,
            probe_collection: probe_collection.into(),
            cache_ttl,
            probe_timeout,
            cache: Mutex::new(ProbeCache::default()),
            probes: AtomicU64::new(0),
        }
    }

    /// Whether the mirror is reachable, probing at most once per TTL window.
    ///
    /// Concurrent callers wait for the same probe.
    pub async fn is_online(&self) -> bool {
        let mut cache = self.cache.lock().await;
        if let Some(checked_at) = cache.checked_at {
            if checked_at.elapsed() < self.cache_ttl {
                return cache.online;
            }
        }

        let online = self.probe().await;
        if online != cache.online || cache.checked_at.is_none() {
            tracing::info!(online, "Mirror connectivity changed");
        }
        cache.online = online;
        cache.checked_at = Some(Instant::now());
        online
    }

    /// Force the next [`Self::is_online`] call to probe.
    pub async fn invalidate(&self) {
        let mut cache = self.cache.lock().await;
        cache.checked_at = None;
    }

    /// Record an offline observation made outside the probe (e.g. a push timeout).
    pub async fn mark_offline(&self) {
        let mut cache = self.cache.lock().await;
        if cache.online {
            tracing::info!(online = false, "Mirror connectivity changed");
        }
        cache.online = false;
        cache.checked_at = Some(Instant::now());
    }

    /// Last known state without probing; `None` before the first probe
    pub async fn last_known(&self) -> Option<bool> {
        let cache = self.cache.lock().await;
        cache.checked_at.map(|_| cache.online)
    }

    /// Probes performed so far
    pub fn probe_count(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }

    async fn probe(&self) -> bool {
        self.probes.fetch_add(1, Ordering::Relaxed);
        match tokio::time::timeout(
            self.probe_timeout,
            self.store.probe(&self.probe_collection),
        )
        .await
        {
            Ok(Ok(())) => true,
            Ok(Err(error)) => {
                tracing::debug!("Connectivity probe failed: {error}");
                false
            }
            Err(_) => {
                tracing::debug!(
                    timeout_ms = u64::try_from(self.probe_timeout.as_millis()).unwrap_or(u64::MAX),
                    "Connectivity probe timed out"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::memory_store::MemoryDocumentStore;

    fn monitor(store: &Arc<MemoryDocumentStore>) -> ConnectivityMonitor {
        ConnectivityMonitor::new(
            store.clone(),
            "users",
            Duration::from_secs(5),
            Duration::from_secs(3),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn calls_within_ttl_share_one_probe() {
        let store = Arc::new(MemoryDocumentStore::new());
        let monitor = monitor(&store);

        assert!(monitor.is_online().await);
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(monitor.is_online().await);

        assert_eq!(store.probe_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_ttl_reprobes() {
        let store = Arc::new(MemoryDocumentStore::new());
        let monitor = monitor(&store);

        assert!(monitor.is_online().await);
        store.set_online(false);
        assert!(monitor.is_online().await);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!monitor.is_online().await);
        assert_eq!(store.probe_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probe_times_out_as_offline_and_is_cached() {
        let store = Arc::new(MemoryDocumentStore::new());
        store.set_latency(Duration::from_secs(30));
        let monitor = monitor(&store);

        let started = Instant::now();
        assert!(!monitor.is_online().await);
        assert!(started.elapsed() < Duration::from_secs(4));

        assert!(!monitor.is_online().await);
        assert_eq!(monitor.probe_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_forces_fresh_probe() {
        let store = Arc::new(MemoryDocumentStore::new());
        store.set_online(false);
        let monitor = monitor(&store);
        assert!(!monitor.is_online().await);

        store.set_online(true);
        monitor.invalidate().await;

        assert!(monitor.is_online().await);
        assert_eq!(store.probe_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn mark_offline_holds_for_ttl() {
        let store = Arc::new(MemoryDocumentStore::new());
        let monitor = monitor(&store);
        assert!(monitor.is_online().await);

        monitor.mark_offline().await;

        assert!(!monitor.is_online().await);
        assert_eq!(monitor.last_known().await, Some(false));
        assert_eq!(store.probe_count(), 1);
    }
}
