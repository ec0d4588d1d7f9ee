//! Periodic retry of unsynced records
//!
//! Two cadences: a short one pushing `PENDING` records and a longer one
//! retrying `FAILED` records and checking the mirror for lost documents.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::push::{PushSummary, PushSyncer};
use super::SyncError;
use crate::models::SyncStatus;

pub struct RetryScheduler {
    pusher: Arc<PushSyncer>,
    pending_interval: Duration,
    failed_interval: Duration,
}

/// Running scheduler tasks; dropping the handle does not stop them
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Signal both tasks and wait for them to finish their current tick.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(error) = task.await {
                tracing::warn!("Retry task ended abnormally: {error}");
            }
        }
    }
}

impl RetryScheduler {
    pub fn new(pusher: Arc<PushSyncer>, pending_interval: Duration, failed_interval: Duration) -> Self {
        Self {
            pusher,
            pending_interval,
            failed_interval,
        }
    }

    /// Push `PENDING` records; `None` when the mirror is offline.
    pub async fn run_once(&self) -> Option<PushSummary> {
        if !self.pusher.connectivity().is_online().await {
            tracing::debug!("Mirror offline, skipping pending retry");
            return None;
        }
        Some(self.pusher.push_by_status(&[SyncStatus::Pending]).await)
    }

    /// Retry `FAILED` records and requeue users missing from the mirror.
    pub async fn run_failed_once(&self) -> Option<PushSummary> {
        if !self.pusher.connectivity().is_online().await {
            tracing::debug!("Mirror offline, skipping failed retry");
            return None;
        }
        let summary = self.pusher.push_by_status(&[SyncStatus::Failed]).await;
        match self.pusher.verify_mirror().await {
            Ok(0) | Err(SyncError::Offline) => {}
            Ok(requeued) => tracing::info!(requeued, "Requeued records missing from the mirror"),
            Err(error) => tracing::warn!("Mirror verification failed: {error}"),
        }
        Some(summary)
    }

    /// Spawn both retry loops.
    pub fn start(self: Arc<Self>) -> SchedulerHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        tracing::info!(
            pending_interval = ?self.pending_interval,
            failed_interval = ?self.failed_interval,
            "Starting retry scheduler"
        );

        let pending = {
            let scheduler = Arc::clone(&self);
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                let interval = scheduler.pending_interval;
                tick_until_shutdown(interval, shutdown_rx, || scheduler.run_once()).await;
            })
        };
        let failed = {
            let scheduler = Arc::clone(&self);
            tokio::spawn(async move {
                let interval = scheduler.failed_interval;
                tick_until_shutdown(interval, shutdown_rx, || scheduler.run_failed_once()).await;
            })
        };

        SchedulerHandle {
            shutdown,
            tasks: vec![pending, failed],
        }
    }
}

async fn tick_until_shutdown<F, Fut>(
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<PushSummary>>,
{
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            _ = interval.tick() => {
                tick().await;
            }
        }
    }
}
