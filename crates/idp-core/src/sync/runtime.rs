//! Wiring of the sync components into one background service

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use super::connectivity::ConnectivityMonitor;
use super::documents::MirrorDocument;
use super::identity::IdentityProvider;
use super::pull::{FeedEnd, PullIngestor};
use super::push::{PushSummary, PushSyncer};
use super::remote::DocumentStore;
use super::scheduler::{RetryScheduler, SchedulerHandle};
use crate::config::SyncSettings;
use crate::models::{LoginAttempt, User, UserSession};
use crate::services::DatabaseService;

struct RunningTasks {
    scheduler: SchedulerHandle,
    shutdown: watch::Sender<bool>,
    feeds: Vec<JoinHandle<()>>,
}

/// Connectivity monitor, pusher, ingestor and scheduler sharing one store
pub struct SyncRuntime {
    db: DatabaseService,
    store: Arc<dyn DocumentStore>,
    connectivity: Arc<ConnectivityMonitor>,
    pusher: Arc<PushSyncer>,
    ingestor: PullIngestor,
    scheduler: Arc<RetryScheduler>,
    settings: SyncSettings,
    running: Mutex<Option<RunningTasks>>,
}

impl SyncRuntime {
    /// Build the components; nothing runs until [`Self::start`].
    ///
    /// Local mutations and pushed documents are tagged with
    /// `settings.source_tag`.
    pub fn new(
        db: DatabaseService,
        store: Arc<dyn DocumentStore>,
        identity: Option<Arc<dyn IdentityProvider>>,
        settings: SyncSettings,
    ) -> Self {
        let db = db.with_source_tag(&settings.source_tag);
        let connectivity = Arc::new(ConnectivityMonitor::new(
            Arc::clone(&store),
            User::COLLECTION,
            settings.connectivity_cache_ttl,
            settings.probe_timeout,
        ));
        let mut pusher = PushSyncer::new(
            db.clone(),
            Arc::clone(&store),
            Arc::clone(&connectivity),
            settings.push_timeout,
        );
        if let Some(identity) = identity {
            pusher = pusher.with_identity_provider(identity);
        }
        let pusher = Arc::new(pusher);
        let scheduler = Arc::new(RetryScheduler::new(
            Arc::clone(&pusher),
            settings.pending_retry_interval,
            settings.failed_retry_interval,
        ));

        Self {
            ingestor: PullIngestor::new(db.clone()),
            db,
            store,
            connectivity,
            pusher,
            scheduler,
            settings,
            running: Mutex::new(None),
        }
    }

    /// Start the retry scheduler and one change-feed follower per collection.
    ///
    /// Calling it again while running does nothing.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let feeds = [User::COLLECTION, UserSession::COLLECTION, LoginAttempt::COLLECTION]
            .into_iter()
            .map(|collection| {
                let follower = FeedFollower {
                    store: Arc::clone(&self.store),
                    ingestor: self.ingestor.clone(),
                    collection,
                    resubscribe_delay: self.settings.resubscribe_delay,
                };
                tokio::spawn(follower.run(shutdown_rx.clone()))
            })
            .collect();

        *running = Some(RunningTasks {
            scheduler: Arc::clone(&self.scheduler).start(),
            shutdown,
            feeds,
        });
        tracing::info!(source_tag = %self.settings.source_tag, "Sync runtime started");
    }

    /// Stop every background task and wait for them.
    pub async fn shutdown(&self) {
        let Some(tasks) = self.running.lock().await.take() else {
            return;
        };
        let _ = tasks.shutdown.send(true);
        tasks.scheduler.stop().await;
        for feed in tasks.feeds {
            if let Err(error) = feed.await {
                tracing::warn!("Change feed task ended abnormally: {error}");
            }
        }
        tracing::info!("Sync runtime stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Push every `PENDING` and `FAILED` record now
    pub async fn push_now(&self) -> PushSummary {
        self.pusher.push_all_pending().await
    }

    /// Best-effort push of one record right after a local write.
    ///
    /// Failures are logged; the record stays queued for the scheduler.
    pub async fn push_quietly<R: MirrorDocument>(&self, record: &R) {
        if let Err(error) = self.pusher.push_one(record).await {
            tracing::debug!(
                collection = R::COLLECTION,
                local_id = %record.meta().local_id,
                "Immediate push failed, left for retry: {error}"
            );
        }
    }

    pub const fn database(&self) -> &DatabaseService {
        &self.db
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn pusher(&self) -> &Arc<PushSyncer> {
        &self.pusher
    }

    pub const fn ingestor(&self) -> &PullIngestor {
        &self.ingestor
    }

    pub fn scheduler(&self) -> &Arc<RetryScheduler> {
        &self.scheduler
    }

    pub const fn settings(&self) -> &SyncSettings {
        &self.settings
    }
}

struct FeedFollower {
    store: Arc<dyn DocumentStore>,
    ingestor: PullIngestor,
    collection: &'static str,
    resubscribe_delay: Duration,
}

impl FeedFollower {
    /// Keep a subscription open until shutdown, re-subscribing after drops.
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.store.subscribe(self.collection).await {
                Ok(feed) => {
                    tracing::debug!(collection = self.collection, "Subscribed to change feed");
                    if self.ingestor.run(feed, shutdown.clone()).await == FeedEnd::Shutdown {
                        return;
                    }
                    tracing::warn!(collection = self.collection, "Change feed closed");
                }
                Err(error) => {
                    tracing::warn!(collection = self.collection, "Subscribe failed: {error}");
                }
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                () = tokio::time::sleep(self.resubscribe_delay) => {}
            }
        }
    }
}
