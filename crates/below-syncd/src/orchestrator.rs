//! Membership-gated sync loop
//!
//! The orchestrator merges membership updates, a fixed-period ticker and a
//! shutdown signal into one loop. Sync attempts run inline, so a trigger
//! that arrives mid-sync waits until the attempt returns.

use crate::bundler::{BundleError, DirectoryBundler};
use crate::membership::{MembershipFeed, MembershipUpdate};
use crate::uploader::{RemoteUploader, UploadError};
use async_trait::async_trait;
use below_sync_core::{MembershipEvent, UploadTarget};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Sync attempt errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Bundle failed: {0}")]
    Bundle(#[from] BundleError),
    #[error("Upload failed: {0}")]
    Upload(#[from] UploadError),
}

/// One sync attempt
#[async_trait]
pub trait SyncJob: Send + Sync {
    /// Run the attempt to completion, returning the bytes uploaded
    async fn run(&self) -> Result<u64, SyncError>;
}

/// Bundle the log directory and upload it to the node's object
pub struct ArchiveSync {
    bundler: DirectoryBundler,
    uploader: RemoteUploader,
    target: UploadTarget,
}

impl ArchiveSync {
    pub fn new(bundler: DirectoryBundler, uploader: RemoteUploader, target: UploadTarget) -> Self {
        Self {
            bundler,
            uploader,
            target,
        }
    }
}

#[async_trait]
impl SyncJob for ArchiveSync {
    async fn run(&self) -> Result<u64, SyncError> {
        let archive = self.bundler.bundle().await?;
        let sent = self
            .uploader
            .upload(archive, &self.target.object_name, self.target.deadline)
            .await?;
        Ok(sent)
    }
}

/// What set off a sync attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Membership,
    Tick,
}

/// Loop counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrchestratorStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    /// Ticks ignored because the gate was closed
    pub skipped_ticks: u64,
}

/// Stops a running orchestrator
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    /// Signal shutdown. An attempt already running is left to finish.
    pub fn shutdown(&self) {
        let _ = self.tx.send(());
    }
}

/// Membership-gated periodic sync driver
pub struct SyncOrchestrator<J> {
    job: J,
    period: Duration,
    /// Whether this node may sync; only membership updates change it
    gate: bool,
    stats: OrchestratorStats,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl<J: SyncJob> SyncOrchestrator<J> {
    pub fn new(job: J, period: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        Self {
            job,
            period,
            gate: false,
            stats: OrchestratorStats::default(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Handle for stopping the loop, valid before and during `run`
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Run until shutdown
    pub async fn run(mut self, mut feed: MembershipFeed) -> OrchestratorStats {
        info!("Sync loop started (period {:?})", self.period);

        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut feed_open = true;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_rx.recv() => {
                    info!("Sync loop shutting down");
                    break;
                }
                update = feed.next(), if feed_open => match update {
                    MembershipUpdate::Changed(event) => self.on_membership(event).await,
                    MembershipUpdate::Closed => {
                        warn!("Membership feed closed; keeping gate at {}", self.gate);
                        feed_open = false;
                    }
                },
                _ = ticker.tick() => self.on_tick().await,
            }
        }

        self.stats
    }

    async fn on_membership(&mut self, event: MembershipEvent) {
        if event.is_member != self.gate {
            info!(
                "Sync {} (triggered_by_change={})",
                if event.is_member { "enabled" } else { "disabled" },
                event.triggered_by_change
            );
        }
        self.gate = event.is_member;
        if self.gate {
            self.attempt(Trigger::Membership).await;
        }
    }

    async fn on_tick(&mut self) {
        if self.gate {
            self.attempt(Trigger::Tick).await;
        } else {
            debug!("Tick skipped, node not in membership list");
            self.stats.skipped_ticks += 1;
        }
    }

    async fn attempt(&mut self, trigger: Trigger) {
        self.stats.attempts += 1;
        let started = Instant::now();
        match self.job.run().await {
            Ok(sent) => {
                self.stats.successes += 1;
                info!(
                    "Sync ({:?}) uploaded {} bytes in {:?}",
                    trigger,
                    sent,
                    started.elapsed()
                );
            }
            Err(e) => {
                self.stats.failures += 1;
                error!("Sync ({:?}) failed: {}", trigger, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::tests::extract;
    use crate::store::{ObjectStoreBlobStore, StoreError};
    use crate::uploader::tests::RecordingStore;
    use object_store::ObjectStore;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    const PERIOD: Duration = Duration::from_secs(60);

    /// Counts attempts; optionally fails every one
    struct CountingJob {
        attempts: Arc<AtomicU64>,
        fail: bool,
    }

    #[async_trait]
    impl SyncJob for CountingJob {
        async fn run(&self) -> Result<u64, SyncError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SyncError::Upload(UploadError::DestinationUnavailable {
                    name: "below_nodeA.tar.gz".to_string(),
                    source: StoreError::Unavailable {
                        message: "no such bucket".to_string(),
                    },
                }));
            }
            Ok(1)
        }
    }

    struct Harness {
        attempts: Arc<AtomicU64>,
        events: mpsc::Sender<MembershipEvent>,
        shutdown: ShutdownHandle,
        task: tokio::task::JoinHandle<OrchestratorStats>,
    }

    impl Harness {
        fn start(fail: bool) -> Self {
            let attempts = Arc::new(AtomicU64::new(0));
            let job = CountingJob {
                attempts: attempts.clone(),
                fail,
            };
            let (events, rx) = mpsc::channel(16);
            let orchestrator = SyncOrchestrator::new(job, PERIOD);
            let shutdown = orchestrator.shutdown_handle();
            let task = tokio::spawn(orchestrator.run(MembershipFeed::new(rx)));
            Self {
                attempts,
                events,
                shutdown,
                task,
            }
        }

        fn attempts(&self) -> u64 {
            self.attempts.load(Ordering::SeqCst)
        }

        async fn stop(self) -> OrchestratorStats {
            self.shutdown.shutdown();
            self.task.await.unwrap()
        }
    }

    async fn advance(d: Duration) {
        tokio::time::sleep(d).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_syncs_immediately() {
        let h = Harness::start(false);
        h.events.send(MembershipEvent::initial(true)).await.unwrap();
        advance(Duration::from_secs(1)).await;
        assert_eq!(h.attempts(), 1);

        let stats = h.stop().await;
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_ignored_while_disabled() {
        let h = Harness::start(false);
        h.events.send(MembershipEvent::initial(false)).await.unwrap();
        advance(PERIOD * 3 + Duration::from_secs(1)).await;
        assert_eq!(h.attempts(), 0);

        let stats = h.stop().await;
        assert_eq!(stats.attempts, 0);
        assert_eq!(stats.skipped_ticks, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_before_first_event_do_nothing() {
        let h = Harness::start(false);
        advance(PERIOD * 2 + Duration::from_secs(1)).await;
        assert_eq!(h.attempts(), 0);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_attempt_per_tick_while_enabled() {
        let h = Harness::start(false);
        h.events.send(MembershipEvent::initial(true)).await.unwrap();
        advance(Duration::from_secs(1)).await;
        assert_eq!(h.attempts(), 1);

        advance(PERIOD).await;
        assert_eq!(h.attempts(), 2);
        advance(PERIOD * 2).await;
        assert_eq!(h.attempts(), 4);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_follows_latest_event() {
        let h = Harness::start(false);
        for is_member in [true, false, true, false] {
            h.events
                .send(MembershipEvent::changed(is_member))
                .await
                .unwrap();
        }
        advance(Duration::from_secs(1)).await;
        // Each enabling event syncs once.
        assert_eq!(h.attempts(), 2);

        advance(PERIOD * 2).await;
        assert_eq!(h.attempts(), 2);

        h.events.send(MembershipEvent::changed(true)).await.unwrap();
        advance(Duration::from_secs(1)).await;
        assert_eq!(h.attempts(), 3);
        advance(PERIOD).await;
        assert_eq!(h.attempts(), 4);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_enabled_then_revoked_scenario() {
        let h = Harness::start(false);
        h.events.send(MembershipEvent::initial(true)).await.unwrap();
        advance(Duration::from_secs(1)).await;
        assert_eq!(h.attempts(), 1);

        h.events.send(MembershipEvent::changed(false)).await.unwrap();
        advance(PERIOD).await;
        assert_eq!(h.attempts(), 1);

        let stats = h.stop().await;
        assert_eq!(stats.skipped_ticks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_loop() {
        let h = Harness::start(true);
        h.events.send(MembershipEvent::initial(true)).await.unwrap();
        advance(PERIOD * 2 + Duration::from_secs(1)).await;
        assert_eq!(h.attempts(), 3);

        let stats = h.stop().await;
        assert_eq!(stats.failures, 3);
        assert_eq!(stats.successes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_feed_keeps_gate() {
        let h = Harness::start(false);
        h.events.send(MembershipEvent::initial(true)).await.unwrap();
        let Harness {
            attempts,
            events,
            shutdown,
            task,
        } = h;
        drop(events);

        advance(PERIOD + Duration::from_secs(1)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        shutdown.shutdown();
        assert_eq!(task.await.unwrap().attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_before_run_wins() {
        let attempts = Arc::new(AtomicU64::new(0));
        let orchestrator = SyncOrchestrator::new(
            CountingJob {
                attempts: attempts.clone(),
                fail: false,
            },
            PERIOD,
        );
        orchestrator.shutdown_handle().shutdown();

        let (tx, rx) = mpsc::channel(1);
        tx.send(MembershipEvent::initial(true)).await.unwrap();
        let stats = orchestrator.run(MembershipFeed::new(rx)).await;

        assert_eq!(stats, OrchestratorStats::default());
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_archive_sync_uploads_bundle() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data_01"), b"sample").unwrap();

        let inner: Arc<dyn ObjectStore> = Arc::new(object_store::memory::InMemory::new());
        let job = ArchiveSync::new(
            DirectoryBundler::new(dir.path()),
            RemoteUploader::new(Arc::new(ObjectStoreBlobStore::new(inner.clone()))),
            UploadTarget::for_node("nodeA", Duration::from_secs(10)),
        );
        let sent = job.run().await.unwrap();

        let object = inner
            .get(&object_store::path::Path::from("below_nodeA.tar.gz"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(object.len() as u64, sent);
        assert_eq!(
            extract(&object),
            vec![("data_01".to_string(), false, b"sample".to_vec())]
        );
    }

    #[tokio::test]
    async fn test_archive_sync_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let job = ArchiveSync::new(
            DirectoryBundler::new(dir.path().join("gone")),
            RemoteUploader::new(Arc::new(RecordingStore::default())),
            UploadTarget::for_node("nodeA", Duration::from_secs(10)),
        );
        assert!(matches!(
            job.run().await,
            Err(SyncError::Bundle(BundleError::DirectoryNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_archive_sync_destination_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data_01"), b"sample").unwrap();
        let job = ArchiveSync::new(
            DirectoryBundler::new(dir.path()),
            RemoteUploader::new(Arc::new(RecordingStore {
                unavailable: true,
                ..Default::default()
            })),
            UploadTarget::for_node("nodeA", Duration::from_secs(10)),
        );
        assert!(matches!(
            job.run().await,
            Err(SyncError::Upload(UploadError::DestinationUnavailable { .. }))
        ));
    }
}
