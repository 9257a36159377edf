//! below-syncd daemon - start-up wiring

use crate::bundler::DirectoryBundler;
use crate::config::Config;
use crate::membership::{MembershipFeed, MembershipWatcher, WatchError};
use crate::orchestrator::{ArchiveSync, OrchestratorStats, ShutdownHandle, SyncOrchestrator};
use crate::store::{open_object_store, ObjectStoreBlobStore, StoreError};
use crate::uploader::RemoteUploader;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Start-up errors
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] anyhow::Error),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),
}

/// A started daemon, ready to run
pub struct Daemon {
    watcher: MembershipWatcher,
    feed: MembershipFeed,
    orchestrator: SyncOrchestrator<ArchiveSync>,
}

impl Daemon {
    /// Build every component and evaluate membership once.
    ///
    /// Any error here is fatal.
    pub async fn start(config: Config) -> Result<Self, DaemonError> {
        config.validate()?;
        let node = config.node_identity()?;
        let target = config.upload_target()?;

        let store = open_object_store(config.backend, &config.bucket_name)?;
        let uploader = RemoteUploader::new(Arc::new(ObjectStoreBlobStore::new(store)));
        let bundler = DirectoryBundler::new(&config.below_log_dir);

        let mut watcher = MembershipWatcher::new(&config.config_path, node.as_str())?;
        let feed = watcher.start().await?;

        info!(
            "Node {} syncing {} to {} every {:?} (timeout {:?})",
            node,
            config.below_log_dir.display(),
            target.object_name,
            config.upload_period(),
            target.deadline
        );

        let orchestrator = SyncOrchestrator::new(
            ArchiveSync::new(bundler, uploader, target),
            config.upload_period(),
        );

        Ok(Self {
            watcher,
            feed,
            orchestrator,
        })
    }

    /// Handle for stopping [`Daemon::run`]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.orchestrator.shutdown_handle()
    }

    /// Run the sync loop until shutdown, then stop watching
    pub async fn run(self) -> OrchestratorStats {
        let stats = self.orchestrator.run(self.feed).await;
        self.watcher.close();
        stats
    }
}
