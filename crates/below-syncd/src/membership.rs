//! Membership-file watching
//!
//! [`MembershipWatcher`] watches the shared membership file and turns every
//! write into a fresh [`MembershipEvent`]. Re-reads that fail are logged and
//! dropped, so the consumer keeps acting on the last good answer.

use below_sync_core::{MembershipEvent, MembershipList};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Membership events buffered ahead of the consumer
const FEED_CAPACITY: usize = 16;
/// Raw file-system notifications buffered ahead of the watch task
const RAW_CAPACITY: usize = 64;

/// Watcher errors
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Cannot access config path {}: {source}", .path.display())]
    ConfigAccess {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Config path {} is a directory, expected a file", .0.display())]
    NotAFile(PathBuf),
    #[error("File watch error: {0}")]
    Watch(#[from] notify::Error),
    #[error("Membership error: {0}")]
    Membership(#[from] below_sync_core::Error),
    #[error("Membership evaluation task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("Watcher already started")]
    AlreadyStarted,
}

/// Next item of a [`MembershipFeed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipUpdate {
    /// A fresh membership evaluation
    Changed(MembershipEvent),
    /// The watch has stopped; no further updates will arrive
    Closed,
}

/// Ordered sequence of membership evaluations
#[derive(Debug)]
pub struct MembershipFeed {
    rx: mpsc::Receiver<MembershipEvent>,
}

impl MembershipFeed {
    pub fn new(rx: mpsc::Receiver<MembershipEvent>) -> Self {
        Self { rx }
    }

    /// Wait for the next update. Cancel safe.
    pub async fn next(&mut self) -> MembershipUpdate {
        match self.rx.recv().await {
            Some(event) => MembershipUpdate::Changed(event),
            None => MembershipUpdate::Closed,
        }
    }
}

/// Answers "is this node listed" for one membership file
#[derive(Debug, Clone)]
struct MembershipCheck {
    path: PathBuf,
    node: String,
}

impl MembershipCheck {
    async fn evaluate(&self) -> Result<bool, WatchError> {
        let path = self.path.clone();
        let list = tokio::task::spawn_blocking(move || MembershipList::load(path)).await??;
        Ok(list.contains(&self.node))
    }
}

/// Watches a membership file for one node
pub struct MembershipWatcher {
    check: MembershipCheck,
    watcher: RecommendedWatcher,
    raw_rx: Option<mpsc::Receiver<notify::Result<Event>>>,
}

impl MembershipWatcher {
    /// Register a watch on `config_path` for `node`
    pub fn new(config_path: impl AsRef<Path>, node: impl Into<String>) -> Result<Self, WatchError> {
        let path = config_path.as_ref().to_path_buf();
        let metadata = std::fs::metadata(&path).map_err(|source| WatchError::ConfigAccess {
            path: path.clone(),
            source,
        })?;
        if metadata.is_dir() {
            return Err(WatchError::NotAFile(path));
        }

        let (raw_tx, raw_rx) = mpsc::channel(RAW_CAPACITY);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = raw_tx.blocking_send(res);
        })?;
        watcher.watch(&path, RecursiveMode::NonRecursive)?;

        Ok(Self {
            check: MembershipCheck {
                path,
                node: node.into(),
            },
            watcher,
            raw_rx: Some(raw_rx),
        })
    }

    /// Evaluate membership now and start monitoring.
    ///
    /// The returned feed yields the start-up evaluation first, then one
    /// event per successful re-read after a write. Fails if the start-up
    /// evaluation fails.
    pub async fn start(&mut self) -> Result<MembershipFeed, WatchError> {
        let raw_rx = self.raw_rx.take().ok_or(WatchError::AlreadyStarted)?;
        let is_member = self.check.evaluate().await?;
        info!(
            "Node {:?} is {} in {}",
            self.check.node,
            if is_member { "listed" } else { "not listed" },
            self.check.path.display()
        );

        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        // The channel is empty, so this cannot wait.
        let _ = tx.send(MembershipEvent::initial(is_member)).await;
        tokio::spawn(watch_loop(self.check.clone(), raw_rx, tx));

        Ok(MembershipFeed::new(rx))
    }

    /// Stop watching; the feed then reports [`MembershipUpdate::Closed`]
    pub fn close(mut self) {
        if let Err(e) = self.watcher.unwatch(&self.check.path) {
            debug!("Unwatch of {} failed: {}", self.check.path.display(), e);
        }
    }
}

fn is_write(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any)
    )
}

async fn watch_loop(
    check: MembershipCheck,
    mut raw_rx: mpsc::Receiver<notify::Result<Event>>,
    tx: mpsc::Sender<MembershipEvent>,
) {
    while let Some(res) = raw_rx.recv().await {
        match res {
            Ok(event) if is_write(&event.kind) => match check.evaluate().await {
                Ok(is_member) => {
                    debug!("Membership re-read: is_member={}", is_member);
                    if tx.send(MembershipEvent::changed(is_member)).await.is_err() {
                        debug!("Membership feed dropped, stopping watch");
                        return;
                    }
                }
                Err(e) => warn!("Ignoring unreadable membership file: {}", e),
            },
            Ok(event) => trace!("Ignoring file event {:?}", event.kind),
            Err(e) => warn!("Error from watcher: {}", e),
        }
    }
    info!("Membership watch on {} closed", check.path.display());
}
