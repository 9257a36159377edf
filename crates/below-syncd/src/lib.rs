//! below-syncd - membership-gated below log uploader
//!
//! This daemon provides:
//! - Membership-file watching (is this node allowed to sync?)
//! - Streaming tar.gz snapshots of the below store directory
//! - Deadline-bounded uploads to an object store
//! - A gated periodic sync loop tying the three together

pub mod bundler;
pub mod config;
pub mod daemon;
pub mod membership;
pub mod orchestrator;
pub mod store;
pub mod uploader;

pub use bundler::DirectoryBundler;
pub use config::Config;
pub use daemon::Daemon;
pub use membership::MembershipWatcher;
pub use orchestrator::SyncOrchestrator;
pub use uploader::RemoteUploader;
