//! Core types shared by the below-sync components

use std::fs::Metadata;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// =============================================================================
// MEMBERSHIP
// =============================================================================

/// Result of one membership evaluation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MembershipEvent {
    /// False for the start-up evaluation, true for file-change re-reads
    pub triggered_by_change: bool,
    /// Whether the local node is listed
    pub is_member: bool,
}

impl MembershipEvent {
    /// Event for the evaluation made before monitoring begins
    pub fn initial(is_member: bool) -> Self {
        Self {
            triggered_by_change: false,
            is_member,
        }
    }

    /// Event for a re-read after a write to the membership file
    pub fn changed(is_member: bool) -> Self {
        Self {
            triggered_by_change: true,
            is_member,
        }
    }
}

// =============================================================================
// ARCHIVE
// =============================================================================

/// One file-system object captured in an archive
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Path relative to the bundle root, raw bytes of every component kept
    pub relative_path: PathBuf,
    pub is_directory: bool,
    /// Content length; zero for directories
    pub size: u64,
    /// Permission bits
    pub mode: u32,
    pub modified: SystemTime,
}

impl ArchiveEntry {
    /// Build an entry from file metadata
    pub fn from_metadata(relative_path: impl Into<PathBuf>, metadata: &Metadata) -> Self {
        let is_directory = metadata.is_dir();
        Self {
            relative_path: relative_path.into(),
            is_directory,
            size: if is_directory { 0 } else { metadata.len() },
            mode: permission_bits(metadata),
            modified: metadata.modified().unwrap_or(UNIX_EPOCH),
        }
    }

    /// Modification time as seconds since the Unix epoch
    pub fn mtime_secs(&self) -> u64 {
        self.modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

#[cfg(unix)]
fn permission_bits(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(metadata: &Metadata) -> u32 {
    match (metadata.is_dir(), metadata.permissions().readonly()) {
        (true, _) => 0o755,
        (false, true) => 0o444,
        (false, false) => 0o644,
    }
}

/// Archive name of `path` relative to `root`, made of its normal components
/// only. Names are kept byte for byte; the archive writer emits `/` as the
/// separator. Returns `None` for paths outside `root` and for `root` itself.
pub fn archive_path(root: &Path, path: &Path) -> Option<PathBuf> {
    let relative: PathBuf = path
        .strip_prefix(root)
        .ok()?
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect();
    if relative.as_os_str().is_empty() {
        None
    } else {
        Some(relative)
    }
}

// =============================================================================
// UPLOAD TARGET
// =============================================================================

/// Where and how long to upload one node's archive
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadTarget {
    /// Destination object name, `below_<node>.tar.gz`
    pub object_name: String,
    /// Upload deadline
    pub deadline: Duration,
}

impl UploadTarget {
    /// Derive the target for a node identity
    pub fn for_node(node: &str, deadline: Duration) -> Self {
        Self {
            object_name: format!("below_{}.tar.gz", node),
            deadline,
        }
    }
}
