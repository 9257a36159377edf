//! Error types for below-sync core

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Membership-file errors
#[derive(Debug, Error)]
pub enum Error {
    /// The membership file could not be read
    #[error("failed to read membership file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The membership file is not valid YAML or has the wrong shape
    #[error("malformed membership file: {0}")]
    Malformed(#[from] serde_yaml::Error),
}
