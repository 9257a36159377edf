//! Membership-file parsing
//!
//! The membership file is YAML with a single recognized key:
//!
//! ```yaml
//! nodes:
//!   - host-a
//!   - host-b
//! ```
//!
//! Other keys are ignored. An empty document is an empty list.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;

/// Parsed membership file
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct MembershipList {
    /// Node identifiers, in file order (duplicates allowed)
    #[serde(default)]
    pub nodes: Vec<String>,
}

impl MembershipList {
    /// Parse membership YAML
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Read and parse a membership file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Check whether `node` is listed
    pub fn contains(&self, node: &str) -> bool {
        self.nodes.iter().any(|n| n == node)
    }
}
