//! below-sync core library
//!
//! Shared data model for the below-sync daemon: membership events, the
//! parsed membership list, archive entries, and upload targets.
//!
//! # Modules
//!
//! - [`types`]: Core types (MembershipEvent, ArchiveEntry, UploadTarget, etc.)
//! - [`membership`]: Membership-file parsing
//! - [`error`]: Error types

pub mod error;
pub mod membership;
pub mod types;

pub use error::{Error, Result};
pub use membership::MembershipList;
pub use types::*;
