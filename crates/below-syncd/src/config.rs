//! Configuration for below-syncd

use crate::store::StoreBackend;
use below_sync_core::UploadTarget;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// below-syncd - membership-gated below log uploader
#[derive(Parser, Debug, Clone)]
#[command(name = "below-syncd")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Path to the membership file listing the nodes allowed to sync
    #[arg(long, env = "BELOW_SYNC_CONFIG_PATH")]
    pub config_path: PathBuf,

    /// Bucket receiving the archives (a directory for the file backend)
    #[arg(long, env = "BELOW_SYNC_BUCKET")]
    pub bucket_name: String,

    /// Object store backend
    #[arg(long, value_enum, default_value = "gcs")]
    pub backend: StoreBackend,

    /// Upload interval in seconds
    #[arg(long, default_value = "60")]
    pub upload_frequency_secs: u64,

    /// Per-upload timeout in seconds
    #[arg(long, default_value = "60")]
    pub context_timeout_secs: u64,

    /// Directory containing the below store to archive
    #[arg(long, default_value = "/var/log/below/store")]
    pub below_log_dir: PathBuf,

    /// Node identity; defaults to the hostname
    #[arg(long, env = "BELOW_SYNC_NODE_NAME")]
    pub node_name: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bucket_name.trim().is_empty() {
            anyhow::bail!("Bucket name cannot be empty");
        }
        if self.config_path.as_os_str().is_empty() {
            anyhow::bail!("Config path cannot be empty");
        }
        if self.below_log_dir.as_os_str().is_empty() {
            anyhow::bail!("Below log directory cannot be empty");
        }
        if self.upload_frequency_secs == 0 {
            anyhow::bail!("Upload frequency must be greater than 0");
        }
        if self.context_timeout_secs == 0 {
            anyhow::bail!("Context timeout must be greater than 0");
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Unknown log format: {}", self.log_format);
        }
        self.node_identity()?;
        Ok(())
    }

    /// Resolve the node identity: `--node-name` if set, the hostname otherwise
    pub fn node_identity(&self) -> anyhow::Result<String> {
        let node = match &self.node_name {
            Some(name) => name.trim().to_string(),
            None => gethostname::gethostname()
                .into_string()
                .map_err(|raw| anyhow::anyhow!("Hostname is not valid UTF-8: {:?}", raw))?,
        };
        if node.is_empty() {
            anyhow::bail!("Node identity cannot be empty");
        }
        Ok(node)
    }

    /// Interval between timer-driven syncs
    pub fn upload_period(&self) -> Duration {
        Duration::from_secs(self.upload_frequency_secs)
    }

    /// Deadline for a single upload
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.context_timeout_secs)
    }

    /// Upload target for this node
    pub fn upload_target(&self) -> anyhow::Result<UploadTarget> {
        Ok(UploadTarget::for_node(
            &self.node_identity()?,
            self.upload_timeout(),
        ))
    }
}
