//! below-syncd - membership-gated below log uploader
//!
//! While this node is listed in the shared membership file, the daemon
//! periodically archives the below store and uploads it as
//! `below_<node>.tar.gz`.

use below_syncd::config::Config;
use below_syncd::daemon::Daemon;
use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration
    let config = Config::parse();

    // Initialize logging
    let directive = if config.verbose {
        "below_syncd=debug"
    } else {
        "below_syncd=info"
    };
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(directive.parse().unwrap()));
    if config.log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    info!(
        "below-syncd v{} - membership-gated below log uploader",
        env!("CARGO_PKG_VERSION")
    );

    let daemon = match Daemon::start(config).await {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("Failed to start: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Install signal handlers
    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Received shutdown signal");
        shutdown.shutdown();
    });

    let stats = daemon.run().await;
    info!(
        "Final stats: {} attempts, {} succeeded, {} failed, {} ticks skipped",
        stats.attempts, stats.successes, stats.failures, stats.skipped_ticks
    );

    ExitCode::SUCCESS
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}
