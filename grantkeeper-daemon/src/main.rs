//! Grantkeeper Daemon
//!
//! Background service that keeps OAuth2 tokens fresh and hands them out
//! over a local control socket.
//!
//! # Running
//!
//! ```bash
//! cargo run -p grantkeeper-daemon -- --config ~/.config/grantkeeper/grantkeeper.toml
//! # or after install:
//! grantkeeperd
//! ```

use anyhow::Result;
use clap::Parser;
use grantkeeper_daemon::config::{self, CONFIG_ENV};
use grantkeeper_daemon::Daemon;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "grantkeeperd")]
#[command(author, version, about = "OAuth2 token custody daemon", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = CONFIG_ENV)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = config::load_config(cli.config.as_deref())?;
    init_logging(&config.log_level);

    info!("Starting grantkeeper daemon...");
    info!("Loaded configuration from {:?}", config.config_path);

    let daemon = Daemon::bind(&config)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received, stopping daemon...");
        let _ = shutdown_tx.send(true);
    });

    info!("Daemon running. Press Ctrl+C to stop.");
    daemon.run(shutdown_rx).await?;

    info!("Daemon stopped");
    Ok(())
}

/// `RUST_LOG` wins over the configured level.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).with_target(false).init();
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
