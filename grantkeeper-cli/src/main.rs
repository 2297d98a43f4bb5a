//! Grantkeeper CLI
//!
//! Command-line front-end for the grantkeeper daemon.
//!
//! # Usage
//!
//! ```bash
//! # Write a starter configuration
//! grantkeeper init
//!
//! # List configured accounts and their token state
//! grantkeeper accounts
//! grantkeeper status
//!
//! # Print a fresh access token
//! grantkeeper token get work
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use grantkeeper_daemon::config::{self, CONFIG_ENV};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::FmtSubscriber;

mod client;
mod init;

use client::DaemonClient;

#[derive(Parser)]
#[command(name = "grantkeeper")]
#[command(about = "Talk to the grantkeeper OAuth2 token daemon")]
#[command(version)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the daemon control socket
    #[arg(long, global = true, env = "GRANTKEEPER_SOCKET")]
    socket: Option<PathBuf>,

    /// Path to the configuration file
    #[arg(short, long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured accounts
    Accounts,

    /// Show whether each account has a usable token
    Status,

    /// Show daemon paths, ports and certificate fingerprint
    Info,

    /// Get, delete or refresh the token of an account
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },

    /// Write a commented default configuration file
    Init,
}

#[derive(Subcommand)]
enum TokenAction {
    /// Print a fresh access token
    Get {
        /// Account name
        account: String,
    },

    /// Delete the stored token
    Delete {
        /// Account name
        account: String,
    },

    /// Refresh the token now
    Refresh {
        /// Account name
        account: String,
    },
}

impl Commands {
    /// Control-socket line for commands answered by the daemon.
    fn control_line(&self) -> Option<String> {
        match self {
            Commands::Accounts => Some("accounts".to_string()),
            Commands::Status => Some("status".to_string()),
            Commands::Info => Some("info".to_string()),
            Commands::Token { action } => Some(match action {
                TokenAction::Get { account } => format!("get-token {}", account),
                TokenAction::Delete { account } => format!("delete-token {}", account),
                TokenAction::Refresh { account } => format!("refresh-token {}", account),
            }),
            Commands::Init => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    if cli.verbose {
        FmtSubscriber::builder()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let Some(line) = cli.command.control_line() else {
        let path = cli.config.clone().unwrap_or_else(config::default_config_path);
        init::write_default_config(&path)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(ExitCode::SUCCESS);
    };

    let client = DaemonClient::new(resolve_socket(&cli));
    let response = client.send(&line).await?;

    if client::is_error(&response) {
        eprint!("{}", response);
        return Ok(ExitCode::FAILURE);
    }
    print!("{}", response);
    Ok(ExitCode::SUCCESS)
}

/// `--socket`, then the configured socket, then the default location.
fn resolve_socket(cli: &Cli) -> PathBuf {
    if let Some(socket) = &cli.socket {
        return socket.clone();
    }
    match config::load_config(cli.config.as_deref()) {
        Ok(config) => config.socket_path(),
        Err(e) => {
            debug!("Using default socket path: {}", e);
            config::default_socket_path()
        }
    }
}
