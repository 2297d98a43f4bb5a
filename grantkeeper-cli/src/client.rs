//! Daemon client for the grantkeeperd control socket.
//!
//! Each request opens a fresh connection, writes one command line, closes
//! its write half and reads the response until the daemon hangs up.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

use grantkeeper_daemon::commands::ERROR_PREFIX;

/// Client for communicating with the grantkeeper daemon.
pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send one command and return the daemon's response text.
    pub async fn send(&self, command: &str) -> Result<String> {
        debug!("Connecting to daemon at {:?}", self.socket_path);
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to connect to daemon at {:?}; is grantkeeperd running?",
                    self.socket_path
                )
            })?;

        debug!(command, "Sending command");
        stream.write_all(command.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.shutdown().await?;

        let mut response = String::new();
        stream
            .read_to_string(&mut response)
            .await
            .context("Failed to read daemon response")?;
        Ok(response)
    }
}

/// Whether a daemon response reports a failure.
pub fn is_error(response: &str) -> bool {
    response.starts_with(ERROR_PREFIX)
}
