//! Unix control socket server.
//!
//! Clients write newline-delimited commands; each connection gets its own
//! task and its commands are answered in arrival order.

use anyhow::{Context, Result, bail};
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::commands::{self, Response};
use crate::state::DaemonState;

/// Longest accepted command line, newline included.
pub const MAX_LINE_BYTES: u64 = 4096;

/// Pause after a failed `accept` so persistent errors (EMFILE) don't spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Make sure `socket_path` can be bound.
///
/// - nothing there: fine
/// - a live socket: another daemon is running, fail
/// - a dead socket: stale from a crash, unlink it
/// - anything else: fail rather than delete a user's file
pub fn ensure_socket_available(socket_path: &Path) -> Result<()> {
    let metadata = match std::fs::symlink_metadata(socket_path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to stat socket {:?}", socket_path));
        }
    };

    if !metadata.file_type().is_socket() {
        bail!("socket path exists and is not a socket: {}", socket_path.display());
    }

    if std::os::unix::net::UnixStream::connect(socket_path).is_ok() {
        bail!("daemon already running on {}", socket_path.display());
    }

    warn!("Removing stale socket at {:?}", socket_path);
    std::fs::remove_file(socket_path)
        .with_context(|| format!("Failed to remove stale socket at {:?}", socket_path))?;
    Ok(())
}

/// Check the socket path and bind the control listener.
pub fn bind(socket_path: &Path) -> Result<UnixListener> {
    ensure_socket_available(socket_path)?;

    if let Some(parent) = socket_path.parent() {
        grantkeeper_core::persist::create_private_dir(parent)
            .with_context(|| format!("Failed to create socket directory {:?}", parent))?;
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("Failed to bind Unix socket at {:?}", socket_path))?;
    info!("Control socket listening on {:?}", socket_path);
    Ok(listener)
}

/// Accept connections until `shutdown` flips to `true`.
pub async fn serve(
    listener: UnixListener,
    state: Arc<DaemonState>,
    mut shutdown: watch::Receiver<bool>,
) {
    while !*shutdown.borrow() {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!("Control socket shutdown signal received");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, state).await {
                                warn!("Connection handler error: {}", e);
                            }
                        });
                    }
                    Err(e) => back_off_after_accept_error(&e).await,
                }
            }
        }
    }
}

async fn back_off_after_accept_error(e: &std::io::Error) {
    warn!("Failed to accept connection: {}", e);
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

/// Answer every line of one connection until the client hangs up.
///
/// Bad lines (not UTF-8, too long) get an error response; the connection
/// stays open.
async fn handle_connection(mut stream: UnixStream, state: Arc<DaemonState>) -> Result<()> {
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let n = (&mut reader)
            .take(MAX_LINE_BYTES)
            .read_until(b'\n', &mut buf)
            .await?;

        if n == 0 {
            // Connection closed
            break;
        }

        let response = if !buf.ends_with(b"\n") && n as u64 == MAX_LINE_BYTES {
            discard_rest_of_line(&mut reader).await?;
            Response::Error("Command line too long".to_string())
        } else {
            match std::str::from_utf8(&buf) {
                Ok(line) => {
                    let response = commands::handle_line(&state, line).await;
                    let command = line.split_whitespace().next().unwrap_or("");
                    debug!(command, error = response.is_error(), "Handled control command");
                    response
                }
                Err(_) => Response::Error("Command is not valid UTF-8".to_string()),
            }
        };

        writer.write_all(response.render().as_bytes()).await?;
        writer.flush().await?;
    }

    Ok(())
}

/// Skip input up to and including the next newline, in bounded chunks.
async fn discard_rest_of_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<()> {
    let mut chunk = Vec::new();
    loop {
        chunk.clear();
        let n = (&mut *reader)
            .take(MAX_LINE_BYTES)
            .read_until(b'\n', &mut chunk)
            .await?;
        if n == 0 || chunk.ends_with(b"\n") {
            return Ok(());
        }
    }
}
