//! Daemon assembly: bind every listener, then run them until shutdown.

use anyhow::{Context, Result, bail};
use axum_server::tls_rustls::RustlsConfig;
use grantkeeper_core::certs::LeafMaterial;
use grantkeeper_core::oauth::http_client_trusting;
use grantkeeper_core::{CertAuthority, OAuthEngine, TokenManager, TracingNotifier, create_store};
use std::net::{Ipv4Addr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::state::{DaemonInfo, DaemonState};
use crate::{control, http, sweep};

/// Resolve once `shutdown` carries `true` or its sender is gone.
pub async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}

/// A daemon whose listeners are bound but not yet serving.
pub struct Daemon {
    state: Arc<DaemonState>,
    control: UnixListener,
    http: Option<TcpListener>,
    https: Option<(TcpListener, LeafMaterial)>,
    socket_path: PathBuf,
    refresh_interval: Duration,
}

impl Daemon {
    /// Prepare storage and certificates and bind every listener.
    ///
    /// Listeners bind to `127.0.0.1`; port `0` picks a free port, which is
    /// then reported by [`DaemonInfo`]. Must be called inside a Tokio runtime.
    pub fn bind(config: &DaemonConfig) -> Result<Self> {
        let https_port = config.https_port()?;
        let http_port = config.http_port()?;
        if https_port.is_none() && http_port.is_none() {
            bail!("both https_listen and http_listen are disabled; enable at least one");
        }

        let socket_path = config.socket_path();
        control::ensure_socket_available(&socket_path)?;

        let data_dir = config.data_dir();
        grantkeeper_core::persist::create_private_dir(&data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;

        let accounts = Arc::new(config.registry());
        let mut engine = OAuthEngine::new(accounts);

        let https_listener = match https_port {
            Some(port) => {
                let authority = CertAuthority::new(config.cert_dir());
                let leaf = authority
                    .ensure_leaf()
                    .context("Failed to prepare HTTPS certificate")?;
                let ca_pem = std::fs::read(authority.ca_cert_path())
                    .with_context(|| format!("Failed to read {:?}", authority.ca_cert_path()))?;
                engine = engine.with_http_client(
                    http_client_trusting(&ca_pem).context("Failed to build HTTP client")?,
                );
                info!(ca = %authority.ca_cert_path().display(), "Local certificate authority ready");
                Some((bind_tcp("https_listen", port)?, leaf))
            }
            None => None,
        };

        let http_listener = match http_port {
            Some(port) => Some(bind_tcp("http_listen", port)?),
            None => None,
        };

        let store = create_store(config.persistence(), &data_dir);
        let manager = TokenManager::new(store, engine, Arc::new(TracingNotifier))
            .with_threshold(config.expiry_threshold());

        let info = DaemonInfo {
            data_dir,
            config_path: config.config_path.clone(),
            socket_path: socket_path.clone(),
            http_port: http_listener.as_ref().map(local_port).transpose()?,
            https_port: https_listener.as_ref().map(|(l, _)| local_port(l)).transpose()?,
            fingerprint: https_listener.as_ref().map(|(_, leaf)| leaf.fingerprint.clone()),
        };

        let control = control::bind(&socket_path)?;

        Ok(Self {
            state: Arc::new(DaemonState::new(Arc::new(manager), info)),
            control,
            http: http_listener,
            https: https_listener,
            socket_path,
            refresh_interval: config.refresh_interval(),
        })
    }

    pub fn state(&self) -> &Arc<DaemonState> {
        &self.state
    }

    pub fn info(&self) -> &DaemonInfo {
        &self.state.info
    }

    /// Serve until `shutdown` flips to `true`, then remove the socket.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        if rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("rustls crypto provider already installed");
        }

        let Daemon {
            state,
            control,
            http: http_listener,
            https: https_listener,
            socket_path,
            refresh_interval,
        } = self;

        let router = http::router(state.clone());
        if let Some(port) = state.info.https_port {
            info!("HTTPS callback listening on https://localhost:{}", port);
        }
        if let Some(port) = state.info.http_port {
            info!("HTTP callback listening on http://localhost:{}", port);
        }

        let result = tokio::try_join!(
            async {
                control::serve(control, state.clone(), shutdown.clone()).await;
                Ok::<(), anyhow::Error>(())
            },
            async {
                sweep::run(state.manager.clone(), refresh_interval, shutdown.clone()).await;
                Ok::<(), anyhow::Error>(())
            },
            async {
                if let Some(listener) = http_listener {
                    http::serve_http(listener, router.clone(), shutdown.clone())
                        .await
                        .context("HTTP listener failed")?;
                }
                Ok::<(), anyhow::Error>(())
            },
            async {
                if let Some((listener, leaf)) = https_listener {
                    let tls = RustlsConfig::from_pem(
                        leaf.cert_pem.into_bytes(),
                        leaf.key_pem.into_bytes(),
                    )
                    .await
                    .context("Failed to load TLS configuration")?;
                    http::serve_https(listener, router.clone(), tls, shutdown.clone())
                        .await
                        .context("HTTPS listener failed")?;
                }
                Ok::<(), anyhow::Error>(())
            },
        );

        if let Err(e) = std::fs::remove_file(&socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove socket {:?}: {}", socket_path, e);
            }
        } else {
            info!("Socket file removed");
        }

        result.map(|_| ())
    }
}

fn bind_tcp(field: &str, port: u16) -> Result<TcpListener> {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port))
        .with_context(|| format!("Failed to bind {} on 127.0.0.1:{}", field, port))
}

fn local_port(listener: &TcpListener) -> Result<u16> {
    Ok(listener.local_addr()?.port())
}
