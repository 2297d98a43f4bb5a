//! State shared by the control socket and the HTTP surface.

use grantkeeper_core::TokenManager;
use std::path::PathBuf;
use std::sync::Arc;

/// Facts about the running daemon reported by `info`.
#[derive(Debug, Clone, Default)]
pub struct DaemonInfo {
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
    pub socket_path: PathBuf,
    /// Bound HTTP port, `None` when disabled.
    pub http_port: Option<u16>,
    /// Bound HTTPS port, `None` when disabled.
    pub https_port: Option<u16>,
    /// Public key fingerprint of the HTTPS leaf certificate.
    pub fingerprint: Option<String>,
}

impl DaemonInfo {
    /// Link that starts authorization for `account` in a browser.
    ///
    /// Prefers HTTPS; falls back to plain HTTP when HTTPS is disabled.
    pub fn auth_link(&self, account: &str) -> String {
        let account: String = url::form_urlencoded::byte_serialize(account.as_bytes()).collect();
        match (self.https_port, self.http_port) {
            (Some(port), _) => format!("https://localhost:{}/auth?account={}", port, account),
            (None, Some(port)) => format!("http://localhost:{}/auth?account={}", port, account),
            (None, None) => format!("https://localhost/auth?account={}", account),
        }
    }
}

/// Everything a request handler needs.
pub struct DaemonState {
    pub manager: Arc<TokenManager>,
    pub info: DaemonInfo,
}

impl DaemonState {
    pub fn new(manager: Arc<TokenManager>, info: DaemonInfo) -> Self {
        Self { manager, info }
    }
}
