//! `grantkeeper init`: write a starter configuration.

use anyhow::{Context, Result, bail};
use std::path::Path;

/// Commented starter configuration. Loads as-is with no accounts.
pub const DEFAULT_CONFIG: &str = r#"# grantkeeper daemon configuration

# Port of the HTTPS callback listener, or "none" to disable it.
https_listen = "8080"

# Port of a plain HTTP callback listener, or "none" to disable it.
http_listen = "none"

# Where tokens are kept: "memory", "file" or "keyring".
persistence = "memory"

# Seconds between background refresh sweeps.
refresh_interval_secs = 1800

# Tokens expiring within this many seconds are refreshed ahead of time.
expiry_threshold_secs = 600

# Log level used when RUST_LOG is not set.
log_level = "info"

# Optional overrides:
# socket_path = "/run/user/1000/grantkeeper.sock"
# data_dir = "/home/me/.local/share/grantkeeper"

# One table per account. The redirect URI must point at this daemon.
#
# [account.work]
# auth_uri = "https://login.microsoftonline.com/common/oauth2/v2.0/authorize"
# token_uri = "https://login.microsoftonline.com/common/oauth2/v2.0/token"
# client_id = "your-client-id"
# client_secret = ""
# redirect_uri = "https://localhost:8080"
# scopes = ["https://outlook.office.com/IMAP.AccessAsUser.All", "offline_access"]
#
# [account.work.auth_uri_fields]
# login_hint = "me@example.com"
"#;

/// Write [`DEFAULT_CONFIG`] to `path`, owner-only. Never overwrites.
pub fn write_default_config(path: &Path) -> Result<()> {
    if path.exists() {
        bail!(
            "config file already exists at {}; refusing to overwrite",
            path.display()
        );
    }

    grantkeeper_core::persist::write_private(path, DEFAULT_CONFIG.as_bytes())
        .with_context(|| format!("Failed to write config to {:?}", path))?;
    Ok(())
}
