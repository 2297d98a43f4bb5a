//! Daemon configuration handling.
//!
//! The configuration is a TOML file:
//!
//! ```toml
//! https_listen = "8080"
//! http_listen = "none"
//! persistence = "keyring"
//!
//! [account.work]
//! auth_uri = "https://login.example.com/oauth2/authorize"
//! token_uri = "https://login.example.com/oauth2/token"
//! client_id = "client-123"
//! redirect_uri = "https://localhost:8080"
//! scopes = ["offline_access"]
//!
//! [account.work.auth_uri_fields]
//! login_hint = "me@example.com"
//! ```

use directories::ProjectDirs;
use grantkeeper_core::{Account, AccountRegistry, Persistence};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable overriding the configuration path.
pub const CONFIG_ENV: &str = "GRANTKEEPER_CONFIG";

/// File name of the configuration inside the config directory.
pub const CONFIG_FILE_NAME: &str = "grantkeeper.toml";

/// File name of the control socket.
pub const SOCKET_FILE_NAME: &str = "grantkeeper.sock";

/// Largest accepted `refresh_interval_secs`: one week.
pub const MAX_REFRESH_INTERVAL_SECS: u64 = 7 * 24 * 60 * 60;

/// Largest accepted `expiry_threshold_secs`: one day.
pub const MAX_EXPIRY_THRESHOLD_SECS: u64 = 24 * 60 * 60;

/// Listen values that disable a listener.
const DISABLED_MARKERS: [&str; 4] = ["", "none", "off", "disabled"];

/// Errors raised while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found at {path}; run `grantkeeper init` or create one manually")]
    NotFound { path: PathBuf },

    #[error("failed to read config from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid listen value '{value}' for {field}: expected a port number or \"none\"")]
    InvalidListen { field: &'static str, value: String },

    #[error("account '{account}': {message}")]
    InvalidAccount { account: String, message: String },

    #[error("{field} must be greater than zero")]
    ZeroInterval { field: &'static str },

    #[error("{field} is {value}, the maximum is {max}")]
    OutOfRange {
        field: &'static str,
        value: u64,
        max: u64,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Port of the HTTPS callback listener, or a disabled marker.
    #[serde(default = "default_https_listen")]
    pub https_listen: String,

    /// Port of the plain HTTP callback listener, or a disabled marker.
    #[serde(default = "default_http_listen")]
    pub http_listen: String,

    /// Where tokens are kept.
    #[serde(default)]
    pub persistence: Option<Persistence>,

    /// Older spelling of `persistence = "file"`.
    #[serde(default)]
    pub persist_tokens: bool,

    /// Seconds between background refresh sweeps.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// Tokens expiring within this many seconds are refreshed.
    #[serde(default = "default_expiry_threshold_secs")]
    pub expiry_threshold_secs: u64,

    /// Logging level.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Path to the Unix control socket.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    /// Directory for tokens and certificates.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Configured accounts keyed by name.
    #[serde(default, rename = "account")]
    pub accounts: BTreeMap<String, Account>,

    /// Path to the configuration file that was loaded.
    #[serde(skip)]
    pub config_path: PathBuf,
}

fn default_https_listen() -> String {
    "8080".to_string()
}

fn default_http_listen() -> String {
    "none".to_string()
}

fn default_refresh_interval_secs() -> u64 {
    1800
}

fn default_expiry_threshold_secs() -> u64 {
    600
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            https_listen: default_https_listen(),
            http_listen: default_http_listen(),
            persistence: None,
            persist_tokens: false,
            refresh_interval_secs: default_refresh_interval_secs(),
            expiry_threshold_secs: default_expiry_threshold_secs(),
            log_level: default_log_level(),
            socket_path: None,
            data_dir: None,
            accounts: BTreeMap::new(),
            config_path: PathBuf::new(),
        }
    }
}

impl DaemonConfig {
    /// Parse a configuration document.
    pub fn from_toml(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut config: DaemonConfig =
            toml::from_str(contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.config_path = path.to_path_buf();
        for (name, account) in config.accounts.iter_mut() {
            account.name = name.clone();
        }
        config.validate()?;
        Ok(config)
    }

    /// Check listen values, intervals and every account.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.https_port()?;
        self.http_port()?;

        if self.refresh_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval {
                field: "refresh_interval_secs",
            });
        }
        for (field, value, max) in [
            ("refresh_interval_secs", self.refresh_interval_secs, MAX_REFRESH_INTERVAL_SECS),
            ("expiry_threshold_secs", self.expiry_threshold_secs, MAX_EXPIRY_THRESHOLD_SECS),
        ] {
            if value > max {
                return Err(ConfigError::OutOfRange { field, value, max });
            }
        }

        for (name, account) in &self.accounts {
            let invalid = |message: String| ConfigError::InvalidAccount {
                account: name.clone(),
                message,
            };

            if name.is_empty() || name.chars().any(char::is_whitespace) {
                return Err(invalid("account names cannot be empty or contain whitespace".into()));
            }
            if account.client_id.is_empty() {
                return Err(invalid("client_id is required".into()));
            }
            for (field, value) in [
                ("auth_uri", &account.auth_uri),
                ("token_uri", &account.token_uri),
            ] {
                url::Url::parse(value)
                    .map_err(|e| invalid(format!("{} '{}' is not a valid URL: {}", field, value, e)))?;
            }
            if !account.redirect_uri.is_empty() {
                url::Url::parse(&account.redirect_uri).map_err(|e| {
                    invalid(format!("redirect_uri '{}' is not a valid URL: {}", account.redirect_uri, e))
                })?;
            }
        }

        Ok(())
    }

    /// HTTPS listener port, `None` when disabled.
    pub fn https_port(&self) -> Result<Option<u16>, ConfigError> {
        parse_listen("https_listen", &self.https_listen)
    }

    /// HTTP listener port, `None` when disabled.
    pub fn http_port(&self) -> Result<Option<u16>, ConfigError> {
        parse_listen("http_listen", &self.http_listen)
    }

    /// Effective persistence mode, honouring `persist_tokens`.
    pub fn persistence(&self) -> Persistence {
        match self.persistence {
            Some(mode) => mode,
            None if self.persist_tokens => Persistence::File,
            None => Persistence::Memory,
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.clamp(1, MAX_REFRESH_INTERVAL_SECS))
    }

    pub fn expiry_threshold(&self) -> chrono::Duration {
        let secs = self.expiry_threshold_secs.min(MAX_EXPIRY_THRESHOLD_SECS);
        chrono::Duration::try_seconds(secs as i64).unwrap_or(chrono::Duration::MAX)
    }

    /// Control socket path, explicit or the per-user default.
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(default_socket_path)
    }

    /// Data directory, explicit or the per-user default.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    /// Directory holding the local CA and leaf certificate.
    pub fn cert_dir(&self) -> PathBuf {
        self.data_dir().join("certs")
    }

    /// Immutable registry of the configured accounts.
    pub fn registry(&self) -> AccountRegistry {
        AccountRegistry::new(self.accounts.values().cloned())
    }
}

/// Parse a listen value: a port number, or a disabled marker.
pub fn parse_listen(field: &'static str, value: &str) -> Result<Option<u16>, ConfigError> {
    let trimmed = value.trim();
    if DISABLED_MARKERS
        .iter()
        .any(|marker| trimmed.eq_ignore_ascii_case(marker))
    {
        return Ok(None);
    }
    trimmed
        .parse::<u16>()
        .map(Some)
        .map_err(|_| ConfigError::InvalidListen {
            field,
            value: value.to_string(),
        })
}

/// Load configuration from `path`, or from the default location.
pub fn load_config(path: Option<&Path>) -> Result<DaemonConfig, ConfigError> {
    let config_path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);

    let contents = std::fs::read_to_string(&config_path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ConfigError::NotFound {
                path: config_path.clone(),
            }
        } else {
            ConfigError::Read {
                path: config_path.clone(),
                source,
            }
        }
    })?;

    DaemonConfig::from_toml(&contents, &config_path)
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "grantkeeper", "grantkeeper")
}

/// Default configuration path in the per-user config directory.
pub fn default_config_path() -> PathBuf {
    project_dirs()
        .map(|d| d.config_dir().join(CONFIG_FILE_NAME))
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME))
}

/// Default data directory for tokens and certificates.
pub fn default_data_dir() -> PathBuf {
    project_dirs()
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".grantkeeper"))
}

/// Default control socket path: the runtime directory if there is one,
/// the temp directory otherwise.
pub fn default_socket_path() -> PathBuf {
    project_dirs()
        .and_then(|d| d.runtime_dir().map(Path::to_path_buf))
        .unwrap_or_else(std::env::temp_dir)
        .join(SOCKET_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
https_listen = "8443"
http_listen = "off"
persistence = "file"
refresh_interval_secs = 60

[account.work]
auth_uri = "https://login.example.com/authorize"
token_uri = "https://login.example.com/token"
client_id = "client-123"
scopes = ["offline_access", "mail"]

[account.work.auth_uri_fields]
login_hint = "me@example.com"
"#;

    fn parse(contents: &str) -> Result<DaemonConfig, ConfigError> {
        DaemonConfig::from_toml(contents, Path::new("/tmp/grantkeeper.toml"))
    }

    #[test]
    fn test_parse_sample() {
        let config = parse(SAMPLE).unwrap();

        assert_eq!(config.https_port().unwrap(), Some(8443));
        assert_eq!(config.http_port().unwrap(), None);
        assert_eq!(config.persistence(), Persistence::File);
        assert_eq!(config.refresh_interval(), Duration::from_secs(60));
        assert_eq!(config.expiry_threshold(), chrono::Duration::minutes(10));

        let registry = config.registry();
        let work = registry.get("work").unwrap();
        assert_eq!(work.name, "work");
        assert_eq!(work.auth_uri_fields["login_hint"], "me@example.com");
    }

    #[test]
    fn test_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.https_port().unwrap(), Some(8080));
        assert_eq!(config.http_port().unwrap(), None);
        assert_eq!(config.persistence(), Persistence::Memory);
        assert_eq!(config.log_level, "info");
        assert!(config.accounts.is_empty());
    }

    #[test]
    fn test_legacy_persist_tokens() {
        let config = parse("persist_tokens = true").unwrap();
        assert_eq!(config.persistence(), Persistence::File);

        let explicit = parse("persist_tokens = true\npersistence = \"memory\"").unwrap();
        assert_eq!(explicit.persistence(), Persistence::Memory);
    }

    #[test]
    fn test_interval_bounds() {
        assert!(matches!(
            parse("refresh_interval_secs = 0"),
            Err(ConfigError::ZeroInterval { .. })
        ));
        assert!(matches!(
            parse("refresh_interval_secs = 9223372036854775807"),
            Err(ConfigError::OutOfRange { field: "refresh_interval_secs", .. })
        ));
        assert!(matches!(
            parse("expiry_threshold_secs = 1000000000000000"),
            Err(ConfigError::OutOfRange { field: "expiry_threshold_secs", .. })
        ));

        let config = parse("refresh_interval_secs = 604800\nexpiry_threshold_secs = 86400").unwrap();
        assert_eq!(config.refresh_interval(), Duration::from_secs(604800));
        assert_eq!(config.expiry_threshold(), chrono::Duration::days(1));
    }

    #[test]
    fn test_parse_listen() {
        assert_eq!(parse_listen("f", "8080").unwrap(), Some(8080));
        assert_eq!(parse_listen("f", " 0 ").unwrap(), Some(0));
        for marker in ["", "none", "OFF", "Disabled"] {
            assert_eq!(parse_listen("f", marker).unwrap(), None, "{marker}");
        }
        assert!(parse_listen("f", "http").is_err());
        assert!(parse_listen("f", "70000").is_err());
    }

    #[test]
    fn test_invalid_account_rejected() {
        let result = parse(
            r#"
[account.work]
auth_uri = "not a url"
token_uri = "https://login.example.com/token"
client_id = "client-123"
"#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidAccount { .. })));

        let missing_client = parse(
            r#"
[account.work]
auth_uri = "https://login.example.com/authorize"
token_uri = "https://login.example.com/token"
client_id = ""
"#,
        );
        assert!(matches!(missing_client, Err(ConfigError::InvalidAccount { .. })));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = load_config(Some(&dir.path().join("absent.toml")));
        assert!(matches!(result, Err(ConfigError::NotFound { .. })));
    }

    #[test]
    fn test_explicit_paths() {
        let config = parse(
            "socket_path = \"/tmp/gk/control.sock\"\ndata_dir = \"/tmp/gk/data\"",
        )
        .unwrap();
        assert_eq!(config.socket_path(), PathBuf::from("/tmp/gk/control.sock"));
        assert_eq!(config.cert_dir(), PathBuf::from("/tmp/gk/data/certs"));
    }
}
