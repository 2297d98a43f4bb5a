//! Control-socket commands.
//!
//! One command per line, whitespace-separated. Every command produces
//! exactly one response block; failures start with `ERROR: `.

use grantkeeper_core::TokenError;
use std::fmt;

use crate::state::DaemonState;

/// Prefix of every failed response.
pub const ERROR_PREFIX: &str = "ERROR: ";

/// A parsed control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Accounts,
    Status,
    Info,
    GetToken { account: String },
    DeleteToken { account: String },
    RefreshToken { account: String },
}

/// Why a line is not a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    InvalidArguments { usage: &'static str },
    Unknown(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Empty => write!(f, "No command provided"),
            ParseError::InvalidArguments { usage } => {
                write!(f, "Invalid arguments. Usage: {}", usage)
            }
            ParseError::Unknown(cmd) => write!(f, "Unknown command '{}'", cmd),
        }
    }
}

impl Command {
    /// Parse one request line.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some((&cmd, args)) = parts.split_first() else {
            return Err(ParseError::Empty);
        };

        let account = |usage: &'static str| match args {
            [account] => Ok(account.to_string()),
            _ => Err(ParseError::InvalidArguments { usage }),
        };

        match cmd {
            "accounts" => Ok(Command::Accounts),
            "status" => Ok(Command::Status),
            "info" => Ok(Command::Info),
            "get-token" => Ok(Command::GetToken {
                account: account("get-token <account_name>")?,
            }),
            "delete-token" => Ok(Command::DeleteToken {
                account: account("delete-token <account_name>")?,
            }),
            "refresh-token" => Ok(Command::RefreshToken {
                account: account("refresh-token <account_name>")?,
            }),
            other => Err(ParseError::Unknown(other.to_string())),
        }
    }
}

/// Result of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok(String),
    Error(String),
}

impl Response {
    /// Wire form, terminated by a newline.
    pub fn render(&self) -> String {
        match self {
            Response::Ok(body) => format!("{}\n", body),
            Response::Error(message) => format!("{}{}\n", ERROR_PREFIX, message),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error(_))
    }
}

/// Parse and execute one request line.
pub async fn handle_line(state: &DaemonState, line: &str) -> Response {
    match Command::parse(line) {
        Ok(command) => execute(state, command).await,
        Err(e) => Response::Error(e.to_string()),
    }
}

/// Execute a parsed command.
pub async fn execute(state: &DaemonState, command: Command) -> Response {
    match command {
        Command::Accounts => accounts(state),
        Command::Status => status(state).await,
        Command::Info => info(state),
        Command::GetToken { account } => get_token(state, &account).await,
        Command::DeleteToken { account } => delete_token(state, &account).await,
        Command::RefreshToken { account } => refresh_token(state, &account).await,
    }
}

fn accounts(state: &DaemonState) -> Response {
    let registry = state.manager.accounts();
    if registry.is_empty() {
        return Response::Ok("No accounts configured.".to_string());
    }
    Response::Ok(registry.names().join("\n"))
}

async fn status(state: &DaemonState) -> Response {
    let mut lines = Vec::new();
    for name in state.manager.accounts().names() {
        let usable = state
            .manager
            .status(name)
            .await
            .map(|freshness| freshness.is_usable())
            .unwrap_or(false);
        if usable {
            lines.push(format!("{}: token valid", name));
        } else {
            lines.push(format!("{}: token missing or expired", name));
        }
    }
    if lines.is_empty() {
        return Response::Ok("No accounts configured.".to_string());
    }
    Response::Ok(lines.join("\n"))
}

fn info(state: &DaemonState) -> Response {
    let info = &state.info;
    let port = |port: Option<u16>| port.map_or_else(|| "disabled".to_string(), |p| p.to_string());

    Response::Ok(format!(
        "Data directory: {}\nConfig file: {}\nControl socket: {}\nServer running on:\n  HTTP Port: {}\n  HTTPS Port: {}\nHTTPS public key: {}",
        info.data_dir.display(),
        info.config_path.display(),
        info.socket_path.display(),
        port(info.http_port),
        port(info.https_port),
        info.fingerprint.as_deref().unwrap_or("none"),
    ))
}

async fn get_token(state: &DaemonState, account: &str) -> Response {
    match state.manager.ensure_access_token(account).await {
        Ok(token) => Response::Ok(token.access_token.expose().to_string()),
        Err(e @ TokenError::UnknownAccount { .. }) => Response::Error(capitalize(&e.to_string())),
        Err(e @ TokenError::RefreshFailed { .. }) => Response::Error(format!(
            "Failed to auto refresh token for '{}': {}. Please authenticate. Go to: {}",
            account,
            e,
            state.info.auth_link(account)
        )),
        Err(e) => Response::Error(format!(
            "Could not retrieve token for '{}': {}. Please authenticate. Go to: {}",
            account,
            e,
            state.info.auth_link(account)
        )),
    }
}

async fn delete_token(state: &DaemonState, account: &str) -> Response {
    match state.manager.delete(account).await {
        Ok(()) => Response::Ok(format!("Token for '{}' deleted", account)),
        Err(e) => Response::Error(format!("Could not delete token for '{}': {}", account, e)),
    }
}

async fn refresh_token(state: &DaemonState, account: &str) -> Response {
    match state.manager.force_refresh(account).await {
        Ok(_) => Response::Ok(format!("Token for '{}' refreshed", account)),
        Err(TokenError::NotFound { .. } | TokenError::ReauthRequired { .. }) => {
            Response::Error(format!(
                "No refresh token available for '{}'. Please authenticate at: {}",
                account,
                state.info.auth_link(account)
            ))
        }
        Err(e @ TokenError::UnknownAccount { .. }) => Response::Error(capitalize(&e.to_string())),
        Err(e) => Response::Error(format!("Failed to refresh token for '{}': {}", account, e)),
    }
}

fn capitalize(message: &str) -> String {
    let mut chars = message.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("accounts"), Ok(Command::Accounts));
        assert_eq!(Command::parse("  status \r"), Ok(Command::Status));
        assert_eq!(
            Command::parse("get-token work"),
            Ok(Command::GetToken {
                account: "work".to_string()
            })
        );
        assert_eq!(
            Command::parse("refresh-token\twork"),
            Ok(Command::RefreshToken {
                account: "work".to_string()
            })
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Command::parse("   "), Err(ParseError::Empty));
        assert_eq!(
            Command::parse("get-token").unwrap_err().to_string(),
            "Invalid arguments. Usage: get-token <account_name>"
        );
        assert_eq!(
            Command::parse("delete-token a b").unwrap_err().to_string(),
            "Invalid arguments. Usage: delete-token <account_name>"
        );
        assert_eq!(
            Command::parse("frobnicate now").unwrap_err().to_string(),
            "Unknown command 'frobnicate'"
        );
    }

    #[test]
    fn test_render() {
        assert_eq!(Response::Ok("abc".into()).render(), "abc\n");
        assert_eq!(
            Response::Error("No command provided".into()).render(),
            "ERROR: No command provided\n"
        );
    }

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("account 'x' is not configured"), "Account 'x' is not configured");
        assert_eq!(capitalize(""), "");
    }
}
