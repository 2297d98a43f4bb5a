//! OAuth 2.0 authorization-code and refresh exchanges.
//!
//! [`OAuthEngine`] builds authorization URLs and performs the token endpoint
//! exchanges for configured accounts, using the `oauth2` crate's
//! [`BasicClient`] over a [`reqwest::Client`] supplied by the caller (see
//! [`transport`]).
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use grantkeeper_core::model::{Account, AccountRegistry};
//! use grantkeeper_core::oauth::OAuthEngine;
//!
//! let account = Account::new("work")
//!     .with_auth_uri("https://provider.example/authorize")
//!     .with_token_uri("https://provider.example/token")
//!     .with_client_id("client-id");
//! let engine = OAuthEngine::new(Arc::new(AccountRegistry::new([account])));
//!
//! println!("Visit: {}", engine.authorize_url("work")?);
//!
//! // After the provider redirects back with a code...
//! let token = engine.exchange_code("work", "authorization-code").await?;
//! # Ok(())
//! # }
//! ```

pub mod transport;

use chrono::Utc;
use oauth2::basic::{BasicClient, BasicErrorResponse, BasicTokenResponse, BasicTokenType};
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, RedirectUrl, RefreshToken,
    RequestTokenError, Scope, TokenResponse, TokenUrl,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::model::{Account, AccountRegistry};
use crate::token::Token;

/// Prefix of the `state` parameter; the account name follows it.
pub const STATE_PREFIX: &str = "account:";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Error type for token endpoint exchanges.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The token endpoint could not be reached or rejected the request.
    #[error("token exchange for '{account}' failed: {message}")]
    Exchange { account: String, message: String },

    /// The account is not in the configuration.
    #[error("account '{account}' is not configured")]
    UnknownAccount { account: String },

    /// A refresh was requested for a token without a refresh token.
    #[error("no refresh token available for '{account}'")]
    MissingRefreshToken { account: String },
}

impl ExchangeError {
    fn exchange(account: &str, message: impl Into<String>) -> Self {
        ExchangeError::Exchange {
            account: account.to_string(),
            message: message.into(),
        }
    }
}

/// Build the `state` value identifying `account`.
pub fn state_for(account: &str) -> String {
    format!("{}{}", STATE_PREFIX, account)
}

/// Extract the account name from a `state` value.
///
/// Returns `None` if the prefix is missing.
pub fn account_from_state(state: &str) -> Option<&str> {
    state.strip_prefix(STATE_PREFIX)
}

/// HTTP client used when the caller does not supply one.
///
/// Redirects are not followed; a token endpoint answering with a redirect is
/// an error, not something to chase.
pub fn default_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_default()
}

/// Like [`default_http_client`], additionally trusting the PEM root `ca_pem`.
pub fn http_client_trusting(ca_pem: &[u8]) -> Result<reqwest::Client, reqwest::Error> {
    let root = reqwest::Certificate::from_pem(ca_pem)?;
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(HTTP_TIMEOUT)
        .add_root_certificate(root)
        .build()
}

/// Create an OAuth2 client for a configured account.
pub fn create_oauth_client(account: &Account) -> Result<BasicClient, ExchangeError> {
    let auth_url = AuthUrl::new(account.auth_uri.clone())
        .map_err(|e| ExchangeError::exchange(&account.name, format!("invalid auth URL: {}", e)))?;

    let token_url = TokenUrl::new(account.token_uri.clone())
        .map_err(|e| ExchangeError::exchange(&account.name, format!("invalid token URL: {}", e)))?;

    let client_secret = if account.client_secret.is_empty() {
        None
    } else {
        Some(ClientSecret::new(account.client_secret.clone()))
    };

    let mut client = BasicClient::new(
        ClientId::new(account.client_id.clone()),
        client_secret,
        auth_url,
        Some(token_url),
    );

    if !account.redirect_uri.is_empty() {
        let redirect_url = RedirectUrl::new(account.redirect_uri.clone()).map_err(|e| {
            ExchangeError::exchange(&account.name, format!("invalid redirect URL: {}", e))
        })?;
        client = client.set_redirect_uri(redirect_url);
    }

    Ok(client)
}

/// Performs authorization-code and refresh exchanges for configured accounts.
#[derive(Clone)]
pub struct OAuthEngine {
    accounts: Arc<AccountRegistry>,
    http: reqwest::Client,
}

impl OAuthEngine {
    /// Create an engine over the configured accounts.
    pub fn new(accounts: Arc<AccountRegistry>) -> Self {
        Self {
            accounts,
            http: default_http_client(),
        }
    }

    /// Use `http` for every token endpoint request.
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// The configured accounts.
    pub fn accounts(&self) -> &Arc<AccountRegistry> {
        &self.accounts
    }

    fn account(&self, name: &str) -> Result<&Account, ExchangeError> {
        self.accounts
            .get(name)
            .ok_or_else(|| ExchangeError::UnknownAccount {
                account: name.to_string(),
            })
    }

    /// Build the authorization URL the user visits to grant access.
    ///
    /// The URL carries `state=account:<name>`, the configured scopes,
    /// `access_type=offline` and every extra authorization field of the
    /// account (for example `login_hint`).
    pub fn authorize_url(&self, account: &str) -> Result<Url, ExchangeError> {
        let config = self.account(account)?;
        let client = create_oauth_client(config)?;

        let state = state_for(account);
        let mut request = client
            .authorize_url(|| CsrfToken::new(state))
            .add_scopes(config.scopes.iter().cloned().map(Scope::new))
            .add_extra_param("access_type", "offline");

        for (key, value) in &config.auth_uri_fields {
            request = request.add_extra_param(key.as_str(), value.as_str());
        }

        let (url, _state) = request.url();
        Ok(url)
    }

    /// Exchange an authorization code for a token.
    pub async fn exchange_code(&self, account: &str, code: &str) -> Result<Token, ExchangeError> {
        let config = self.account(account)?;
        let client = create_oauth_client(config)?;

        let response = client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(|request| transport::execute(&self.http, request))
            .await
            .map_err(|e| ExchangeError::exchange(account, describe_error(e)))?;

        tracing::debug!(account, "Authorization code exchanged");
        Ok(token_from_response(&response, None))
    }

    /// Obtain a new access token using the refresh token of `old`.
    ///
    /// If the provider does not rotate the refresh token, the old one is
    /// carried over into the returned token.
    pub async fn refresh(&self, account: &str, old: &Token) -> Result<Token, ExchangeError> {
        let config = self.account(account)?;
        let refresh_token =
            old.refresh_secret()
                .ok_or_else(|| ExchangeError::MissingRefreshToken {
                    account: account.to_string(),
                })?;
        let client = create_oauth_client(config)?;

        let response = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.expose().to_string()))
            .request_async(|request| transport::execute(&self.http, request))
            .await
            .map_err(|e| ExchangeError::exchange(account, describe_error(e)))?;

        tracing::debug!(account, "Refresh token exchanged");
        Ok(token_from_response(&response, Some(refresh_token.expose())))
    }
}

impl std::fmt::Debug for OAuthEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthEngine")
            .field("accounts", &self.accounts.names())
            .finish_non_exhaustive()
    }
}

fn token_from_response(response: &BasicTokenResponse, previous_refresh: Option<&str>) -> Token {
    let mut token = Token::new(response.access_token().secret().as_str())
        .with_token_type(token_type_name(response.token_type()));

    if let Some(expires_at) = response
        .expires_in()
        .and_then(|d| chrono::Duration::from_std(d).ok())
        .and_then(|d| Utc::now().checked_add_signed(d))
    {
        token = token.with_expiry(expires_at);
    }

    match (response.refresh_token(), previous_refresh) {
        (Some(refresh), _) => token.with_refresh_token(refresh.secret().as_str()),
        (None, Some(previous)) => token.with_refresh_token(previous),
        (None, None) => token,
    }
}

fn token_type_name(token_type: &BasicTokenType) -> String {
    match token_type {
        BasicTokenType::Bearer => "Bearer".to_string(),
        BasicTokenType::Mac => "MAC".to_string(),
        BasicTokenType::Extension(other) => other.clone(),
    }
}

fn describe_error(
    error: RequestTokenError<transport::TransportError, BasicErrorResponse>,
) -> String {
    match error {
        RequestTokenError::ServerResponse(response) => response.to_string(),
        RequestTokenError::Request(e) => e.to_string(),
        RequestTokenError::Parse(e, _) => format!("unparseable token response: {}", e),
        RequestTokenError::Other(message) => message,
    }
}
