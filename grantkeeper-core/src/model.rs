//! Domain model types for grantkeeper.
//!
//! This module defines:
//! - [`Account`] - OAuth2 client configuration for one named account
//! - [`AccountRegistry`] - The immutable set of accounts loaded at startup

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// OAuth2 client configuration for a single account.
///
/// Accounts come from the configuration file and never change while the
/// daemon runs.
///
/// # Example
///
/// ```
/// use grantkeeper_core::Account;
///
/// let account = Account::new("work")
///     .with_auth_uri("https://login.example.com/oauth2/authorize")
///     .with_token_uri("https://login.example.com/oauth2/token")
///     .with_client_id("client-123")
///     .with_scopes(vec!["offline_access".to_string()]);
///
/// assert_eq!(account.name, "work");
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    /// Unique account name, the key used on the control socket.
    #[serde(skip)]
    pub name: String,

    /// Authorization endpoint URL.
    pub auth_uri: String,

    /// Token endpoint URL.
    pub token_uri: String,

    /// OAuth client ID.
    pub client_id: String,

    /// OAuth client secret (empty for public clients).
    #[serde(default)]
    pub client_secret: String,

    /// Redirect URI registered with the provider, pointing back at the daemon.
    #[serde(default)]
    pub redirect_uri: String,

    /// Scopes requested during authorization.
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Extra query parameters added to the authorization request
    /// (for example `login_hint`).
    #[serde(default)]
    pub auth_uri_fields: BTreeMap<String, String>,
}

impl Account {
    /// Create an account with the given name and no endpoints.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the authorization URL.
    pub fn with_auth_uri(mut self, url: impl Into<String>) -> Self {
        self.auth_uri = url.into();
        self
    }

    /// Set the token URL.
    pub fn with_token_uri(mut self, url: impl Into<String>) -> Self {
        self.token_uri = url.into();
        self
    }

    /// Set the client ID.
    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
        self
    }

    /// Set the client secret.
    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = secret.into();
        self
    }

    /// Set the redirect URI.
    pub fn with_redirect_uri(mut self, url: impl Into<String>) -> Self {
        self.redirect_uri = url.into();
        self
    }

    /// Set the requested scopes.
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Add an extra authorization request parameter.
    pub fn with_auth_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.auth_uri_fields.insert(name.into(), value.into());
        self
    }
}

/// Read-only registry of configured accounts.
///
/// Built once from configuration and shared behind an `Arc`; there is no way
/// to mutate it after construction.
#[derive(Debug, Clone, Default)]
pub struct AccountRegistry {
    accounts: HashMap<String, Account>,
}

impl AccountRegistry {
    /// Build a registry from a list of accounts.
    ///
    /// Later entries replace earlier ones with the same name.
    pub fn new(accounts: impl IntoIterator<Item = Account>) -> Self {
        Self {
            accounts: accounts
                .into_iter()
                .map(|account| (account.name.clone(), account))
                .collect(),
        }
    }

    /// Look up an account by name.
    pub fn get(&self, name: &str) -> Option<&Account> {
        self.accounts.get(name)
    }

    /// Check whether an account is configured.
    pub fn contains(&self, name: &str) -> bool {
        self.accounts.contains_key(name)
    }

    /// Account names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.accounts.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}
