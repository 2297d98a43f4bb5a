//! Token custody abstraction.
//!
//! This module provides:
//! - [`Secret`] - A wrapper for sensitive values that prevents accidental logging
//! - [`TokenStore`] - Trait for token storage backends
//! - [`MemoryStore`] - Process-lifetime storage
//! - [`FileStore`] - Owner-only JSON file on disk
//! - [`KeyringStore`] - OS keyring holding refresh tokens only (with `keyring-store` feature)
//! - [`SplitStore`] - Access tokens in memory, refresh tokens in a durable backend
//! - [`create_store`] - Helper to select a backend from the configured [`Persistence`]
//!
//! Every backend is keyed by account name and holds at most one token per
//! account; the last `set` wins.
//!
//! # Example
//!
//! ```rust,ignore
//! use grantkeeper_core::store::{MemoryStore, TokenStore};
//! use grantkeeper_core::Token;
//!
//! let store = MemoryStore::new();
//! store.set("work", &Token::new("access").with_refresh_token("refresh")).await?;
//!
//! let token = store.get("work").await?;
//! assert_eq!(token.access_token.expose(), "access");
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::token::Token;

mod file;
#[cfg(feature = "keyring-store")]
mod keyring;
mod memory;
mod split;

pub use file::FileStore;
#[cfg(feature = "keyring-store")]
pub use self::keyring::{Keychain, KeyringStore, OsKeychain};
pub use memory::MemoryStore;
pub use split::SplitStore;

/// File name of the token document inside the data directory.
pub const TOKEN_FILE_NAME: &str = "tokens.json";

/// A secret value that prevents accidental exposure in logs.
///
/// The inner value is only accessible via [`expose()`](Secret::expose).
/// Debug and Display implementations show `[REDACTED]` instead of the value,
/// and the memory is wiped when the secret is dropped.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    /// Create a new secret from a string value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the secret value.
    ///
    /// Use sparingly and never log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Consume the secret and return the inner value.
    pub fn into_inner(mut self) -> String {
        std::mem::take(&mut self.0)
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret([REDACTED])")
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Secret {}

/// Error type for token store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No token is stored for the account.
    #[error("token for '{account}' not found")]
    NotFound { account: String },

    /// The storage backend encountered an error.
    #[error("backend error: {message}")]
    BackendError { message: String },

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Reading or writing the token file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The keyring backend is not available.
    #[error("keyring not available: {message}")]
    KeyringUnavailable { message: String },
}

impl StoreError {
    pub(crate) fn not_found(account: &str) -> Self {
        StoreError::NotFound {
            account: account.to_string(),
        }
    }

    /// Whether this error only reports a missing token.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Abstraction over token custody backends.
///
/// Implementations must be safe to call concurrently from the control socket
/// handlers, the HTTP callback and the sweep. Each call is atomic on its own;
/// a `get` followed by a `set` is not.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Retrieve the token for an account.
    ///
    /// Returns [`StoreError::NotFound`] if nothing is stored.
    async fn get(&self, account: &str) -> Result<Token, StoreError>;

    /// Store the token for an account, replacing any previous one.
    async fn set(&self, account: &str, token: &Token) -> Result<(), StoreError>;

    /// Delete the token for an account.
    ///
    /// Returns [`StoreError::NotFound`] if nothing was stored; the store is
    /// left unchanged in that case.
    async fn delete(&self, account: &str) -> Result<(), StoreError>;

    /// Names of all accounts holding a token.
    async fn list_accounts(&self) -> Result<BTreeSet<String>, StoreError>;
}

#[async_trait]
impl<S: TokenStore + ?Sized> TokenStore for Arc<S> {
    async fn get(&self, account: &str) -> Result<Token, StoreError> {
        (**self).get(account).await
    }

    async fn set(&self, account: &str, token: &Token) -> Result<(), StoreError> {
        (**self).set(account, token).await
    }

    async fn delete(&self, account: &str) -> Result<(), StoreError> {
        (**self).delete(account).await
    }

    async fn list_accounts(&self) -> Result<BTreeSet<String>, StoreError> {
        (**self).list_accounts().await
    }
}

/// Where tokens are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Persistence {
    /// Tokens live only as long as the daemon process.
    #[default]
    Memory,
    /// Tokens are written to an owner-only JSON file.
    File,
    /// Refresh tokens go to the OS keyring, access tokens stay in memory.
    Keyring,
}

/// Create a token store for the configured persistence mode.
///
/// # Backend Selection Logic
///
/// - [`Persistence::Memory`]: a [`MemoryStore`]
/// - [`Persistence::File`]: a [`FileStore`] at `data_dir/tokens.json`
/// - [`Persistence::Keyring`]: a [`SplitStore`] over a [`KeyringStore`],
///   falling back to a [`SplitStore`] over a [`FileStore`] with a warning if
///   the keyring is unavailable or the `keyring-store` feature is disabled
pub fn create_store(persistence: Persistence, data_dir: &Path) -> Arc<dyn TokenStore> {
    let token_file = data_dir.join(TOKEN_FILE_NAME);

    match persistence {
        Persistence::Memory => {
            tracing::info!("Using in-memory token storage; tokens will not survive a restart");
            Arc::new(MemoryStore::new())
        }
        Persistence::File => {
            tracing::info!(path = %token_file.display(), "Using file token storage");
            Arc::new(FileStore::new(token_file))
        }
        Persistence::Keyring => {
            #[cfg(feature = "keyring-store")]
            {
                let keyring = KeyringStore::new(self::keyring::DEFAULT_SERVICE);
                if keyring.is_available() {
                    tracing::info!("Using OS keyring for refresh tokens");
                    return Arc::new(SplitStore::new(Arc::new(keyring)));
                }
                tracing::warn!(
                    path = %token_file.display(),
                    "Keyring unavailable, keeping refresh tokens in the token file instead"
                );
            }

            #[cfg(not(feature = "keyring-store"))]
            tracing::warn!(
                path = %token_file.display(),
                "Keyring storage requested but keyring-store feature not enabled; \
                 keeping refresh tokens in the token file instead"
            );

            Arc::new(SplitStore::new(Arc::new(FileStore::new(token_file))))
        }
    }
}
