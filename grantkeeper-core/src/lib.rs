//! # Grantkeeper Core
//!
//! Core library for the grantkeeper OAuth2 token custody daemon.
//!
//! This crate provides:
//! - Domain types for configured accounts and the tokens held for them
//! - The [`TokenStore`] trait with memory, file, keyring and split backends
//! - The OAuth2 authorization-code and refresh engine
//! - [`TokenManager`], the token lifecycle coordinator
//! - A local certificate authority for the HTTPS callback listener
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use grantkeeper_core::TokenManager;
//!
//! async fn get_token(manager: &TokenManager) -> Result<String, grantkeeper_core::TokenError> {
//!     let token = manager.ensure_access_token("work").await?;
//!     Ok(token.access_token.expose().to_string())
//! }
//! ```

pub mod certs;
pub mod model;
pub mod notify;
pub mod oauth;
pub mod persist;
pub mod store;
pub mod token;
pub mod token_manager;

// Re-export commonly used types at crate root
pub use model::{Account, AccountRegistry};

pub use store::{
    create_store, FileStore, MemoryStore, Persistence, Secret, SplitStore, StoreError,
    TokenStore,
};

#[cfg(feature = "keyring-store")]
pub use store::KeyringStore;

pub use token::{Freshness, Token, TokenError};

pub use oauth::{ExchangeError, OAuthEngine};

pub use token_manager::{SweepReport, TokenManager};

pub use notify::{Notifier, TracingNotifier};

pub use certs::{CertAuthority, CertError, LeafMaterial};
