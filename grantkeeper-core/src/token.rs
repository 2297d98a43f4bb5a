//! OAuth2 token custody records.
//!
//! This module provides:
//! - [`Token`] - The access/refresh token pair held for one account
//! - [`Freshness`] - Lifecycle state of an account's token at a point in time
//! - [`TokenError`] - Errors raised by the token lifecycle

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::oauth::ExchangeError;
use crate::store::{Secret, StoreError};

/// Error type for token lifecycle operations.
#[derive(Debug, Error)]
pub enum TokenError {
    /// No token is stored for the account.
    #[error("no token stored for '{account}'")]
    NotFound { account: String },

    /// The account is not in the configuration.
    #[error("account '{account}' is not configured")]
    UnknownAccount { account: String },

    /// The token cannot be refreshed and the user must authorize again.
    #[error("token for '{account}' has expired and has no refresh token")]
    ReauthRequired { account: String },

    /// A refresh was attempted and failed; the stored token was discarded.
    #[error("token refresh for '{account}' failed: {message}")]
    RefreshFailed { account: String, message: String },

    /// Authorization code exchange failed.
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    /// Storage error during token operations.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

/// The token pair held for one account.
///
/// A token without a refresh token is terminal: once it expires the only way
/// forward is a fresh authorization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Token {
    /// The bearer access token.
    pub access_token: Secret,

    /// The refresh token, if the provider issued one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<Secret>,

    /// When the access token expires (None if the provider did not say).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Token type (usually "Bearer").
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl Token {
    /// Create a token with only an access token.
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: Secret::new(access_token),
            refresh_token: None,
            expires_at: None,
            token_type: default_token_type(),
        }
    }

    /// Attach a refresh token. An empty string leaves the token without one.
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        let refresh_token = refresh_token.into();
        self.refresh_token = if refresh_token.is_empty() {
            None
        } else {
            Some(Secret::new(refresh_token))
        };
        self
    }

    /// Set the absolute expiry.
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Set the token type.
    pub fn with_token_type(mut self, token_type: impl Into<String>) -> Self {
        self.token_type = token_type.into();
        self
    }

    /// The refresh token, treating an empty value as absent.
    pub fn refresh_secret(&self) -> Option<&Secret> {
        self.refresh_token
            .as_ref()
            .filter(|secret| !secret.expose().is_empty())
    }

    /// Whether a refresh exchange may be attempted for this token.
    pub fn is_refreshable(&self) -> bool {
        self.refresh_secret().is_some()
    }

    /// Check if this token has expired at `now`.
    ///
    /// An empty access token counts as expired, which is what a split store
    /// returns after a restart when only the refresh half survived.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        if self.access_token.expose().is_empty() {
            return true;
        }
        self.expires_at.map(|exp| exp <= now).unwrap_or(false)
    }

    /// Check if this token will expire within `window` of `now`.
    pub fn expires_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        if self.access_token.expose().is_empty() {
            return true;
        }
        // A window reaching past the end of time covers every expiry.
        self.expires_at
            .map(|exp| now.checked_add_signed(window).is_none_or(|limit| exp <= limit))
            .unwrap_or(false)
    }

    /// Evaluate the lifecycle state of this token.
    pub fn freshness_at(&self, now: DateTime<Utc>, threshold: Duration) -> Freshness {
        let refreshable = self.is_refreshable();
        if self.is_expired_at(now) {
            Freshness::Expired { refreshable }
        } else if self.expires_within(now, threshold) {
            Freshness::ExpiringSoon { refreshable }
        } else {
            Freshness::Valid
        }
    }
}

/// Lifecycle state of an account's token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Nothing stored; the account has never been authorized (or was reset).
    Missing,

    /// Usable and outside the refresh threshold.
    Valid,

    /// Still usable but inside the refresh threshold.
    ExpiringSoon { refreshable: bool },

    /// Past expiry. Without a refresh token this is a dead end.
    Expired { refreshable: bool },
}

impl Freshness {
    /// Evaluate an optional token.
    pub fn of(token: Option<&Token>, now: DateTime<Utc>, threshold: Duration) -> Self {
        match token {
            Some(token) => token.freshness_at(now, threshold),
            None => Freshness::Missing,
        }
    }

    /// Whether the access token can be handed out as-is.
    pub fn is_usable(&self) -> bool {
        matches!(self, Freshness::Valid | Freshness::ExpiringSoon { .. })
    }

    /// Whether a refresh should be attempted.
    pub fn needs_refresh(&self) -> bool {
        matches!(
            self,
            Freshness::ExpiringSoon { refreshable: true } | Freshness::Expired { refreshable: true }
        )
    }

    /// Whether only a new authorization can recover the account.
    pub fn is_dead(&self) -> bool {
        matches!(self, Freshness::Expired { refreshable: false })
    }
}
