//! Token lifecycle coordinator.
//!
//! [`TokenManager`] decides, per account, whether the stored token can be
//! handed out, must be refreshed, or needs a new authorization. It is driven
//! from two places:
//!
//! - the on-demand path ([`TokenManager::ensure_access_token`]), when a
//!   caller asks for a token over the control socket
//! - the eager path ([`TokenManager::sweep`]), run periodically by the daemon
//!
//! # Refresh serialization
//!
//! Both paths take a per-account async mutex before refreshing, then re-read
//! and re-evaluate the token. If the other path refreshed in the meantime,
//! its result is reused and no second exchange is made.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use grantkeeper_core::{
//!     model::AccountRegistry, notify::TracingNotifier, oauth::OAuthEngine,
//!     store::MemoryStore, token_manager::TokenManager,
//! };
//!
//! let accounts = Arc::new(AccountRegistry::new([]));
//! let manager = TokenManager::new(
//!     Arc::new(MemoryStore::new()),
//!     OAuthEngine::new(accounts),
//!     Arc::new(TracingNotifier),
//! );
//!
//! let token = manager.ensure_access_token("work").await?;
//! println!("Access token: {}", token.access_token.expose());
//! # Ok(())
//! # }
//! ```

use chrono::{Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    model::AccountRegistry,
    notify::Notifier,
    oauth::OAuthEngine,
    store::{StoreError, TokenStore},
    token::{Freshness, Token, TokenError},
};

/// Default refresh threshold in seconds.
///
/// Tokens expiring within this window are refreshed ahead of time.
pub const DEFAULT_EXPIRY_THRESHOLD_SECS: i64 = 600;

/// Outcome counts of one [`TokenManager::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Tokens refreshed by this sweep.
    pub refreshed: usize,
    /// Refresh attempts that failed.
    pub failed: usize,
    /// Expired tokens that cannot be refreshed.
    pub expired: usize,
}

/// Who asked for a refresh; decides skip and failure handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    OnDemand,
    Sweep,
    Forced,
}

impl Trigger {
    /// A failed refresh discards the stored token, except during a sweep.
    fn deletes_on_failure(self) -> bool {
        !matches!(self, Trigger::Sweep)
    }
}

enum Refreshed {
    New(Token),
    Current(Token),
}

/// Coordinates token freshness, refresh and persistence per account.
pub struct TokenManager {
    store: Arc<dyn TokenStore>,
    engine: OAuthEngine,
    notifier: Arc<dyn Notifier>,
    threshold: Duration,
    refresh_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TokenManager {
    /// Create a manager with the default 10-minute threshold.
    pub fn new(
        store: Arc<dyn TokenStore>,
        engine: OAuthEngine,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            engine,
            notifier,
            threshold: Duration::seconds(DEFAULT_EXPIRY_THRESHOLD_SECS),
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Refresh tokens that expire within `threshold`.
    pub fn with_threshold(mut self, threshold: Duration) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    pub fn engine(&self) -> &OAuthEngine {
        &self.engine
    }

    pub fn accounts(&self) -> &Arc<AccountRegistry> {
        self.engine.accounts()
    }

    fn refresh_lock(&self, account: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.refresh_locks
            .lock()
            .entry(account.to_string())
            .or_default()
            .clone()
    }

    fn require_configured(&self, account: &str) -> Result<(), TokenError> {
        if self.accounts().contains(account) {
            Ok(())
        } else {
            Err(TokenError::UnknownAccount {
                account: account.to_string(),
            })
        }
    }

    async fn load(&self, account: &str) -> Result<Option<Token>, TokenError> {
        match self.store.get(account).await {
            Ok(token) => Ok(Some(token)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn freshness(&self, token: Option<&Token>) -> Freshness {
        Freshness::of(token, Utc::now(), self.threshold)
    }

    /// Lifecycle state of the stored token for `account`.
    pub async fn status(&self, account: &str) -> Result<Freshness, TokenError> {
        let token = self.load(account).await?;
        Ok(self.freshness(token.as_ref()))
    }

    /// Return a usable access token for `account`, refreshing if needed.
    ///
    /// - valid, or expiring without a refresh token: returned as stored
    /// - expiring or expired with a refresh token: refreshed, persisted and
    ///   returned; on failure the stored token is deleted and
    ///   [`TokenError::RefreshFailed`] is returned
    /// - expired without a refresh token: [`TokenError::ReauthRequired`],
    ///   and the stored token is left alone
    /// - nothing stored: [`TokenError::NotFound`]
    pub async fn ensure_access_token(&self, account: &str) -> Result<Token, TokenError> {
        self.require_configured(account)?;

        let token = self.load(account).await?;
        match self.freshness(token.as_ref()) {
            Freshness::Missing => Err(TokenError::NotFound {
                account: account.to_string(),
            }),
            Freshness::Expired { refreshable: false } => {
                tracing::warn!(account, "Token expired and cannot be refreshed");
                Err(TokenError::ReauthRequired {
                    account: account.to_string(),
                })
            }
            freshness if freshness.needs_refresh() => {
                match self.refresh_serialized(account, Trigger::OnDemand).await? {
                    Refreshed::New(token) | Refreshed::Current(token) => Ok(token),
                }
            }
            _ => {
                tracing::debug!(account, "Using cached access token");
                token.ok_or_else(|| TokenError::NotFound {
                    account: account.to_string(),
                })
            }
        }
    }

    /// Refresh the token for `account` regardless of its expiry.
    ///
    /// A token without a refresh token raises a notification and returns
    /// [`TokenError::ReauthRequired`]. A failed refresh deletes the token.
    pub async fn force_refresh(&self, account: &str) -> Result<Token, TokenError> {
        self.require_configured(account)?;

        match self.refresh_serialized(account, Trigger::Forced).await? {
            Refreshed::New(token) | Refreshed::Current(token) => Ok(token),
        }
    }

    /// Refresh every configured account whose token is inside the threshold.
    ///
    /// Failures are logged and notified but the stored token is kept, so a
    /// later on-demand request can still try. Expired tokens without a
    /// refresh token are reported and left alone.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for account in self.accounts().names() {
            let token = match self.load(account).await {
                Ok(Some(token)) => token,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(account, error = %e, "Failed to read token during sweep");
                    continue;
                }
            };

            let freshness = self.freshness(Some(&token));
            if freshness.needs_refresh() {
                match self.refresh_serialized(account, Trigger::Sweep).await {
                    Ok(Refreshed::New(_)) => report.refreshed += 1,
                    Ok(Refreshed::Current(_)) => {}
                    Err(_) => report.failed += 1,
                }
            } else if freshness.is_dead() {
                report.expired += 1;
                tracing::warn!(account, "Token has expired; authorize the account again");
                self.notifier.notify(
                    "grantkeeper - token expired",
                    &format!(
                        "Token for {} has expired and must be authorized again.",
                        account
                    ),
                );
            }
        }

        tracing::debug!(
            refreshed = report.refreshed,
            failed = report.failed,
            expired = report.expired,
            "Sweep finished"
        );
        report
    }

    /// Persist a token obtained from an authorization-code exchange.
    pub async fn store_authorized(&self, account: &str, token: &Token) -> Result<(), TokenError> {
        self.store.set(account, token).await?;
        tracing::info!(account, expires_at = ?token.expires_at, "Stored authorized token");
        Ok(())
    }

    /// Delete the stored token for `account`.
    pub async fn delete(&self, account: &str) -> Result<(), TokenError> {
        self.store
            .delete(account)
            .await
            .map_err(|e| token_error(account, e))?;
        tracing::info!(account, "Deleted token");
        Ok(())
    }

    async fn refresh_serialized(
        &self,
        account: &str,
        trigger: Trigger,
    ) -> Result<Refreshed, TokenError> {
        let lock = self.refresh_lock(account);
        let _guard = lock.lock().await;

        // Re-read under the lock; the other path may have refreshed already.
        let token = self
            .load(account)
            .await?
            .ok_or_else(|| TokenError::NotFound {
                account: account.to_string(),
            })?;

        let freshness = self.freshness(Some(&token));
        if trigger != Trigger::Forced && !freshness.needs_refresh() {
            if freshness.is_dead() {
                return Err(TokenError::ReauthRequired {
                    account: account.to_string(),
                });
            }
            tracing::debug!(account, "Token was refreshed concurrently");
            return Ok(Refreshed::Current(token));
        }

        if !token.is_refreshable() {
            tracing::warn!(account, "No refresh token available");
            self.notifier.notify(
                "grantkeeper - refresh failed",
                &format!(
                    "Token for {} has no refresh token; authorize the account again.",
                    account
                ),
            );
            return Err(TokenError::ReauthRequired {
                account: account.to_string(),
            });
        }

        match self.engine.refresh(account, &token).await {
            Ok(refreshed) => {
                self.store.set(account, &refreshed).await?;
                tracing::info!(account, expires_at = ?refreshed.expires_at, "Token refreshed");
                self.notifier.notify(
                    "grantkeeper - token refreshed",
                    &format!("Token for {} was refreshed.", account),
                );
                Ok(Refreshed::New(refreshed))
            }
            Err(e) => {
                tracing::error!(account, error = %e, "Token refresh failed");
                if trigger.deletes_on_failure() {
                    if let Err(delete_err) = self.store.delete(account).await {
                        if !delete_err.is_not_found() {
                            tracing::warn!(account, error = %delete_err, "Failed to discard token");
                        }
                    }
                }
                self.notifier.notify(
                    "grantkeeper - refresh failed",
                    &format!("Token for {} could not be refreshed.", account),
                );
                Err(TokenError::RefreshFailed {
                    account: account.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("engine", &self.engine)
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

fn token_error(account: &str, error: StoreError) -> TokenError {
    if error.is_not_found() {
        TokenError::NotFound {
            account: account.to_string(),
        }
    } else {
        TokenError::Storage(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Account;
    use crate::notify::RecordingNotifier;
    use crate::store::MemoryStore;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        manager: Arc<TokenManager>,
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
        _server: MockServer,
    }

    async fn fixture(response: ResponseTemplate, expected_calls: u64) -> Fixture {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(response)
            .expect(expected_calls)
            .mount(&server)
            .await;

        let account = Account::new("work")
            .with_auth_uri("https://provider.example/authorize")
            .with_token_uri(format!("{}/token", server.uri()))
            .with_client_id("client-id");
        let engine = OAuthEngine::new(Arc::new(AccountRegistry::new([account])));
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let manager = Arc::new(TokenManager::new(store.clone(), engine, notifier.clone()));

        Fixture {
            manager,
            store,
            notifier,
            _server: server,
        }
    }

    fn refreshed_body() -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "new-access",
            "token_type": "Bearer",
            "expires_in": 3600
        }))
    }

    fn rejected_body() -> ResponseTemplate {
        ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": "invalid_grant"
        }))
    }

    #[tokio::test]
    async fn test_valid_token_is_returned_without_refresh() {
        let fx = fixture(refreshed_body(), 0).await;
        let token = Token::new("cached")
            .with_refresh_token("refresh")
            .with_expiry(Utc::now() + Duration::hours(1));
        fx.store.set("work", &token).await.unwrap();

        let result = fx.manager.ensure_access_token("work").await.unwrap();
        assert_eq!(result.access_token.expose(), "cached");
    }

    #[tokio::test]
    async fn test_expiring_without_refresh_token_is_returned() {
        let fx = fixture(refreshed_body(), 0).await;
        let token = Token::new("cached").with_expiry(Utc::now() + Duration::minutes(5));
        fx.store.set("work", &token).await.unwrap();

        let result = fx.manager.ensure_access_token("work").await.unwrap();
        assert_eq!(result.access_token.expose(), "cached");
    }

    #[tokio::test]
    async fn test_expired_without_refresh_token_requires_reauth() {
        let fx = fixture(refreshed_body(), 0).await;
        let token = Token::new("stale").with_expiry(Utc::now() - Duration::minutes(1));
        fx.store.set("work", &token).await.unwrap();

        let result = fx.manager.ensure_access_token("work").await;
        assert!(matches!(result, Err(TokenError::ReauthRequired { .. })));
        // The token is left untouched.
        assert_eq!(fx.store.get("work").await.unwrap(), token);
    }

    #[tokio::test]
    async fn test_expiring_token_is_refreshed_and_persisted() {
        let fx = fixture(refreshed_body(), 1).await;
        let token = Token::new("old")
            .with_refresh_token("refresh")
            .with_expiry(Utc::now() + Duration::minutes(5));
        fx.store.set("work", &token).await.unwrap();

        let result = fx.manager.ensure_access_token("work").await.unwrap();
        assert_eq!(result.access_token.expose(), "new-access");

        let stored = fx.store.get("work").await.unwrap();
        assert_eq!(stored.access_token.expose(), "new-access");
        assert_eq!(stored.refresh_secret().unwrap().expose(), "refresh");
        assert_eq!(fx.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_deletes_token() {
        let fx = fixture(rejected_body(), 1).await;
        let token = Token::new("old")
            .with_refresh_token("revoked")
            .with_expiry(Utc::now() - Duration::minutes(1));
        fx.store.set("work", &token).await.unwrap();

        let result = fx.manager.ensure_access_token("work").await;
        assert!(matches!(result, Err(TokenError::RefreshFailed { .. })));
        assert!(fx.store.get("work").await.unwrap_err().is_not_found());
        assert_eq!(fx.notifier.sent()[0].0, "grantkeeper - refresh failed");
    }

    #[tokio::test]
    async fn test_missing_and_unknown_accounts() {
        let fx = fixture(refreshed_body(), 0).await;

        let missing = fx.manager.ensure_access_token("work").await;
        assert!(matches!(missing, Err(TokenError::NotFound { .. })));

        let unknown = fx.manager.ensure_access_token("personal").await;
        assert!(matches!(unknown, Err(TokenError::UnknownAccount { .. })));
    }

    #[tokio::test]
    async fn test_force_refresh_without_refresh_token() {
        let fx = fixture(refreshed_body(), 0).await;
        fx.store.set("work", &Token::new("only-access")).await.unwrap();

        let result = fx.manager.force_refresh("work").await;
        assert!(matches!(result, Err(TokenError::ReauthRequired { .. })));
        assert_eq!(fx.notifier.sent().len(), 1);
        assert!(fx.store.get("work").await.is_ok());
    }

    #[tokio::test]
    async fn test_force_refresh_ignores_expiry() {
        let fx = fixture(refreshed_body(), 1).await;
        let token = Token::new("fresh")
            .with_refresh_token("refresh")
            .with_expiry(Utc::now() + Duration::hours(5));
        fx.store.set("work", &token).await.unwrap();

        let result = fx.manager.force_refresh("work").await.unwrap();
        assert_eq!(result.access_token.expose(), "new-access");
    }

    #[tokio::test]
    async fn test_sweep_failure_keeps_token() {
        let fx = fixture(rejected_body(), 1).await;
        let token = Token::new("old")
            .with_refresh_token("refresh")
            .with_expiry(Utc::now() + Duration::minutes(2));
        fx.store.set("work", &token).await.unwrap();

        let report = fx.manager.sweep().await;
        assert_eq!(
            report,
            SweepReport {
                refreshed: 0,
                failed: 1,
                expired: 0
            }
        );
        assert_eq!(fx.store.get("work").await.unwrap(), token);
    }

    #[tokio::test]
    async fn test_sweep_reports_dead_tokens() {
        let fx = fixture(refreshed_body(), 0).await;
        let token = Token::new("dead").with_expiry(Utc::now() - Duration::hours(1));
        fx.store.set("work", &token).await.unwrap();

        let report = fx.manager.sweep().await;
        assert_eq!(report.expired, 1);
        assert_eq!(fx.notifier.sent()[0].0, "grantkeeper - token expired");
        assert!(fx.store.get("work").await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_refresh_once() {
        let fx = fixture(refreshed_body(), 1).await;
        let token = Token::new("old")
            .with_refresh_token("refresh")
            .with_expiry(Utc::now() - Duration::minutes(1));
        fx.store.set("work", &token).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = fx.manager.clone();
            handles.push(tokio::spawn(async move {
                manager.ensure_access_token("work").await
            }));
        }
        let sweep = fx.manager.sweep().await;

        for handle in handles {
            let token = handle.await.unwrap().unwrap();
            assert_eq!(token.access_token.expose(), "new-access");
        }
        assert_eq!(sweep.failed, 0);
    }

    #[tokio::test]
    async fn test_status_and_delete() {
        let fx = fixture(refreshed_body(), 0).await;
        assert_eq!(fx.manager.status("work").await.unwrap(), Freshness::Missing);

        fx.manager
            .store_authorized("work", &Token::new("access"))
            .await
            .unwrap();
        assert_eq!(fx.manager.status("work").await.unwrap(), Freshness::Valid);

        fx.manager.delete("work").await.unwrap();
        assert!(matches!(
            fx.manager.delete("work").await,
            Err(TokenError::NotFound { .. })
        ));
    }
}
