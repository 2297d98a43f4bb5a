//! Split token storage: access tokens in memory, refresh tokens elsewhere.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

use super::{MemoryStore, StoreError, TokenStore};
use crate::token::Token;

/// Token store that keeps each half of a token where it belongs.
///
/// The short-lived access token (with its expiry and type) lives in an
/// in-process [`MemoryStore`]; the refresh token goes to a durable backend
/// such as a [`KeyringStore`](super::KeyringStore) or [`FileStore`](super::FileStore).
/// The durable backend never sees an access token.
///
/// After a restart only the refresh half exists, so reads return a token
/// with an empty access token, which the lifecycle treats as expired and
/// refreshes on first use.
pub struct SplitStore {
    access: MemoryStore,
    durable: Arc<dyn TokenStore>,
}

impl SplitStore {
    /// Compose a split store over a durable refresh-token backend.
    pub fn new(durable: Arc<dyn TokenStore>) -> Self {
        Self {
            access: MemoryStore::new(),
            durable,
        }
    }
}

impl std::fmt::Debug for SplitStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplitStore")
            .field("access", &self.access)
            .finish_non_exhaustive()
    }
}

/// Ignore a `NotFound`, keep every other error.
fn found<T>(result: Result<T, StoreError>) -> Result<Option<T>, StoreError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl TokenStore for SplitStore {
    async fn get(&self, account: &str) -> Result<Token, StoreError> {
        let access = found(self.access.get(account).await)?;
        let durable = found(self.durable.get(account).await)?;

        let refresh = durable.as_ref().and_then(|t| t.refresh_token.clone());
        match (access, durable) {
            (Some(mut token), _) => {
                token.refresh_token = refresh;
                Ok(token)
            }
            (None, Some(_)) => {
                let mut token = Token::new("");
                token.refresh_token = refresh;
                Ok(token)
            }
            (None, None) => Err(StoreError::not_found(account)),
        }
    }

    async fn set(&self, account: &str, token: &Token) -> Result<(), StoreError> {
        // Memory only changes once the durable half is written.
        match token.refresh_secret() {
            Some(refresh) => {
                let refresh_only = Token::new("").with_refresh_token(refresh.expose());
                self.durable.set(account, &refresh_only).await?;
            }
            // A token without a refresh half replaces any older one.
            None => {
                found(self.durable.delete(account).await)?;
            }
        }

        let mut access_only = token.clone();
        access_only.refresh_token = None;
        self.access.set(account, &access_only).await
    }

    async fn delete(&self, account: &str) -> Result<(), StoreError> {
        let had_access = found(self.access.delete(account).await)?.is_some();
        let had_refresh = found(self.durable.delete(account).await)?.is_some();

        if had_access || had_refresh {
            Ok(())
        } else {
            Err(StoreError::not_found(account))
        }
    }

    async fn list_accounts(&self) -> Result<BTreeSet<String>, StoreError> {
        let mut accounts = self.access.list_accounts().await?;
        accounts.extend(self.durable.list_accounts().await?);
        Ok(accounts)
    }
}
