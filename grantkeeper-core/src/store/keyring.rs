//! OS keyring-backed token storage implementation.

use async_trait::async_trait;
use ::keyring::Entry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use super::{StoreError, TokenStore};
use crate::token::Token;

/// Keyring service name used by the daemon.
pub const DEFAULT_SERVICE: &str = "grantkeeper";

/// Keyring entry holding the JSON list of accounts with a stored token.
pub const ACCOUNT_INDEX_KEY: &str = "grantkeeper-account-index";

const AVAILABILITY_PROBE_KEY: &str = "grantkeeper-keyring-check";

/// Minimal string-secret interface over a platform keyring.
///
/// Platform keyrings cannot enumerate their entries, so [`KeyringStore`]
/// keeps its own account index on top of this interface.
pub trait Keychain: Send + Sync {
    /// Read a secret. `Ok(None)` if no entry exists.
    fn get(&self, service: &str, key: &str) -> Result<Option<String>, StoreError>;

    /// Create or replace a secret.
    fn set(&self, service: &str, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove a secret. Returns `false` if there was nothing to remove.
    fn delete(&self, service: &str, key: &str) -> Result<bool, StoreError>;
}

/// [`Keychain`] backed by the platform's native keyring service:
/// - macOS: Keychain
/// - Linux: Secret Service API
/// - Windows: Credential Manager
#[derive(Debug, Default, Clone, Copy)]
pub struct OsKeychain;

impl OsKeychain {
    fn entry(service: &str, key: &str) -> Result<Entry, StoreError> {
        Entry::new(service, key).map_err(|e| StoreError::BackendError {
            message: format!("failed to create keyring entry: {}", e),
        })
    }
}

impl Keychain for OsKeychain {
    fn get(&self, service: &str, key: &str) -> Result<Option<String>, StoreError> {
        match Self::entry(service, key)?.get_password() {
            Ok(password) => Ok(Some(password)),
            Err(::keyring::Error::NoEntry) => Ok(None),
            Err(::keyring::Error::Ambiguous(_)) => Err(StoreError::BackendError {
                message: format!("ambiguous keyring entry for key: {}", key),
            }),
            Err(::keyring::Error::PlatformFailure(e)) => Err(StoreError::KeyringUnavailable {
                message: format!("platform keyring failure: {}", e),
            }),
            Err(::keyring::Error::NoStorageAccess(e)) => Err(StoreError::KeyringUnavailable {
                message: format!("keyring storage not accessible: {}", e),
            }),
            Err(e) => Err(StoreError::BackendError {
                message: format!("keyring error: {}", e),
            }),
        }
    }

    fn set(&self, service: &str, key: &str, value: &str) -> Result<(), StoreError> {
        Self::entry(service, key)?
            .set_password(value)
            .map_err(|e| StoreError::BackendError {
                message: format!("failed to set keyring password: {}", e),
            })
    }

    fn delete(&self, service: &str, key: &str) -> Result<bool, StoreError> {
        match Self::entry(service, key)?.delete_credential() {
            Ok(()) => Ok(true),
            Err(::keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(StoreError::BackendError {
                message: format!("failed to delete keyring entry: {}", e),
            }),
        }
    }
}

/// Keyring payload for one account.
#[derive(Debug, Serialize, Deserialize)]
struct KeyringTokenEntry {
    refresh_token: String,
}

/// Token store holding refresh tokens in the OS keyring.
///
/// Only the refresh token is kept; tokens read back have an empty access
/// token and no expiry, so the lifecycle treats them as due for refresh.
/// Meant to be the durable half of a [`SplitStore`](super::SplitStore).
///
/// Each account is an entry named after the account under the store's
/// service name. Because keyrings cannot be enumerated, the store also
/// maintains a de-duplicated JSON array of account names in the
/// [`ACCOUNT_INDEX_KEY`] entry.
pub struct KeyringStore {
    service: String,
    keychain: Arc<dyn Keychain>,
    index_lock: Mutex<()>,
}

impl KeyringStore {
    /// Create a keyring store on the platform keyring.
    pub fn new(service: &str) -> Self {
        Self::with_keychain(service, Arc::new(OsKeychain))
    }

    /// Create a keyring store over an arbitrary [`Keychain`].
    pub fn with_keychain(service: &str, keychain: Arc<dyn Keychain>) -> Self {
        let service = if service.is_empty() {
            DEFAULT_SERVICE
        } else {
            service
        };
        Self {
            service: service.to_string(),
            keychain,
            index_lock: Mutex::new(()),
        }
    }

    /// Probe whether the keyring backend answers at all.
    ///
    /// A missing probe entry counts as available; only backend failures do not.
    pub fn is_available(&self) -> bool {
        match self.keychain.get(&self.service, AVAILABILITY_PROBE_KEY) {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("Keyring probe failed: {}", e);
                false
            }
        }
    }

    fn read_index(&self) -> Result<Vec<String>, StoreError> {
        match self.keychain.get(&self.service, ACCOUNT_INDEX_KEY)? {
            Some(raw) if !raw.trim().is_empty() => {
                let accounts: Vec<String> = serde_json::from_str(&raw)?;
                Ok(unique_accounts(accounts))
            }
            _ => Ok(Vec::new()),
        }
    }

    fn write_index(&self, accounts: Vec<String>) -> Result<(), StoreError> {
        let raw = serde_json::to_string(&unique_accounts(accounts))?;
        self.keychain.set(&self.service, ACCOUNT_INDEX_KEY, &raw)
    }

    fn add_to_index(&self, account: &str) -> Result<(), StoreError> {
        let _guard = self.index_lock.lock();
        let mut accounts = self.read_index()?;
        if accounts.iter().any(|existing| existing == account) {
            return Ok(());
        }
        accounts.push(account.to_string());
        self.write_index(accounts)
    }

    fn remove_from_index(&self, account: &str) -> Result<(), StoreError> {
        let _guard = self.index_lock.lock();
        let accounts = self.read_index()?;
        if !accounts.iter().any(|existing| existing == account) {
            return Ok(());
        }
        self.write_index(
            accounts
                .into_iter()
                .filter(|existing| existing != account)
                .collect(),
        )
    }
}

impl std::fmt::Debug for KeyringStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyringStore")
            .field("service", &self.service)
            .finish()
    }
}

#[async_trait]
impl TokenStore for KeyringStore {
    async fn get(&self, account: &str) -> Result<Token, StoreError> {
        let raw = self
            .keychain
            .get(&self.service, account)?
            .ok_or_else(|| StoreError::not_found(account))?;

        // Older entries hold the bare refresh token instead of JSON.
        let refresh_token = match serde_json::from_str::<KeyringTokenEntry>(&raw) {
            Ok(entry) => entry.refresh_token,
            Err(_) => raw,
        };
        if refresh_token.is_empty() {
            return Err(StoreError::not_found(account));
        }

        Ok(Token::new("").with_refresh_token(refresh_token))
    }

    async fn set(&self, account: &str, token: &Token) -> Result<(), StoreError> {
        let Some(refresh_token) = token.refresh_secret() else {
            return Ok(());
        };

        let raw = serde_json::to_string(&KeyringTokenEntry {
            refresh_token: refresh_token.expose().to_string(),
        })?;
        self.keychain.set(&self.service, account, &raw)?;
        self.add_to_index(account)
    }

    async fn delete(&self, account: &str) -> Result<(), StoreError> {
        let existed = self.keychain.delete(&self.service, account)?;
        self.remove_from_index(account)?;
        if existed {
            Ok(())
        } else {
            Err(StoreError::not_found(account))
        }
    }

    async fn list_accounts(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.read_index()?.into_iter().collect())
    }
}

/// Drop empty names and duplicates, keeping first-seen order.
fn unique_accounts(accounts: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    accounts
        .into_iter()
        .filter(|account| !account.is_empty() && seen.insert(account.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Keychain kept in a map, with a switch to make index writes fail.
    #[derive(Default)]
    struct MapKeychain {
        entries: Mutex<HashMap<(String, String), String>>,
        fail_index_writes: AtomicBool,
    }

    impl Keychain for MapKeychain {
        fn get(&self, service: &str, key: &str) -> Result<Option<String>, StoreError> {
            Ok(self
                .entries
                .lock()
                .get(&(service.to_string(), key.to_string()))
                .cloned())
        }

        fn set(&self, service: &str, key: &str, value: &str) -> Result<(), StoreError> {
            if key == ACCOUNT_INDEX_KEY && self.fail_index_writes.load(Ordering::SeqCst) {
                return Err(StoreError::BackendError {
                    message: "index write refused".to_string(),
                });
            }
            self.entries
                .lock()
                .insert((service.to_string(), key.to_string()), value.to_string());
            Ok(())
        }

        fn delete(&self, service: &str, key: &str) -> Result<bool, StoreError> {
            Ok(self
                .entries
                .lock()
                .remove(&(service.to_string(), key.to_string()))
                .is_some())
        }
    }

    fn store() -> (KeyringStore, Arc<MapKeychain>) {
        let keychain = Arc::new(MapKeychain::default());
        (
            KeyringStore::with_keychain("grantkeeper-test", keychain.clone()),
            keychain,
        )
    }

    #[tokio::test]
    async fn test_keyring_holds_refresh_token_only() {
        let (store, keychain) = store();
        let token = Token::new("access").with_refresh_token("refresh");

        store.set("work", &token).await.unwrap();
        let retrieved = store.get("work").await.unwrap();

        assert_eq!(retrieved.refresh_secret().unwrap().expose(), "refresh");
        assert_eq!(retrieved.access_token.expose(), "");

        let raw = keychain.get("grantkeeper-test", "work").unwrap().unwrap();
        assert!(!raw.contains("access"));
    }

    #[tokio::test]
    async fn test_keyring_ignores_token_without_refresh() {
        let (store, _) = store();
        store.set("work", &Token::new("access")).await.unwrap();

        assert!(store.get("work").await.unwrap_err().is_not_found());
        assert!(store.list_accounts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keyring_index_is_deduplicated() {
        let (store, keychain) = store();
        let token = Token::new("a").with_refresh_token("r");

        store.set("work", &token).await.unwrap();
        store.set("work", &token).await.unwrap();
        store.set("personal", &token).await.unwrap();

        let raw = keychain
            .get("grantkeeper-test", ACCOUNT_INDEX_KEY)
            .unwrap()
            .unwrap();
        let index: Vec<String> = serde_json::from_str(&raw).unwrap();
        assert_eq!(index, vec!["work".to_string(), "personal".to_string()]);
    }

    #[tokio::test]
    async fn test_keyring_delete_updates_index() {
        let (store, _) = store();
        store
            .set("work", &Token::new("a").with_refresh_token("r"))
            .await
            .unwrap();

        store.delete("work").await.unwrap();
        assert!(store.list_accounts().await.unwrap().is_empty());
        assert!(store.delete("work").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_keyring_index_failure_is_surfaced() {
        let (store, keychain) = store();
        keychain.fail_index_writes.store(true, Ordering::SeqCst);

        let result = store
            .set("work", &Token::new("a").with_refresh_token("r"))
            .await;
        assert!(matches!(result, Err(StoreError::BackendError { .. })));
    }

    #[tokio::test]
    async fn test_keyring_reads_legacy_raw_secret() {
        let (store, keychain) = store();
        keychain
            .set("grantkeeper-test", "work", "bare-refresh-token")
            .unwrap();

        let token = store.get("work").await.unwrap();
        assert_eq!(token.refresh_secret().unwrap().expose(), "bare-refresh-token");
    }

    #[test]
    fn test_unique_accounts() {
        let accounts = vec![
            "b".to_string(),
            "".to_string(),
            "a".to_string(),
            "b".to_string(),
        ];
        assert_eq!(unique_accounts(accounts), vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_empty_service_uses_default() {
        let store = KeyringStore::with_keychain("", Arc::new(MapKeychain::default()));
        assert_eq!(store.service, DEFAULT_SERVICE);
        assert!(store.is_available());
    }
}
