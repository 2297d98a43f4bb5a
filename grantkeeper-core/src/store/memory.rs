//! In-memory token storage implementation.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

use super::{StoreError, TokenStore};
use crate::token::Token;

/// In-memory token store.
///
/// This store is not persistent; data is lost when the process exits. It is
/// also the access-token half of a [`SplitStore`](super::SplitStore).
///
/// # Thread Safety
///
/// A single mutex guards the map, so every operation is atomic with respect
/// to the others.
pub struct MemoryStore {
    tokens: Mutex<HashMap<String, Token>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Create a memory store with initial data.
    pub fn with_tokens(tokens: HashMap<String, Token>) -> Self {
        Self {
            tokens: Mutex::new(tokens),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("accounts", &self.tokens.lock().len())
            .finish()
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn get(&self, account: &str) -> Result<Token, StoreError> {
        self.tokens
            .lock()
            .get(account)
            .cloned()
            .ok_or_else(|| StoreError::not_found(account))
    }

    async fn set(&self, account: &str, token: &Token) -> Result<(), StoreError> {
        self.tokens.lock().insert(account.to_string(), token.clone());
        Ok(())
    }

    async fn delete(&self, account: &str) -> Result<(), StoreError> {
        self.tokens
            .lock()
            .remove(account)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(account))
    }

    async fn list_accounts(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.tokens.lock().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_memory_store_set_get() {
        let store = MemoryStore::new();
        let token = Token::new("access").with_refresh_token("refresh");

        store.set("work", &token).await.unwrap();
        let retrieved = store.get("work").await.unwrap();

        assert_eq!(retrieved, token);
    }

    #[tokio::test]
    async fn test_memory_store_last_write_wins() {
        let store = MemoryStore::new();

        store.set("work", &Token::new("first")).await.unwrap();
        store.set("work", &Token::new("second")).await.unwrap();

        assert_eq!(store.get("work").await.unwrap().access_token.expose(), "second");
    }

    #[tokio::test]
    async fn test_memory_store_get_nonexistent() {
        let store = MemoryStore::new();
        let result = store.get("nonexistent").await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_memory_store_delete() {
        let store = MemoryStore::new();
        store.set("work", &Token::new("access")).await.unwrap();
        store.delete("work").await.unwrap();

        assert!(store.get("work").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_memory_store_delete_missing_leaves_store_intact() {
        let store = MemoryStore::new();
        store.set("work", &Token::new("access")).await.unwrap();

        let result = store.delete("personal").await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
        assert!(store.get("work").await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_store_list_accounts() {
        let store = MemoryStore::new();
        store.set("work", &Token::new("t1")).await.unwrap();
        store.set("personal", &Token::new("t2")).await.unwrap();

        let accounts = store.list_accounts().await.unwrap();
        assert_eq!(
            accounts.into_iter().collect::<Vec<_>>(),
            vec!["personal".to_string(), "work".to_string()]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_memory_store_concurrent_writers() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();

        for i in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let account = format!("account-{}", i % 4);
                store.set(&account, &Token::new(format!("t{i}"))).await.unwrap();
                store.get(&account).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.list_accounts().await.unwrap().len(), 4);
    }
}
