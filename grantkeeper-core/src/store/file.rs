//! File-backed token storage implementation.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::{StoreError, TokenStore};
use crate::persist;
use crate::token::Token;

/// On-disk format of the token file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenFileData {
    /// Version of the file format (for future migrations).
    version: u32,

    /// Tokens keyed by account name.
    #[serde(default)]
    tokens: BTreeMap<String, Token>,
}

impl Default for TokenFileData {
    fn default() -> Self {
        Self {
            version: 1,
            tokens: BTreeMap::new(),
        }
    }
}

/// Token store persisted as a plaintext JSON document.
///
/// The file is owner-only and every mutation rewrites it through a temporary
/// file and an atomic rename, so a crash mid-write leaves the previous
/// contents in place. A missing file is an empty store; a corrupt one is
/// reported rather than overwritten.
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    /// Create a store backed by the file at `path`.
    ///
    /// Nothing is read or created until the first operation.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Path of the token file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<TokenFileData, StoreError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(TokenFileData::default()),
            Err(e) => return Err(e.into()),
        };

        if persist::repair_mode(&self.path, persist::PRIVATE_FILE_MODE)? {
            tracing::warn!(path = %self.path.display(), "Restored owner-only permissions");
        }

        if contents.trim().is_empty() {
            return Ok(TokenFileData::default());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    fn save(&self, data: &TokenFileData) -> Result<(), StoreError> {
        let contents = serde_json::to_vec_pretty(data)?;
        persist::write_private(&self.path, &contents)?;
        Ok(())
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore").field("path", &self.path).finish()
    }
}

#[async_trait]
impl TokenStore for FileStore {
    async fn get(&self, account: &str) -> Result<Token, StoreError> {
        let _guard = self.lock.lock();
        self.load()?
            .tokens
            .remove(account)
            .ok_or_else(|| StoreError::not_found(account))
    }

    async fn set(&self, account: &str, token: &Token) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut data = self.load()?;
        data.tokens.insert(account.to_string(), token.clone());
        self.save(&data)?;
        tracing::debug!(account, path = %self.path.display(), "Token written to file");
        Ok(())
    }

    async fn delete(&self, account: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut data = self.load()?;
        if data.tokens.remove(account).is_none() {
            return Err(StoreError::not_found(account));
        }
        self.save(&data)
    }

    async fn list_accounts(&self) -> Result<BTreeSet<String>, StoreError> {
        let _guard = self.lock.lock();
        Ok(self.load()?.tokens.into_keys().collect())
    }
}
