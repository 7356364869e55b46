//! Credential store lookups
//!
//! Accounts may keep their secret outside the routing configuration. The
//! mapper asks the [`CredentialStore`] first and falls back to the account's
//! static token.

use crate::Secret;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Source of per-account secrets
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Whether the store has a credential for the key
    async fn has_credential(&self, key: &str) -> bool;

    /// Fetch the credential for the key
    async fn get_credential(&self, key: &str) -> Option<Secret>;
}

/// In-process credential store
#[derive(Default)]
pub struct MemoryCredentialStore {
    credentials: RwLock<HashMap<String, Secret>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or replace a credential
    pub fn insert(&self, key: impl Into<String>, secret: impl Into<Secret>) {
        let mut creds = self.credentials.write();
        creds.insert(key.into(), secret.into());
    }

    /// Remove a credential, returning whether one existed
    pub fn remove(&self, key: &str) -> bool {
        let mut creds = self.credentials.write();
        creds.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.credentials.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.read().is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for MemoryCredentialStore
where
    K: Into<String>,
    V: Into<Secret>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let store = Self::new();
        for (key, secret) in iter {
            store.insert(key, secret);
        }
        store
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn has_credential(&self, key: &str) -> bool {
        self.credentials.read().contains_key(key)
    }

    async fn get_credential(&self, key: &str) -> Option<Secret> {
        self.credentials.read().get(key).cloned()
    }
}
