//! Credential storage collaborator.
//!
//! The bridge only talks to [`Keystore`]. Encryption at rest belongs to the
//! concrete store; the bundled [`InMemoryKeystore`] keeps keys in process
//! memory and is what the bridge runs with by default.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::KeystoreError;
use crate::secrets::{Credential, ProviderTable};

/// A stored API credential.
#[derive(Clone)]
pub struct StoredKey {
    pub id: String,
    pub provider: String,
    pub token: SecretString,
    pub display_name: String,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds, 0 means never.
    pub expires_at: i64,
    pub tags: Vec<String>,
}

impl StoredKey {
    pub fn new(id: impl Into<String>, provider: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            token: SecretString::from(token.into()),
            display_name: String::new(),
            created_at: Utc::now().timestamp(),
            expires_at: 0,
            tags: Vec::new(),
        }
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at != 0 && self.expires_at <= now
    }

    /// Metadata view without the token.
    pub fn info(&self) -> KeyInfo {
        KeyInfo {
            id: self.id.clone(),
            provider: self.provider.clone(),
            display_name: self.display_name.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            tags: self.tags.clone(),
        }
    }

    /// Wire credential for injection. The token leaves the secret wrapper here.
    pub fn to_credential(&self) -> Credential {
        let credential = Credential::new(self.provider.clone(), self.token.expose_secret());
        if self.display_name.is_empty() {
            credential
        } else {
            credential.with_display_name(self.display_name.clone())
        }
    }
}

impl std::fmt::Debug for StoredKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredKey")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("token", &"[REDACTED]")
            .field("display_name", &self.display_name)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("tags", &self.tags)
            .finish()
    }
}

/// Key metadata returned by `list_keys`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub id: String,
    pub provider: String,
    pub display_name: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub tags: Vec<String>,
}

/// Storage for provider credentials.
#[async_trait]
pub trait Keystore: Send + Sync {
    /// Store a new key. Ids are unique.
    async fn store(&self, key: StoredKey) -> Result<KeyInfo, KeystoreError>;

    /// Fetch a key including its token. Expired keys are refused.
    async fn retrieve(&self, id: &str) -> Result<StoredKey, KeystoreError>;

    /// List key metadata, optionally filtered by provider.
    async fn list(&self, provider: Option<&str>) -> Result<Vec<KeyInfo>, KeystoreError>;

    async fn delete(&self, id: &str) -> Result<(), KeystoreError>;
}

/// Process-memory keystore.
pub struct InMemoryKeystore {
    providers: ProviderTable,
    keys: RwLock<HashMap<String, StoredKey>>,
}

impl InMemoryKeystore {
    pub fn new(providers: ProviderTable) -> Self {
        Self {
            providers,
            keys: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryKeystore {
    fn default() -> Self {
        Self::new(ProviderTable::standard())
    }
}

#[async_trait]
impl Keystore for InMemoryKeystore {
    async fn store(&self, mut key: StoredKey) -> Result<KeyInfo, KeystoreError> {
        if key.id.trim().is_empty() {
            return Err(KeystoreError::MissingField("id"));
        }
        if key.token.expose_secret().is_empty() {
            return Err(KeystoreError::MissingField("token"));
        }
        if !self.providers.is_known(&key.provider) {
            return Err(KeystoreError::InvalidProvider(key.provider));
        }
        key.provider = key.provider.trim().to_ascii_lowercase();

        let mut keys = self.keys.write().await;
        if keys.contains_key(&key.id) {
            return Err(KeystoreError::Duplicate(key.id));
        }
        let info = key.info();
        keys.insert(key.id.clone(), key);
        tracing::info!(key_id = %info.id, provider = %info.provider, "Stored key");
        Ok(info)
    }

    async fn retrieve(&self, id: &str) -> Result<StoredKey, KeystoreError> {
        let keys = self.keys.read().await;
        let key = keys
            .get(id)
            .ok_or_else(|| KeystoreError::NotFound(id.to_string()))?;
        if key.is_expired_at(Utc::now().timestamp()) {
            return Err(KeystoreError::Expired(id.to_string()));
        }
        Ok(key.clone())
    }

    async fn list(&self, provider: Option<&str>) -> Result<Vec<KeyInfo>, KeystoreError> {
        let keys = self.keys.read().await;
        let mut infos: Vec<KeyInfo> = keys
            .values()
            .filter(|k| provider.is_none_or(|p| k.provider.eq_ignore_ascii_case(p)))
            .map(StoredKey::info)
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(infos)
    }

    async fn delete(&self, id: &str) -> Result<(), KeystoreError> {
        self.keys
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| KeystoreError::NotFound(id.to_string()))
    }
}
