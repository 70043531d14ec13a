//! Durable key-value persistence for session state.
//!
//! The store never interprets what it holds beyond (de)serializing
//! credential records. Only the session manager writes to it.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use keyring::Entry;
use tracing::{debug, warn};

use super::{Credential, CredentialKind, StorageError};

/// Keychain service name for the keyring backend
const SERVICE_NAME: &str = "clinicsync";

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

pub const ADMIN_FLAG_KEY: &str = "admin-flag";
pub const DOCTOR_ID_KEY: &str = "doctor-id";

/// Every key that belongs to the signed-in session.
pub const SESSION_KEYS: [&str; 5] = [
    "identity",
    "calendar-delegation",
    "conferencing",
    ADMIN_FLAG_KEY,
    DOCTOR_ID_KEY,
];

/// Platform persistence medium.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    /// Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// OS keychain storage, one keychain entry per key.
pub struct KeyringBackend {
    service: String,
}

impl KeyringBackend {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    async fn with_entry<T, F>(&self, key: &str, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(Entry) -> Result<T, keyring::Error> + Send + 'static,
    {
        let service = self.service.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let entry = Entry::new(&service, &key)?;
            op(entry)
        })
        .await
        .map_err(|e| StorageError::Backend(format!("keychain task failed: {}", e)))?
        .map_err(|e| StorageError::Backend(e.to_string()))
    }
}

impl Default for KeyringBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for KeyringBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.with_entry(key, |entry| match entry.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e),
        })
        .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let value = value.to_string();
        self.with_entry(key, move |entry| entry.set_password(&value)).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.with_entry(key, |entry| match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e),
        })
        .await
    }
}

/// All keys in one JSON map file, replaced atomically on every write.
pub struct FileBackend {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl FileBackend {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            path: cache_dir.join(SESSION_FILE),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn load_map(&self) -> Result<BTreeMap<String, String>, StorageError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| StorageError::Serialization(format!("session file: {}", e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(StorageError::Backend(e.to_string())),
        }
    }

    async fn save_map(&self, map: &BTreeMap<String, String>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
        }
        let contents = serde_json::to_string_pretty(map)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _guard = self.lock.lock().await;
        Ok(self.load_map().await?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let mut map = self.load_map().await?;
        map.insert(key.to_string(), value.to_string());
        self.save_map(&map).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let mut map = self.load_map().await?;
        if map.remove(key).is_some() {
            self.save_map(&map).await?;
        }
        Ok(())
    }
}

/// Process-local storage. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryBackend {
    values: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.remove(key);
        Ok(())
    }
}

/// Session-state persistence on top of a `StorageBackend`.
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn StorageBackend>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryBackend::default()))
    }

    /// Read a value. Backend failures read as absent.
    pub async fn read(&self, key: &str) -> Option<String> {
        match self.backend.get(key).await {
            Ok(value) => value,
            Err(e) => {
                debug!(key = key, error = %e, "Failed to read stored value");
                None
            }
        }
    }

    pub async fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.backend.set(key, value).await
    }

    pub async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.backend.delete(key).await
    }

    /// Remove every key, attempting all of them and reporting the ones that
    /// could not be removed.
    pub async fn clear_all(&self, keys: &[&str]) -> Result<(), StorageError> {
        let mut failed = Vec::new();
        for key in keys {
            if let Err(e) = self.backend.delete(key).await {
                warn!(key = *key, error = %e, "Failed to remove stored value");
                failed.push((*key).to_string());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(StorageError::Partial(failed))
        }
    }

    pub async fn read_credential(&self, kind: CredentialKind) -> Option<Credential> {
        let raw = self.read(kind.storage_key()).await?;
        match serde_json::from_str::<Credential>(&raw) {
            Ok(credential) if credential.kind == kind => Some(credential),
            Ok(credential) => {
                warn!(
                    expected = %kind,
                    found = %credential.kind,
                    "Stored credential has wrong kind"
                );
                None
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "Failed to parse stored credential");
                None
            }
        }
    }

    /// Writes the whole record under one key so a credential is never
    /// half-written.
    pub async fn write_credential(&self, credential: &Credential) -> Result<(), StorageError> {
        let raw = serde_json::to_string(credential)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.write(credential.kind.storage_key(), &raw).await
    }

    pub async fn remove_credential(&self, kind: CredentialKind) -> Result<(), StorageError> {
        self.remove(kind.storage_key()).await
    }
}
