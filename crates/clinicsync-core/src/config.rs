//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: the
//! backend base URL, provider client identifiers and endpoints, timeouts and
//! the credential storage backend.
//!
//! Configuration is stored at `~/.config/clinicsync/config.json`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::{CredentialStore, FileBackend, KeyringBackend, MemoryBackend, StorageBackend};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "clinicsync";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Upper bound on any single network call, including silent refreshes.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// How long an interactive sign-in or redirect flow may stay open.
const DEFAULT_INTERACTIVE_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Keyring,
    File,
    Memory,
}

impl std::str::FromStr for StorageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "keyring" => Ok(StorageKind::Keyring),
            "file" => Ok(StorageKind::File),
            "memory" => Ok(StorageKind::Memory),
            other => Err(anyhow::anyhow!("Unknown storage backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub client_id: String,
    /// Backend's client id; server-auth-codes are minted for it.
    pub server_client_id: String,
    pub authorize_url: String,
    pub token_url: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            server_client_id: String::new(),
            authorize_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            redirect_uri: "clinicsync://oauth/identity".to_string(),
            scopes: vec![
                "https://www.googleapis.com/auth/calendar".to_string(),
                "https://www.googleapis.com/auth/calendar.events".to_string(),
                "profile".to_string(),
                "email".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConferencingConfig {
    pub client_id: String,
    pub authorize_url: String,
    pub redirect_uri: String,
}

impl Default for ConferencingConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            authorize_url: "https://zoom.us/oauth/authorize".to_string(),
            redirect_uri: "clinicsync://oauth/conferencing".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub identity: IdentityConfig,
    pub conferencing: ConferencingConfig,
    pub request_timeout_secs: u64,
    pub interactive_timeout_secs: u64,
    pub storage: StorageKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.clinicsync.app".to_string(),
            identity: IdentityConfig::default(),
            conferencing: ConferencingConfig::default(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            interactive_timeout_secs: DEFAULT_INTERACTIVE_TIMEOUT_SECS,
            storage: StorageKind::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            Ok(serde_json::from_str(&contents).context("Failed to parse config file")?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply `CLINICSYNC_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("CLINICSYNC_API_URL") {
            self.api_base_url = url;
        }
        if let Ok(storage) = std::env::var("CLINICSYNC_STORAGE") {
            self.storage = storage.parse()?;
        }
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn interactive_timeout(&self) -> Duration {
        Duration::from_secs(self.interactive_timeout_secs)
    }

    pub fn endpoint(&self, path: &str) -> String {
        join_url(&self.api_base_url, path)
    }

    /// Build the credential store for the configured backend.
    pub fn credential_store(&self) -> Result<CredentialStore> {
        let backend: Arc<dyn StorageBackend> = match self.storage {
            StorageKind::Keyring => Arc::new(KeyringBackend::new()),
            StorageKind::File => Arc::new(FileBackend::new(self.cache_dir()?)),
            StorageKind::Memory => Arc::new(MemoryBackend::default()),
        };
        Ok(CredentialStore::new(backend))
    }

    /// Shared HTTP client with the configured timeout.
    pub fn http_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(self.request_timeout())
            .build()
            .context("Failed to build HTTP client")
    }
}

/// Join a base URL and a path with exactly one slash between them.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"api_base_url": "https://staging.example"}"#).unwrap();
        assert_eq!(config.api_base_url, "https://staging.example");
        assert_eq!(config.request_timeout_secs, 60);
        assert_eq!(config.storage, StorageKind::Keyring);
        assert!(config.identity.scopes.iter().any(|s| s == "email"));
    }

    #[test]
    fn test_endpoint_joins_slashes() {
        let config = Config {
            api_base_url: "https://api.example/".to_string(),
            ..Config::default()
        };
        assert_eq!(config.endpoint("/exchange"), "https://api.example/exchange");
        assert_eq!(config.endpoint("patients"), "https://api.example/patients");
    }

    #[test]
    fn test_storage_kind_parse() {
        assert_eq!("FILE".parse::<StorageKind>().unwrap(), StorageKind::File);
        assert!("cloud".parse::<StorageKind>().is_err());
    }
}
