//! Engine configuration.
//!
//! A small TOML file at `~/.config/calvault/config.toml`; every field has a
//! default, and a missing or unparsable file falls back to those defaults —
//! configuration is a read path, and read paths never hard-fail.

use std::path::PathBuf;

use serde::Deserialize;
use tracing::warn;

use crate::error::{VaultError, VaultResult};

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("calvault")
}

fn default_keyring_service() -> String {
    "calvault".to_string()
}

fn default_keyring_account() -> String {
    "events-key".to_string()
}

/// Engine configuration. `data_dir` is the app-private root that holds
/// `snapshot.json`, `ops.ndjson`, `months/`, and the encrypted generations.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Secure-key-store service name (fixed per install).
    #[serde(default = "default_keyring_service")]
    pub keyring_service: String,

    /// Secure-key-store account name.
    #[serde(default = "default_keyring_account")]
    pub keyring_account: String,

    /// User scope mixed into the AEAD associated-data context, so ciphertexts
    /// cannot be swapped between users.
    #[serde(default)]
    pub user_scope: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            data_dir: default_data_dir(),
            keyring_service: default_keyring_service(),
            keyring_account: default_keyring_account(),
            user_scope: None,
        }
    }
}

impl StoreConfig {
    pub fn config_path() -> VaultResult<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| VaultError::Config("Could not determine config directory".into()))?
            .join("calvault");
        Ok(config_dir.join("config.toml"))
    }

    /// Load from the config file, falling back to defaults if it is missing
    /// or unparsable.
    pub fn load() -> Self {
        let path = match Self::config_path() {
            Ok(path) => path,
            Err(_) => return Self::default(),
        };
        let Ok(contents) = std::fs::read_to_string(&path) else {
            return Self::default();
        };
        match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config unparsable, using defaults");
                Self::default()
            }
        }
    }

    /// Associated-data string binding encrypted records to this application,
    /// schema revision, and user.
    pub fn crypto_context(&self) -> String {
        format!(
            "calvault:v{}:{}",
            crate::schema::SCHEMA_VERSION,
            self.user_scope.as_deref().unwrap_or("local")
        )
    }
}
