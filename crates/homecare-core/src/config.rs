//! Application configuration management.
//!
//! This module handles loading and saving the application configuration:
//! backend URL, last used username, where tokens are stored, and session
//! timing.
//!
//! Configuration is stored at `~/.config/homecare/config.json`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::keychain::{KeyringTokenStore, DEFAULT_ACCOUNT};
use crate::auth::provider::{ProviderOptions, Route, DEFAULT_LOGIN_PATH};
use crate::auth::session::{
    SessionPolicy, REFRESH_LEAD_MINUTES, REMEMBER_ME_HORIZON_MINUTES, REMEMBER_ME_TTL_MINUTES,
    SESSION_TTL_MINUTES,
};
use crate::auth::store::{FileTokenStore, MemoryTokenStore, TokenStore};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "homecare";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Backend used when nothing is configured.
const DEFAULT_API_BASE_URL: &str = "http://localhost:3000/api";

/// Environment variable overriding `api_base_url`.
pub const API_URL_ENV: &str = "HOMECARE_API_URL";

/// Environment variable holding the sealed store passphrase.
pub const STORE_PASSPHRASE_ENV: &str = "HOMECARE_STORE_PASSPHRASE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TokenStorage {
    /// Plain JSON file in the cache directory
    #[default]
    File,
    /// Passphrase-encrypted file in the cache directory
    Sealed,
    /// OS keychain
    Keyring,
    /// Process memory only
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub last_username: Option<String>,
    pub token_storage: TokenStorage,
    pub session_ttl_minutes: i64,
    pub remember_me_ttl_minutes: i64,
    pub remember_me_horizon_minutes: i64,
    pub refresh_lead_minutes: i64,
    pub recheck_interval_secs: u64,
    pub login_path: String,
    pub public_paths: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            last_username: None,
            token_storage: TokenStorage::default(),
            session_ttl_minutes: SESSION_TTL_MINUTES,
            remember_me_ttl_minutes: REMEMBER_ME_TTL_MINUTES,
            remember_me_horizon_minutes: REMEMBER_ME_HORIZON_MINUTES,
            refresh_lead_minutes: REFRESH_LEAD_MINUTES,
            recheck_interval_secs: 3 * 60,
            login_path: DEFAULT_LOGIN_PATH.to_string(),
            public_paths: Vec::new(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
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

    /// Apply `HOMECARE_API_URL` if set.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                self.api_base_url = url;
            }
        }
    }

    pub fn session_policy(&self) -> Result<SessionPolicy> {
        SessionPolicy::from_minutes(
            self.session_ttl_minutes,
            self.remember_me_ttl_minutes,
            self.remember_me_horizon_minutes,
            self.refresh_lead_minutes,
        )
        .context("Invalid session timing in config")
    }

    pub fn provider_options(&self) -> ProviderOptions {
        ProviderOptions {
            login_route: Route::new(self.login_path.clone()),
            public_routes: self.public_paths.iter().cloned().map(Route::new).collect(),
            recheck_interval: Duration::from_secs(self.recheck_interval_secs.max(1)),
        }
    }

    /// Open the configured token store under `cache_dir`.
    pub fn open_token_store(
        &self,
        cache_dir: &Path,
        passphrase: Option<&str>,
    ) -> Result<Arc<dyn TokenStore>> {
        let store: Arc<dyn TokenStore> = match self.token_storage {
            TokenStorage::File => Arc::new(FileTokenStore::new(cache_dir)),
            TokenStorage::Sealed => {
                let passphrase = passphrase.ok_or_else(|| {
                    anyhow::anyhow!("Sealed token storage needs {} to be set", STORE_PASSPHRASE_ENV)
                })?;
                Arc::new(FileTokenStore::sealed(cache_dir, passphrase)?)
            }
            TokenStorage::Keyring => Arc::new(KeyringTokenStore::new(DEFAULT_ACCOUNT)?),
            TokenStorage::Memory => Arc::new(MemoryTokenStore::new()),
        };
        Ok(store)
    }
}
