use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use anyhow::{Result, anyhow};

use crate::secret::EncryptedSecret;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub backend_url: Option<String>,
    pub default_model: Option<String>,
    #[serde(default = "default_thinking")]
    pub thinking_enabled: bool,
    /// Sealed system prompt; never stored in plaintext
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<EncryptedSecret>,
}

fn default_thinking() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            backend_url: None,
            default_model: None,
            thinking_enabled: true,
            system_prompt: None,
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::get_config_path()?)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Self::new());
        }

        let config_content = fs::read_to_string(config_path)?;
        let config: Config = serde_json::from_str(&config_content)?;
        Ok(config)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        // Create config directory if it doesn't exist
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let config_content = serde_json::to_string_pretty(self)?;
        fs::write(config_path, config_content)?;
        Ok(())
    }

    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not determine config directory"))?;

        Ok(config_dir.join("termchat"))
    }

    pub fn get_config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }
}

/// Replace the stored secret wholesale, or remove it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretUpdate {
    Replace(EncryptedSecret),
    Clear,
}

/// Where the sealed system prompt lives. The core only ever sees the blob.
pub trait SecretStore: Send + Sync {
    fn load(&self) -> Result<Option<EncryptedSecret>>;
    fn store(&self, update: SecretUpdate) -> Result<()>;
}

/// Keeps the secret inside `config.json`
#[derive(Debug, Clone)]
pub struct ConfigSecretStore {
    path: PathBuf,
}

impl ConfigSecretStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn with_default_path() -> Result<Self> {
        Ok(Self::new(Config::get_config_path()?))
    }
}

impl SecretStore for ConfigSecretStore {
    fn load(&self) -> Result<Option<EncryptedSecret>> {
        Ok(Config::load_from(&self.path)?.system_prompt)
    }

    fn store(&self, update: SecretUpdate) -> Result<()> {
        let mut config = Config::load_from(&self.path)?;
        config.system_prompt = match update {
            SecretUpdate::Replace(secret) => Some(secret),
            SecretUpdate::Clear => None,
        };
        config.save_to(&self.path)
    }
}

#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secret: Mutex<Option<EncryptedSecret>>,
}

impl MemorySecretStore {
    pub fn new(secret: Option<EncryptedSecret>) -> Self {
        Self {
            secret: Mutex::new(secret),
        }
    }
}

impl SecretStore for MemorySecretStore {
    fn load(&self) -> Result<Option<EncryptedSecret>> {
        let secret = self
            .secret
            .lock()
            .map_err(|_| anyhow!("secret store lock poisoned"))?;
        Ok(secret.clone())
    }

    fn store(&self, update: SecretUpdate) -> Result<()> {
        let mut secret = self
            .secret
            .lock()
            .map_err(|_| anyhow!("secret store lock poisoned"))?;
        *secret = match update {
            SecretUpdate::Replace(new) => Some(new),
            SecretUpdate::Clear => None,
        };
        Ok(())
    }
}
