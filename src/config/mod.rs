//! Configuration system (layered: code > env > config file).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::Deserialize;

use crate::error::{CanopyError, Result};

/// Environment variable overriding the agent state directory.
pub const AGENT_DIR_ENV: &str = "CANOPY_AGENT_DIR";

/// Layered configuration for Canopy.
///
/// Resolution order for API keys:
/// 1. Explicit keys (`set_api_key`)
/// 2. Environment variables (loaded by [`CanopyConfig::from_env`])
/// 3. `config.toml` in the agent directory
#[derive(Clone, Default)]
pub struct CanopyConfig {
    api_keys: Arc<RwLock<HashMap<String, String>>>,
    base_urls: Arc<RwLock<HashMap<String, String>>>,
    agent_dir: Option<PathBuf>,
}

impl std::fmt::Debug for CanopyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanopyConfig")
            .field("agent_dir", &self.agent_dir)
            .finish_non_exhaustive()
    }
}

/// Shape of `config.toml`.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    api_keys: HashMap<String, String>,
    #[serde(default)]
    base_urls: HashMap<String, String>,
}

impl CanopyConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from environment variables and `config.toml` (if present).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        let config = Self::new();

        let env_mappings = [
            ("ANTHROPIC_API_KEY", "anthropic"),
            ("OPENAI_API_KEY", "openai"),
            ("GOOGLE_API_KEY", "google"),
            ("GEMINI_API_KEY", "google"),
            ("XAI_API_KEY", "grok"),
            ("GROQ_API_KEY", "groq"),
            ("MISTRAL_API_KEY", "mistral"),
        ];
        for (var, provider) in env_mappings {
            if let Ok(value) = std::env::var(var) {
                if !value.trim().is_empty() {
                    config.set_api_key(provider, value.trim());
                }
            }
        }

        if let Ok(file) = config.load_config_file() {
            let mut keys = config.api_keys.write().expect("api_keys lock");
            for (provider, key) in file.api_keys {
                keys.entry(provider).or_insert(key);
            }
            drop(keys);
            let mut urls = config.base_urls.write().expect("base_urls lock");
            for (provider, url) in file.base_urls {
                urls.entry(provider).or_insert(url);
            }
        }

        config
    }

    fn load_config_file(&self) -> Result<ConfigFile> {
        let path = self.agent_dir().join("config.toml");
        if !path.exists() {
            return Ok(ConfigFile::default());
        }
        let raw = std::fs::read_to_string(&path)?;
        toml::from_str(&raw)
            .map_err(|e| CanopyError::Configuration(format!("invalid config.toml: {e}")))
    }

    /// Override the agent state directory (sessions, config file).
    pub fn with_agent_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.agent_dir = Some(dir.into());
        self
    }

    /// Set an explicit API key for a provider.
    pub fn set_api_key(&self, provider: impl Into<String>, key: impl Into<String>) {
        self.api_keys
            .write()
            .expect("api_keys lock")
            .insert(provider.into(), key.into());
    }

    /// Resolve an API key for a provider.
    pub fn get_api_key(&self, provider: &str) -> Option<String> {
        self.api_keys
            .read()
            .expect("api_keys lock")
            .get(provider)
            .cloned()
    }

    /// Set an explicit base URL for a provider.
    pub fn set_base_url(&self, provider: impl Into<String>, url: impl Into<String>) {
        self.base_urls
            .write()
            .expect("base_urls lock")
            .insert(provider.into(), url.into());
    }

    /// Resolve the base URL override for a provider.
    pub fn get_base_url(&self, provider: &str) -> Option<String> {
        self.base_urls
            .read()
            .expect("base_urls lock")
            .get(provider)
            .cloned()
    }

    /// Root directory for agent state.
    ///
    /// `CANOPY_AGENT_DIR` wins, then the configured override, then
    /// `~/.canopy/agent`.
    pub fn agent_dir(&self) -> PathBuf {
        if let Ok(dir) = std::env::var(AGENT_DIR_ENV) {
            if !dir.trim().is_empty() {
                return expand_home(dir.trim());
            }
        }
        if let Some(dir) = &self.agent_dir {
            return dir.clone();
        }
        default_agent_dir()
    }

    /// Directory holding per-project session subdirectories.
    pub fn sessions_dir(&self) -> PathBuf {
        self.agent_dir().join("sessions")
    }
}

fn default_agent_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".canopy").join("agent"))
        .unwrap_or_else(|| PathBuf::from(".canopy/agent"))
}

fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(dirs) = directories::BaseDirs::new() {
            return dirs.home_dir().to_path_buf();
        }
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(dirs) = directories::BaseDirs::new() {
            return dirs.home_dir().join(rest);
        }
    }
    PathBuf::from(path)
}
