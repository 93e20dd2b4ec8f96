use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::poll::{RetryPolicy, DEFAULT_POLL_INTERVAL, DEFAULT_TIMEOUT};
use crate::storage::MessageEncoding;

pub const CONFIG_FILENAME: &str = ".functions-e2e.toml";

pub const STORAGE_ENV: &str = "AzureWebJobsStorage";
pub const HOST_URL_ENV: &str = "FUNCTIONS_E2E_HOST_URL";
pub const FUNCTION_KEY_ENV: &str = "FUNCTIONS_E2E_FUNCTION_KEY";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub host: HostConfig,
    pub poll: PollConfig,
    pub resources: ResourceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub connection_string: String,
    /// `base64` (the functions runtime default) or `plain`.
    pub message_encoding: MessageEncoding,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            connection_string: "UseDevelopmentStorage=true".to_string(),
            message_encoding: MessageEncoding::default(),
        }
    }
}

/// Where the function host listens and how to launch it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub base_url: String,
    pub function_key: Option<String>,
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Log line that marks the host as ready to process triggers.
    pub ready_line: String,
    /// Extra environment for the host process.
    pub env: BTreeMap<String, String>,
    pub startup_timeout_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:7071".to_string(),
            function_key: None,
            command: "func".to_string(),
            args: vec!["start".to_string(), "--port".to_string(), "7071".to_string()],
            working_dir: None,
            ready_line: "Host lock lease acquired".to_string(),
            env: BTreeMap::new(),
            startup_timeout_ms: 120_000,
        }
    }
}

impl HostConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub timeout_ms: u64,
    pub interval_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

impl PollConfig {
    pub fn policy(&self) -> Result<RetryPolicy> {
        RetryPolicy::from_millis(self.timeout_ms, self.interval_ms)
            .map_err(anyhow::Error::msg)
            .context("invalid [poll] settings")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Appended to every queue and container name, e.g. `test-input-{suffix}`.
    pub suffix: String,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            suffix: "rust".to_string(),
        }
    }
}

impl Config {
    /// Load from `path`, or defaults when the file does not exist. Environment
    /// overrides are applied either way.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(CONFIG_FILENAME));
        let mut config = if path.exists() {
            load_config_from_path(path)?
        } else {
            Config::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write {}", path.as_ref().display()))?;
        Ok(())
    }

    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| var(key).filter(|v| !v.trim().is_empty());
        if let Some(connection_string) = non_empty(STORAGE_ENV) {
            self.storage.connection_string = connection_string;
        }
        if let Some(url) = non_empty(HOST_URL_ENV) {
            self.host.base_url = url;
        }
        if let Some(key) = non_empty(FUNCTION_KEY_ENV) {
            self.host.function_key = Some(key);
        }
    }
}

pub fn load_config_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.as_ref().display()))?;
    Ok(config)
}
