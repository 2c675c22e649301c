//! Runtime configuration: loading, environment overrides, and derived
//! policies.
//!
//! Lookup order for the config file: `TASKRELAY_CONFIG`, `./taskrelay.json`,
//! then the platform config dir. With no file the built-in defaults apply.
//! Environment variables override whatever the file said.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{
    APP_NAME, CONFIG_FILE_NAME, DEFAULT_API_BASE_URL, DEFAULT_CONTAINER_PATH,
    DEFAULT_POLL_INTERVAL_SECS, DEFAULT_SESSION_RETRY_DELAYS_MS,
};
use crate::util::{env_first, env_parse};

/// Settings shared by the HTTP client, session tracker, and poller.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    pub api_base_url: String,
    pub api_token: Option<String>,
    /// Workspace the runtime keeps session logs under.
    pub container_path: String,
    pub poll_interval_secs: u64,
    /// Delay before each transcript fetch attempt; its length is the retry bound.
    pub session_retry_delays_ms: Vec<u64>,
    /// Opaque settings forwarded on follow-ups (e-mail/IM channels etc.).
    pub notification_settings: Option<Value>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            api_token: None,
            container_path: DEFAULT_CONTAINER_PATH.to_string(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            session_retry_delays_ms: DEFAULT_SESSION_RETRY_DELAYS_MS.to_vec(),
            notification_settings: None,
        }
    }
}

/// Where the configuration was loaded from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    Defaults,
    File(PathBuf),
}

impl ConfigSource {
    pub fn label(&self) -> String {
        match self {
            ConfigSource::Defaults => "built-in defaults".to_string(),
            ConfigSource::File(path) => path.display().to_string(),
        }
    }
}

impl RelayConfig {
    /// Load the config file (if any) and apply environment overrides.
    pub fn load() -> Result<(Self, ConfigSource)> {
        let (mut config, source) = Self::load_file()?;
        config.apply_env();
        Ok((config, source))
    }

    fn load_file() -> Result<(Self, ConfigSource)> {
        if let Ok(path) = env::var("TASKRELAY_CONFIG") {
            let path = PathBuf::from(path);
            return Ok((Self::load_from_path(&path)?, ConfigSource::File(path)));
        }

        let cwd_path = PathBuf::from(CONFIG_FILE_NAME);
        if cwd_path.exists() {
            return Ok((Self::load_from_path(&cwd_path)?, ConfigSource::File(cwd_path)));
        }

        if let Some(config_path) = config_dir_file(CONFIG_FILE_NAME) {
            if config_path.exists() {
                return Ok((
                    Self::load_from_path(&config_path)?,
                    ConfigSource::File(config_path),
                ));
            }
        }

        Ok((Self::default(), ConfigSource::Defaults))
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("read config from {}", path.display()))?;
        let config = serde_json::from_str(&contents)
            .with_context(|| format!("parse config from {}", path.display()))?;
        Ok(config)
    }

    /// Override file values with `TASKRELAY_*` environment variables.
    pub fn apply_env(&mut self) {
        if let Some(url) = env_first(&["TASKRELAY_API_URL", "TASKRELAY_API_BASE"]) {
            self.api_base_url = url;
        }
        if let Some(token) = env_first(&["TASKRELAY_API_TOKEN"]) {
            self.api_token = Some(token);
        }
        if let Some(path) = env_first(&["TASKRELAY_CONTAINER_PATH"]) {
            self.container_path = path;
        }
        if let Some(secs) = env_parse::<u64>(&["TASKRELAY_POLL_SECS"]) {
            self.poll_interval_secs = secs;
        }
    }

    /// Fixed polling interval; never below one second.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.session_retry_delays_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        )
    }
}

fn config_dir_file(filename: &str) -> Option<PathBuf> {
    let proj_dirs = ProjectDirs::from("com", APP_NAME, APP_NAME)?;
    Some(proj_dirs.config_dir().join(filename))
}

// ── Retry policy ─────────────────────────────────────────────────────

/// Bounded backoff for fetching a session that may not be persisted yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl RetryPolicy {
    /// One attempt per delay. An empty list still makes one immediate attempt.
    pub fn new(delays: Vec<Duration>) -> Self {
        if delays.is_empty() {
            return Self {
                delays: vec![Duration::ZERO],
            };
        }
        Self { delays }
    }

    pub fn attempts(&self) -> usize {
        self.delays.len()
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RelayConfig::default().retry_policy()
    }
}
