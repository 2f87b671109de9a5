use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connection::{Endpoint, RetryPolicy};
use crate::multiplexer::RequestTimeouts;
use crate::predictor::DEFAULT_MAX_CANDIDATES;

pub const DEFAULT_PORT: u16 = 49201;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub companion: CompanionConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub requests: RequestsConfig,
    #[serde(default)]
    pub predictor: PredictorConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub state: StateConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompanionConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: DEFAULT_PORT,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConnectionConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    5
}
fn default_retry_delay_ms() -> u64 {
    2000
}
fn default_connect_timeout_ms() -> u64 {
    1000
}
fn default_settle_delay_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct RequestsConfig {
    #[serde(default = "default_file_timeout_secs")]
    pub file_timeout_secs: u64,
    #[serde(default = "default_apply_timeout_secs")]
    pub apply_timeout_secs: u64,
    #[serde(default = "default_file_timeout_secs")]
    pub list_timeout_secs: u64,
}

impl Default for RequestsConfig {
    fn default() -> Self {
        Self {
            file_timeout_secs: default_file_timeout_secs(),
            apply_timeout_secs: default_apply_timeout_secs(),
            list_timeout_secs: default_file_timeout_secs(),
        }
    }
}

fn default_file_timeout_secs() -> u64 {
    10
}
fn default_apply_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct PredictorConfig {
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            max_candidates: DEFAULT_MAX_CANDIDATES,
        }
    }
}

fn default_max_candidates() -> usize {
    DEFAULT_MAX_CANDIDATES
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7332".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StateConfig {
    /// Directory for the persisted file list and port setting. Persistence
    /// is off when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Config {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.companion.host.clone(), self.companion.port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.connection.max_retries,
            retry_delay: Duration::from_millis(self.connection.retry_delay_ms),
            connect_timeout: Duration::from_millis(self.connection.connect_timeout_ms),
            settle_delay: Duration::from_millis(self.connection.settle_delay_ms),
        }
    }

    pub fn request_timeouts(&self) -> RequestTimeouts {
        RequestTimeouts {
            file_list: Duration::from_secs(self.requests.list_timeout_secs),
            file_contents: Duration::from_secs(self.requests.file_timeout_secs),
            diff_apply: Duration::from_secs(self.requests.apply_timeout_secs),
        }
    }
}

/// Load and validate a config file. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = parse_config(&content)?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.companion.host.trim().is_empty() {
        anyhow::bail!("companion.host must not be empty");
    }
    if config.companion.port == 0 {
        anyhow::bail!("companion.port must be > 0");
    }

    // Retry policy must stay bounded
    if config.connection.connect_timeout_ms == 0 {
        anyhow::bail!("connection.connect_timeout_ms must be > 0");
    }

    if config.requests.file_timeout_secs == 0
        || config.requests.apply_timeout_secs == 0
        || config.requests.list_timeout_secs == 0
    {
        anyhow::bail!("requests timeouts must be > 0");
    }

    // Can only lower the corpus cap
    if !(1..=DEFAULT_MAX_CANDIDATES).contains(&config.predictor.max_candidates) {
        anyhow::bail!(
            "predictor.max_candidates must be between 1 and {}",
            DEFAULT_MAX_CANDIDATES
        );
    }

    Ok(())
}
