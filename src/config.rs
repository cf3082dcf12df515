//! Configuration loader and validator for the GitHub sync daemon.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub github: Github,
    #[serde(default)]
    pub sync: Sync,
    #[serde(default)]
    pub queue: Queue,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// GitHub API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Github {
    pub token: String,
    /// Login of the local account the daemon syncs for.
    pub user: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Public URL registered as the webhook callback on owned repos.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// Sync engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sync {
    #[serde(default = "default_freshness_window_ms")]
    pub freshness_window_ms: u64,
    #[serde(default = "default_rate_limit_max_retries")]
    pub rate_limit_max_retries: u32,
    #[serde(default = "default_rate_limit_base_delay_ms")]
    pub rate_limit_base_delay_ms: u64,
    #[serde(default = "default_tx_chunk_size")]
    pub tx_chunk_size: usize,
    #[serde(default = "default_webhook_concurrency")]
    pub webhook_concurrency: usize,
    #[serde(default = "default_pr_concurrency")]
    pub pr_concurrency: usize,
}

/// Webhook queue processor tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Queue {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_loops")]
    pub max_loops: u32,
    #[serde(default = "default_max_run_ms")]
    pub max_run_ms: u64,
    #[serde(default = "default_overfetch_multiplier")]
    pub overfetch_multiplier: usize,
    #[serde(default = "default_stale_timeout_ms")]
    pub stale_timeout_ms: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_api_base() -> String {
    "https://api.github.com/".to_string()
}
fn default_freshness_window_ms() -> u64 {
    5 * 60 * 1000
}
fn default_rate_limit_max_retries() -> u32 {
    3
}
fn default_rate_limit_base_delay_ms() -> u64 {
    1000
}
fn default_tx_chunk_size() -> usize {
    100
}
fn default_webhook_concurrency() -> usize {
    5
}
fn default_pr_concurrency() -> usize {
    5
}
fn default_max_attempts() -> i64 {
    5
}
fn default_base_delay_ms() -> u64 {
    60_000
}
fn default_batch_size() -> usize {
    5
}
fn default_max_loops() -> u32 {
    20
}
fn default_max_run_ms() -> u64 {
    15_000
}
fn default_overfetch_multiplier() -> usize {
    3
}
fn default_stale_timeout_ms() -> u64 {
    10 * 60 * 1000
}

impl Default for Sync {
    fn default() -> Self {
        Self {
            freshness_window_ms: default_freshness_window_ms(),
            rate_limit_max_retries: default_rate_limit_max_retries(),
            rate_limit_base_delay_ms: default_rate_limit_base_delay_ms(),
            tx_chunk_size: default_tx_chunk_size(),
            webhook_concurrency: default_webhook_concurrency(),
            pr_concurrency: default_pr_concurrency(),
        }
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            batch_size: default_batch_size(),
            max_loops: default_max_loops(),
            max_run_ms: default_max_run_ms(),
            overfetch_multiplier: default_overfetch_multiplier(),
            stale_timeout_ms: default_stale_timeout_ms(),
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.bind_addr.trim().is_empty() {
        return Err(ConfigError::Invalid("app.bind_addr must be non-empty"));
    }

    if cfg.github.token.trim().is_empty() {
        return Err(ConfigError::Invalid("github.token must be non-empty"));
    }
    if cfg.github.user.trim().is_empty() {
        return Err(ConfigError::Invalid("github.user must be non-empty"));
    }
    if cfg.github.api_base.trim().is_empty() {
        return Err(ConfigError::Invalid("github.api_base must be non-empty"));
    }

    if cfg.sync.tx_chunk_size == 0 {
        return Err(ConfigError::Invalid("sync.tx_chunk_size must be > 0"));
    }
    if cfg.sync.webhook_concurrency == 0 {
        return Err(ConfigError::Invalid("sync.webhook_concurrency must be > 0"));
    }
    if cfg.sync.pr_concurrency == 0 {
        return Err(ConfigError::Invalid("sync.pr_concurrency must be > 0"));
    }

    if cfg.queue.max_attempts <= 0 {
        return Err(ConfigError::Invalid("queue.max_attempts must be > 0"));
    }
    if cfg.queue.batch_size == 0 {
        return Err(ConfigError::Invalid("queue.batch_size must be > 0"));
    }
    if cfg.queue.overfetch_multiplier == 0 {
        return Err(ConfigError::Invalid("queue.overfetch_multiplier must be > 0"));
    }

    Ok(())
}

/// Example YAML used in docs and tests.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  bind_addr: "0.0.0.0:8080"
  poll_interval_ms: 1000

github:
  token: "YOUR_GITHUB_TOKEN"
  user: "octocat"
  webhook_url: "https://syncd.example.com/webhook"

sync:
  freshness_window_ms: 300000
  rate_limit_max_retries: 3
  rate_limit_base_delay_ms: 1000
  tx_chunk_size: 100
  webhook_concurrency: 5
  pr_concurrency: 5

queue:
  max_attempts: 5
  base_delay_ms: 60000
  batch_size: 5
  max_loops: 20
  max_run_ms: 15000
  overfetch_multiplier: 3
  stale_timeout_ms: 600000
"#
}
