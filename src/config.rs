//! TOML configuration.
//!
//! Only `[db]` is required; every other section falls back to defaults.
//! See `config/wm.example.toml` for a complete file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub diff_service: DiffServiceConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub triage: TriageConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root of the content-addressed diff payload store.
    #[serde(default = "default_payload_dir")]
    pub payload_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            payload_dir: default_payload_dir(),
        }
    }
}

fn default_payload_dir() -> PathBuf {
    PathBuf::from("./data/diffs")
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiffServiceConfig {
    #[serde(default = "default_diff_url")]
    pub url: String,
    /// Environment variable holding the API key sent as `x-api-key`.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Recorded as the `source_type` of every Diff.
    #[serde(default = "default_source_type")]
    pub source_type: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for DiffServiceConfig {
    fn default() -> Self {
        Self {
            url: default_diff_url(),
            api_key_env: None,
            source_type: default_source_type(),
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

fn default_diff_url() -> String {
    "https://api1.pagefreezer.com/v1/api/utils/diff/compare".to_string()
}
fn default_source_type() -> String {
    "pagefreezer".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_attempts() -> u32 {
    4
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_max_ms() -> u64 {
    32_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Concurrent diff workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Failed pops a Version may accumulate before it is dead-lettered.
    #[serde(default = "default_requeue_limit")]
    pub requeue_limit: u32,
    /// Sleep between passes in `wm watch`.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            requeue_limit: default_requeue_limit(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_requeue_limit() -> u32 {
    3
}
fn default_poll_interval_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct TriageConfig {
    /// `constant` or `change_size`.
    #[serde(default = "default_scorer")]
    pub scorer: String,
    /// Priority assigned by the `constant` scorer.
    #[serde(default)]
    pub constant: f64,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            scorer: default_scorer(),
            constant: 0.0,
        }
    }
}

fn default_scorer() -> String {
    "constant".to_string()
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
    "127.0.0.1:7341".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.diff_service.max_attempts == 0 {
        anyhow::bail!("diff_service.max_attempts must be >= 1");
    }
    if config.diff_service.backoff_max_ms < config.diff_service.backoff_base_ms {
        anyhow::bail!("diff_service.backoff_max_ms must be >= diff_service.backoff_base_ms");
    }
    if config.pipeline.workers == 0 {
        anyhow::bail!("pipeline.workers must be >= 1");
    }
    if config.pipeline.requeue_limit == 0 {
        anyhow::bail!("pipeline.requeue_limit must be >= 1");
    }

    match config.triage.scorer.as_str() {
        "constant" | "change_size" => {}
        other => anyhow::bail!(
            "Unknown triage scorer: '{}'. Must be constant or change_size.",
            other
        ),
    }
    if !config.triage.constant.is_finite() {
        anyhow::bail!("triage.constant must be a finite number");
    }

    Ok(config)
}
