//! Configuration for the engine and the `todo-batch` host.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`<config_dir>/todo-batch/config.toml`)
//! 4. Compiled defaults

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bulk::MAX_BULK_TASKS;
use crate::command::MAX_BATCH_SIZE;
use crate::ratelimit::DEFAULT_LOW_WATER_MARK;
use crate::retry::RetryPolicy;

const DEFAULT_BASE_URL: &str = "https://api.todoist.com/api/v1";
const MAX_DEADLINE_SECS: u64 = 24 * 60 * 60;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    #[error("{field} = {value} is out of range, expected {expected}")]
    OutOfRange {
        field: &'static str,
        value: u64,
        expected: &'static str,
    },
}

/// Limits and policies the engine runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Commands per batch, 1..=100.
    pub max_batch_size: usize,
    /// Unique task ids per bulk request, 1..=50.
    pub max_bulk_tasks: usize,
    /// Per-task calls in flight at once during a bulk request.
    pub max_concurrency: usize,
    /// Overall budget for one invocation, waits and retries included.
    pub deadline: Duration,
    pub low_water_mark: u32,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_batch_size: MAX_BATCH_SIZE,
            max_bulk_tasks: MAX_BULK_TASKS,
            max_concurrency: 5,
            deadline: Duration::from_secs(60),
            low_water_mark: DEFAULT_LOW_WATER_MARK,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Rejects values the engine cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range(
            "max_batch_size",
            self.max_batch_size as u64,
            1,
            MAX_BATCH_SIZE as u64,
            "1..=100",
        )?;
        check_range(
            "max_bulk_tasks",
            self.max_bulk_tasks as u64,
            1,
            MAX_BULK_TASKS as u64,
            "1..=50",
        )?;
        check_range("max_concurrency", self.max_concurrency as u64, 1, u64::MAX, ">= 1")?;
        check_range("max_attempts", u64::from(self.retry.max_attempts), 1, u64::MAX, ">= 1")?;
        check_range(
            "deadline_secs",
            self.deadline.as_secs(),
            1,
            MAX_DEADLINE_SECS,
            "1..=86400",
        )?;
        Ok(())
    }
}

fn check_range(
    field: &'static str,
    value: u64,
    min: u64,
    max: u64,
    expected: &'static str,
) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            expected,
        })
    }
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    upstream: UpstreamFileConfig,
    batch: BatchFileConfig,
    bulk: BulkFileConfig,
    retry: RetryFileConfig,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct UpstreamFileConfig {
    base_url: Option<String>,
    token: Option<String>,
    timeout_secs: Option<u64>,
    deadline_secs: Option<u64>,
    low_water_mark: Option<u32>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct BatchFileConfig {
    max_batch_size: Option<usize>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct BulkFileConfig {
    max_tasks: Option<usize>,
    max_concurrency: Option<usize>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RetryFileConfig {
    max_attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    respect_retry_after: Option<bool>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// Global flags shared by every `todo-batch` subcommand.
#[derive(clap::Args, Debug, Default)]
pub struct CliArgs {
    /// Base URL of the upstream API.
    #[arg(long, global = true, env = "TODO_BATCH_BASE_URL")]
    pub base_url: Option<String>,

    /// API token sent as a bearer token.
    #[arg(long, global = true, env = "TODOIST_API_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Path to config file (default: `<config_dir>/todo-batch/config.toml`).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Maximum per-task calls in flight during a bulk request.
    #[arg(long, global = true)]
    pub max_concurrency: Option<usize>,

    /// Total attempts per upstream call when rate limited.
    #[arg(long, global = true)]
    pub max_attempts: Option<u32>,

    /// Overall deadline for one invocation, in seconds.
    #[arg(long, global = true)]
    pub deadline_secs: Option<u64>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info", env = "TODO_BATCH_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved host configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub base_url: String,
    pub token: Option<String>,
    /// Per-request transport timeout.
    pub request_timeout: Duration,
    pub engine: EngineConfig,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token: None,
            request_timeout: Duration::from_secs(30),
            engine: EngineConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and a missing file
    /// is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read or
    /// parsed, or a resolved limit is out of range.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let config = Self::resolve(cli, &file);
        config.engine.validate()?;
        Ok(config)
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let engine = defaults.engine;
        let retry = engine.retry;

        Self {
            base_url: cli
                .base_url
                .clone()
                .or_else(|| file.upstream.base_url.clone())
                .unwrap_or(defaults.base_url),
            token: cli.token.clone().or_else(|| file.upstream.token.clone()),
            request_timeout: file
                .upstream
                .timeout_secs
                .map_or(defaults.request_timeout, Duration::from_secs),
            engine: EngineConfig {
                max_batch_size: file.batch.max_batch_size.unwrap_or(engine.max_batch_size),
                max_bulk_tasks: file.bulk.max_tasks.unwrap_or(engine.max_bulk_tasks),
                max_concurrency: cli
                    .max_concurrency
                    .or(file.bulk.max_concurrency)
                    .unwrap_or(engine.max_concurrency),
                deadline: cli
                    .deadline_secs
                    .or(file.upstream.deadline_secs)
                    .map_or(engine.deadline, Duration::from_secs),
                low_water_mark: file.upstream.low_water_mark.unwrap_or(engine.low_water_mark),
                retry: RetryPolicy {
                    max_attempts: cli
                        .max_attempts
                        .or(file.retry.max_attempts)
                        .unwrap_or(retry.max_attempts),
                    base_delay: file
                        .retry
                        .base_delay_ms
                        .map_or(retry.base_delay, Duration::from_millis),
                    max_delay: file
                        .retry
                        .max_delay_ms
                        .map_or(retry.max_delay, Duration::from_millis),
                    respect_retry_after: file
                        .retry
                        .respect_retry_after
                        .unwrap_or(retry.respect_retry_after),
                },
            },
            log_level: cli.log_level.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn load_config_file(explicit_path: Option<&Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("todo-batch").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
