//! Application configuration
//!
//! Loaded from `config/<env>.yaml`; command-line flags and environment
//! variables override the connection settings afterwards.

use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use thiserror::Error;

use crate::reconcile::{PoolConfig, SweeperConfig, WorkerConfig};

/// Storage and accrual calls a single tick can make in the worst case:
/// acquire, poll, status write, ledger write, delete, release.
pub const MAX_CALLS_PER_TICK: u32 = 6;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub log: LogConfig,
    pub database: DatabaseConfig,
    pub accrual: AccrualConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LogConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    /// `never`, `hourly` or `daily`
    pub rotation: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "./logs".to_string(),
            log_file: "gophermart.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AccrualConfig {
    /// Base URL of the accrual service, e.g. `http://localhost:8080`
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    5000
}

impl AccrualConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ReconcileConfig {
    pub workers: usize,
    pub tick_interval_ms: u64,
    pub rate_limit_cooldown_ms: u64,
    /// Cap on a `Retry-After` requested cooldown
    pub max_rate_limit_cooldown_ms: u64,
    pub call_timeout_ms: u64,
    pub lock_lease_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            tick_interval_ms: 1000,
            rate_limit_cooldown_ms: 5000,
            max_rate_limit_cooldown_ms: 60_000,
            call_timeout_ms: 5000,
            lock_lease_ms: 60_000,
            sweep_interval_ms: 30_000,
        }
    }
}

/// Values taken from the command line or environment
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub database_url: Option<String>,
    pub accrual_address: Option<String>,
    pub workers: Option<usize>,
}

impl AppConfig {
    /// Load `config/<env>.yaml`
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        Self::from_file(&format!("config/{}.yaml", env))
    }

    /// Load configuration from YAML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Apply command-line/environment values on top of the file
    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        if let Some(url) = overrides.database_url.filter(|u| !u.is_empty()) {
            self.database.url = url;
        }
        if let Some(address) = overrides.accrual_address.filter(|a| !a.is_empty()) {
            self.accrual.address = address;
        }
        if let Some(workers) = overrides.workers {
            self.reconcile.workers = workers;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::Invalid("database.url is required".into()));
        }
        if self.accrual.address.trim().is_empty() {
            return Err(ConfigError::Invalid("accrual.address is required".into()));
        }

        let r = &self.reconcile;
        if r.workers == 0 {
            return Err(ConfigError::Invalid("reconcile.workers must be > 0".into()));
        }
        if r.tick_interval_ms == 0 || r.call_timeout_ms == 0 || r.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "reconcile intervals and timeouts must be > 0".into(),
            ));
        }

        if r.max_rate_limit_cooldown_ms < r.rate_limit_cooldown_ms {
            return Err(ConfigError::Invalid(format!(
                "reconcile.max_rate_limit_cooldown_ms ({}) must be >= rate_limit_cooldown_ms ({})",
                r.max_rate_limit_cooldown_ms, r.rate_limit_cooldown_ms
            )));
        }

        // A live claim must never look abandoned to the sweeper
        let worst_tick_ms = r.call_timeout_ms * u64::from(MAX_CALLS_PER_TICK);
        if r.lock_lease_ms <= worst_tick_ms {
            return Err(ConfigError::Invalid(format!(
                "reconcile.lock_lease_ms ({}) must exceed the worst-case tick ({} ms)",
                r.lock_lease_ms, worst_tick_ms
            )));
        }

        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        let r = &self.reconcile;
        PoolConfig {
            workers: r.workers,
            worker: WorkerConfig {
                tick_interval: Duration::from_millis(r.tick_interval_ms),
                rate_limit_cooldown: Duration::from_millis(r.rate_limit_cooldown_ms),
                max_rate_limit_cooldown: Duration::from_millis(r.max_rate_limit_cooldown_ms),
                call_timeout: Duration::from_millis(r.call_timeout_ms),
            },
            sweeper: SweeperConfig {
                sweep_interval: Duration::from_millis(r.sweep_interval_ms),
                lock_lease: Duration::from_millis(r.lock_lease_ms),
            },
        }
    }
}
