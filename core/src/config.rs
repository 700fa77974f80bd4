use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::CoreError;
use crate::Result;

pub const HOME_ENV_VAR: &str = "PDH_HOME";
pub const PORT_ENV_VAR: &str = "PORT";
const CONFIG_FILENAME: &str = "config.toml";

/// Application configuration.
///
/// Loaded from `config.toml` under the data home; every field has a default
/// so a missing file yields a working setup. The loaded value is passed down
/// explicitly — nothing reads configuration from globals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root for per-source databases: `<storage_root>/<source>/<source>.db`.
    pub storage_root: PathBuf,
    /// Root for persisted component state: `<state_root>/state/<component>.json`.
    pub state_root: PathBuf,
    pub download: DownloadConfig,
    pub pool: PoolConfig,
    pub retry: RetryConfig,
    pub server: ServerConfig,
    /// Terminal jobs older than this many hours are eligible for cleanup.
    pub job_retention_hours: u64,
    /// Backups kept under `<state_root>/state/backups`.
    pub max_backups: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Ids fetched per ledger range.
    pub batch_size: i64,
    /// Requests allowed per `rate_interval_secs`.
    pub rate_limit: u32,
    pub rate_interval_secs: u64,
    pub http_timeout_secs: u64,
    /// Ranges at least this dense are skipped during reconciliation.
    pub density_skip_threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub initial_workers: usize,
    /// Zero means unbounded: submissions never see backpressure.
    pub queue_capacity: usize,
    pub autoscale: bool,
    pub autoscale_cadence_secs: u64,
    pub autoscale_cooldown_secs: u64,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        let home = data_home();
        Self {
            storage_root: home.join("storage"),
            state_root: home.clone(),
            download: DownloadConfig::default(),
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
            server: ServerConfig::default(),
            job_retention_hours: 24,
            max_backups: 5,
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            rate_limit: 10,
            rate_interval_secs: 1,
            http_timeout_secs: 30,
            density_skip_threshold: 0.9,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 8,
            initial_workers: 2,
            queue_capacity: 0,
            autoscale: false,
            autoscale_cadence_secs: 10,
            autoscale_cooldown_secs: 30,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            backoff_factor: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

/// Data home: `$PDH_HOME` if set, else `~/.pubdatahub`.
pub fn data_home() -> PathBuf {
    if let Ok(home) = std::env::var(HOME_ENV_VAR)
        && !home.is_empty()
    {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pubdatahub")
}

impl Config {
    /// Load from `path` (or `<data_home>/config.toml`), falling back to
    /// defaults when the file does not exist. `PORT` overrides the HTTP
    /// port either way.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| data_home().join(CONFIG_FILENAME));
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            toml::from_str(&raw)
                .map_err(|err| CoreError::validation(format!("invalid config {}: {err}", path.display())))?
        } else {
            Self::default()
        };
        if let Ok(port) = std::env::var(PORT_ENV_VAR)
            && let Ok(port) = port.parse::<u16>()
        {
            config.server.port = port;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = toml::to_string_pretty(self)
            .map_err(|err| CoreError::validation(format!("failed to encode config: {err}")))?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    pub fn config_path(&self) -> PathBuf {
        data_home().join(CONFIG_FILENAME)
    }

    pub fn validate(&self) -> Result<()> {
        if self.download.batch_size < 1 {
            return Err(CoreError::validation("download.batch_size must be >= 1"));
        }
        if self.download.rate_limit == 0 {
            return Err(CoreError::validation("download.rate_limit must be >= 1"));
        }
        if self.download.rate_interval_secs == 0 {
            return Err(CoreError::validation(
                "download.rate_interval_secs must be >= 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.download.density_skip_threshold) {
            return Err(CoreError::validation(
                "download.density_skip_threshold must be within [0, 1]",
            ));
        }
        if self.pool.max_workers == 0 {
            return Err(CoreError::validation("pool.max_workers must be >= 1"));
        }
        if self.pool.min_workers > self.pool.max_workers {
            return Err(CoreError::validation(
                "pool.min_workers must not exceed pool.max_workers",
            ));
        }
        if !(self.pool.min_workers..=self.pool.max_workers).contains(&self.pool.initial_workers) {
            return Err(CoreError::validation(
                "pool.initial_workers must lie within [min_workers, max_workers]",
            ));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(CoreError::validation("retry.backoff_factor must be >= 1"));
        }
        Ok(())
    }
}
