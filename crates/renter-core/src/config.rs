//! Renter configuration
//!
//! Loaded from TOML, then overridden from the environment:
//!
//! ```toml
//! [memory]
//! download_budget = 1073741824
//!
//! [download]
//! overdrive = 3
//!
//! [log]
//! level = "debug"
//! directives = ["renter_core::worker=trace"]
//! ```

use std::path::Path;
use std::time::Duration;

use renter_ec::ErasureScheme;
use renter_telemetry::{LogConfig, LogLevel};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const GIB: u64 = 1 << 30;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Environment variable error
    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

/// Memory budgets, one manager per traffic class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub download_budget: u64,
    pub upload_budget: u64,
    pub repair_budget: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            download_budget: GIB,
            upload_budget: GIB,
            repair_budget: GIB,
        }
    }
}

/// Per-worker execution limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Async jobs a worker runs concurrently alongside its serial job
    pub max_async_jobs: usize,
    /// Consecutive upload failures before the worker cools down
    pub upload_failure_cooldown_threshold: u32,
    /// First cooldown, doubled per further failure
    pub upload_cooldown_base_ms: u64,
    /// Cooldown ceiling
    pub upload_cooldown_max_secs: u64,
    /// Smoothing factor of the read latency average
    pub latency_ema_alpha: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_async_jobs: 8,
            upload_failure_cooldown_threshold: 3,
            upload_cooldown_base_ms: 1_000,
            upload_cooldown_max_secs: 600,
            latency_ema_alpha: 0.2,
        }
    }
}

impl WorkerConfig {
    pub fn upload_cooldown_base(&self) -> Duration {
        Duration::from_millis(self.upload_cooldown_base_ms)
    }

    pub fn upload_cooldown_max(&self) -> Duration {
        Duration::from_secs(self.upload_cooldown_max_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Extra piece fetches launched beyond `k`
    pub overdrive: usize,
    /// Workers allowed to fetch the same piece at once
    pub piece_redundancy: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            overdrive: 2,
            piece_redundancy: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Data pieces of new uploads
    pub data_pieces: usize,
    /// Parity pieces of new uploads
    pub parity_pieces: usize,
    /// Chunk size of new uploads, in bytes
    pub chunk_size: u64,
}

impl UploadConfig {
    /// Erasure scheme for new uploads
    pub fn scheme(&self) -> renter_ec::Result<ErasureScheme> {
        ErasureScheme::new(self.data_pieces, self.parity_pieces)
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            data_pieces: 10,
            parity_pieces: 20,
            chunk_size: 40 * (1 << 20),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Seconds between full health checks of a directory
    pub check_interval_secs: u64,
    /// Files a single health pass may refresh
    pub max_files_per_check: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 3_600,
            max_files_per_check: 100,
        }
    }
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Chunk health at or above which a repair is queued
    pub threshold: f64,
    /// Chunks the upload heap holds at once
    pub max_upload_heap_chunks: usize,
    /// Concurrent chunk repairs
    pub max_concurrent_repairs: usize,
    /// Seconds the repair loop idles when there is nothing to do
    pub idle_interval_secs: u64,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            threshold: 0.25,
            max_upload_heap_chunks: 250,
            max_concurrent_repairs: 16,
            idle_interval_secs: 900,
        }
    }
}

impl RepairConfig {
    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.idle_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StuckConfig {
    /// Stuck chunks allowed in the upload heap at once
    pub max_stuck_chunks_in_heap: usize,
    /// Randomly chosen stuck chunks added per cycle
    pub max_random_stuck_chunks_add_to_heap: usize,
    /// Capacity of the recent-success stack
    pub max_successful_stuck_repair_files: usize,
    /// Seconds between stuck loop cycles
    pub interval_secs: u64,
}

impl Default for StuckConfig {
    fn default() -> Self {
        Self {
            max_stuck_chunks_in_heap: 25,
            max_random_stuck_chunks_add_to_heap: 5,
            max_successful_stuck_repair_files: 10,
            interval_secs: 600,
        }
    }
}

impl StuckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Complete renter configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenterConfig {
    pub memory: MemoryConfig,
    pub worker: WorkerConfig,
    pub download: DownloadConfig,
    pub upload: UploadConfig,
    pub health: HealthConfig,
    pub repair: RepairConfig,
    pub stuck: StuckConfig,
    pub log: LogConfig,
}

impl RenterConfig {
    /// Parse a TOML document; missing sections take their defaults
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from a file, apply environment overrides and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize back to TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Override fields from `RENTER_*` environment variables
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("RENTER_MEMORY_DOWNLOAD_BUDGET") {
            self.memory.download_budget = parse_env("RENTER_MEMORY_DOWNLOAD_BUDGET", &v)?;
        }
        if let Some(v) = lookup("RENTER_MEMORY_UPLOAD_BUDGET") {
            self.memory.upload_budget = parse_env("RENTER_MEMORY_UPLOAD_BUDGET", &v)?;
        }
        if let Some(v) = lookup("RENTER_MEMORY_REPAIR_BUDGET") {
            self.memory.repair_budget = parse_env("RENTER_MEMORY_REPAIR_BUDGET", &v)?;
        }
        if let Some(v) = lookup("RENTER_DOWNLOAD_OVERDRIVE") {
            self.download.overdrive = parse_env("RENTER_DOWNLOAD_OVERDRIVE", &v)?;
        }
        if let Some(v) = lookup("RENTER_LOG_LEVEL") {
            self.log.level = parse_env::<LogLevel>("RENTER_LOG_LEVEL", &v)?;
        }
        Ok(())
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.memory;
        if m.download_budget == 0 || m.upload_budget == 0 || m.repair_budget == 0 {
            return Err(ConfigError::Validation(
                "memory budgets must be non-zero".into(),
            ));
        }
        if self.worker.max_async_jobs == 0 {
            return Err(ConfigError::Validation(
                "worker.max_async_jobs must be at least 1".into(),
            ));
        }
        if !(self.worker.latency_ema_alpha > 0.0 && self.worker.latency_ema_alpha <= 1.0) {
            return Err(ConfigError::Validation(
                "worker.latency_ema_alpha must be in (0, 1]".into(),
            ));
        }
        if self.download.piece_redundancy == 0 {
            return Err(ConfigError::Validation(
                "download.piece_redundancy must be at least 1".into(),
            ));
        }
        if self.upload.data_pieces == 0 || self.upload.chunk_size == 0 {
            return Err(ConfigError::Validation(
                "upload.data_pieces and upload.chunk_size must be non-zero".into(),
            ));
        }
        if let Err(e) = self.upload.scheme() {
            return Err(ConfigError::Validation(format!("upload scheme: {}", e)));
        }
        if !(self.repair.threshold > 0.0 && self.repair.threshold <= 1.0) {
            return Err(ConfigError::Validation(
                "repair.threshold must be in (0, 1]".into(),
            ));
        }
        if self.repair.max_upload_heap_chunks == 0 || self.repair.max_concurrent_repairs == 0 {
            return Err(ConfigError::Validation(
                "repair heap size and concurrency must be non-zero".into(),
            ));
        }
        if self.stuck.max_successful_stuck_repair_files == 0 {
            return Err(ConfigError::Validation(
                "stuck.max_successful_stuck_repair_files must be non-zero".into(),
            ));
        }
        if self.health.max_files_per_check == 0 {
            return Err(ConfigError::Validation(
                "health.max_files_per_check must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::EnvVar(format!("{key}: cannot parse {value:?}")))
}
