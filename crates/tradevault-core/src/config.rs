//! # Storage Configuration
//!
//! Typed configuration for every storage component. Configuration is loaded
//! from a TOML file (all sections optional, missing fields take defaults),
//! then overridden from the environment, then validated.
//!
//! Durations are written in human-readable form: `"150ms"`, `"5m"`, `"24h"`.
//!
//! ```toml
//! database_path = "data/trades.db"
//!
//! [pool]
//! size = 8
//! acquire_timeout = "5s"
//!
//! [breaker]
//! failure_threshold = 5
//! cooldown = "60s"
//!
//! [backup]
//! directory = "data/backups"
//! max_backups = 10
//! retention_days = 30
//! interval = "24h"
//! ```
//!
//! ## Environment Variables
//!
//! - `TRADEVAULT_DB_PATH` - Path of the SQLite store
//! - `TRADEVAULT_POOL_SIZE` - Number of pooled connections (1-100)
//! - `TRADEVAULT_ACQUIRE_TIMEOUT` - Connection checkout timeout (e.g. `5s`)
//! - `TRADEVAULT_BREAKER_THRESHOLD` - Consecutive failures before the breaker opens
//! - `TRADEVAULT_BREAKER_COOLDOWN` - Time the breaker stays open
//! - `TRADEVAULT_SLOW_QUERY_THRESHOLD` - Warning threshold for query latency
//! - `TRADEVAULT_HEALTH_INTERVAL` - Health check period
//! - `TRADEVAULT_BACKUP_DIR` - Backup directory
//! - `TRADEVAULT_BACKUP_COMPRESS` - Gzip backups (true/false)
//! - `TRADEVAULT_MAX_BACKUPS` - Count-based retention limit
//! - `TRADEVAULT_RETENTION_DAYS` - Age-based retention limit
//! - `TRADEVAULT_BACKUP_INTERVAL` - Auto-backup period

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::database::PoolSize;
use crate::error::ConfigError;

const JOURNAL_MODES: &[&str] = &["DELETE", "TRUNCATE", "PERSIST", "MEMORY", "WAL", "OFF"];
const SYNCHRONOUS_LEVELS: &[&str] = &["OFF", "NORMAL", "FULL", "EXTRA"];

/// Top-level storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub pool: PoolConfig,
    pub breaker: BreakerConfig,
    pub query: QueryConfig,
    pub health: HealthConfig,
    pub backup: BackupConfig,
    pub shutdown: ShutdownConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("tradevault.db"),
            pool: PoolConfig::default(),
            breaker: BreakerConfig::default(),
            query: QueryConfig::default(),
            health: HealthConfig::default(),
            backup: BackupConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

/// Connection pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub size: PoolSize,
    #[serde(with = "humantime_duration")]
    pub acquire_timeout: Duration,
    pub pragmas: PragmaConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: PoolSize::default(),
            acquire_timeout: Duration::from_secs(5),
            pragmas: PragmaConfig::default(),
        }
    }
}

/// Pragmas applied to every connection at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PragmaConfig {
    pub journal_mode: String,
    pub synchronous: String,
    pub cache_size_kb: i64,
    pub mmap_size_bytes: u64,
    #[serde(with = "humantime_duration")]
    pub busy_timeout: Duration,
    pub foreign_keys: bool,
}

impl Default for PragmaConfig {
    fn default() -> Self {
        Self {
            journal_mode: "WAL".to_string(),
            synchronous: "NORMAL".to_string(),
            cache_size_kb: 64 * 1024,
            mmap_size_bytes: 256 * 1024 * 1024,
            busy_timeout: Duration::from_secs(5),
            foreign_keys: true,
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "humantime_duration")]
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Query instrumentation and result cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    #[serde(with = "humantime_duration")]
    pub slow_query_threshold: Duration,
    #[serde(with = "humantime_duration")]
    pub critical_query_threshold: Duration,
    /// Ring buffer capacity for query samples
    pub metrics_capacity: usize,
    /// Slow query alerts kept for inspection
    pub alert_capacity: usize,
    pub cache_capacity: usize,
    /// Minimum number of oldest entries dropped when the cache overflows
    pub cache_eviction_batch: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold: Duration::from_secs(1),
            critical_query_threshold: Duration::from_secs(5),
            metrics_capacity: 1000,
            alert_capacity: 100,
            cache_capacity: 1000,
            cache_eviction_batch: 100,
        }
    }
}

/// Which SQLite integrity pragma the health monitor and backups run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityCheckMode {
    Quick,
    Full,
}

impl IntegrityCheckMode {
    pub fn pragma(&self) -> &'static str {
        match self {
            IntegrityCheckMode::Quick => "quick_check",
            IntegrityCheckMode::Full => "integrity_check",
        }
    }
}

/// Health monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    #[serde(with = "humantime_duration")]
    pub interval: Duration,
    pub min_free_disk_bytes: u64,
    pub integrity_check: IntegrityCheckMode,
    /// Rows kept in the `health_log` table
    pub health_log_retention: usize,
    #[serde(with = "humantime_duration")]
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            min_free_disk_bytes: 100 * 1024 * 1024,
            integrity_check: IntegrityCheckMode::Quick,
            health_log_retention: 1000,
            probe_timeout: Duration::from_secs(2),
        }
    }
}

/// Upper bound for `retention_days`, roughly a century.
pub const MAX_RETENTION_DAYS: u32 = 36_500;

/// Backup scheduling and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub directory: PathBuf,
    pub compress: bool,
    pub max_backups: usize,
    pub retention_days: u32,
    #[serde(with = "humantime_duration")]
    pub interval: Duration,
    pub auto_backup: bool,
    pub backup_on_shutdown: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("backups"),
            compress: true,
            max_backups: 10,
            retention_days: 30,
            interval: Duration::from_secs(24 * 60 * 60),
            auto_backup: true,
            backup_on_shutdown: true,
        }
    }
}

/// Soft timeouts for the shutdown sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    #[serde(with = "humantime_duration")]
    pub drain_timeout: Duration,
    #[serde(with = "humantime_duration")]
    pub worker_join_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(5),
            worker_join_timeout: Duration::from_secs(10),
        }
    }
}

impl StorageConfig {
    /// Configuration for a store at `database_path` with backups in `backup_dir`.
    pub fn new(database_path: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self {
            database_path: database_path.into(),
            ..Default::default()
        };
        config.backup.directory = backup_dir.into();
        config
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        Self::load_from_toml(&content)
    }

    /// Load configuration from a TOML string
    pub fn load_from_toml(toml_content: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply `TRADEVAULT_*` overrides from the process environment.
    pub fn apply_env_overrides(self) -> Result<Self, ConfigError> {
        self.apply_env_overrides_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides using `lookup` as the variable source.
    pub fn apply_env_overrides_with<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("TRADEVAULT_DB_PATH") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(size) = parse_env::<usize, _>(&lookup, "TRADEVAULT_POOL_SIZE")? {
            self.pool.size =
                PoolSize::try_from(size).map_err(|e| ConfigError::InvalidEnvVar {
                    key: "TRADEVAULT_POOL_SIZE".to_string(),
                    message: e.to_string(),
                })?;
        }
        if let Some(timeout) = parse_env_duration(&lookup, "TRADEVAULT_ACQUIRE_TIMEOUT")? {
            self.pool.acquire_timeout = timeout;
        }
        if let Some(threshold) = parse_env::<u32, _>(&lookup, "TRADEVAULT_BREAKER_THRESHOLD")? {
            self.breaker.failure_threshold = threshold;
        }
        if let Some(cooldown) = parse_env_duration(&lookup, "TRADEVAULT_BREAKER_COOLDOWN")? {
            self.breaker.cooldown = cooldown;
        }
        if let Some(slow) = parse_env_duration(&lookup, "TRADEVAULT_SLOW_QUERY_THRESHOLD")? {
            self.query.slow_query_threshold = slow;
        }
        if let Some(interval) = parse_env_duration(&lookup, "TRADEVAULT_HEALTH_INTERVAL")? {
            self.health.interval = interval;
        }
        if let Some(dir) = lookup("TRADEVAULT_BACKUP_DIR") {
            self.backup.directory = PathBuf::from(dir);
        }
        if let Some(compress) = parse_env_bool(&lookup, "TRADEVAULT_BACKUP_COMPRESS")? {
            self.backup.compress = compress;
        }
        if let Some(max) = parse_env::<usize, _>(&lookup, "TRADEVAULT_MAX_BACKUPS")? {
            self.backup.max_backups = max;
        }
        if let Some(days) = parse_env::<u32, _>(&lookup, "TRADEVAULT_RETENTION_DAYS")? {
            self.backup.retention_days = days;
        }
        if let Some(interval) = parse_env_duration(&lookup, "TRADEVAULT_BACKUP_INTERVAL")? {
            self.backup.interval = interval;
        }

        Ok(self)
    }

    /// Validate cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "database_path must not be empty".to_string(),
            ));
        }
        if self.pool.acquire_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "pool.acquire_timeout must be greater than zero".to_string(),
            ));
        }

        let pragmas = &self.pool.pragmas;
        if !JOURNAL_MODES.contains(&pragmas.journal_mode.to_ascii_uppercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "unknown journal_mode '{}'",
                pragmas.journal_mode
            )));
        }
        if !SYNCHRONOUS_LEVELS.contains(&pragmas.synchronous.to_ascii_uppercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "unknown synchronous level '{}'",
                pragmas.synchronous
            )));
        }

        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.breaker.cooldown.is_zero() {
            return Err(ConfigError::Validation(
                "breaker.cooldown must be greater than zero".to_string(),
            ));
        }

        let query = &self.query;
        if query.slow_query_threshold.is_zero() {
            return Err(ConfigError::Validation(
                "query.slow_query_threshold must be greater than zero".to_string(),
            ));
        }
        if query.critical_query_threshold <= query.slow_query_threshold {
            return Err(ConfigError::Validation(
                "query.critical_query_threshold must exceed slow_query_threshold".to_string(),
            ));
        }
        if query.metrics_capacity == 0 || query.cache_capacity == 0 || query.alert_capacity == 0
        {
            return Err(ConfigError::Validation(
                "query capacities must be at least 1".to_string(),
            ));
        }
        if query.cache_eviction_batch == 0 || query.cache_eviction_batch > query.cache_capacity {
            return Err(ConfigError::Validation(format!(
                "query.cache_eviction_batch must be 1-{}",
                query.cache_capacity
            )));
        }

        if self.health.interval.is_zero() || self.health.probe_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "health intervals must be greater than zero".to_string(),
            ));
        }

        let backup = &self.backup;
        if backup.directory.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "backup.directory must not be empty".to_string(),
            ));
        }
        if backup.max_backups == 0 {
            return Err(ConfigError::Validation(
                "backup.max_backups must be at least 1".to_string(),
            ));
        }
        if !(1..=MAX_RETENTION_DAYS).contains(&backup.retention_days) {
            return Err(ConfigError::Validation(format!(
                "backup.retention_days must be between 1 and {MAX_RETENTION_DAYS}"
            )));
        }
        if backup.interval.is_zero() {
            return Err(ConfigError::Validation(
                "backup.interval must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_env<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(val) => val
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!("invalid value '{val}': {e}"),
            }),
        None => Ok(None),
    }
}

fn parse_env_duration<F>(lookup: &F, key: &str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(val) => humantime::parse_duration(val.trim())
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!("invalid duration '{val}': {e}"),
            }),
        None => Ok(None),
    }
}

fn parse_env_bool<F>(lookup: &F, key: &str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(val) => match val.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!(
                    "invalid boolean value '{val}', expected true/false/1/0/yes/no/on/off"
                ),
            }),
        },
        None => Ok(None),
    }
}

/// Serde adapter for durations written as `"5s"`, `"24h"`, `"150ms"`.
mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
