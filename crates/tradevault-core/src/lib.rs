//! # TradeVault Core
//!
//! Backend-agnostic types shared by the TradeVault storage layer:
//!
//! - [`error`]: the storage error taxonomy and its retry classification
//! - [`config`]: typed, validated configuration loaded from TOML and the environment
//! - [`database`]: validated newtypes such as [`database::PoolSize`]
//! - [`health`]: immutable health snapshots produced by the health monitor
//! - [`metrics`]: query samples, latency classes and rolling statistics
//!
//! The SQLite implementation lives in `tradevault-storage`.

pub mod config;
pub mod database;
pub mod error;
pub mod health;
pub mod metrics;

pub use config::StorageConfig;
pub use error::{ConfigError, ErrorClass, StorageError, StorageResult};
pub use health::HealthStatus;
pub use metrics::{QueryMetrics, StatementType};
