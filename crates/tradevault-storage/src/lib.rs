//! # TradeVault Storage
//!
//! Resilient single-file SQLite storage: a fixed connection pool, a circuit
//! breaker in front of query execution, query metrics and a bounded result
//! cache, a background health monitor, and verified backups with retention
//! and validated restores.
//!
//! ## Components
//!
//! - [`ConnectionPool`]: fixed set of WAL connections with blocking checkout
//! - [`CircuitBreaker`]: fails fast after consecutive query failures
//! - [`QueryExecutor`]: breaker + pool + metrics + cache around each statement
//! - [`HealthMonitor`]: periodic store checks published as immutable snapshots
//! - [`BackupManager`]: single-flight snapshots, retention, restores
//! - [`StorageService`]: builds and wires everything, owns start/shutdown
//!
//! ## Example
//!
//! ```rust,no_run
//! use tradevault_core::StorageConfig;
//! use tradevault_storage::{NewTrade, StorageService, TradeType};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let service = StorageService::open(StorageConfig::new("data/vault.db", "data/backups"))?;
//!
//! let trade_id = service.record_trade(&NewTrade {
//!     trader: "Aria".into(),
//!     item: "Iron Ore".into(),
//!     previous_quantity: 0,
//!     current_quantity: 12,
//!     price: 3.5,
//!     trade_type: TradeType::Buy,
//! })?;
//!
//! let backup_id = service.create_backup()?;
//! println!("trade {trade_id} stored, backup {backup_id} taken");
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod breaker;
pub mod cache;
pub mod executor;
pub mod metrics;
pub mod migration;
pub mod monitor;
pub mod pool;
pub mod result_store;
pub mod service;
mod sql;
pub mod trades;
pub mod worker;

pub use backup::{BackupManager, BackupMetadata, RestoreReport, ScheduledBackup};
pub use breaker::{CircuitBreaker, CircuitState};
pub use cache::ResultCache;
pub use executor::{FetchMode, QueryExecutor, QueryOptions, QueryResult};
pub use metrics::MetricsRecorder;
pub use monitor::HealthMonitor;
pub use pool::{ConnectionPool, PooledConnection};
pub use result_store::ResultStore;
pub use service::{ShutdownReport, StorageService};
pub use sql::query_hash;
pub use trades::{NewTrade, Trade, TradeLedger, TradeType};
pub use worker::WorkerHandle;

pub use rusqlite::types::Value;
