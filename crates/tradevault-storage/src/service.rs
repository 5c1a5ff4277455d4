//! Composition root for the storage layer.
//!
//! [`StorageService::open`] builds every component explicitly and wires them
//! together; nothing is looked up through globals. Background work only runs
//! after [`StorageService::start`], and [`StorageService::shutdown`] tears it
//! down in a fixed order with soft timeouts.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rusqlite::types::Value;
use tracing::{info, warn};

use tradevault_core::config::StorageConfig;
use tradevault_core::error::{StorageError, StorageResult};
use tradevault_core::health::{HealthStatus, PoolStatistics};
use tradevault_core::metrics::QueryStats;

use crate::backup::{BackupManager, BackupMetadata, RestoreReport, ScheduledBackup};
use crate::breaker::CircuitBreaker;
use crate::executor::{QueryExecutor, QueryOptions, QueryResult};
use crate::metrics::MetricsRecorder;
use crate::migration::MigrationEngine;
use crate::monitor::HealthMonitor;
use crate::pool::ConnectionPool;
use crate::result_store::ResultStore;
use crate::trades::{NewTrade, TradeLedger};
use crate::worker::WorkerHandle;

/// What [`StorageService::shutdown`] managed to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every checked-out connection came back within the drain timeout.
    pub drained: bool,
    pub workers_stopped: usize,
    pub workers_abandoned: usize,
    pub connections_closed: usize,
    /// `None` when shutdown backups are disabled.
    pub final_backup: Option<ScheduledBackup>,
}

pub struct StorageService {
    config: StorageConfig,
    pool: Arc<ConnectionPool>,
    executor: Arc<QueryExecutor>,
    monitor: Arc<HealthMonitor>,
    backups: Arc<BackupManager>,
    ledger: TradeLedger,
    results: ResultStore,
    workers: Mutex<Vec<WorkerHandle>>,
    shut_down: AtomicBool,
}

impl StorageService {
    /// Validate `config`, open the pool, apply migrations and build every
    /// component. No background work is started.
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        config.validate()?;

        if let Some(parent) = config
            .database_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        {
            fs::create_dir_all(parent).map_err(|e| StorageError::io("create data directory", e))?;
        }

        let pool = Arc::new(ConnectionPool::open(&config.database_path, config.pool.clone())?);
        {
            let conn = pool.acquire()?;
            MigrationEngine::new().migrate(&conn)?;
        }

        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        let metrics = Arc::new(MetricsRecorder::new(&config.query));
        let executor = Arc::new(QueryExecutor::new(
            Arc::clone(&pool),
            breaker,
            Arc::clone(&metrics),
            &config.query,
        ));
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&pool),
            metrics,
            config.health.clone(),
        ));
        let backups = Arc::new(BackupManager::new(
            config.backup.clone(),
            Arc::clone(&pool),
            Arc::clone(&monitor),
            config.shutdown.drain_timeout,
        )?);

        info!(
            path = %config.database_path.display(),
            pool_size = config.pool.size.get(),
            backup_dir = %config.backup.directory.display(),
            "Storage service opened"
        );

        Ok(Self {
            ledger: TradeLedger::new(Arc::clone(&executor)),
            results: ResultStore::new(Arc::clone(&executor)),
            config,
            pool,
            executor,
            monitor,
            backups,
            workers: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Spawn the health monitor and, if enabled, the auto-backup loop on the
    /// current tokio runtime. Calling it again is a no-op.
    pub fn start(&self) -> StorageResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(StorageError::ShuttingDown);
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(StorageError::InvalidInput(
                "background workers need a tokio runtime".to_string(),
            ));
        }

        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return Ok(());
        }
        workers.push(self.monitor.start());
        if self.config.backup.auto_backup {
            workers.push(self.backups.start_auto_backup());
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.workers.lock().is_empty()
    }

    /// Stop accepting work, drain, stop workers, close connections and take
    /// a final backup if the last health snapshot was healthy.
    pub async fn shutdown(&self) -> StorageResult<ShutdownReport> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Err(StorageError::ShuttingDown);
        }
        info!("Storage service shutting down");

        self.pool.close();

        let drain_timeout = self.config.shutdown.drain_timeout;
        let pool = Arc::clone(&self.pool);
        let drained = tokio::task::spawn_blocking(move || pool.wait_idle(drain_timeout))
            .await
            .unwrap_or(false);
        if !drained {
            warn!(
                timeout_ms = drain_timeout.as_millis() as u64,
                active = self.pool.active_connections(),
                "In-flight queries did not finish in time"
            );
        }

        let workers: Vec<WorkerHandle> = std::mem::take(&mut *self.workers.lock());
        let mut workers_stopped = 0;
        let mut workers_abandoned = 0;
        for worker in workers {
            if worker.stop(self.config.shutdown.worker_join_timeout).await {
                workers_stopped += 1;
            } else {
                workers_abandoned += 1;
            }
        }

        let connections_closed = self.pool.close_all();

        let final_backup = if self.config.backup.backup_on_shutdown {
            Some(self.final_backup().await)
        } else {
            None
        };

        let report = ShutdownReport {
            drained,
            workers_stopped,
            workers_abandoned,
            connections_closed,
            final_backup,
        };
        info!(?report, "Storage service stopped");
        Ok(report)
    }

    // The pool is closed by now, so this trusts the last published snapshot.
    async fn final_backup(&self) -> ScheduledBackup {
        let health = self.monitor.status();
        if !health.healthy {
            let reason = health.summary();
            warn!(%reason, "Skipping shutdown backup, store is unhealthy");
            return ScheduledBackup::SkippedUnhealthy(reason);
        }

        let backups = Arc::clone(&self.backups);
        match tokio::task::spawn_blocking(move || backups.create_backup()).await {
            Ok(Ok(id)) => ScheduledBackup::Created(id),
            Ok(Err(StorageError::BackupInProgress)) => ScheduledBackup::SkippedInProgress,
            Ok(Err(e)) => {
                warn!(error = %e, "Shutdown backup failed");
                ScheduledBackup::Failed(e.to_string())
            }
            Err(e) => {
                warn!(error = %e, "Shutdown backup task failed");
                ScheduledBackup::Failed(e.to_string())
            }
        }
    }

    /// Run a statement, optionally serving reads from the result cache.
    pub fn execute(
        &self,
        sql: &str,
        params: &[Value],
        cache_key: Option<&str>,
    ) -> StorageResult<Arc<QueryResult>> {
        let options = QueryOptions {
            cache_key: cache_key.map(str::to_string),
            ..Default::default()
        };
        self.executor.execute(sql, params, &options)
    }

    pub fn execute_with(
        &self,
        sql: &str,
        params: &[Value],
        options: &QueryOptions,
    ) -> StorageResult<Arc<QueryResult>> {
        self.executor.execute(sql, params, options)
    }

    pub fn record_trade(&self, trade: &NewTrade) -> StorageResult<i64> {
        self.ledger.record_trade(trade)
    }

    pub fn cache_result(&self, key: &str, value: &serde_json::Value) -> StorageResult<()> {
        self.results.cache_result(key, value)
    }

    pub fn get_cached_result(&self, key: &str) -> StorageResult<Option<serde_json::Value>> {
        self.results.get_cached_result(key)
    }

    /// Latest health snapshot, without running any checks.
    pub fn health(&self) -> Arc<HealthStatus> {
        self.monitor.status()
    }

    /// Run the health checks now.
    pub fn check_health(&self) -> Arc<HealthStatus> {
        self.monitor.check_now()
    }

    pub fn create_backup(&self) -> StorageResult<String> {
        self.backups.create_backup()
    }

    /// Restore the live store from backup `id`, verifying the backup first.
    pub fn restore(&self, id: &str) -> StorageResult<RestoreReport> {
        let report = self.backups.restore(id, &self.config.database_path, true)?;
        self.executor.clear_cache();
        Ok(report)
    }

    pub fn restore_to(
        &self,
        id: &str,
        target: &Path,
        verify_first: bool,
    ) -> StorageResult<RestoreReport> {
        self.backups.restore(id, target, verify_first)
    }

    pub fn list_backups(&self) -> Vec<BackupMetadata> {
        self.backups.list_backups()
    }

    pub fn delete_backup(&self, id: &str) -> StorageResult<()> {
        self.backups.delete_backup(id)
    }

    pub fn query_stats(&self) -> QueryStats {
        self.executor.metrics().summary()
    }

    pub fn pool_statistics(&self) -> PoolStatistics {
        self.pool.statistics()
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn executor(&self) -> &Arc<QueryExecutor> {
        &self.executor
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn backups(&self) -> &Arc<BackupManager> {
        &self.backups
    }

    pub fn ledger(&self) -> &TradeLedger {
        &self.ledger
    }

    pub fn results(&self) -> &ResultStore {
        &self.results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn config(dir: &Path) -> StorageConfig {
        let mut config = StorageConfig::new(dir.join("data/vault.db"), dir.join("backups"));
        config.health.min_free_disk_bytes = 0;
        config.shutdown.drain_timeout = Duration::from_millis(200);
        config
    }

    #[test]
    fn test_open_migrates_and_serves_queries() {
        let dir = tempdir().unwrap();
        let service = StorageService::open(config(dir.path())).unwrap();

        let tables = service
            .execute(
                "SELECT COUNT(*) AS n FROM sqlite_master WHERE name IN ('trades', 'inventory', 'result_cache', 'health_log')",
                &[],
                None,
            )
            .unwrap();
        assert_eq!(tables.scalar("n"), Some(&Value::Integer(4)));
        assert!(!service.is_running());
        assert!(service.health().checked_at.is_none());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.backup.max_backups = 0;
        assert!(matches!(
            StorageService::open(config),
            Err(StorageError::Config(_))
        ));
    }

    #[test]
    fn test_start_needs_runtime() {
        let dir = tempdir().unwrap();
        let service = StorageService::open(config(dir.path())).unwrap();
        assert!(matches!(service.start(), Err(StorageError::InvalidInput(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_sequence() {
        let dir = tempdir().unwrap();
        let service = StorageService::open(config(dir.path())).unwrap();
        service.start().unwrap();
        service.start().unwrap();
        assert!(service.is_running());

        let report = service.shutdown().await.unwrap();
        assert!(report.drained);
        assert_eq!(report.workers_stopped, 2);
        assert_eq!(report.workers_abandoned, 0);
        assert_eq!(report.connections_closed, 5);
        assert!(matches!(report.final_backup, Some(ScheduledBackup::Created(_))));

        assert!(matches!(
            service.execute("SELECT 1", &[], None),
            Err(StorageError::ShuttingDown)
        ));
        assert!(matches!(service.shutdown().await, Err(StorageError::ShuttingDown)));
        assert_eq!(service.list_backups().len(), 1);
    }
}
