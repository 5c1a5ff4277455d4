//! Periodic health checks of the pool and the store.
//!
//! Each run produces a complete [`HealthStatus`] and publishes it with a
//! single pointer swap. Sub-check failures become issue strings on the
//! snapshot; nothing here returns an error to the caller.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use chrono::Utc;
use rusqlite::{Connection, params};
use sysinfo::Disks;
use tracing::{debug, info, warn};

use tradevault_core::config::HealthConfig;
use tradevault_core::error::StorageError;
use tradevault_core::health::{DiskSpace, HealthStatus, IntegrityResult, PoolUtilization};

use crate::metrics::MetricsRecorder;
use crate::pool::ConnectionPool;
use crate::sql;
use crate::worker::WorkerHandle;

pub struct HealthMonitor {
    pool: Arc<ConnectionPool>,
    metrics: Arc<MetricsRecorder>,
    config: HealthConfig,
    slow_threshold: Duration,
    status: ArcSwap<HealthStatus>,
}

impl HealthMonitor {
    pub fn new(
        pool: Arc<ConnectionPool>,
        metrics: Arc<MetricsRecorder>,
        config: HealthConfig,
    ) -> Self {
        let slow_threshold = metrics.slow_threshold();
        Self {
            pool,
            metrics,
            config,
            slow_threshold,
            status: ArcSwap::from_pointee(HealthStatus::pending()),
        }
    }

    /// Latest published snapshot.
    pub fn status(&self) -> Arc<HealthStatus> {
        self.status.load_full()
    }

    pub fn is_healthy(&self) -> bool {
        self.status.load().healthy
    }

    /// Run every check now and publish the result.
    pub fn check_now(&self) -> Arc<HealthStatus> {
        let started = Instant::now();
        let mut status = HealthStatus {
            checked_at: Some(Utc::now()),
            ..HealthStatus::pending()
        };

        let stats = self.pool.statistics();
        status.pool_utilization =
            PoolUtilization::classify(stats.active_connections, stats.total_connections);
        status.pool_utilization_ratio = stats.utilization;

        // A saturated pool is busy, not broken: utilization already reports
        // it, so the store checks are skipped without raising an issue.
        let conn = match self.pool.acquire_timeout(self.config.probe_timeout) {
            Ok(conn) => Some(conn),
            Err(StorageError::PoolExhausted { timeout }) => {
                debug!(
                    timeout_ms = timeout.as_millis() as u64,
                    utilization = ?status.pool_utilization,
                    "No idle connection for the health probe, store checks skipped"
                );
                None
            }
            Err(e) => {
                status.connectivity_ok = false;
                status.issues.push(format!("connectivity probe failed: {e}"));
                None
            }
        };
        if let Some(conn) = &conn {
            self.check_store(conn, &mut status);
        }

        status.free_disk_bytes = free_disk_space(self.pool.path());
        status.disk_space =
            DiskSpace::classify(status.free_disk_bytes, self.config.min_free_disk_bytes);
        match status.disk_space {
            DiskSpace::Critical => status.issues.push(format!(
                "free disk space {} bytes below minimum {}",
                status.free_disk_bytes.unwrap_or_default(),
                self.config.min_free_disk_bytes
            )),
            DiskSpace::Low => debug!(
                free_bytes = status.free_disk_bytes,
                "Free disk space is low"
            ),
            DiskSpace::Ok | DiskSpace::Unknown => {}
        }

        status.avg_query_latency = self.metrics.average_latency();
        if let Some(avg) = status.avg_query_latency {
            let limit = self.slow_threshold * 2;
            if avg > limit {
                status.issues.push(format!(
                    "average query latency {}ms exceeds {}ms",
                    avg.as_millis(),
                    limit.as_millis()
                ));
            }
        }

        status.check_duration = started.elapsed();
        status.healthy = status.issues.is_empty();

        if status.healthy {
            debug!(
                duration_ms = status.check_duration.as_millis() as u64,
                utilization = ?status.pool_utilization,
                "Health check passed"
            );
        } else {
            warn!(
                issues = %status.summary(),
                duration_ms = status.check_duration.as_millis() as u64,
                "Health check found issues"
            );
        }

        if let Some(conn) = &conn {
            self.append_log(conn, &status);
        }
        drop(conn);

        let status = Arc::new(status);
        self.status.store(Arc::clone(&status));
        status
    }

    fn check_store(&self, conn: &Connection, status: &mut HealthStatus) {
        if let Err(e) = conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)) {
            status.connectivity_ok = false;
            status.issues.push(format!("connectivity probe failed: {e}"));
            return;
        }

        status.integrity = match sql::integrity_check(conn, self.config.integrity_check) {
            Ok(result) => result,
            Err(e) => IntegrityResult::Failed(e.to_string()),
        };
        if let IntegrityResult::Failed(reason) = &status.integrity {
            status.issues.push(format!("integrity check failed: {reason}"));
        }

        match sql::foreign_key_violations(conn) {
            Ok(0) => {}
            Ok(count) => {
                status.foreign_key_violations = count;
                status
                    .issues
                    .push(format!("{count} foreign key violation(s)"));
            }
            Err(e) => status
                .issues
                .push(format!("foreign key check failed: {e}")),
        }
    }

    // Best effort: the table may not exist on an unmigrated store.
    fn append_log(&self, conn: &Connection, status: &HealthStatus) {
        let issues = serde_json::to_string(&status.issues).unwrap_or_else(|_| "[]".to_string());
        let result = conn
            .execute(
                "INSERT INTO health_log
                 (checked_at, healthy, integrity, pool_utilization, free_disk_bytes, avg_latency_ms, issues)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    sql::timestamp(status.checked_at.unwrap_or_else(Utc::now)),
                    status.healthy,
                    status.integrity.to_string(),
                    format!("{:?}", status.pool_utilization),
                    status.free_disk_bytes.map(|b| b as i64),
                    status.avg_query_latency.map(|d| d.as_secs_f64() * 1000.0),
                    issues,
                ],
            )
            .and_then(|_| {
                conn.execute(
                    "DELETE FROM health_log WHERE id NOT IN
                     (SELECT id FROM health_log ORDER BY id DESC LIMIT ?1)",
                    params![self.config.health_log_retention as i64],
                )
            });

        if let Err(e) = result {
            debug!(error = %e, "Could not append health log entry");
        }
    }

    /// Start the periodic check loop on the current tokio runtime.
    pub fn start(self: &Arc<Self>) -> WorkerHandle {
        let monitor = Arc::clone(self);
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "Starting health monitor"
        );
        WorkerHandle::spawn("health-monitor", self.config.interval, move || {
            let monitor = Arc::clone(&monitor);
            async move {
                if let Err(e) = tokio::task::spawn_blocking(move || monitor.check_now()).await {
                    warn!(error = %e, "Health check task failed");
                }
            }
        })
    }
}

/// Free bytes on the volume whose mount point is the longest prefix of `path`.
fn free_disk_space(path: &Path) -> Option<u64> {
    let resolved = resolve(path)?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| resolved.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

fn resolve(path: &Path) -> Option<PathBuf> {
    if let Ok(p) = std::fs::canonicalize(path) {
        return Some(p);
    }
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::canonicalize(parent).ok()
}
