//! Health snapshot types
//!
//! The health monitor produces one [`HealthStatus`] per run and publishes it
//! by swapping a shared pointer, so readers only ever see a complete
//! snapshot. Health is advisory: it gates scheduled backups and is exposed
//! to external monitoring, but never fails a query on its own.

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Utilisation class of the connection pool at check time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PoolUtilization {
    /// Below 50% of connections checked out
    Idle,
    /// 50-80%
    Normal,
    /// Above 80% but not every connection
    High,
    /// Every connection checked out
    Saturated,
}

impl PoolUtilization {
    pub fn classify(active: usize, total: usize) -> Self {
        if total == 0 || active >= total {
            return PoolUtilization::Saturated;
        }
        let ratio = active as f64 / total as f64;
        if ratio < 0.5 {
            PoolUtilization::Idle
        } else if ratio <= 0.8 {
            PoolUtilization::Normal
        } else {
            PoolUtilization::High
        }
    }
}

/// Free disk space class for the volume holding the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiskSpace {
    Ok,
    /// Under twice the configured minimum
    Low,
    /// Under the configured minimum
    Critical,
    /// The volume could not be determined
    Unknown,
}

impl DiskSpace {
    pub fn classify(free_bytes: Option<u64>, minimum: u64) -> Self {
        match free_bytes {
            None => DiskSpace::Unknown,
            Some(free) if free < minimum => DiskSpace::Critical,
            Some(free) if free < minimum.saturating_mul(2) => DiskSpace::Low,
            Some(_) => DiskSpace::Ok,
        }
    }
}

/// Outcome of `PRAGMA integrity_check` / `quick_check`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntegrityResult {
    Ok,
    Failed(String),
    NotChecked,
}

impl IntegrityResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, IntegrityResult::Ok)
    }
}

impl fmt::Display for IntegrityResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityResult::Ok => write!(f, "ok"),
            IntegrityResult::Failed(reason) => write!(f, "failed: {reason}"),
            IntegrityResult::NotChecked => write!(f, "not checked"),
        }
    }
}

/// Immutable health snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    /// `None` until the first check has run.
    pub checked_at: Option<DateTime<Utc>>,
    pub check_duration: Duration,
    pub connectivity_ok: bool,
    pub integrity: IntegrityResult,
    pub foreign_key_violations: usize,
    pub pool_utilization: PoolUtilization,
    pub pool_utilization_ratio: f64,
    pub disk_space: DiskSpace,
    pub free_disk_bytes: Option<u64>,
    pub avg_query_latency: Option<Duration>,
    pub issues: Vec<String>,
}

impl HealthStatus {
    /// Snapshot published before the first check. Reported healthy so that
    /// nothing is skipped merely because the monitor has not run yet.
    pub fn pending() -> Self {
        Self {
            healthy: true,
            checked_at: None,
            check_duration: Duration::ZERO,
            connectivity_ok: true,
            integrity: IntegrityResult::NotChecked,
            foreign_key_violations: 0,
            pool_utilization: PoolUtilization::Idle,
            pool_utilization_ratio: 0.0,
            disk_space: DiskSpace::Unknown,
            free_disk_bytes: None,
            avg_query_latency: None,
            issues: Vec::new(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// One-line summary of the issues, or "healthy".
    pub fn summary(&self) -> String {
        if self.issues.is_empty() {
            "healthy".to_string()
        } else {
            self.issues.join("; ")
        }
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::pending()
    }
}

/// Connection pool statistics
#[derive(Debug, Clone)]
pub struct PoolStatistics {
    pub total_connections: usize,
    pub idle_connections: usize,
    pub active_connections: usize,
    pub unhealthy_connections: usize,
    pub total_queries: u64,
    pub total_errors: u64,
    pub created_at: Instant,
    /// Fraction of connections checked out (0.0-1.0)
    pub utilization: f64,
}

impl PoolStatistics {
    pub fn new(total: usize, idle: usize, active: usize, created_at: Instant) -> Self {
        let utilization = if total > 0 {
            active as f64 / total as f64
        } else {
            0.0
        };

        Self {
            total_connections: total,
            idle_connections: idle,
            active_connections: active,
            unhealthy_connections: 0,
            total_queries: 0,
            total_errors: 0,
            created_at,
            utilization,
        }
    }

    pub fn classification(&self) -> PoolUtilization {
        PoolUtilization::classify(self.active_connections, self.total_connections)
    }

    pub fn is_at_capacity(&self) -> bool {
        self.active_connections >= self.total_connections
    }
}
