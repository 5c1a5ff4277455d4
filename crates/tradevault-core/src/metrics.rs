//! Query instrumentation types.
//!
//! A [`QueryMetrics`] sample is recorded for every executed statement. The
//! storage crate keeps the most recent samples in a fixed-capacity ring
//! buffer and summarises them with [`QueryStats::from_samples`].

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of SQL statement, derived from its leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatementType {
    Select,
    Insert,
    Update,
    Delete,
    /// A scoped multi-statement transaction run through the executor.
    Transaction,
    Other,
}

impl StatementType {
    /// Classify a statement by its first keyword. `WITH` counts as a read.
    pub fn classify(sql: &str) -> Self {
        let keyword = sql
            .trim_start()
            .split(|c: char| c.is_whitespace() || c == '(')
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();

        match keyword.as_str() {
            "SELECT" | "WITH" => StatementType::Select,
            "INSERT" | "REPLACE" => StatementType::Insert,
            "UPDATE" => StatementType::Update,
            "DELETE" => StatementType::Delete,
            "BEGIN" | "COMMIT" | "ROLLBACK" | "SAVEPOINT" | "RELEASE" => {
                StatementType::Transaction
            }
            _ => StatementType::Other,
        }
    }

    /// Reads are the only statements whose results may be cached.
    pub fn is_read(&self) -> bool {
        matches!(self, StatementType::Select)
    }
}

impl fmt::Display for StatementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatementType::Select => "SELECT",
            StatementType::Insert => "INSERT",
            StatementType::Update => "UPDATE",
            StatementType::Delete => "DELETE",
            StatementType::Transaction => "TRANSACTION",
            StatementType::Other => "OTHER",
        };
        f.write_str(name)
    }
}

/// One executed statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMetrics {
    /// Short content hash of the normalised statement text.
    pub query_hash: String,
    pub statement_type: StatementType,
    pub duration: Duration,
    pub rows_affected: usize,
    pub success: bool,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl QueryMetrics {
    pub fn success(
        query_hash: impl Into<String>,
        statement_type: StatementType,
        duration: Duration,
        rows_affected: usize,
    ) -> Self {
        Self {
            query_hash: query_hash.into(),
            statement_type,
            duration,
            rows_affected,
            success: true,
            error: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn failure(
        query_hash: impl Into<String>,
        statement_type: StatementType,
        duration: Duration,
        error: impl Into<String>,
    ) -> Self {
        Self {
            query_hash: query_hash.into(),
            statement_type,
            duration,
            rows_affected: 0,
            success: false,
            error: Some(error.into()),
            recorded_at: Utc::now(),
        }
    }
}

/// Latency class of a single statement relative to the configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LatencyClass {
    Normal,
    Slow,
    Critical,
}

impl LatencyClass {
    /// `slow` and `critical` are exclusive lower bounds.
    pub fn classify(duration: Duration, slow: Duration, critical: Duration) -> Self {
        if duration > critical {
            LatencyClass::Critical
        } else if duration > slow {
            LatencyClass::Slow
        } else {
            LatencyClass::Normal
        }
    }
}

/// Emitted when a statement crosses the slow or critical threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowQueryAlert {
    pub query_hash: String,
    pub statement_type: StatementType,
    pub duration: Duration,
    pub class: LatencyClass,
    pub observed_at: DateTime<Utc>,
}

/// Rolling summary over the samples currently held in the ring buffer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryStats {
    pub sample_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub avg_latency_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
    pub slow_count: usize,
    pub critical_count: usize,
}

impl QueryStats {
    /// Summarise `samples` using nearest-rank percentiles.
    pub fn from_samples<'a>(
        samples: impl IntoIterator<Item = &'a QueryMetrics>,
        slow: Duration,
        critical: Duration,
    ) -> Self {
        let mut stats = QueryStats::default();
        let mut latencies = Vec::new();

        for sample in samples {
            stats.sample_count += 1;
            if sample.success {
                stats.success_count += 1;
            } else {
                stats.failure_count += 1;
            }
            match LatencyClass::classify(sample.duration, slow, critical) {
                LatencyClass::Slow => stats.slow_count += 1,
                LatencyClass::Critical => stats.critical_count += 1,
                LatencyClass::Normal => {}
            }
            latencies.push(sample.duration.as_secs_f64() * 1000.0);
        }

        if latencies.is_empty() {
            return stats;
        }

        latencies.sort_by(f64::total_cmp);
        stats.avg_latency_ms = latencies.iter().sum::<f64>() / latencies.len() as f64;
        stats.p50_ms = percentile(&latencies, 50.0);
        stats.p95_ms = percentile(&latencies, 95.0);
        stats.p99_ms = percentile(&latencies, 99.0);
        stats.max_ms = latencies[latencies.len() - 1];
        stats
    }

    /// Fraction of failed samples (0.0-1.0).
    pub fn failure_rate(&self) -> f64 {
        if self.sample_count == 0 {
            0.0
        } else {
            self.failure_count as f64 / self.sample_count as f64
        }
    }
}

// `sorted` must be non-empty and ascending.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
