//! Query execution behind the circuit breaker and connection pool.
//!
//! Every statement follows the same path: cache lookup (reads with a cache
//! key only), breaker gate, bounded connection checkout, execution, metrics
//! sample, release. Slow statements are logged and recorded as alerts but
//! never fail the call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::types::Value;
use rusqlite::{Connection, Transaction, TransactionBehavior, params_from_iter};
use tracing::{debug, error, warn};

use tradevault_core::config::QueryConfig;
use tradevault_core::error::{StorageError, StorageResult};
use tradevault_core::metrics::{LatencyClass, QueryMetrics, StatementType};

use crate::breaker::CircuitBreaker;
use crate::cache::{CacheStats, ResultCache};
use crate::metrics::MetricsRecorder;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::sql;

/// How many result rows to materialise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchMode {
    #[default]
    All,
    First,
}

/// Per-call options for [`QueryExecutor::execute`].
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Serve from / populate the result cache under this key. Only reads
    /// fetched with [`FetchMode::All`] use the cache; a truncated result is
    /// never stored or served.
    pub cache_key: Option<String>,
    pub fetch: FetchMode,
}

impl QueryOptions {
    pub fn cached(key: impl Into<String>) -> Self {
        Self {
            cache_key: Some(key.into()),
            ..Default::default()
        }
    }

    pub fn first_row() -> Self {
        Self {
            fetch: FetchMode::First,
            ..Default::default()
        }
    }
}

/// Materialised result of one statement.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub rows_affected: usize,
}

impl QueryResult {
    /// Value of `column` in the first row.
    pub fn scalar(&self, column: &str) -> Option<&Value> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.rows.first()?.get(index)
    }
}

pub struct QueryExecutor {
    pool: Arc<ConnectionPool>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<MetricsRecorder>,
    cache: ResultCache,
    acquire_timeout: Duration,
}

impl QueryExecutor {
    pub fn new(
        pool: Arc<ConnectionPool>,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<MetricsRecorder>,
        config: &QueryConfig,
    ) -> Self {
        let acquire_timeout = pool.config().acquire_timeout;
        Self {
            pool,
            breaker,
            metrics,
            cache: ResultCache::new(config.cache_capacity, config.cache_eviction_batch),
            acquire_timeout,
        }
    }

    /// Run one parameterised statement.
    pub fn execute(
        &self,
        sql: &str,
        params: &[Value],
        options: &QueryOptions,
    ) -> StorageResult<Arc<QueryResult>> {
        let cache_key = options
            .cache_key
            .as_deref()
            .filter(|_| options.fetch == FetchMode::All);
        if let Some(key) = cache_key {
            if let Some(hit) = self.cache.get(key) {
                debug!(cache_key = key, "Result cache hit");
                return Ok(hit);
            }
        }

        let statement_type = StatementType::classify(sql);
        let result = self.guarded(sql, statement_type, |conn| {
            let result = run_statement(conn, sql, params, statement_type, options.fetch)?;
            let rows = result.rows_affected.max(result.rows.len());
            Ok((result, rows))
        })?;

        let result = Arc::new(result);
        if let Some(key) = cache_key {
            if statement_type.is_read() {
                self.cache.insert(key, Arc::clone(&result));
            }
        }
        Ok(result)
    }

    /// Run `f` inside an immediate transaction on one pooled connection.
    ///
    /// The transaction commits only if `f` returns `Ok`; every other exit,
    /// including a panic in `f`, rolls it back when the transaction drops.
    pub fn transaction<T, F>(&self, label: &str, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> rusqlite::Result<T>,
    {
        self.guarded(label, StatementType::Transaction, |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = f(&tx)?;
            let changes = tx.changes() as usize;
            tx.commit()?;
            Ok((value, changes))
        })
    }

    /// Run read-only work `f` on one pooled connection, outside any
    /// explicit transaction.
    pub fn read<T, F>(&self, label: &str, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        self.guarded(label, StatementType::Select, |conn| Ok((f(&*conn)?, 0)))
    }

    /// Breaker gate, checkout, timing and metrics around one unit of work.
    fn guarded<T, F>(&self, text: &str, statement_type: StatementType, work: F) -> StorageResult<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<(T, usize)>,
    {
        let Some(permit) = self.breaker.try_acquire() else {
            return Err(StorageError::CircuitOpen {
                retry_after: self.breaker.retry_after(),
            });
        };

        // Exhaustion says nothing about the store's health; dropping the
        // permit unsettled hands a half-open probe slot to the next caller.
        let mut conn: PooledConnection<'_> = self.pool.acquire_timeout(self.acquire_timeout)?;

        let query_hash = sql::query_hash(text);
        let started = Instant::now();
        let outcome = work(&mut *conn);
        let duration = started.elapsed();

        conn.record_outcome(outcome.is_ok());
        if let Err(e) = &outcome {
            if sql::is_session_error(e) {
                conn.invalidate();
            }
        }
        drop(conn);

        match outcome {
            Ok((value, rows)) => {
                permit.success();
                let class = self.metrics.record(QueryMetrics::success(
                    query_hash.clone(),
                    statement_type,
                    duration,
                    rows,
                ));
                self.log_latency(&query_hash, statement_type, duration, class);
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                let class = self.metrics.record(QueryMetrics::failure(
                    query_hash.clone(),
                    statement_type,
                    duration,
                    e.to_string(),
                ));
                self.log_latency(&query_hash, statement_type, duration, class);
                debug!(query_hash = %query_hash, error = %e, "Statement failed");
                Err(sql::query_failed(statement_type, &e))
            }
        }
    }

    fn log_latency(
        &self,
        query_hash: &str,
        statement_type: StatementType,
        duration: Duration,
        class: LatencyClass,
    ) {
        let duration_ms = duration.as_millis() as u64;
        match class {
            LatencyClass::Normal => {}
            LatencyClass::Slow => warn!(
                query_hash,
                statement_type = %statement_type,
                duration_ms,
                "Slow query"
            ),
            LatencyClass::Critical => error!(
                query_hash,
                statement_type = %statement_type,
                duration_ms,
                "Critically slow query"
            ),
        }
    }

    pub fn invalidate_cached(&self, key: &str) -> bool {
        self.cache.invalidate(key)
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }
}

fn run_statement(
    conn: &Connection,
    sql: &str,
    params: &[Value],
    statement_type: StatementType,
    fetch: FetchMode,
) -> rusqlite::Result<QueryResult> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    if columns.is_empty() {
        let rows_affected = stmt.execute(params_from_iter(params.iter()))?;
        return Ok(QueryResult {
            columns,
            rows: Vec::new(),
            rows_affected,
        });
    }

    let mut rows = Vec::new();
    let mut cursor = stmt.query(params_from_iter(params.iter()))?;
    while let Some(row) = cursor.next()? {
        let values = (0..columns.len())
            .map(|i| row.get::<_, Value>(i))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.push(values);
        if fetch == FetchMode::First {
            break;
        }
    }
    drop(cursor);

    let rows_affected = if statement_type.is_read() {
        0
    } else {
        conn.changes() as usize
    };

    Ok(QueryResult {
        columns,
        rows,
        rows_affected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitState;
    use tempfile::{TempDir, tempdir};
    use tradevault_core::config::{BreakerConfig, PoolConfig};
    use tradevault_core::database::PoolSize;

    fn executor(threshold: u32) -> (TempDir, QueryExecutor) {
        let dir = tempdir().unwrap();
        let pool = ConnectionPool::open(
            dir.path().join("exec.db"),
            PoolConfig {
                size: PoolSize::new(2).unwrap(),
                acquire_timeout: Duration::from_millis(100),
                ..Default::default()
            },
        )
        .unwrap();
        let config = QueryConfig::default();
        let exec = QueryExecutor::new(
            Arc::new(pool),
            Arc::new(CircuitBreaker::new(BreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_secs(60),
            })),
            Arc::new(MetricsRecorder::new(&config)),
            &config,
        );
        exec.execute(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
            &[],
            &QueryOptions::default(),
        )
        .unwrap();
        (dir, exec)
    }

    #[test]
    fn test_execute_write_and_read() {
        let (_dir, exec) = executor(5);
        let inserted = exec
            .execute(
                "INSERT INTO items (name) VALUES (?1), (?2)",
                &[Value::Text("a".into()), Value::Text("b".into())],
                &QueryOptions::default(),
            )
            .unwrap();
        assert_eq!(inserted.rows_affected, 2);

        let rows = exec
            .execute("SELECT id, name FROM items ORDER BY id", &[], &QueryOptions::default())
            .unwrap();
        assert_eq!(rows.columns, vec!["id", "name"]);
        assert_eq!(rows.rows.len(), 2);
        assert_eq!(rows.rows[1][1], Value::Text("b".into()));

        let first = exec
            .execute("SELECT name FROM items ORDER BY id", &[], &QueryOptions::first_row())
            .unwrap();
        assert_eq!(first.rows.len(), 1);
        assert_eq!(first.scalar("name"), Some(&Value::Text("a".into())));

        assert_eq!(exec.metrics().len(), 4);
    }

    #[test]
    fn test_cache_hit_skips_store() {
        let (_dir, exec) = executor(5);
        exec.execute("INSERT INTO items (name) VALUES ('x')", &[], &QueryOptions::default())
            .unwrap();

        let opts = QueryOptions::cached("all-items");
        let first = exec.execute("SELECT COUNT(*) AS n FROM items", &[], &opts).unwrap();
        exec.execute("INSERT INTO items (name) VALUES ('y')", &[], &QueryOptions::default())
            .unwrap();
        let samples_before = exec.metrics().len();

        let second = exec.execute("SELECT COUNT(*) AS n FROM items", &[], &opts).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.scalar("n"), Some(&Value::Integer(1)));
        assert_eq!(exec.metrics().len(), samples_before);
        assert_eq!(exec.cache_stats().hits, 1);
    }

    #[test]
    fn test_first_row_reads_bypass_cache() {
        let (_dir, exec) = executor(5);
        exec.execute("INSERT INTO items (name) VALUES ('a'), ('b'), ('c')", &[], &QueryOptions::default())
            .unwrap();

        let first = QueryOptions {
            cache_key: Some("names".into()),
            fetch: FetchMode::First,
        };
        let truncated = exec.execute("SELECT name FROM items ORDER BY id", &[], &first).unwrap();
        assert_eq!(truncated.rows.len(), 1);
        assert_eq!(exec.cache_stats().entries, 0);

        let all = exec
            .execute("SELECT name FROM items ORDER BY id", &[], &QueryOptions::cached("names"))
            .unwrap();
        assert_eq!(all.rows.len(), 3);

        let again = exec.execute("SELECT name FROM items ORDER BY id", &[], &first).unwrap();
        assert_eq!(again.rows.len(), 1);
        assert_eq!(exec.cache_stats().hits, 0);
    }

    #[test]
    fn test_panicking_half_open_call_releases_breaker() {
        let (_dir, base) = executor(5);
        let exec = QueryExecutor::new(
            Arc::clone(base.pool()),
            Arc::new(CircuitBreaker::new(BreakerConfig {
                failure_threshold: 1,
                cooldown: Duration::from_millis(20),
            })),
            Arc::clone(base.metrics()),
            &QueryConfig::default(),
        );
        exec.execute("SELECT * FROM no_such_table", &[], &QueryOptions::default())
            .unwrap_err();
        assert_eq!(exec.breaker().state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(30));

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            exec.transaction("panics", |_tx| -> rusqlite::Result<()> {
                panic!("closure bailed out")
            })
        }));
        assert!(outcome.is_err());
        assert_eq!(exec.pool().active_connections(), 0);

        exec.execute("SELECT 1", &[], &QueryOptions::default()).unwrap();
        assert_eq!(exec.breaker().state(), CircuitState::Closed);
    }

    #[test]
    fn test_writes_are_never_cached() {
        let (_dir, exec) = executor(5);
        let opts = QueryOptions::cached("write");
        exec.execute("INSERT INTO items (name) VALUES ('x')", &[], &opts).unwrap();
        exec.execute("INSERT INTO items (name) VALUES ('y')", &[], &opts).unwrap();
        assert_eq!(exec.cache_stats().entries, 0);

        let count = exec
            .execute("SELECT COUNT(*) AS n FROM items", &[], &QueryOptions::default())
            .unwrap();
        assert_eq!(count.scalar("n"), Some(&Value::Integer(2)));
    }

    #[test]
    fn test_failures_trip_breaker() {
        let (_dir, exec) = executor(3);
        for _ in 0..3 {
            let err = exec
                .execute("SELECT * FROM no_such_table", &[], &QueryOptions::default())
                .unwrap_err();
            assert!(matches!(
                err,
                StorageError::QueryFailed { statement_type: StatementType::Select, .. }
            ));
        }

        let err = exec
            .execute("SELECT 1", &[], &QueryOptions::default())
            .unwrap_err();
        assert!(matches!(err, StorageError::CircuitOpen { .. }));
        assert!(err.is_retryable());

        let stats = exec.metrics().summary();
        assert_eq!(stats.failure_count, 3);
        assert_eq!(exec.pool().statistics().total_errors, 3);
        assert_eq!(exec.pool().statistics().idle_connections, 2);
    }

    #[test]
    fn test_transaction_commits_and_rolls_back() {
        let (_dir, exec) = executor(5);
        let id = exec
            .transaction("insert-two", |tx| {
                tx.execute("INSERT INTO items (name) VALUES ('a')", [])?;
                tx.execute("INSERT INTO items (name) VALUES ('b')", [])?;
                Ok(tx.last_insert_rowid())
            })
            .unwrap();
        assert_eq!(id, 2);

        let err = exec
            .transaction("half-done", |tx| {
                tx.execute("INSERT INTO items (name) VALUES ('c')", [])?;
                tx.execute("INSERT INTO items (name) VALUES (NULL)", [])?;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::QueryFailed { statement_type: StatementType::Transaction, .. }
        ));

        let count = exec
            .execute("SELECT COUNT(*) AS n FROM items", &[], &QueryOptions::default())
            .unwrap();
        assert_eq!(count.scalar("n"), Some(&Value::Integer(2)));
    }
}
