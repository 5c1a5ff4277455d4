//! Circuit breaker behaviour, alone and in front of the executor.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::{TempDir, tempdir};
use tradevault_core::StorageError;
use tradevault_core::config::{BreakerConfig, PoolConfig, QueryConfig};
use tradevault_storage::{
    CircuitBreaker, CircuitState, ConnectionPool, MetricsRecorder, QueryExecutor, QueryOptions,
};

fn executor(threshold: u32, cooldown: Duration) -> (TempDir, QueryExecutor) {
    let dir = tempdir().expect("temp dir");
    let pool = ConnectionPool::open(
        dir.path().join("breaker.db"),
        PoolConfig {
            acquire_timeout: Duration::from_millis(100),
            ..Default::default()
        },
    )
    .expect("pool should open");
    let query = QueryConfig::default();
    let executor = QueryExecutor::new(
        Arc::new(pool),
        Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            cooldown,
        })),
        Arc::new(MetricsRecorder::new(&query)),
        &query,
    );
    (dir, executor)
}

/// Threshold - 1 failures followed by a success never opens the circuit.
#[test]
fn test_success_resets_before_threshold() {
    let breaker = CircuitBreaker::new(BreakerConfig {
        failure_threshold: 5,
        cooldown: Duration::from_secs(60),
    });

    for _ in 0..3 {
        for _ in 0..4 {
            breaker.record_failure();
        }
        breaker.record_success();
    }
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert!(breaker.can_execute());
}

/// Five failing statements with threshold 5: the sixth is rejected without
/// touching the store, and after the cooldown one call gets through.
#[test]
fn test_executor_fails_fast_then_recovers() {
    let (_dir, executor) = executor(5, Duration::from_millis(100));
    let options = QueryOptions::default();

    for _ in 0..5 {
        let err = executor
            .execute("SELECT * FROM not_a_table", &[], &options)
            .expect_err("statement should fail");
        assert!(matches!(err, StorageError::QueryFailed { .. }));
        assert!(!err.is_retryable());
    }
    assert_eq!(executor.breaker().state(), CircuitState::Open);

    let pool_queries = executor.pool().statistics().total_queries;
    let err = executor
        .execute("SELECT 1", &[], &options)
        .expect_err("circuit should be open");
    assert!(matches!(err, StorageError::CircuitOpen { .. }));
    assert_eq!(executor.pool().statistics().total_queries, pool_queries);

    thread::sleep(Duration::from_millis(150));
    executor
        .execute("SELECT 1", &[], &options)
        .expect("probe should run and succeed");
    assert_eq!(executor.breaker().state(), CircuitState::Closed);
}

/// After the cooldown exactly one caller is admitted; its failure re-opens.
#[test]
fn test_half_open_single_probe_failure() {
    let breaker = CircuitBreaker::new(BreakerConfig {
        failure_threshold: 2,
        cooldown: Duration::from_millis(30),
    });
    breaker.record_failure();
    breaker.record_failure();
    assert!(!breaker.can_execute());

    thread::sleep(Duration::from_millis(50));
    let admitted = (0..10).filter(|_| breaker.can_execute()).count();
    assert_eq!(admitted, 1);
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(!breaker.can_execute());
    assert!(breaker.snapshot().retry_after.is_some());
}

/// An exhausted pool is reported as such and is not held against the store.
#[test]
fn test_pool_exhaustion_does_not_trip() {
    let (_dir, executor) = executor(1, Duration::from_secs(60));
    let _held: Vec<_> = (0..executor.pool().capacity())
        .map(|_| executor.pool().acquire().expect("acquire"))
        .collect();

    let err = executor
        .execute("SELECT 1", &[], &QueryOptions::default())
        .expect_err("pool should be exhausted");
    assert!(matches!(err, StorageError::PoolExhausted { .. }));
    assert!(err.is_retryable());
    assert_eq!(executor.breaker().state(), CircuitState::Closed);
}
