//! Connection pool behaviour under contention.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::tempdir;
use tradevault_core::StorageError;
use tradevault_core::config::PoolConfig;
use tradevault_core::database::PoolSize;
use tradevault_storage::ConnectionPool;

fn pool(dir: &std::path::Path, size: u8) -> Arc<ConnectionPool> {
    let config = PoolConfig {
        size: PoolSize::new(size).expect("valid pool size"),
        acquire_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    Arc::new(ConnectionPool::open(dir.join("pool.db"), config).expect("pool should open"))
}

/// Up to capacity, every caller gets a connection without waiting.
#[test]
fn test_capacity_callers_do_not_block() {
    let dir = tempdir().expect("temp dir");
    let pool = pool(dir.path(), 4);

    let start = Instant::now();
    let held: Vec<_> = (0..4)
        .map(|_| pool.acquire_timeout(Duration::from_secs(1)).expect("acquire"))
        .collect();
    assert!(start.elapsed() < Duration::from_millis(500));
    assert_eq!(pool.statistics().active_connections, 4);
    assert!(pool.statistics().is_at_capacity());

    drop(held);
    assert_eq!(pool.statistics().idle_connections, 4);
}

/// Capacity 2, three simultaneous callers, two connections held for 200ms:
/// the third caller times out after 100ms.
#[test]
fn test_third_caller_gets_pool_exhausted() {
    let dir = tempdir().expect("temp dir");
    let pool = pool(dir.path(), 2);
    let barrier = Arc::new(Barrier::new(3));

    let holders: Vec<_> = (0..2)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let conn = pool.acquire().expect("holder acquires");
                barrier.wait();
                thread::sleep(Duration::from_millis(200));
                drop(conn);
            })
        })
        .collect();

    barrier.wait();
    let start = Instant::now();
    let result = pool.acquire_timeout(Duration::from_millis(100));
    let waited = start.elapsed();

    match result {
        Err(StorageError::PoolExhausted { timeout }) => {
            assert_eq!(timeout, Duration::from_millis(100));
        }
        Err(other) => panic!("expected PoolExhausted, got {other}"),
        Ok(_) => panic!("expected PoolExhausted, got a connection"),
    }
    assert!(waited >= Duration::from_millis(100));

    for holder in holders {
        holder.join().expect("holder thread");
    }
    assert_eq!(pool.statistics().idle_connections, 2);
}

/// A waiting caller is served as soon as a holder releases.
#[test]
fn test_waiter_served_after_release() {
    let dir = tempdir().expect("temp dir");
    let pool = pool(dir.path(), 1);

    let held = pool.acquire().expect("acquire");
    let waiter = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.acquire_timeout(Duration::from_secs(2)).map(|c| c.id()).is_ok())
    };

    thread::sleep(Duration::from_millis(50));
    drop(held);
    assert!(waiter.join().expect("waiter thread"));
}

/// A failed statement does not cost the pool a connection.
#[test]
fn test_query_error_returns_connection() {
    let dir = tempdir().expect("temp dir");
    let pool = pool(dir.path(), 1);

    for _ in 0..3 {
        let mut conn = pool.acquire().expect("acquire");
        let ok = conn.execute("INSERT INTO missing VALUES (1)", []).is_ok();
        conn.record_outcome(ok);
    }

    let stats = pool.statistics();
    assert_eq!(stats.idle_connections, 1);
    assert_eq!(stats.total_errors, 3);
    assert_eq!(stats.unhealthy_connections, 0);
}
