//! Background workers and shutdown on a real runtime.

use std::time::Duration;

use tempfile::tempdir;
use tradevault_core::{StorageConfig, StorageError};
use tradevault_storage::{ScheduledBackup, StorageService, Value};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tradevault_storage=debug")
        .with_test_writer()
        .try_init();
}

fn fast_config(dir: &std::path::Path) -> StorageConfig {
    let mut config = StorageConfig::new(dir.join("vault.db"), dir.join("backups"));
    config.health.min_free_disk_bytes = 0;
    config.health.interval = Duration::from_millis(50);
    config.backup.interval = Duration::from_millis(100);
    config.backup.auto_backup = true;
    config.backup.max_backups = 3;
    config.shutdown.drain_timeout = Duration::from_millis(500);
    config.shutdown.worker_join_timeout = Duration::from_secs(2);
    config
}

/// Running workers publish health snapshots and take auto-backups, and
/// retention keeps the auto-backups within bounds.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_workers_check_health_and_back_up() {
    init_tracing();
    let dir = tempdir().expect("temp dir");
    let service = StorageService::open(fast_config(dir.path())).expect("service should open");
    service.start().expect("workers should start");

    tokio::time::sleep(Duration::from_millis(600)).await;

    let health = service.health();
    assert!(health.checked_at.is_some(), "health monitor never ran");
    assert!(health.healthy, "unexpected issues: {:?}", health.issues);
    assert!(health.connectivity_ok);

    let backups = service.list_backups();
    assert!(!backups.is_empty(), "auto-backup never ran");
    assert!(backups.len() <= 3);

    let logged = service
        .execute("SELECT COUNT(*) AS n FROM health_log", &[], None)
        .expect("health log query");
    match logged.scalar("n") {
        Some(Value::Integer(n)) => assert!(*n > 0, "no health checks logged"),
        other => panic!("unexpected count: {other:?}"),
    }

    let report = service.shutdown().await.expect("shutdown should succeed");
    assert!(report.drained);
    assert_eq!(report.workers_stopped, 2);
    assert!(matches!(report.final_backup, Some(ScheduledBackup::Created(_))));
    assert!(!service.is_running());
}

/// Shutdown waits for a connection held by a caller, up to the drain timeout.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_waits_for_in_flight_work() {
    init_tracing();
    let dir = tempdir().expect("temp dir");
    let mut config = fast_config(dir.path());
    config.backup.auto_backup = false;
    config.backup.backup_on_shutdown = false;
    let service = std::sync::Arc::new(StorageService::open(config).expect("service should open"));

    let holder = {
        let service = std::sync::Arc::clone(&service);
        std::thread::spawn(move || {
            let conn = service.pool().acquire().expect("acquire");
            std::thread::sleep(Duration::from_millis(150));
            drop(conn);
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let report = service.shutdown().await.expect("shutdown should succeed");
    holder.join().expect("holder thread");

    assert!(report.drained);
    assert_eq!(report.connections_closed, service.config().pool.size.get());
    assert!(report.final_backup.is_none());
    assert!(matches!(service.start(), Err(StorageError::ShuttingDown)));
}

/// A connection still held after the drain timeout does not block shutdown.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_gives_up_after_drain_timeout() {
    let dir = tempdir().expect("temp dir");
    let mut config = fast_config(dir.path());
    config.shutdown.drain_timeout = Duration::from_millis(50);
    config.backup.backup_on_shutdown = false;
    let service = StorageService::open(config).expect("service should open");

    let held = service.pool().acquire().expect("acquire");
    let report = service.shutdown().await.expect("shutdown should succeed");
    assert!(!report.drained);
    assert_eq!(report.connections_closed, service.config().pool.size.get() - 1);
    drop(held);
}
