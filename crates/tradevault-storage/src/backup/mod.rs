//! # Backups
//!
//! Verified snapshots of the live store, with retention and validated
//! restores.
//!
//! - A backup is a `VACUUM INTO` snapshot taken on its own connection, so it
//!   is consistent under WAL and never holds a pooled connection. The copy is
//!   integrity-checked, counted, hashed and optionally gzipped before it is
//!   registered.
//! - At most one backup or restore runs at a time.
//! - A restore never destroys the store it replaces: the existing file is
//!   copied aside first and put back if the restored file fails validation.

mod archive;
mod registry;

pub use registry::{BackupMetadata, BackupRegistry, BackupType, REGISTRY_FILE};

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::{Connection, params};
use tracing::{debug, error, info, warn};

use tradevault_core::config::{BackupConfig, IntegrityCheckMode};
use tradevault_core::error::{StorageError, StorageResult};
use tradevault_core::health::IntegrityResult;

use crate::monitor::HealthMonitor;
use crate::pool::ConnectionPool;
use crate::sql;
use crate::worker::WorkerHandle;

use archive::ScratchFile;

/// Outcome of one auto-backup timer tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduledBackup {
    Created(String),
    SkippedUnhealthy(String),
    SkippedInProgress,
    Failed(String),
}

/// What a successful restore did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub backup_id: String,
    pub target: PathBuf,
    /// Where the replaced store was copied, if there was one.
    pub pre_restore_copy: Option<PathBuf>,
    /// Tables whose row count differs from the backup's metadata.
    pub row_count_mismatches: Vec<String>,
}

/// Clears the in-progress flag on drop.
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct BackupManager {
    config: BackupConfig,
    pool: Arc<ConnectionPool>,
    monitor: Arc<HealthMonitor>,
    registry: BackupRegistry,
    in_progress: AtomicBool,
    reload_timeout: Duration,
}

impl BackupManager {
    pub fn new(
        config: BackupConfig,
        pool: Arc<ConnectionPool>,
        monitor: Arc<HealthMonitor>,
        reload_timeout: Duration,
    ) -> StorageResult<Self> {
        fs::create_dir_all(&config.directory)
            .map_err(|e| StorageError::io("create backup directory", e))?;
        let registry = BackupRegistry::load(&config.directory)?;

        Ok(Self {
            config,
            pool,
            monitor,
            registry,
            in_progress: AtomicBool::new(false),
            reload_timeout,
        })
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    pub fn registry(&self) -> &BackupRegistry {
        &self.registry
    }

    /// Snapshot the live store. Returns the new backup id.
    pub fn create_backup(&self) -> StorageResult<String> {
        let _flight = FlightGuard::try_acquire(&self.in_progress).ok_or(StorageError::BackupInProgress)?;
        let started = Instant::now();
        let source = self.pool.path().to_path_buf();
        let id = self.next_id();

        let snapshot = ScratchFile::new(
            self.config
                .directory
                .join(archive::backup_file_name(&id, false)),
        );
        self.snapshot_to(&source, snapshot.path())
            .map_err(|e| StorageError::integrity(&id, format!("snapshot failed: {e}")))?;

        let (integrity, table_row_counts) = inspect(snapshot.path(), IntegrityCheckMode::Full)
            .map_err(|e| StorageError::integrity(&id, format!("cannot open snapshot: {e}")))?;
        if let IntegrityResult::Failed(reason) = integrity {
            error!(backup_id = %id, %reason, "Backup failed integrity check, discarded");
            return Err(StorageError::integrity(&id, reason));
        }

        let original_size = file_len(snapshot.path())?;
        let content_sha256 = sql::sha256_file(snapshot.path())
            .map_err(|e| StorageError::io("hash backup", e))?;

        let (backup_path, compressed_size) = if self.config.compress {
            let gz = ScratchFile::new(
                self.config
                    .directory
                    .join(archive::backup_file_name(&id, true)),
            );
            let size = archive::compress_file(snapshot.path(), gz.path())
                .map_err(|e| StorageError::io("compress backup", e))?;
            drop(snapshot);
            (gz.keep(), size)
        } else {
            (snapshot.keep(), original_size)
        };

        let sha256 = if self.config.compress {
            sql::sha256_file(&backup_path).map_err(|e| StorageError::io("hash backup", e))?
        } else {
            content_sha256.clone()
        };

        let metadata = BackupMetadata {
            id: id.clone(),
            backup_type: BackupType::Full,
            source_path: source,
            backup_path: backup_path.clone(),
            created_at: Utc::now(),
            original_size,
            compressed_size,
            sha256,
            content_sha256,
            table_row_counts,
            integrity_verified: true,
            compression_ratio: if original_size > 0 {
                compressed_size as f64 / original_size as f64
            } else {
                1.0
            },
            duration: started.elapsed(),
            compressed: self.config.compress,
        };

        if let Err(e) = self.registry.insert(metadata.clone()) {
            let _ = archive::remove_if_exists(&backup_path);
            return Err(e);
        }

        info!(
            backup_id = %id,
            path = %backup_path.display(),
            original_size,
            compressed_size,
            ratio = metadata.compression_ratio,
            duration_ms = metadata.duration.as_millis() as u64,
            "Backup created"
        );

        self.apply_retention();
        Ok(id)
    }

    fn next_id(&self) -> String {
        loop {
            let id = archive::backup_id(Utc::now());
            let taken = self.registry.contains(&id)
                || self
                    .config
                    .directory
                    .join(archive::backup_file_name(&id, self.config.compress))
                    .exists();
            if !taken {
                return id;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn snapshot_to(&self, source: &Path, destination: &Path) -> rusqlite::Result<()> {
        let conn = Connection::open(source)?;
        conn.busy_timeout(self.pool.config().pragmas.busy_timeout)?;
        conn.execute(
            "VACUUM INTO ?1",
            params![destination.to_string_lossy().into_owned()],
        )?;
        drop(conn);

        // Self-contained rollback-journal file: no -wal/-shm needed to read it.
        let copy = Connection::open(destination)?;
        sql::run_pragma(&copy, "PRAGMA journal_mode = DELETE")?;
        copy.close().map_err(|(_, e)| e)
    }

    /// Re-hash and integrity-check a stored backup.
    pub fn verify_backup(&self, id: &str) -> StorageResult<()> {
        let metadata = self.metadata(id)?;
        self.verify(&metadata)
    }

    fn verify(&self, metadata: &BackupMetadata) -> StorageResult<()> {
        let id = metadata.id.as_str();
        if !metadata.file_exists() {
            return Err(StorageError::integrity(id, "backup file is missing"));
        }

        let actual = sql::sha256_file(&metadata.backup_path)
            .map_err(|e| StorageError::io("hash backup", e))?;
        if actual != metadata.sha256 {
            return Err(StorageError::integrity(
                id,
                format!("hash mismatch: expected {}, found {actual}", metadata.sha256),
            ));
        }

        let scratch = ScratchFile::new(self.config.directory.join(format!(".verify_{id}.db")));
        archive::materialize(&metadata.backup_path, metadata.compressed, scratch.path())
            .map_err(|e| StorageError::integrity(id, format!("cannot unpack backup: {e}")))?;
        match inspect(scratch.path(), IntegrityCheckMode::Full) {
            Ok((IntegrityResult::Failed(reason), _)) => Err(StorageError::integrity(id, reason)),
            Ok(_) => {
                debug!(backup_id = id, "Backup verified");
                Ok(())
            }
            Err(e) => Err(StorageError::integrity(id, format!("cannot open backup: {e}"))),
        }
    }

    /// Restore backup `id` to `target`.
    ///
    /// The backup file must exist; with `verify_first` its hash and integrity
    /// are also checked before anything at `target` is touched. Restoring
    /// over the pool's own store takes every pooled connection out of
    /// service for the duration.
    pub fn restore(&self, id: &str, target: &Path, verify_first: bool) -> StorageResult<RestoreReport> {
        let _flight = FlightGuard::try_acquire(&self.in_progress).ok_or(StorageError::BackupInProgress)?;
        let metadata = self.metadata(id)?;

        if !metadata.file_exists() {
            warn!(backup_id = id, path = %metadata.backup_path.display(), "Backup file missing");
            return Err(StorageError::integrity(id, "backup file is missing"));
        }
        if verify_first {
            self.verify(&metadata)?;
        }

        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StorageError::io("create restore directory", e))?;
        }

        let report = if self.is_live_store(target) {
            info!(backup_id = id, "Restoring over the live store");
            self.pool
                .reload(self.reload_timeout, || self.swap_in(&metadata, target))?
        } else {
            self.swap_in(&metadata, target)?
        };

        info!(
            backup_id = id,
            target = %target.display(),
            pre_restore_copy = ?report.pre_restore_copy,
            "Restore completed"
        );
        Ok(report)
    }

    fn is_live_store(&self, target: &Path) -> bool {
        match (fs::canonicalize(target), fs::canonicalize(self.pool.path())) {
            (Ok(a), Ok(b)) => a == b,
            _ => target == self.pool.path(),
        }
    }

    fn swap_in(&self, metadata: &BackupMetadata, target: &Path) -> StorageResult<RestoreReport> {
        let id = metadata.id.as_str();
        let staged = ScratchFile::new(archive::with_suffix(target, &format!(".restore_{id}")));
        archive::materialize(&metadata.backup_path, metadata.compressed, staged.path())
            .map_err(|e| StorageError::integrity(id, format!("cannot unpack backup: {e}")))?;

        let pre_restore_copy = if target.exists() {
            let stamp = Utc::now().format("%Y%m%d_%H%M%S_%3f");
            let aside = archive::with_suffix(target, &format!(".pre_restore_{stamp}"));
            fs::copy(target, &aside).map_err(|e| StorageError::io("copy store aside", e))?;
            let wal = archive::with_suffix(target, "-wal");
            if wal.exists() {
                fs::copy(&wal, archive::with_suffix(&aside, "-wal"))
                    .map_err(|e| StorageError::io("copy store aside", e))?;
            }
            Some(aside)
        } else {
            None
        };

        fs::rename(staged.path(), target).map_err(|e| StorageError::io("move restored store", e))?;
        staged.keep();
        for side in archive::side_files(target) {
            archive::remove_if_exists(&side).map_err(|e| StorageError::io("remove stale side file", e))?;
        }

        match self.validate_restored(metadata, target) {
            Ok(row_count_mismatches) => Ok(RestoreReport {
                backup_id: id.to_string(),
                target: target.to_path_buf(),
                pre_restore_copy,
                row_count_mismatches,
            }),
            Err(reason) => {
                error!(backup_id = id, %reason, "Restored store failed validation, rolling back");
                self.roll_back(target, pre_restore_copy.as_deref())?;
                Err(StorageError::RestoreValidation {
                    backup_id: id.to_string(),
                    reason,
                    preserved_copy: pre_restore_copy,
                })
            }
        }
    }

    fn validate_restored(&self, metadata: &BackupMetadata, target: &Path) -> Result<Vec<String>, String> {
        let hash = sql::sha256_file(target).map_err(|e| format!("cannot hash restored store: {e}"))?;
        if hash != metadata.content_sha256 {
            return Err(format!(
                "content hash mismatch: expected {}, found {hash}",
                metadata.content_sha256
            ));
        }

        let (integrity, counts) = inspect(target, IntegrityCheckMode::Full)
            .map_err(|e| format!("cannot open restored store: {e}"))?;
        if let IntegrityResult::Failed(reason) = integrity {
            return Err(format!("integrity check failed: {reason}"));
        }

        let mut mismatches = Vec::new();
        for (table, expected) in &metadata.table_row_counts {
            let actual = counts.get(table).copied();
            if actual != Some(*expected) {
                warn!(
                    backup_id = %metadata.id,
                    table = %table,
                    expected,
                    actual = ?actual,
                    "Row count differs from backup metadata"
                );
                mismatches.push(table.clone());
            }
        }
        Ok(mismatches)
    }

    fn roll_back(&self, target: &Path, pre_restore_copy: Option<&Path>) -> StorageResult<()> {
        match pre_restore_copy {
            Some(aside) => {
                fs::copy(aside, target).map_err(|e| StorageError::io("put original store back", e))?;
                let aside_wal = archive::with_suffix(aside, "-wal");
                if aside_wal.exists() {
                    fs::copy(&aside_wal, archive::with_suffix(target, "-wal"))
                        .map_err(|e| StorageError::io("put original store back", e))?;
                }
            }
            None => {
                archive::remove_if_exists(target)
                    .map_err(|e| StorageError::io("remove failed restore", e))?;
            }
        }
        Ok(())
    }

    /// Registry entries, newest first.
    pub fn list_backups(&self) -> Vec<BackupMetadata> {
        let mut backups: Vec<_> = self.registry.snapshot().values().cloned().collect();
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        backups
    }

    /// Backups that can be restored right now, newest first. Entries whose
    /// file has disappeared are treated as corrupt and left out.
    pub fn restore_candidates(&self) -> Vec<BackupMetadata> {
        self.list_backups()
            .into_iter()
            .filter(|b| b.is_recoverable())
            .collect()
    }

    pub fn latest_recoverable(&self) -> Option<BackupMetadata> {
        self.restore_candidates().into_iter().next()
    }

    pub fn metadata(&self, id: &str) -> StorageResult<BackupMetadata> {
        self.registry.get(id).ok_or_else(|| StorageError::BackupNotFound {
            backup_id: id.to_string(),
        })
    }

    /// Remove a backup's file and its registry entry. A file that is already
    /// gone is not an error.
    pub fn delete_backup(&self, id: &str) -> StorageResult<()> {
        let metadata = self.metadata(id)?;
        match archive::remove_if_exists(&metadata.backup_path) {
            Ok(true) => {}
            Ok(false) => warn!(backup_id = id, "Backup file already gone, dropping registry entry"),
            Err(e) => return Err(StorageError::io("delete backup file", e)),
        }
        self.registry.remove(id)?;
        info!(backup_id = id, "Backup deleted");
        Ok(())
    }

    /// Count-based then age-based cleanup. Returns the ids deleted.
    pub fn apply_retention(&self) -> Vec<String> {
        let mut deleted = Vec::new();

        let mut oldest_first = self.list_backups();
        oldest_first.reverse();
        let excess = oldest_first.len().saturating_sub(self.config.max_backups);
        for backup in oldest_first.iter().take(excess) {
            self.delete_for_retention(&backup.id, "count", &mut deleted);
        }

        let cutoff = chrono::Duration::try_days(i64::from(self.config.retention_days))
            .and_then(|window| Utc::now().checked_sub_signed(window));
        match cutoff {
            Some(cutoff) => {
                for backup in oldest_first.iter().skip(excess) {
                    if backup.created_at < cutoff {
                        self.delete_for_retention(&backup.id, "age", &mut deleted);
                    }
                }
            }
            None => debug!(
                retention_days = self.config.retention_days,
                "Retention window reaches past the calendar, age policy skipped"
            ),
        }

        deleted
    }

    fn delete_for_retention(&self, id: &str, policy: &str, deleted: &mut Vec<String>) {
        match self.delete_backup(id) {
            Ok(()) => {
                debug!(backup_id = id, policy, "Retention removed backup");
                deleted.push(id.to_string());
            }
            Err(e) => warn!(backup_id = id, policy, error = %e, "Retention could not remove backup"),
        }
    }

    /// Body of the auto-backup timer. Skips, rather than delays, when the
    /// store is reported unhealthy.
    pub fn run_scheduled_backup(&self) -> ScheduledBackup {
        let health = self.monitor.status();
        if !health.healthy {
            let reason = health.summary();
            warn!(%reason, "Skipping scheduled backup, store is unhealthy");
            return ScheduledBackup::SkippedUnhealthy(reason);
        }

        match self.create_backup() {
            Ok(id) => ScheduledBackup::Created(id),
            Err(StorageError::BackupInProgress) => {
                warn!("Skipping scheduled backup, another backup is in progress");
                ScheduledBackup::SkippedInProgress
            }
            Err(e) => {
                error!(error = %e, "Scheduled backup failed");
                ScheduledBackup::Failed(e.to_string())
            }
        }
    }

    /// Start the auto-backup loop on the current tokio runtime.
    pub fn start_auto_backup(self: &Arc<Self>) -> WorkerHandle {
        let manager = Arc::clone(self);
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            directory = %self.config.directory.display(),
            "Starting auto-backup"
        );
        WorkerHandle::spawn("auto-backup", self.config.interval, move || {
            let manager = Arc::clone(&manager);
            async move {
                match tokio::task::spawn_blocking(move || manager.run_scheduled_backup()).await {
                    Ok(outcome) => debug!(?outcome, "Scheduled backup tick"),
                    Err(e) => warn!(error = %e, "Scheduled backup task failed"),
                }
            }
        })
    }
}

/// Integrity result and per-table row counts of the store at `path`,
/// opened read-only.
fn inspect(
    path: &Path,
    mode: IntegrityCheckMode,
) -> rusqlite::Result<(IntegrityResult, BTreeMap<String, i64>)> {
    let conn = sql::open_read_only(path)?;
    let integrity = sql::integrity_check(&conn, mode)?;
    let counts = if integrity.is_ok() {
        sql::table_row_counts(&conn)?
    } else {
        BTreeMap::new()
    };
    Ok((integrity, counts))
}

fn file_len(path: &Path) -> StorageResult<u64> {
    fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| StorageError::io("stat backup", e))
}
