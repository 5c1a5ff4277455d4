//! Fixed-size connection pool with blocking checkout
//!
//! The pool opens exactly `size` connections up front and never resizes.
//! Idle connections sit in a bounded queue; [`ConnectionPool::acquire`]
//! blocks on that queue until a connection is free or the timeout elapses.
//! A checked-out connection is owned by exactly one [`PooledConnection`],
//! which puts it back on drop, including when the caller saw a query error.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use rusqlite::Connection;

use tradevault_core::config::PoolConfig;
use tradevault_core::error::{StorageError, StorageResult};
use tradevault_core::health::PoolStatistics;

use crate::sql;

/// Stable slot number of a pooled connection.
pub type ConnectionId = usize;

/// Bookkeeping for one pooled connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub query_count: u64,
    pub error_count: u64,
    pub healthy: bool,
    pub checked_out: bool,
}

impl ConnectionInfo {
    fn new(id: ConnectionId) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            last_used: now,
            query_count: 0,
            error_count: 0,
            healthy: true,
            checked_out: false,
        }
    }
}

struct PoolSlot {
    id: ConnectionId,
    conn: Connection,
}

/// Connection pool for a single SQLite file
pub struct ConnectionPool {
    path: PathBuf,
    config: PoolConfig,
    idle_tx: Sender<PoolSlot>,
    idle_rx: Receiver<PoolSlot>,
    connections: Mutex<HashMap<ConnectionId, ConnectionInfo>>,
    active: AtomicUsize,
    closed: AtomicBool,
    created_at: Instant,
}

impl ConnectionPool {
    /// Open `config.size` connections to the store at `path`.
    pub fn open(path: impl AsRef<Path>, config: PoolConfig) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let capacity = config.size.get();
        let (idle_tx, idle_rx) = bounded(capacity);
        let mut connections = HashMap::with_capacity(capacity);

        for id in 0..capacity {
            let conn = sql::open_connection(&path, &config.pragmas)?;
            connections.insert(id, ConnectionInfo::new(id));
            idle_tx
                .send(PoolSlot { id, conn })
                .map_err(|_| StorageError::database("pool init", "idle queue closed"))?;
        }

        tracing::debug!(
            path = %path.display(),
            size = capacity,
            journal_mode = %config.pragmas.journal_mode,
            "Connection pool opened"
        );

        Ok(Self {
            path,
            config,
            idle_tx,
            idle_rx,
            connections: Mutex::new(connections),
            active: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            created_at: Instant::now(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> usize {
        self.config.size.get()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Check out a connection using the configured acquire timeout.
    pub fn acquire(&self) -> StorageResult<PooledConnection<'_>> {
        self.acquire_timeout(self.config.acquire_timeout)
    }

    /// Check out a connection, blocking for at most `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> StorageResult<PooledConnection<'_>> {
        if self.is_closed() {
            return Err(StorageError::ShuttingDown);
        }

        let slot = match self.idle_rx.recv_timeout(timeout) {
            Ok(slot) => slot,
            Err(RecvTimeoutError::Timeout) => {
                tracing::debug!(
                    timeout_ms = timeout.as_millis() as u64,
                    capacity = self.capacity(),
                    "Connection pool exhausted"
                );
                return Err(StorageError::PoolExhausted { timeout });
            }
            Err(RecvTimeoutError::Disconnected) => return Err(StorageError::ShuttingDown),
        };

        if self.is_closed() {
            self.close_slot(slot);
            return Err(StorageError::ShuttingDown);
        }

        self.active.fetch_add(1, Ordering::AcqRel);
        if let Some(info) = self.connections.lock().get_mut(&slot.id) {
            info.checked_out = true;
            info.last_used = Utc::now();
        }

        Ok(PooledConnection {
            pool: self,
            slot: Some(slot),
            queries: 0,
            errors: 0,
            invalid: false,
        })
    }

    /// Return a connection explicitly. Equivalent to dropping it.
    pub fn release(&self, conn: PooledConnection<'_>) {
        drop(conn);
    }

    fn return_slot(&self, slot: PoolSlot, queries: u64, errors: u64, invalid: bool) {
        let id = slot.id;
        let mut reopened = false;

        let slot = if invalid && !self.is_closed() {
            match sql::open_connection(&self.path, &self.config.pragmas) {
                Ok(conn) => {
                    reopened = true;
                    tracing::warn!(connection_id = id, "Replaced invalidated connection");
                    PoolSlot { id, conn }
                }
                Err(e) => {
                    tracing::error!(
                        connection_id = id,
                        error = %e,
                        "Failed to reopen invalidated connection, keeping the old one"
                    );
                    slot
                }
            }
        } else {
            slot
        };

        {
            let mut connections = self.connections.lock();
            if let Some(info) = connections.get_mut(&id) {
                let now = Utc::now();
                info.last_used = now;
                info.query_count += queries;
                info.error_count += errors;
                info.checked_out = false;
                if reopened {
                    info.created_at = now;
                    info.healthy = true;
                } else if invalid {
                    info.healthy = false;
                }
            }
        }

        self.active.fetch_sub(1, Ordering::AcqRel);

        if self.is_closed() {
            self.close_slot(slot);
            return;
        }

        if self.idle_tx.send(slot).is_err() {
            tracing::error!(connection_id = id, "Idle queue closed, connection dropped");
        }
    }

    fn close_slot(&self, slot: PoolSlot) {
        if let Err((_, e)) = slot.conn.close() {
            tracing::warn!(connection_id = slot.id, error = %e, "Error closing connection");
        }
    }

    /// Snapshot of pool usage.
    pub fn statistics(&self) -> PoolStatistics {
        let connections = self.connections.lock();
        let mut stats = PoolStatistics::new(
            self.capacity(),
            self.idle_rx.len(),
            self.active.load(Ordering::Acquire),
            self.created_at,
        );
        for info in connections.values() {
            stats.total_queries += info.query_count;
            stats.total_errors += info.error_count;
            if !info.healthy {
                stats.unhealthy_connections += 1;
            }
        }
        stats
    }

    /// Per-connection metadata ordered by id.
    pub fn connection_info(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<_> = self.connections.lock().values().cloned().collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop handing out connections. In-flight holders keep theirs.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::info!(path = %self.path.display(), "Connection pool closed to new checkouts");
        }
    }

    /// Wait until every connection is back, up to `timeout`.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.active_connections() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        true
    }

    /// Close the pool and every idle connection, checkpointing the WAL first.
    /// Connections still checked out are closed when they come back.
    pub fn close_all(&self) -> usize {
        self.close();

        let mut closed = 0;
        while let Ok(slot) = self.idle_rx.try_recv() {
            if closed == 0 {
                if let Err(e) = sql::run_pragma(&slot.conn, "PRAGMA wal_checkpoint(TRUNCATE)") {
                    tracing::warn!(error = %e, "WAL checkpoint before close failed");
                }
            }
            self.close_slot(slot);
            closed += 1;
        }

        tracing::info!(closed, "Pooled connections closed");
        closed
    }

    /// Take every connection out of service, run `f`, then reopen the pool.
    ///
    /// Used for file-level operations on the live store (restore). No pooled
    /// handle to the old file survives, and the WAL is checkpointed and
    /// truncated before `f` runs. Other callers block in `acquire` meanwhile.
    pub fn reload<T, F>(&self, timeout: Duration, f: F) -> StorageResult<T>
    where
        F: FnOnce() -> StorageResult<T>,
    {
        if self.is_closed() {
            return Err(StorageError::ShuttingDown);
        }

        let deadline = Instant::now() + timeout;
        let mut slots = Vec::with_capacity(self.capacity());
        while slots.len() < self.capacity() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.idle_rx.recv_timeout(remaining) {
                Ok(slot) => slots.push(slot),
                Err(_) => {
                    for slot in slots {
                        let _ = self.idle_tx.send(slot);
                    }
                    return Err(StorageError::PoolExhausted { timeout });
                }
            }
        }

        if let Some(first) = slots.first() {
            if let Err(e) = sql::run_pragma(&first.conn, "PRAGMA wal_checkpoint(TRUNCATE)") {
                tracing::warn!(error = %e, "WAL checkpoint before reload failed");
            }
        }
        let ids: Vec<ConnectionId> = slots.iter().map(|slot| slot.id).collect();
        for slot in slots {
            self.close_slot(slot);
        }

        let result = f();

        for id in ids {
            let conn = match sql::open_connection(&self.path, &self.config.pragmas) {
                Ok(conn) => conn,
                Err(e) => {
                    if let Some(info) = self.connections.lock().get_mut(&id) {
                        info.healthy = false;
                    }
                    tracing::error!(connection_id = id, error = %e, "Failed to reopen connection");
                    return Err(e);
                }
            };
            self.connections.lock().insert(id, ConnectionInfo::new(id));
            if self.idle_tx.send(PoolSlot { id, conn }).is_err() {
                return Err(StorageError::ShuttingDown);
            }
        }

        tracing::info!(path = %self.path.display(), "Connection pool reloaded");
        result
    }
}

/// RAII guard for a checked-out connection. Returns it to the pool on drop.
pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    slot: Option<PoolSlot>,
    queries: u64,
    errors: u64,
    invalid: bool,
}

impl PooledConnection<'_> {
    pub fn id(&self) -> ConnectionId {
        self.slot.as_ref().map(|slot| slot.id).unwrap_or_default()
    }

    /// Count a statement against this connection's counters.
    pub fn record_outcome(&mut self, success: bool) {
        self.queries += 1;
        if !success {
            self.errors += 1;
        }
    }

    /// Mark the session broken; the pool reopens it on release.
    pub fn invalidate(&mut self) {
        self.invalid = true;
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self
            .slot
            .as_ref()
            .expect("BUG: PooledConnection has no connection (this should never happen)")
            .conn
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self
            .slot
            .as_mut()
            .expect("BUG: PooledConnection has no connection (this should never happen)")
            .conn
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool
                .return_slot(slot, self.queries, self.errors, self.invalid);
        }
    }
}
