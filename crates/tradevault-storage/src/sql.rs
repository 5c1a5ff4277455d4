//! Low-level SQLite helpers shared by the pool, executor, monitor and backups.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode, OpenFlags};
use sha2::{Digest, Sha256};

use tradevault_core::config::{IntegrityCheckMode, PragmaConfig};
use tradevault_core::error::{StorageError, StorageResult};
use tradevault_core::health::IntegrityResult;
use tradevault_core::metrics::StatementType;

/// Open a read-write connection and apply the configured pragmas.
pub(crate) fn open_connection(path: &Path, pragmas: &PragmaConfig) -> StorageResult<Connection> {
    let conn = Connection::open(path).map_err(|e| StorageError::database("open", e))?;
    apply_pragmas(&conn, pragmas).map_err(|e| StorageError::database("configure", e))?;
    Ok(conn)
}

/// Open a store without write access, for verifying backups and restores.
pub(crate) fn open_read_only(path: &Path) -> rusqlite::Result<Connection> {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
}

pub(crate) fn apply_pragmas(conn: &Connection, pragmas: &PragmaConfig) -> rusqlite::Result<()> {
    conn.busy_timeout(pragmas.busy_timeout)?;

    let statements = [
        format!("PRAGMA journal_mode = {}", pragmas.journal_mode),
        format!("PRAGMA synchronous = {}", pragmas.synchronous),
        format!("PRAGMA cache_size = -{}", pragmas.cache_size_kb),
        format!("PRAGMA mmap_size = {}", pragmas.mmap_size_bytes),
        format!(
            "PRAGMA foreign_keys = {}",
            if pragmas.foreign_keys { "ON" } else { "OFF" }
        ),
    ];

    for sql in &statements {
        run_pragma(conn, sql)?;
    }
    Ok(())
}

/// Run a pragma and discard whatever rows it reports.
pub(crate) fn run_pragma(conn: &Connection, sql: &str) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;
    while rows.next()?.is_some() {}
    Ok(())
}

pub(crate) fn integrity_check(
    conn: &Connection,
    mode: IntegrityCheckMode,
) -> rusqlite::Result<IntegrityResult> {
    let mut stmt = conn.prepare(&format!("PRAGMA {}", mode.pragma()))?;
    let messages = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    if messages.len() == 1 && messages[0] == "ok" {
        Ok(IntegrityResult::Ok)
    } else {
        Ok(IntegrityResult::Failed(messages.join("; ")))
    }
}

pub(crate) fn foreign_key_violations(conn: &Connection) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
    let mut rows = stmt.query([])?;
    let mut count = 0;
    while rows.next()?.is_some() {
        count += 1;
    }
    Ok(count)
}

/// Row count of every user table, keyed by table name.
pub(crate) fn table_row_counts(conn: &Connection) -> rusqlite::Result<BTreeMap<String, i64>> {
    let tables: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        names
    };

    let mut counts = BTreeMap::new();
    for table in tables {
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_identifier(&table)),
            [],
            |row| row.get(0),
        )?;
        counts.insert(table, count);
    }
    Ok(counts)
}

pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Errors that mean the connection itself is unusable, not just the statement.
pub(crate) fn is_session_error(error: &rusqlite::Error) -> bool {
    matches!(
        error.sqlite_error_code(),
        Some(
            ErrorCode::NotADatabase
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::DatabaseCorrupt
        )
    )
}

pub(crate) fn query_failed(statement_type: StatementType, error: &rusqlite::Error) -> StorageError {
    StorageError::QueryFailed {
        statement_type,
        message: error.to_string(),
    }
}

/// First 16 hex characters of the SHA-256 of the whitespace-normalised statement.
pub fn query_hash(sql: &str) -> String {
    let normalised = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut hex = sha256_hex(normalised.as_bytes());
    hex.truncate(16);
    hex
}

/// Fixed-width UTC timestamp, so stored values sort lexicographically.
pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub(crate) fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}
