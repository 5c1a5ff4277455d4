//! Versioned schema migrations

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

use tradevault_core::error::{StorageError, StorageResult};

/// One schema step. Applied at most once, inside its own transaction.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub up: &'static str,
}

/// A migration recorded in `schema_migrations`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub version: u32,
    pub description: String,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub current_version: u32,
    pub latest_version: u32,
    pub pending: Vec<u32>,
    pub applied: Vec<AppliedMigration>,
}

impl MigrationStatus {
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }
}

pub struct MigrationEngine {
    migrations: Vec<Migration>,
}

impl Default for MigrationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationEngine {
    pub fn new() -> Self {
        Self {
            migrations: Self::default_migrations(),
        }
    }

    fn default_migrations() -> Vec<Migration> {
        vec![
            Migration {
                version: 1,
                description: "Create inventory and trades tables",
                up: r#"
                    CREATE TABLE IF NOT EXISTS inventory (
                        item_name TEXT PRIMARY KEY,
                        quantity INTEGER NOT NULL DEFAULT 0,
                        last_price REAL,
                        updated_at TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS trades (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        trader TEXT NOT NULL,
                        item_name TEXT NOT NULL REFERENCES inventory(item_name),
                        previous_quantity INTEGER NOT NULL,
                        current_quantity INTEGER NOT NULL,
                        quantity_delta INTEGER NOT NULL,
                        price REAL NOT NULL,
                        trade_type TEXT NOT NULL CHECK (trade_type IN ('buy', 'sell', 'transfer')),
                        created_at TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_trades_trader ON trades(trader);
                    CREATE INDEX IF NOT EXISTS idx_trades_created_at ON trades(created_at);
                "#,
            },
            Migration {
                version: 2,
                description: "Create persisted result cache",
                up: r#"
                    CREATE TABLE IF NOT EXISTS result_cache (
                        content_hash TEXT PRIMARY KEY,
                        cache_key TEXT NOT NULL,
                        value TEXT NOT NULL,
                        hit_count INTEGER NOT NULL DEFAULT 0,
                        created_at TEXT NOT NULL,
                        last_accessed TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_result_cache_last_accessed
                        ON result_cache(last_accessed);
                "#,
            },
            Migration {
                version: 3,
                description: "Create health log",
                up: r#"
                    CREATE TABLE IF NOT EXISTS health_log (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        checked_at TEXT NOT NULL,
                        healthy INTEGER NOT NULL,
                        integrity TEXT NOT NULL,
                        pool_utilization TEXT NOT NULL,
                        free_disk_bytes INTEGER,
                        avg_latency_ms REAL,
                        issues TEXT NOT NULL DEFAULT '[]'
                    );
                "#,
            },
        ]
    }

    pub fn latest_version(&self) -> u32 {
        self.migrations.iter().map(|m| m.version).max().unwrap_or(0)
    }

    /// Apply every pending migration. Returns the versions applied.
    pub fn migrate(&self, conn: &Connection) -> StorageResult<Vec<u32>> {
        self.migrate_to(conn, self.latest_version())
    }

    /// Apply pending migrations up to and including `target`.
    pub fn migrate_to(&self, conn: &Connection, target: u32) -> StorageResult<Vec<u32>> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| StorageError::database("create migrations table", e))?;

        let current = current_version(conn)?;
        let mut applied = Vec::new();
        for migration in &self.migrations {
            if migration.version > current && migration.version <= target {
                self.apply(conn, migration)?;
                applied.push(migration.version);
            }
        }

        if !applied.is_empty() {
            tracing::info!(?applied, from = current, "Applied schema migrations");
        }
        Ok(applied)
    }

    fn apply(&self, conn: &Connection, migration: &Migration) -> StorageResult<()> {
        let operation = format!("migration {}", migration.version);
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StorageError::database(&operation, e))?;

        tx.execute_batch(migration.up)
            .map_err(|e| StorageError::database(&operation, e))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
            params![migration.version, migration.description, Utc::now().to_rfc3339()],
        )
        .map_err(|e| StorageError::database(&operation, e))?;

        tx.commit().map_err(|e| StorageError::database(&operation, e))
    }

    pub fn status(&self, conn: &Connection) -> StorageResult<MigrationStatus> {
        let current = current_version(conn)?;
        let pending = self
            .migrations
            .iter()
            .filter(|m| m.version > current)
            .map(|m| m.version)
            .collect();

        let mut applied = Vec::new();
        if table_exists(conn)? {
            let mut stmt = conn
                .prepare("SELECT version, description, applied_at FROM schema_migrations ORDER BY version")
                .map_err(|e| StorageError::database("migration status", e))?;
            let rows = stmt
                .query_map([], |row| {
                    let applied_at: String = row.get(2)?;
                    Ok(AppliedMigration {
                        version: row.get(0)?,
                        description: row.get(1)?,
                        applied_at: DateTime::parse_from_rfc3339(&applied_at)
                            .map(|t| t.with_timezone(&Utc))
                            .unwrap_or_default(),
                    })
                })
                .map_err(|e| StorageError::database("migration status", e))?;
            for row in rows {
                applied.push(row.map_err(|e| StorageError::database("migration status", e))?);
            }
        }

        Ok(MigrationStatus {
            current_version: current,
            latest_version: self.latest_version(),
            pending,
            applied,
        })
    }
}

fn table_exists(conn: &Connection) -> StorageResult<bool> {
    conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations')",
        [],
        |row| row.get(0),
    )
    .map_err(|e| StorageError::database("migration status", e))
}

fn current_version(conn: &Connection) -> StorageResult<u32> {
    if !table_exists(conn)? {
        return Ok(0);
    }
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
    .map_err(|e| StorageError::database("read schema version", e))
}
