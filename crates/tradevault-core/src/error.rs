//! Storage error taxonomy.
//!
//! Every failure surfaced by the storage layer is a [`StorageError`]. Callers
//! use [`StorageError::class`] to pick a retry policy: transient conditions
//! (pool exhausted, circuit open) are worth retrying after a pause, caller
//! errors (bad SQL, invalid input) are not, and system failures signal that
//! the store itself needs attention.

use std::path::PathBuf;
use std::time::Duration;

use crate::metrics::StatementType;

/// Result alias used throughout the storage layer.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors produced by the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No pooled connection became available within the acquire timeout.
    #[error("No connection available within {}ms", timeout.as_millis())]
    PoolExhausted { timeout: Duration },

    /// The circuit breaker is open and rejects new queries.
    #[error("Circuit breaker open, retry in {}ms", retry_after.as_millis())]
    CircuitOpen { retry_after: Duration },

    /// A statement failed to execute.
    #[error("{statement_type} query failed: {message}")]
    QueryFailed {
        statement_type: StatementType,
        message: String,
    },

    /// Another backup is currently running.
    #[error("A backup is already in progress")]
    BackupInProgress,

    /// A backup file is missing, corrupt, or does not match its recorded hash.
    #[error("Backup '{backup_id}' failed integrity verification: {reason}")]
    BackupIntegrity { backup_id: String, reason: String },

    /// The restored store failed its own validation; the original was put back.
    #[error("Restore of '{backup_id}' failed validation: {reason}")]
    RestoreValidation {
        backup_id: String,
        reason: String,
        preserved_copy: Option<PathBuf>,
    },

    /// No registry entry exists for the requested backup.
    #[error("Backup '{backup_id}' not found")]
    BackupNotFound { backup_id: String },

    /// The operation was refused because the store is reported unhealthy.
    #[error("Store is unhealthy: {reason}")]
    Unhealthy { reason: String },

    /// The pool no longer hands out connections.
    #[error("Storage is shutting down")]
    ShuttingDown,

    /// Caller supplied invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Filesystem failure.
    #[error("I/O error during {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Non-query database failure (open, pragma, migration).
    #[error("Database error during {operation}: {message}")]
    Database { operation: String, message: String },

    /// The backup registry could not be read or written.
    #[error("Backup registry error: {0}")]
    Registry(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Coarse classification used by callers to choose a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Try again later (pool exhausted, circuit open, backup in progress).
    Transient,
    /// The request itself is wrong; retrying will not help.
    Caller,
    /// The store is failing; operators should look at health and backups.
    SystemFailure,
    /// Unrecoverable for this process (I/O, configuration, shutdown).
    Fatal,
}

impl StorageError {
    /// Classify this error for retry and backoff decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            StorageError::PoolExhausted { .. }
            | StorageError::CircuitOpen { .. }
            | StorageError::BackupInProgress => ErrorClass::Transient,
            StorageError::QueryFailed { .. }
            | StorageError::InvalidInput(_)
            | StorageError::BackupNotFound { .. } => ErrorClass::Caller,
            StorageError::BackupIntegrity { .. }
            | StorageError::RestoreValidation { .. }
            | StorageError::Unhealthy { .. } => ErrorClass::SystemFailure,
            StorageError::ShuttingDown
            | StorageError::Io { .. }
            | StorageError::Database { .. }
            | StorageError::Registry(_)
            | StorageError::Config(_) => ErrorClass::Fatal,
        }
    }

    /// True when the caller may retry the same request after backing off.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Wrap an I/O error with the operation that produced it.
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        StorageError::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a database error for a non-query operation.
    pub fn database(operation: impl Into<String>, message: impl ToString) -> Self {
        StorageError::Database {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Create an integrity error for a backup.
    pub fn integrity(backup_id: impl Into<String>, reason: impl Into<String>) -> Self {
        StorageError::BackupIntegrity {
            backup_id: backup_id.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("Failed to parse TOML config: {0}")]
    Parse(String),

    #[error("Invalid environment variable '{key}': {message}")]
    InvalidEnvVar { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    Validation(String),
}
