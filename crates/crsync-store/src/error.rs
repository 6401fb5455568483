//! Error types for the store module.

use crsync_core::CoreError;
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Key packing or other core failure.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// The table does not exist.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// Change tracking needs a primary key to address rows.
    #[error("table {0} has no primary key")]
    NoPrimaryKey(String),

    /// A NOT NULL column without a default cannot be merged column by column.
    #[error("column {table}.{column} is NOT NULL without a default")]
    UnsupportedColumn { table: String, column: String },

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// The operation panicked; its savepoint was rolled back.
    #[error("operation panicked: {0}")]
    Panicked(String),

    /// The shared transaction for this operation's batch failed as a whole.
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),
}

impl StoreError {
    /// A poisoned connection mutex, reported as a locked database.
    pub(crate) fn poisoned(e: impl std::fmt::Display) -> Self {
        StoreError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
            Some(format!("mutex poisoned: {}", e)),
        ))
    }

    /// A blocking task that panicked or was cancelled.
    pub(crate) fn join(e: tokio::task::JoinError) -> Self {
        StoreError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_MISUSE),
            Some(format!("spawn_blocking failed: {}", e)),
        ))
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
