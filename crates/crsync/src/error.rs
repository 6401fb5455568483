//! Error types for the database facade.

use crsync_store::StoreError;
use crsync_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// The database was closed.
    #[error("database is closed")]
    Closed,
}

/// Result type for database operations.
pub type Result<T> = std::result::Result<T, Error>;
