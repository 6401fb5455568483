//! Error types for the sync module.

use crsync_core::CodecError;
use crsync_store::StoreError;
use thiserror::Error;

/// Error type returned by subscriber callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A batch could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(String),

    /// A subscriber callback failed.
    #[error("listener failed: {0}")]
    Listener(#[source] BoxError),

    /// The engine has been closed.
    #[error("sync engine closed")]
    Closed,
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
