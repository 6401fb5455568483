//! # crsync Store
//!
//! SQLite-backed change tracking for crsync. Local writes to tracked tables
//! are captured per column by triggers, remote changes are merged with
//! causal-length and last-writer-wins rules, and all access goes through
//! coalescing transaction queues.
//!
//! ## Key Types
//!
//! - [`Engine`] - What the replication core needs from the database
//! - [`Store`] - A connection with its write and read queues
//! - [`Registry`] - One shared [`Store`] per database file
//! - [`VersionState`] - Local version counter and synced watermark
//! - [`Applied`] - Result of a tracked local operation
//!
//! ## Usage
//!
//! ```rust,no_run
//! use crsync_store::{PeerFilter, Store};
//!
//! async fn example() -> crsync_store::Result<()> {
//!     let store = Store::open_memory()?;
//!     store
//!         .write(|conn| {
//!             conn.execute_batch("CREATE TABLE todos (id INTEGER PRIMARY KEY, title TEXT);")?;
//!             Ok(())
//!         })
//!         .await?;
//!     store.enable_tracking("todos").await?;
//!
//!     let applied = store
//!         .apply_operation(|conn| {
//!             conn.execute("INSERT INTO todos (id, title) VALUES (1, 'hi')", [])?;
//!             Ok(())
//!         })
//!         .await?;
//!     assert!(!applied.changes.is_empty());
//!
//!     let unpushed = store.changes_since(0, PeerFilter::LocalOnly).await?;
//!     assert_eq!(unpushed.len(), 1);
//!     Ok(())
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Live versions**: `current` is always `MAX(db_version)`, never cached
//! - **One version per operation**: every write in an operation shares a pinned version
//! - **Watermark safety**: `synced` only moves forward and never passes `current`
//! - **Merges are silent**: triggers are suppressed while remote rows are applied

pub mod changes;
pub mod crr;
pub mod engine;
pub mod error;
pub mod migration;
pub mod queue;
pub mod registry;
pub mod version;

pub use changes::{apply_operation, changes_since, insert_changes, resolve_changes, Applied};
pub use crr::{enable_tracking, table_info, tracked_tables, TableInfo};
pub use engine::{open_connection, Engine, PeerFilter};
pub use error::{Result, StoreError};
pub use queue::Queue;
pub use registry::{Registry, Store, StoreConfig};
pub use version::{select_version, update_version, VersionState};
