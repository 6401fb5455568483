//! # crsync
//!
//! Local-first replication for SQLite: every write to a tracked table is
//! captured as per-column change records, shipped to a remote in compact
//! batches, merged on arrival, and announced to subscribers.
//!
//! ## Overview
//!
//! - **Tracking**: `enable_tracking` installs triggers that record each
//!   column change with its own version and causal length
//! - **Versions**: `current` is the newest local change, `synced` the newest
//!   one the remote has accepted
//! - **Sync**: pushes unsynced local changes, holds a standing pull, and
//!   merges inbound batches with last-writer-wins per column
//! - **Invalidation**: subscribers name the tables they read and hear about
//!   every batch that touches them
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use crsync::{Collaborators, Database, DatabaseConfig, Registry, TableSet};
//! use crsync::core::{ChangeRecord, SiteId};
//!
//! async fn example() -> crsync::Result<()> {
//!     let registry = Arc::new(Registry::new());
//!     let db = Database::open(registry, DatabaseConfig::memory(), Collaborators::default()).await?;
//!
//!     db.update(|conn| {
//!         conn.execute_batch("CREATE TABLE todos (id INTEGER PRIMARY KEY, title TEXT)")?;
//!         Ok(())
//!     })
//!     .await?;
//!     db.enable_tracking("todos").await?;
//!
//!     let _subscription = db
//!         .subscribe(
//!             TableSet::of(["todos"]),
//!             |changes: Vec<ChangeRecord>, _sender: Option<SiteId>| async move {
//!                 println!("todos changed ({} cells)", changes.len());
//!                 Ok::<(), crsync::sync::BoxError>(())
//!             },
//!             None,
//!         )
//!         .await?;
//!
//!     db.update(|conn| {
//!         conn.execute("INSERT INTO todos (title) VALUES ('milk')", [])?;
//!         Ok(())
//!     })
//!     .await?;
//!
//!     db.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `crsync::core` - data model, codec, chunker, query plans
//! - `crsync::store` - SQLite change tracking, versions, queues
//! - `crsync::sync` - the sync engine and its collaborators

pub mod database;
pub mod error;

// Re-export component crates
pub use crsync_core as core;
pub use crsync_store as store;
pub use crsync_sync as sync;

pub use database::{Database, DatabaseConfig};
pub use error::{Error, Result};

// Re-export commonly used types
pub use crsync_core::{affected_tables, ChangeRecord, Dependencies, EncodedBatch, Plan, SiteId, Value};
pub use crsync_store::{Registry, StoreConfig, VersionState};
pub use crsync_sync::{
    Collaborators, SubscribeOptions, Subscription, SyncConfig, SyncEngine, TableSet,
};
