//! # crsync Sync
//!
//! Keeps a local store in step with a remote peer and with other contexts
//! sharing the same database.
//!
//! ## Overview
//!
//! The [`SyncEngine`] owns three flows:
//!
//! - **Push**: unsynced local changes go to the remote; the watermark moves
//!   only after the remote accepts them.
//! - **Pull**: a standing subscription on the remote, seeded with the local
//!   watermark. Inbound batches are merged and fanned out.
//! - **Fan-out**: every applied batch is delivered to subscribers whose
//!   tables it touches. Local batches are also broadcast and pushed.
//!
//! ## Key Properties
//!
//! - **No lost changes**: failed pushes leave the watermark where it was
//! - **Echo suppression**: a subscriber tagged with a client never sees that
//!   client's own batches
//! - **Contained failures**: a failing subscriber does not affect others or
//!   the write that triggered it
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use crsync_store::Store;
//! use crsync_sync::{Collaborators, SyncConfig, SyncEngine, TableSet};
//!
//! async fn example() -> crsync_sync::Result<()> {
//!     let store = Arc::new(Store::open_memory()?);
//!     let engine = SyncEngine::start(store, SyncConfig::default(), Collaborators::default());
//!
//!     let _subscription = engine
//!         .subscribe(
//!             TableSet::of(["todos"]),
//!             |changes: Vec<crsync_core::ChangeRecord>, _sender: Option<crsync_core::SiteId>| async move {
//!                 println!("{} changes", changes.len());
//!                 Ok::<(), crsync_sync::BoxError>(())
//!             },
//!             None,
//!         )
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod engine;
pub mod error;
pub mod listener;
pub mod transport;

pub use broadcast::{memory::BroadcastEndpoint, memory::BroadcastHub, Broadcast};
pub use engine::{Collaborators, ErrorHook, SyncConfig, SyncEngine};
pub use error::{BoxError, Result, SyncError};
pub use listener::{Listener, ListenerResult, SubscribeOptions, Subscription, TableSet};
pub use transport::{memory::PeerTransport, memory::RecordingTransport, PullRequest, Transport};
