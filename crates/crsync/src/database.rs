//! The database handle: one store, one sync engine.
//!
//! A [`Database`] is what applications hold. It opens its store through a
//! shared [`Registry`] so several handles on the same file share one
//! connection and one pair of queues, and it starts a [`SyncEngine`] over
//! that store with whatever collaborators the caller supplies.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crsync_core::{ChangeRecord, EncodedBatch, SiteId};
use crsync_store::{Registry, Store, StoreConfig, VersionState};
use crsync_sync::{Collaborators, Listener, SubscribeOptions, Subscription, SyncConfig, SyncEngine, TableSet};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

/// Configuration for a [`Database`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Where the data lives.
    pub store: StoreConfig,
    /// Push and pull behavior.
    pub sync: SyncConfig,
}

impl DatabaseConfig {
    /// A private in-memory database with default sync settings.
    pub fn memory() -> Self {
        Self {
            store: StoreConfig::memory(),
            sync: SyncConfig::default(),
        }
    }
}

/// An open replicated database.
pub struct Database {
    registry: Arc<Registry>,
    engine: Arc<SyncEngine>,
    closed: AtomicBool,
}

impl Database {
    /// Open the database described by `config` and start syncing it.
    pub async fn open(
        registry: Arc<Registry>,
        config: DatabaseConfig,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let store = registry.open(&config.store).await?;
        let engine = Arc::new(SyncEngine::start(store, config.sync, collaborators));
        info!(
            path = %config.store.path,
            site = %engine.site_id(),
            "database opened"
        );
        Ok(Self {
            registry,
            engine,
            closed: AtomicBool::new(false),
        })
    }

    /// The sync engine, e.g. to serve as the remote end of a
    /// [`PeerTransport`](crsync_sync::PeerTransport).
    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn store(&self) -> &Arc<Store> {
        self.engine.store()
    }

    /// This database's site id.
    pub fn site_id(&self) -> SiteId {
        self.engine.site_id()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Start tracking changes to `table`. Idempotent.
    pub async fn enable_tracking(&self, table: &str) -> Result<()> {
        self.ensure_open()?;
        Ok(self.store().enable_tracking(table).await?)
    }

    pub async fn select_version(&self) -> Result<VersionState> {
        self.ensure_open()?;
        Ok(self.engine.select_version().await?)
    }

    /// Run a write, notify subscribers and schedule a push.
    pub async fn update<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> crsync_store::Result<T> + Send + 'static,
    {
        self.ensure_open()?;
        Ok(self.engine.update(op).await?)
    }

    /// Run a read-only query.
    pub async fn read<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> crsync_store::Result<T> + Send + 'static,
    {
        self.ensure_open()?;
        Ok(self.engine.read(op).await?)
    }

    /// Listen for changes touching `tables`. See [`SyncEngine::subscribe`].
    pub async fn subscribe(
        &self,
        tables: TableSet,
        listener: impl Listener + 'static,
        options: Option<SubscribeOptions>,
    ) -> Result<Subscription> {
        self.ensure_open()?;
        Ok(self.engine.subscribe(tables, listener, options).await?)
    }

    /// Apply a batch received from a peer.
    pub async fn merge(&self, batch: &EncodedBatch) -> Result<()> {
        self.ensure_open()?;
        Ok(self.engine.merge(batch).await?)
    }

    pub async fn push(&self) -> Result<()> {
        self.ensure_open()?;
        Ok(self.engine.push().await?)
    }

    pub async fn pull(&self) -> Result<()> {
        self.ensure_open()?;
        Ok(self.engine.pull().await?)
    }

    /// Notify subscribers of `changes` as if they had just been applied.
    pub async fn trigger(&self, changes: &[ChangeRecord], sender: Option<SiteId>) -> Result<()> {
        self.ensure_open()?;
        Ok(self.engine.trigger(changes, sender).await?)
    }

    /// Stop syncing and release the store. Later calls fail with
    /// [`Error::Closed`]. Closing twice is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.engine.close();
        let released = self.registry.release(self.store()).await;
        info!(site = %self.site_id(), released, "database closed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("location", &self.store().location())
            .field("site_id", &self.site_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}
