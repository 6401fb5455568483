//! Store handles and the connection registry.
//!
//! A [`Store`] bundles one SQLite connection with a write queue and a read
//! queue. The [`Registry`] hands out one shared store per database file and
//! closes it once the last holder releases it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crsync_core::{ChangeRecord, SiteId};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::changes::{self, Applied};
use crate::crr;
use crate::engine::{open_connection, Engine, PeerFilter};
use crate::error::{Result, StoreError};
use crate::queue::Queue;
use crate::version::{self, VersionState};

/// Location and connection settings for a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file path, or `":memory:"` for a private in-memory database.
    pub path: String,
    /// How long SQLite waits on a locked database before failing.
    pub busy_timeout: Duration,
}

impl StoreConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// A private in-memory database.
    pub fn memory() -> Self {
        Self::new(":memory:")
    }

    pub fn is_memory(&self) -> bool {
        self.path == ":memory:"
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "crsync.db".to_string(),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// An open database with its operation queues.
pub struct Store {
    location: String,
    site_id: SiteId,
    write: Queue,
    read: Queue,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("location", &self.location)
            .field("site_id", &self.site_id)
            .finish()
    }
}

impl Store {
    /// Open the database described by `config`, creating and migrating it
    /// as needed.
    ///
    /// Blocks; prefer [`Registry::open`] from async code.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let conn = open_connection(&config.path)?;
        conn.busy_timeout(config.busy_timeout)?;
        let site_id = conn.site_identity()?;
        let conn = Arc::new(Mutex::new(conn));
        info!(path = %config.path, site = %site_id, "opened store");
        Ok(Self {
            location: config.path.clone(),
            site_id,
            write: Queue::new("write", Arc::clone(&conn)),
            read: Queue::new("read", conn),
        })
    }

    /// Open a private in-memory database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        Self::open(&StoreConfig::memory())
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// This database's peer identity.
    pub fn site_id(&self) -> SiteId {
        self.site_id
    }

    /// Run `op` on the write queue.
    pub async fn write<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        self.write.enqueue(op).await
    }

    /// Run `op` on the read queue.
    pub async fn read<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        self.read.enqueue(op).await
    }

    pub async fn enable_tracking(&self, table: &str) -> Result<()> {
        let table = table.to_string();
        self.write(move |conn| crr::enable_tracking(conn, &table))
            .await
    }

    pub async fn select_version(&self) -> Result<VersionState> {
        self.read(version::select_version).await
    }

    pub async fn update_version(&self, version: Option<i64>) -> Result<i64> {
        self.write(move |conn| version::update_version(conn, version))
            .await
    }

    pub async fn changes_since(&self, since: i64, filter: PeerFilter) -> Result<Vec<ChangeRecord>> {
        self.read(move |conn| changes::changes_since(conn, since, &filter))
            .await
    }

    pub async fn insert_changes(&self, batch: Vec<ChangeRecord>) -> Result<i64> {
        self.write(move |conn| changes::insert_changes(conn, &batch))
            .await
    }

    pub async fn resolve_changes(&self, batch: Vec<ChangeRecord>) -> Result<Vec<ChangeRecord>> {
        self.write(move |conn| changes::resolve_changes(conn, &batch))
            .await
    }

    /// Run `op` as a tracked local operation on the write queue.
    pub async fn apply_operation<T, F>(&self, op: F) -> Result<Applied<T>>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        self.write(move |conn| changes::apply_operation(conn, op))
            .await
    }
}

struct Entry {
    store: Arc<Store>,
    refs: usize,
}

/// Shares one [`Store`] per database location.
///
/// In-memory databases are never shared: every open gets a fresh one.
#[derive(Default)]
pub struct Registry {
    entries: tokio::sync::Mutex<HashMap<String, Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `config`'s database or return the store already open there.
    pub async fn open(&self, config: &StoreConfig) -> Result<Arc<Store>> {
        if config.is_memory() {
            return Ok(Arc::new(open_blocking(config.clone()).await?));
        }

        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(&config.path) {
            entry.refs += 1;
            debug!(path = %config.path, refs = entry.refs, "reusing open store");
            return Ok(Arc::clone(&entry.store));
        }

        let store = Arc::new(open_blocking(config.clone()).await?);
        entries.insert(
            config.path.clone(),
            Entry {
                store: Arc::clone(&store),
                refs: 1,
            },
        );
        Ok(store)
    }

    /// Drop one reference to `store`. Returns true once the registry has let
    /// go of it; the connection closes when the last `Arc` is dropped.
    pub async fn release(&self, store: &Store) -> bool {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(store.location()) else {
            return true;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return false;
        }
        entries.remove(store.location());
        info!(path = %store.location(), "closed store");
        true
    }

    /// Number of distinct locations currently open.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

async fn open_blocking(config: StoreConfig) -> Result<Store> {
    tokio::task::spawn_blocking(move || Store::open(&config))
        .await
        .map_err(StoreError::join)?
}
