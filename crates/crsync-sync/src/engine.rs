//! The sync engine.
//!
//! Owns the push/pull protocol with the remote, the subscriber fan-out and
//! the cross-context broadcast for one store.
//!
//! ## Flow
//!
//! ```text
//! update(op) -> apply_operation -> trigger(changes, None) -> listeners
//!                                                         -> broadcast
//!                                                         -> push (spawned)
//!
//! remote -> pull task -> insert_changes -> trigger(batch, Some(peer)) -> listeners
//! ```
//!
//! Push is one-shot and single-flight. Pull is a standing task with its own
//! cancellation token, torn down when connectivity drops and rebuilt when it
//! returns.

use std::sync::{Arc, Mutex, PoisonError};

use crsync_core::{chunk, encode, group_by_site, tables_of, ChangeRecord, ChunkOptions, EncodedBatch, SiteId};
use crsync_store::{PeerFilter, Store, VersionState};
use futures::future::join_all;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::Broadcast;
use crate::error::{Result, SyncError};
use crate::listener::{Listener, Listeners, SubscribeOptions, Subscription, TableSet};
use crate::transport::{PullRequest, Transport};

/// Configuration for sync behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Split pushes into batches of about this many records.
    pub push_chunk_size: Option<usize>,
    /// Never split a version group across pushed batches.
    pub strict_chunks: bool,
    /// Capacity hint passed to the transport for inbound pull channels.
    pub pull_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            push_chunk_size: None,
            strict_chunks: true,
            pull_buffer: 64,
        }
    }
}

/// Receives errors that would otherwise only be logged.
pub type ErrorHook = Arc<dyn Fn(&SyncError) + Send + Sync>;

/// External collaborators of an engine. All are optional.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub transport: Option<Arc<dyn Transport>>,
    pub broadcast: Option<Arc<dyn Broadcast>>,
    /// Connectivity signal. Without one the engine counts as online.
    pub online: Option<watch::Receiver<bool>>,
    pub error_hook: Option<ErrorHook>,
}

impl Collaborators {
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_broadcast(mut self, broadcast: Arc<dyn Broadcast>) -> Self {
        self.broadcast = Some(broadcast);
        self
    }

    pub fn with_online(mut self, online: watch::Receiver<bool>) -> Self {
        self.online = Some(online);
        self
    }

    pub fn with_error_hook(mut self, hook: impl Fn(&SyncError) + Send + Sync + 'static) -> Self {
        self.error_hook = Some(Arc::new(hook));
        self
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("transport", &self.transport.is_some())
            .field("broadcast", &self.broadcast.is_some())
            .field("online", &self.online.is_some())
            .field("error_hook", &self.error_hook.is_some())
            .finish()
    }
}

/// Sync engine for one store.
///
/// Background tasks stop when the engine is closed or dropped.
pub struct SyncEngine {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<Store>,
    config: SyncConfig,
    transport: Option<Arc<dyn Transport>>,
    broadcast: Option<Arc<dyn Broadcast>>,
    online: Option<watch::Receiver<bool>>,
    error_hook: Option<ErrorHook>,
    listeners: Arc<Listeners>,
    /// Serializes pushes.
    push_lock: tokio::sync::Mutex<()>,
    /// Cancels the standing pull, if one is running.
    pull_task: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
}

impl SyncEngine {
    /// Create an engine over `store` and start its background tasks.
    ///
    /// Must be called from within a tokio runtime. If a transport is
    /// configured and the engine is online, a pull starts right away.
    pub fn start(store: Arc<Store>, config: SyncConfig, collaborators: Collaborators) -> Self {
        let inner = Arc::new(Inner {
            store,
            config,
            transport: collaborators.transport,
            broadcast: collaborators.broadcast,
            online: collaborators.online,
            error_hook: collaborators.error_hook,
            listeners: Arc::new(Listeners::default()),
            push_lock: tokio::sync::Mutex::new(()),
            pull_task: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });

        if let Some(broadcast) = &inner.broadcast {
            // Listen before returning so no post after `start` is missed.
            let inbound = broadcast.listen();
            tokio::spawn(Arc::clone(&inner).receive_broadcasts(inbound));
        }
        if inner.online.is_some() {
            tokio::spawn(Arc::clone(&inner).watch_connectivity());
        }
        if inner.transport.is_some() {
            let initial = Arc::clone(&inner);
            tokio::spawn(async move {
                if let Err(e) = initial.pull().await {
                    initial.report(&e);
                }
            });
        }

        Self { inner }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.inner.store
    }

    /// This database's peer identity.
    pub fn site_id(&self) -> SiteId {
        self.inner.store.site_id()
    }

    pub fn is_online(&self) -> bool {
        self.inner.is_online()
    }

    pub fn is_pulling(&self) -> bool {
        self.inner.is_pulling()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Number of live subscriptions.
    pub fn subscriptions(&self) -> usize {
        self.inner.listeners.len()
    }

    pub async fn select_version(&self) -> Result<VersionState> {
        Ok(self.inner.store.select_version().await?)
    }

    /// Send unsynced local changes to the remote.
    ///
    /// Does nothing without a transport, while offline, or when there is
    /// nothing to send. `synced` only advances after the remote accepts.
    pub async fn push(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.push().await
    }

    /// (Re-)establish the standing pull, pushing first.
    pub async fn pull(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.pull().await
    }

    /// Cancel the standing pull. Local writes are unaffected.
    pub fn stop_pull(&self) {
        self.inner.stop_pull();
    }

    /// Register `listener` for changes touching `tables`.
    ///
    /// With `options`, changes after `options.version` that did not come
    /// from `options.client` are delivered right away, and later batches sent
    /// by that client are never delivered.
    pub async fn subscribe(
        &self,
        tables: TableSet,
        listener: impl Listener + 'static,
        options: Option<SubscribeOptions>,
    ) -> Result<Subscription> {
        self.inner.ensure_open()?;
        self.inner.subscribe(tables, Arc::new(listener), options).await
    }

    /// Apply a batch received from a peer and notify subscribers of what
    /// actually changed.
    pub async fn merge(&self, batch: &EncodedBatch) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.merge(batch).await
    }

    /// Fan a batch out to matching subscribers.
    ///
    /// Local batches (`sender == None`) are also broadcast to other contexts
    /// and pushed.
    pub async fn trigger(&self, changes: &[ChangeRecord], sender: Option<SiteId>) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.trigger(changes, sender).await
    }

    /// Run a local write and propagate its changes. Returns the operation's
    /// own result.
    pub async fn update<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> crsync_store::Result<T> + Send + 'static,
    {
        self.inner.ensure_open()?;
        let applied = self.inner.store.apply_operation(op).await?;
        self.inner.trigger(&applied.changes, None).await?;
        Ok(applied.result)
    }

    /// Run a read on the read queue.
    pub async fn read<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> crsync_store::Result<T> + Send + 'static,
    {
        self.inner.ensure_open()?;
        Ok(self.inner.store.read(op).await?)
    }

    /// Stop background tasks and drop every subscription.
    pub fn close(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.stop_pull();
        self.inner.shutdown.cancel();
        self.inner.listeners.clear();
        info!(site = %self.site_id(), "sync engine closed");
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("store", &self.inner.store)
            .field("subscriptions", &self.inner.listeners.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Inner {
    fn ensure_open(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(SyncError::Closed);
        }
        Ok(())
    }

    fn is_online(&self) -> bool {
        self.online.as_ref().map_or(true, |rx| *rx.borrow())
    }

    fn is_pulling(&self) -> bool {
        self.pull_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    fn report(&self, error: &SyncError) {
        match &self.error_hook {
            Some(hook) => hook(error),
            None => warn!(error = %error, "sync error"),
        }
    }

    async fn push(&self) -> Result<()> {
        let Some(transport) = &self.transport else {
            return Ok(());
        };
        if !self.is_online() {
            debug!("offline, skipping push");
            return Ok(());
        }

        let _flight = self.push_lock.lock().await;
        let state = self.store.select_version().await?;
        if !state.has_unsynced() {
            return Ok(());
        }

        let changes = self
            .store
            .changes_since(state.synced, PeerFilter::LocalOnly)
            .await?;
        let batches = match self.config.push_chunk_size {
            Some(size) => chunk(
                &changes,
                ChunkOptions {
                    size,
                    strict: self.config.strict_chunks,
                },
            ),
            None if changes.is_empty() => Vec::new(),
            None => vec![changes.as_slice()],
        };
        for batch in &batches {
            transport.push(encode(batch)?).await?;
        }

        let synced = self.store.update_version(Some(state.current)).await?;
        info!(records = changes.len(), batches = batches.len(), synced, "pushed local changes");
        Ok(())
    }

    async fn pull(self: &Arc<Self>) -> Result<()> {
        self.stop_pull();
        let Some(transport) = &self.transport else {
            return Ok(());
        };
        if !self.is_online() {
            debug!("offline, not pulling");
            return Ok(());
        }

        // Installed before any await so a concurrent `stop_pull` has
        // something to cancel.
        let token = self.shutdown.child_token();
        if let Some(previous) = self
            .pull_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token.clone())
        {
            previous.cancel();
        }

        if let Err(e) = self.push().await {
            self.report(&e);
        }

        let mut inbound = match self.subscribe_remote(transport.as_ref()).await {
            Ok(inbound) => inbound,
            Err(e) => {
                token.cancel();
                return Err(e);
            }
        };
        if token.is_cancelled() || !self.is_online() {
            token.cancel();
            debug!("pull abandoned while connecting");
            return Ok(());
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("pull cancelled");
                        break;
                    }
                    next = inbound.recv() => match next {
                        // Runs to completion even if the token fires meanwhile.
                        Some(batch) => {
                            if let Err(e) = inner.receive_pulled(&batch).await {
                                inner.report(&e);
                            }
                        }
                        None => {
                            info!("pull stream closed by remote");
                            token.cancel();
                            break;
                        }
                    },
                }
            }
        });
        Ok(())
    }

    async fn subscribe_remote(
        &self,
        transport: &dyn Transport,
    ) -> Result<mpsc::Receiver<EncodedBatch>> {
        let since = self.store.select_version().await?.synced;
        let request = PullRequest {
            since,
            client: self.store.site_id(),
            buffer: self.config.pull_buffer,
        };
        let inbound = transport.pull(request).await?;
        info!(since, "pull established");
        Ok(inbound)
    }

    fn stop_pull(&self) {
        let token = self
            .pull_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            token.cancel();
            info!("pull stopped");
        }
    }

    async fn receive_pulled(self: &Arc<Self>, batch: &EncodedBatch) -> Result<()> {
        let changes = batch.decode()?;
        let Some(first) = changes.first() else {
            return Ok(());
        };
        let sender = first.site_id;
        let synced = self.store.insert_changes(changes.clone()).await?;
        debug!(records = changes.len(), sender = %sender, synced, "applied pulled batch");
        self.trigger(&changes, Some(sender)).await
    }

    async fn subscribe(
        &self,
        tables: TableSet,
        listener: Arc<dyn Listener>,
        options: Option<SubscribeOptions>,
    ) -> Result<Subscription> {
        let client = options.map(|o| o.client);
        let id = self.listeners.add(tables, client, Arc::clone(&listener));
        let subscription = Subscription::new(id, &self.listeners);
        debug!(subscription = id, "subscribed");

        if let Some(options) = options {
            let backlog = self
                .store
                .changes_since(options.version, PeerFilter::Exclude(options.client))
                .await?;
            if !backlog.is_empty() {
                debug!(subscription = id, records = backlog.len(), "delivering catch-up");
                if let Err(e) = listener.on_changes(&backlog, None).await {
                    self.report(&SyncError::Listener(e));
                }
            }
        }
        Ok(subscription)
    }

    async fn merge(self: &Arc<Self>, batch: &EncodedBatch) -> Result<()> {
        let changes = batch.decode()?;
        let Some(first) = changes.first() else {
            return Ok(());
        };
        let sender = first.site_id;
        let resolved = self.store.resolve_changes(changes).await?;
        debug!(sender = %sender, records = resolved.len(), "merged batch");
        self.trigger(&resolved, Some(sender)).await
    }

    async fn trigger(self: &Arc<Self>, changes: &[ChangeRecord], sender: Option<SiteId>) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let tables = tables_of(changes);
        let targets = self.listeners.matching(&tables, sender);
        let deliveries = targets.iter().map(|target| async move {
            target
                .listener
                .on_changes(changes, sender)
                .await
                .map_err(|e| (target.id, e))
        });

        if sender.is_none() {
            if let Some(broadcast) = &self.broadcast {
                for group in group_by_site(changes) {
                    broadcast.post(&encode(group)?);
                }
            }
            self.spawn_push();
        }

        for (id, error) in join_all(deliveries).await.into_iter().filter_map(|r| r.err()) {
            debug!(subscription = id, "listener failed");
            self.report(&SyncError::Listener(error));
        }
        Ok(())
    }

    fn spawn_push(self: &Arc<Self>) {
        if self.transport.is_none() || self.shutdown.is_cancelled() {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = inner.push().await {
                inner.report(&e);
            }
        });
    }

    async fn receive_broadcasts(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<EncodedBatch>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = inbound.recv() => match next {
                    Some(batch) => {
                        if let Err(e) = self.receive_broadcast(&batch).await {
                            self.report(&e);
                        }
                    }
                    None => break,
                },
            }
        }
    }

    /// Another context already wrote these changes to the shared database,
    /// so they are only fanned out, never pushed or re-broadcast.
    async fn receive_broadcast(self: &Arc<Self>, batch: &EncodedBatch) -> Result<()> {
        let changes = batch.decode()?;
        let Some(first) = changes.first() else {
            return Ok(());
        };
        let sender = first.site_id;
        self.trigger(&changes, Some(sender)).await
    }

    async fn watch_connectivity(self: Arc<Self>) {
        let Some(mut online) = self.online.clone() else {
            return;
        };
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let is_online = *online.borrow_and_update();
                    if is_online {
                        info!("back online");
                        // Spawned so a later flip offline is seen while connecting.
                        let inner = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = inner.pull().await {
                                inner.report(&e);
                            }
                        });
                    } else {
                        info!("went offline");
                        self.stop_pull();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::memory::BroadcastHub;
    use crate::error::BoxError;
    use crate::transport::memory::RecordingTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type Seen = Arc<Mutex<Vec<(Vec<ChangeRecord>, Option<SiteId>)>>>;

    fn recorder() -> (impl Listener, Seen) {
        let seen: Seen = Arc::default();
        let sink = Arc::clone(&seen);
        let listener = move |changes: Vec<ChangeRecord>, sender: Option<SiteId>| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push((changes, sender));
                Ok::<(), BoxError>(())
            }
        };
        (listener, seen)
    }

    fn failing_listener() -> impl Listener {
        |_: Vec<ChangeRecord>, _: Option<SiteId>| async {
            Err::<(), BoxError>("listener exploded".into())
        }
    }

    fn error_counter() -> (Arc<AtomicUsize>, impl Fn(&SyncError) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let hook_count = Arc::clone(&count);
        (count, move |_: &SyncError| {
            hook_count.fetch_add(1, Ordering::SeqCst);
        })
    }

    async fn todo_store() -> Arc<Store> {
        let store = Arc::new(Store::open_memory().unwrap());
        store
            .write(|conn| {
                conn.execute_batch(
                    "CREATE TABLE todos (id INTEGER PRIMARY KEY, title TEXT);
                     CREATE TABLE tags (id INTEGER PRIMARY KEY, name TEXT);",
                )?;
                Ok(())
            })
            .await
            .unwrap();
        store.enable_tracking("todos").await.unwrap();
        store.enable_tracking("tags").await.unwrap();
        store
    }

    fn insert_todo(
        id: i64,
        title: &'static str,
    ) -> impl FnOnce(&Connection) -> crsync_store::Result<usize> + Send + 'static {
        move |conn| {
            Ok(conn.execute(
                "INSERT INTO todos (id, title) VALUES (?1, ?2)",
                rusqlite::params![id, title],
            )?)
        }
    }

    /// A batch written by a separate peer.
    async fn remote_batch(id: i64, title: &'static str) -> (SiteId, EncodedBatch) {
        let peer = todo_store().await;
        peer.apply_operation(insert_todo(id, title)).await.unwrap();
        let changes = peer.changes_since(0, PeerFilter::Any).await.unwrap();
        (peer.site_id(), encode(&changes).unwrap())
    }

    async fn title(engine: &SyncEngine, id: i64) -> Option<String> {
        engine
            .read(move |conn| {
                let mut stmt = conn.prepare("SELECT title FROM todos WHERE id = ?1")?;
                let mut rows = stmt.query([id])?;
                let title = match rows.next()? {
                    Some(row) => row.get(0)?,
                    None => None,
                };
                Ok(title)
            })
            .await
            .unwrap()
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_update_returns_result_and_notifies() {
        let engine = SyncEngine::start(todo_store().await, SyncConfig::default(), Collaborators::default());
        let (listener, seen) = recorder();
        let _subscription = engine
            .subscribe(TableSet::of(["todos"]), listener, None)
            .await
            .unwrap();

        let inserted = engine.update(insert_todo(1, "write tests")).await.unwrap();
        assert_eq!(inserted, 1);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, None);
        assert!(seen[0].0.iter().all(|c| c.table == "todos"));
    }

    #[tokio::test]
    async fn test_unrelated_table_does_not_notify() {
        let engine = SyncEngine::start(todo_store().await, SyncConfig::default(), Collaborators::default());
        let (listener, seen) = recorder();
        let _subscription = engine
            .subscribe(TableSet::of(["tags"]), listener, None)
            .await
            .unwrap();

        engine.update(insert_todo(1, "x")).await.unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_subscription_stops_delivery() {
        let engine = SyncEngine::start(todo_store().await, SyncConfig::default(), Collaborators::default());
        let (listener, seen) = recorder();
        let subscription = engine.subscribe(TableSet::All, listener, None).await.unwrap();

        engine.update(insert_todo(1, "a")).await.unwrap();
        subscription.unsubscribe();
        engine.update(insert_todo(2, "b")).await.unwrap();

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(engine.subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_failing_listener_is_isolated() {
        let (errors, hook) = error_counter();
        let engine = SyncEngine::start(
            todo_store().await,
            SyncConfig::default(),
            Collaborators::default().with_error_hook(hook),
        );
        let _bad = engine
            .subscribe(TableSet::All, failing_listener(), None)
            .await
            .unwrap();
        let (listener, seen) = recorder();
        let _good = engine.subscribe(TableSet::All, listener, None).await.unwrap();

        engine.update(insert_todo(1, "a")).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(title(&engine, 1).await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_subscribe_with_client_catches_up_and_suppresses_echo() {
        let engine = SyncEngine::start(todo_store().await, SyncConfig::default(), Collaborators::default());
        engine.update(insert_todo(1, "local")).await.unwrap();

        let (client, own_batch) = remote_batch(2, "from client").await;
        let (listener, seen) = recorder();
        let _subscription = engine
            .subscribe(TableSet::All, listener, Some(SubscribeOptions { client, version: 0 }))
            .await
            .unwrap();

        // Catch-up arrives immediately.
        assert_eq!(seen.lock().unwrap().len(), 1);

        // The client's own write is applied but never echoed back to it.
        engine.merge(&own_batch).await.unwrap();
        assert_eq!(title(&engine, 2).await.as_deref(), Some("from client"));
        assert_eq!(seen.lock().unwrap().len(), 1);

        let (other, other_batch) = remote_batch(3, "from elsewhere").await;
        engine.merge(&other_batch).await.unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].1, Some(other));
        assert!(seen.iter().all(|(_, sender)| *sender != Some(client)));
    }

    #[tokio::test]
    async fn test_merge_reports_only_net_changes() {
        let engine = SyncEngine::start(todo_store().await, SyncConfig::default(), Collaborators::default());
        let (listener, seen) = recorder();
        let _subscription = engine.subscribe(TableSet::All, listener, None).await.unwrap();

        let (_, batch) = remote_batch(1, "once").await;
        engine.merge(&batch).await.unwrap();
        engine.merge(&batch).await.unwrap();
        engine.merge(&EncodedBatch::default()).await.unwrap();

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_batch_is_rejected() {
        let engine = SyncEngine::start(todo_store().await, SyncConfig::default(), Collaborators::default());
        let result = engine.merge(&EncodedBatch::new("not a batch")).await;
        assert!(matches!(result, Err(SyncError::Codec(_))));
    }

    #[tokio::test]
    async fn test_push_sends_local_changes_and_advances_synced() {
        let transport = RecordingTransport::new();
        let engine = SyncEngine::start(
            todo_store().await,
            SyncConfig::default(),
            Collaborators::default().with_transport(transport.clone()),
        );

        engine.update(insert_todo(1, "a")).await.unwrap();
        engine.push().await.unwrap();

        let state = engine.select_version().await.unwrap();
        assert_eq!(state.synced, state.current);
        let pushed: Vec<ChangeRecord> = transport
            .pushes()
            .iter()
            .flat_map(|batch| batch.decode().unwrap())
            .collect();
        assert!(!pushed.is_empty());
        assert!(pushed.iter().all(|c| c.site_id == engine.site_id()));
    }

    #[tokio::test]
    async fn test_failed_push_leaves_synced_unchanged() {
        let transport = RecordingTransport::new();
        transport.set_failing(true);
        let (errors, hook) = error_counter();
        let engine = SyncEngine::start(
            todo_store().await,
            SyncConfig::default(),
            Collaborators::default()
                .with_transport(transport.clone())
                .with_error_hook(hook),
        );

        engine.update(insert_todo(1, "a")).await.unwrap();
        assert!(matches!(engine.push().await, Err(SyncError::Transport(_))));
        assert_eq!(engine.select_version().await.unwrap().synced, 0);
        assert!(transport.pushes().is_empty());
        eventually(|| errors.load(Ordering::SeqCst) > 0).await;

        transport.set_failing(false);
        engine.push().await.unwrap();
        let state = engine.select_version().await.unwrap();
        assert_eq!(state.synced, state.current);
        assert!(!transport.pushes().is_empty());
    }

    #[tokio::test]
    async fn test_push_chunks_by_version() {
        let transport = RecordingTransport::new();
        let config = SyncConfig {
            push_chunk_size: Some(1),
            ..SyncConfig::default()
        };
        let (_, hook) = error_counter();
        let (online_tx, online) = watch::channel(false);
        let engine = SyncEngine::start(
            todo_store().await,
            config,
            Collaborators::default()
                .with_transport(transport.clone())
                .with_online(online)
                .with_error_hook(hook),
        );

        engine.update(insert_todo(1, "a")).await.unwrap();
        engine.update(insert_todo(2, "b")).await.unwrap();
        engine.push().await.unwrap();
        assert!(transport.pushes().is_empty());

        online_tx.send(true).unwrap();
        engine.push().await.unwrap();
        // Two versions, each kept whole.
        assert_eq!(transport.pushes().len(), 2);
    }

    #[tokio::test]
    async fn test_pull_applies_inbound_batches() {
        let transport = RecordingTransport::new();
        let engine = SyncEngine::start(
            todo_store().await,
            SyncConfig::default(),
            Collaborators::default().with_transport(transport.clone()),
        );
        let (listener, seen) = recorder();
        let _subscription = engine.subscribe(TableSet::All, listener, None).await.unwrap();
        eventually(|| transport.open_pulls() == 1).await;
        assert_eq!(transport.pulls()[0].client, engine.site_id());

        let (peer, batch) = remote_batch(7, "pulled").await;
        assert_eq!(transport.inject(batch).await, 1);
        eventually(|| !seen.lock().unwrap().is_empty()).await;

        assert_eq!(seen.lock().unwrap()[0].1, Some(peer));
        assert_eq!(title(&engine, 7).await.as_deref(), Some("pulled"));
        let state = engine.select_version().await.unwrap();
        assert_eq!(state.synced, state.current);
        // Pulled changes are never pushed back.
        assert!(transport.pushes().is_empty());
    }

    #[tokio::test]
    async fn test_connectivity_controls_pull() {
        let transport = RecordingTransport::new();
        let (online_tx, online) = watch::channel(true);
        let engine = SyncEngine::start(
            todo_store().await,
            SyncConfig::default(),
            Collaborators::default()
                .with_transport(transport.clone())
                .with_online(online),
        );
        eventually(|| transport.open_pulls() == 1).await;
        assert!(engine.is_pulling());

        online_tx.send(false).unwrap();
        eventually(|| transport.open_pulls() == 0).await;
        assert!(!engine.is_online());
        assert!(!engine.is_pulling());

        // Local writes keep working offline.
        engine.update(insert_todo(1, "offline")).await.unwrap();
        assert!(transport.pushes().is_empty());

        online_tx.send(true).unwrap();
        eventually(|| transport.pulls().len() == 2 && transport.open_pulls() == 1).await;
        // Coming back online pushes what was written offline.
        eventually(|| !transport.pushes().is_empty()).await;
    }

    #[tokio::test]
    async fn test_remote_closing_stream_ends_pull() {
        let transport = RecordingTransport::new();
        let engine = SyncEngine::start(
            todo_store().await,
            SyncConfig::default(),
            Collaborators::default().with_transport(transport.clone()),
        );
        eventually(|| transport.open_pulls() == 1).await;
        assert!(engine.is_pulling());

        transport.disconnect();
        eventually(|| !engine.is_pulling()).await;
    }

    /// Holds every pull open until released.
    #[derive(Default)]
    struct GatedTransport {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
        inbound: Mutex<Vec<mpsc::Sender<EncodedBatch>>>,
    }

    #[async_trait::async_trait]
    impl Transport for GatedTransport {
        async fn push(&self, _batch: EncodedBatch) -> Result<()> {
            Ok(())
        }

        async fn pull(&self, _request: PullRequest) -> Result<mpsc::Receiver<EncodedBatch>> {
            self.entered.notify_one();
            self.release.notified().await;
            let (tx, rx) = mpsc::channel(1);
            self.inbound.lock().unwrap().push(tx);
            Ok(rx)
        }
    }

    #[tokio::test]
    async fn test_going_offline_while_connecting_abandons_pull() {
        let transport = Arc::new(GatedTransport::default());
        let (online_tx, online) = watch::channel(true);
        let engine = SyncEngine::start(
            todo_store().await,
            SyncConfig::default(),
            Collaborators::default()
                .with_transport(transport.clone())
                .with_online(online),
        );
        transport.entered.notified().await;
        assert!(engine.is_pulling());

        online_tx.send(false).unwrap();
        eventually(|| !engine.is_pulling()).await;

        transport.release.notify_one();
        eventually(|| {
            let inbound = transport.inbound.lock().unwrap();
            inbound.len() == 1 && inbound[0].is_closed()
        })
        .await;
        assert!(!engine.is_pulling());
    }

    #[tokio::test]
    async fn test_broadcast_notifies_without_pushing() {
        let hub = BroadcastHub::new();
        let a_transport = RecordingTransport::new();
        let b_transport = RecordingTransport::new();
        let a = SyncEngine::start(
            todo_store().await,
            SyncConfig::default(),
            Collaborators::default()
                .with_transport(a_transport.clone())
                .with_broadcast(Arc::new(hub.endpoint("app.db"))),
        );
        let b = SyncEngine::start(
            todo_store().await,
            SyncConfig::default(),
            Collaborators::default()
                .with_transport(b_transport.clone())
                .with_broadcast(Arc::new(hub.endpoint("app.db"))),
        );
        let (listener, seen) = recorder();
        let _subscription = b.subscribe(TableSet::All, listener, None).await.unwrap();
        eventually(|| a_transport.open_pulls() == 1 && b_transport.open_pulls() == 1).await;

        a.update(insert_todo(1, "shared")).await.unwrap();
        eventually(|| !seen.lock().unwrap().is_empty()).await;
        eventually(|| !a_transport.pushes().is_empty()).await;

        assert_eq!(seen.lock().unwrap()[0].1, Some(a.site_id()));
        assert!(b_transport.pushes().is_empty());
    }

    #[tokio::test]
    async fn test_closed_engine_rejects_work() {
        let engine = SyncEngine::start(todo_store().await, SyncConfig::default(), Collaborators::default());
        let (listener, _) = recorder();
        let _subscription = engine.subscribe(TableSet::All, listener, None).await.unwrap();

        engine.close();
        assert!(engine.is_closed());
        assert_eq!(engine.subscriptions(), 0);
        assert!(matches!(
            engine.update(insert_todo(1, "late")).await,
            Err(SyncError::Closed)
        ));
    }
}
