//! Subscriber registry.
//!
//! Subscriptions are in-memory only. Each one names the tables it cares
//! about (or all of them) and optionally a client whose own changes it must
//! never see again.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use crsync_core::{ChangeRecord, SiteId};
use serde::{Deserialize, Serialize};

use crate::error::BoxError;

/// Result type for subscriber callbacks.
pub type ListenerResult = std::result::Result<(), BoxError>;

/// A subscriber callback.
///
/// Implemented for any `Fn(Vec<ChangeRecord>, Option<SiteId>) -> impl Future`
/// closure, so most callers never name this trait.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Called with a change batch and the peer it came from, or `None` for
    /// local writes.
    async fn on_changes(&self, changes: &[ChangeRecord], sender: Option<SiteId>) -> ListenerResult;
}

#[async_trait]
impl<F, Fut> Listener for F
where
    F: Fn(Vec<ChangeRecord>, Option<SiteId>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ListenerResult> + Send + 'static,
{
    async fn on_changes(&self, changes: &[ChangeRecord], sender: Option<SiteId>) -> ListenerResult {
        (self)(changes.to_vec(), sender).await
    }
}

/// Which tables a subscription listens to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableSet {
    /// Every table (the wildcard).
    All,
    Only(BTreeSet<String>),
}

impl TableSet {
    pub fn of<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TableSet::Only(tables.into_iter().map(Into::into).collect())
    }

    /// True if a batch touching `tables` concerns this set.
    pub fn intersects(&self, tables: &BTreeSet<String>) -> bool {
        match self {
            TableSet::All => true,
            TableSet::Only(own) => !own.is_disjoint(tables),
        }
    }
}

/// Catch-up and echo suppression settings for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeOptions {
    /// Changes sent by this peer are never delivered.
    pub client: SiteId,
    /// Deliver everything after this version right away.
    pub version: i64,
}

struct Registration {
    id: u64,
    tables: TableSet,
    client: Option<SiteId>,
    listener: Arc<dyn Listener>,
}

/// A registered callback selected for one delivery.
pub(crate) struct Target {
    pub(crate) id: u64,
    pub(crate) listener: Arc<dyn Listener>,
}

#[derive(Default)]
pub(crate) struct Listeners {
    next: AtomicU64,
    entries: Mutex<Vec<Registration>>,
}

impl Listeners {
    pub(crate) fn add(
        &self,
        tables: TableSet,
        client: Option<SiteId>,
        listener: Arc<dyn Listener>,
    ) -> u64 {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration {
                id,
                tables,
                client,
                listener,
            });
        id
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|r| r.id != id);
        entries.len() != before
    }

    pub(crate) fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Callbacks that should see a batch touching `tables` from `sender`.
    pub(crate) fn matching(&self, tables: &BTreeSet<String>, sender: Option<SiteId>) -> Vec<Target> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.tables.intersects(tables))
            .filter(|r| r.client.is_none() || r.client != sender)
            .map(|r| Target {
                id: r.id,
                listener: Arc::clone(&r.listener),
            })
            .collect()
    }
}

/// Handle to a live subscription. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    listeners: Weak<Listeners>,
}

impl Subscription {
    pub(crate) fn new(id: u64, listeners: &Arc<Listeners>) -> Self {
        Self {
            id,
            listeners: Arc::downgrade(listeners),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop future deliveries. Same as dropping the handle.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.remove(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn Listener> {
        Arc::new(|_: Vec<ChangeRecord>, _: Option<SiteId>| async { Ok::<(), BoxError>(()) })
    }

    fn tables(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_table_set_intersection() {
        assert!(TableSet::All.intersects(&tables(&["x"])));
        assert!(TableSet::of(["t", "u"]).intersects(&tables(&["u"])));
        assert!(!TableSet::of(["t"]).intersects(&tables(&["u"])));
        assert!(!TableSet::of(["t"]).intersects(&tables(&[])));
    }

    #[test]
    fn test_matching_respects_tables() {
        let listeners = Listeners::default();
        let t = listeners.add(TableSet::of(["t"]), None, noop());
        let all = listeners.add(TableSet::All, None, noop());

        let ids: Vec<u64> = listeners
            .matching(&tables(&["u"]), None)
            .iter()
            .map(|target| target.id)
            .collect();
        assert_eq!(ids, vec![all]);

        let ids: Vec<u64> = listeners
            .matching(&tables(&["t"]), None)
            .iter()
            .map(|target| target.id)
            .collect();
        assert_eq!(ids, vec![t, all]);
    }

    #[test]
    fn test_matching_suppresses_echo() {
        let listeners = Listeners::default();
        let client = SiteId::from_bytes([7; 16]);
        let other = SiteId::from_bytes([8; 16]);
        listeners.add(TableSet::All, Some(client), noop());

        assert!(listeners.matching(&tables(&["t"]), Some(client)).is_empty());
        assert_eq!(listeners.matching(&tables(&["t"]), Some(other)).len(), 1);
        assert_eq!(listeners.matching(&tables(&["t"]), None).len(), 1);
    }

    #[test]
    fn test_subscription_drop_unsubscribes() {
        let listeners = Arc::new(Listeners::default());
        let id = listeners.add(TableSet::All, None, noop());
        let subscription = Subscription::new(id, &listeners);
        assert_eq!(listeners.len(), 1);

        subscription.unsubscribe();
        assert_eq!(listeners.len(), 0);
        assert!(!listeners.remove(id));
    }

    #[test]
    fn test_subscription_outliving_registry() {
        let listeners = Arc::new(Listeners::default());
        let id = listeners.add(TableSet::All, None, noop());
        let subscription = Subscription::new(id, &listeners);
        drop(listeners);
        drop(subscription);
    }
}
