//! Remote transport abstraction.
//!
//! The engine only needs two things from a remote: accept a pushed batch,
//! and stream batches back for a standing pull. Framing (WebSocket, RPC) is
//! left to implementations.

use async_trait::async_trait;
use crsync_core::{EncodedBatch, SiteId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

/// Parameters for a standing pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// The puller's synced watermark.
    pub since: i64,
    /// The puller's identity, used by the remote for echo suppression.
    pub client: SiteId,
    /// Suggested capacity of the inbound channel.
    pub buffer: usize,
}

/// Transport trait for exchanging change batches with a remote.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a batch. Returns once the remote has accepted it.
    async fn push(&self, batch: EncodedBatch) -> Result<()>;

    /// Open a standing pull. Dropping the receiver unsubscribes.
    async fn pull(&self, request: PullRequest) -> Result<mpsc::Receiver<EncodedBatch>>;
}

/// In-process transports.
pub mod memory {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};

    use crsync_core::{encode, group_by_site, ChangeRecord};
    use tracing::{debug, warn};

    use crate::engine::SyncEngine;
    use crate::error::{BoxError, SyncError};
    use crate::listener::{SubscribeOptions, TableSet};

    /// Connects a client engine to a server-side [`SyncEngine`] in the same
    /// process.
    ///
    /// A push is a `merge` on the server. A pull is a wildcard subscription
    /// on the server carrying the client's identity and watermark, so the
    /// client catches up first and never hears its own changes back.
    pub struct PeerTransport {
        server: Arc<SyncEngine>,
    }

    impl PeerTransport {
        pub fn new(server: Arc<SyncEngine>) -> Self {
            Self { server }
        }
    }

    #[async_trait]
    impl Transport for PeerTransport {
        async fn push(&self, batch: EncodedBatch) -> Result<()> {
            self.server.merge(&batch).await
        }

        async fn pull(&self, request: PullRequest) -> Result<mpsc::Receiver<EncodedBatch>> {
            let (tx, rx) = mpsc::channel(request.buffer.max(1));
            let forward = tx.clone();
            let listener = move |changes: Vec<ChangeRecord>, _sender: Option<SiteId>| {
                let tx = forward.clone();
                async move {
                    for group in group_by_site(&changes) {
                        let batch = encode(group)?;
                        if tx.send(batch).await.is_err() {
                            break;
                        }
                    }
                    Ok::<(), BoxError>(())
                }
            };

            // Subscribing replays the catch-up through the channel, so it must
            // not block on a receiver the caller does not hold yet.
            let server = Arc::clone(&self.server);
            tokio::spawn(async move {
                let options = SubscribeOptions {
                    client: request.client,
                    version: request.since,
                };
                match server.subscribe(TableSet::All, listener, Some(options)).await {
                    Ok(subscription) => {
                        tx.closed().await;
                        debug!(client = %request.client, "pull receiver dropped");
                        drop(subscription);
                    }
                    Err(e) => warn!(client = %request.client, error = %e, "pull subscription failed"),
                }
            });
            Ok(rx)
        }
    }

    /// A scripted transport for tests.
    ///
    /// Records every push and pull, can be told to reject pushes, and can
    /// inject inbound batches into all open pulls.
    #[derive(Default)]
    pub struct RecordingTransport {
        pushes: Mutex<Vec<EncodedBatch>>,
        pulls: Mutex<Vec<PullRequest>>,
        inbound: Mutex<Vec<mpsc::Sender<EncodedBatch>>>,
        failing: AtomicBool,
    }

    impl RecordingTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Make subsequent pushes fail (or succeed again).
        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        /// Batches accepted so far.
        pub fn pushes(&self) -> Vec<EncodedBatch> {
            self.pushes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Pull requests seen so far.
        pub fn pulls(&self) -> Vec<PullRequest> {
            self.pulls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Number of pulls whose receiver is still alive.
        pub fn open_pulls(&self) -> usize {
            self.inbound
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .filter(|tx| !tx.is_closed())
                .count()
        }

        /// End every open pull, as a remote going away would.
        pub fn disconnect(&self) {
            self.inbound
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }

        /// Deliver `batch` to every open pull. Returns how many received it.
        pub async fn inject(&self, batch: EncodedBatch) -> usize {
            let senders: Vec<_> = {
                let mut inbound = self.inbound.lock().unwrap_or_else(PoisonError::into_inner);
                inbound.retain(|tx| !tx.is_closed());
                inbound.clone()
            };
            let mut delivered = 0;
            for tx in senders {
                if tx.send(batch.clone()).await.is_ok() {
                    delivered += 1;
                }
            }
            delivered
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn push(&self, batch: EncodedBatch) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(SyncError::Transport("remote rejected push".into()));
            }
            self.pushes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(batch);
            Ok(())
        }

        async fn pull(&self, request: PullRequest) -> Result<mpsc::Receiver<EncodedBatch>> {
            let (tx, rx) = mpsc::channel(request.buffer.max(1));
            self.pulls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(request);
            self.inbound
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(tx);
            Ok(rx)
        }
    }
}
