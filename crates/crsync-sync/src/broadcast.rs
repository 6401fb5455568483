//! Cross-context broadcast.
//!
//! Several engines can share one physical database (one per thread pool,
//! process or embedding). Locally applied batches are announced to the
//! others over this side channel so their subscribers refresh too. It is
//! never used for remote sync.

use crsync_core::EncodedBatch;
use tokio::sync::mpsc;

/// A message bus scoped to one database identity.
pub trait Broadcast: Send + Sync {
    /// Announce a batch to every other context on the channel.
    fn post(&self, batch: &EncodedBatch);

    /// Start receiving batches posted by other contexts.
    fn listen(&self) -> mpsc::UnboundedReceiver<EncodedBatch>;
}

/// In-process broadcast.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};

    use tracing::trace;

    struct Member {
        context: u64,
        tx: mpsc::UnboundedSender<EncodedBatch>,
    }

    /// Shared state for in-process broadcast channels.
    #[derive(Default)]
    pub struct BroadcastHub {
        channels: Mutex<HashMap<String, Vec<Member>>>,
        next: AtomicU64,
    }

    impl BroadcastHub {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// A new context on `channel`. Each endpoint is its own context and
        /// never receives its own posts.
        pub fn endpoint(self: &Arc<Self>, channel: impl Into<String>) -> BroadcastEndpoint {
            BroadcastEndpoint {
                hub: Arc::clone(self),
                channel: channel.into(),
                context: self.next.fetch_add(1, Ordering::Relaxed),
            }
        }
    }

    /// One context's handle on a hub channel.
    pub struct BroadcastEndpoint {
        hub: Arc<BroadcastHub>,
        channel: String,
        context: u64,
    }

    impl Broadcast for BroadcastEndpoint {
        fn post(&self, batch: &EncodedBatch) {
            let mut channels = self
                .hub
                .channels
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let Some(members) = channels.get_mut(&self.channel) else {
                return;
            };
            members.retain(|m| !m.tx.is_closed());
            for member in members.iter().filter(|m| m.context != self.context) {
                // Closed receivers are pruned on the next post.
                let _ = member.tx.send(batch.clone());
            }
            trace!(channel = %self.channel, receivers = members.len(), "posted batch");
        }

        fn listen(&self) -> mpsc::UnboundedReceiver<EncodedBatch> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.hub
                .channels
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(self.channel.clone())
                .or_default()
                .push(Member {
                    context: self.context,
                    tx,
                });
            rx
        }
    }
}
