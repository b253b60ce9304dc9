//! Coordination store seam shared by every edge component.
//!
//! # Purpose
//! Wraps the external store that all edge instances share: pub/sub channels,
//! atomic counters, and plain get/set. The per-environment revision counters
//! and the change channel are the only cross-instance state in the fleet.
//!
//! # Backends
//! - [`RedisStore`] for deployments.
//! - [`MemoryStore`] for tests and single-process development.
//!
//! # Examples
//! ```rust
//! use edge_coord::{CoordinationStore, MemoryStore, RevisionKeys};
//!
//! let rt = tokio::runtime::Runtime::new().expect("rt");
//! rt.block_on(async {
//!     let store = MemoryStore::new();
//!     let keys = RevisionKeys::default();
//!     assert_eq!(keys.current(&store, "prod").await.unwrap(), 0);
//!     assert_eq!(keys.advance(&store, "prod").await.unwrap(), 1);
//! });
//! ```
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

mod errors;
mod events;
mod keys;
mod memory;
mod redis_store;

pub use errors::{EventParseError, StoreError, StoreResult};
pub use events::{ChannelEvent, FLAGS_CHANGED};
pub use keys::{DEFAULT_CHANGE_CHANNEL, DEFAULT_REVISION_PREFIX, RevisionKeys};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;
    async fn incr(&self, key: &str) -> StoreResult<i64>;
    /// Returns the number of subscribers that received the payload.
    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize>;
    /// Opens a dedicated subscriber connection for `channel`.
    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription>;
    async fn health_check(&self) -> StoreResult<()>;
    fn backend_name(&self) -> &'static str;
}

/// Live subscription to one channel. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    receiver: mpsc::UnboundedReceiver<String>,
    // Background forwarder for backends with their own connection.
    forwarder: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(
        channel: impl Into<String>,
        receiver: mpsc::UnboundedReceiver<String>,
        forwarder: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            channel: channel.into(),
            receiver,
            forwarder,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next raw payload; `None` once the underlying connection is gone.
    pub async fn next(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}
