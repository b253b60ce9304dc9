use crate::{CoordinationStore, StoreError, StoreResult, Subscription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// In-process coordination store.
///
/// Counters are serialized by a single mutex, which gives the same
/// linearizable increment the shared store provides across processes.
/// Clones do not share state; wrap in an `Arc` to share one store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
    channels: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        let mut channels = self.channels.lock();
        match channels.get_mut(channel) {
            Some(senders) => {
                senders.retain(|sender| !sender.is_closed());
                senders.len()
            }
            None => 0,
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut values = self.values.lock();
        let current = match values.get(key) {
            Some(raw) => raw.parse::<i64>().map_err(|_| StoreError::InvalidValue {
                key: key.to_string(),
                value: raw.clone(),
            })?,
            None => 0,
        };
        let next = current + 1;
        values.insert(key.to_string(), next.to_string());
        Ok(next)
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize> {
        let mut channels = self.channels.lock();
        let Some(senders) = channels.get_mut(channel) else {
            return Ok(0);
        };
        senders.retain(|sender| sender.send(payload.to_string()).is_ok());
        Ok(senders.len())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(channel, rx, None))
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn incr_starts_at_one_and_keeps_keys_apart() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("a").await.unwrap(), 1);
        assert_eq!(store.incr("a").await.unwrap(), 2);
        assert_eq!(store.incr("b").await.unwrap(), 1);
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn incr_rejects_non_integer_values() {
        let store = MemoryStore::new();
        store.set("a", "x").await.unwrap();
        assert!(matches!(
            store.incr("a").await,
            Err(StoreError::InvalidValue { .. })
        ));
    }

    #[tokio::test]
    async fn publish_reaches_every_live_subscriber_in_order() {
        let store = MemoryStore::new();
        let mut first = store.subscribe("ch").await.unwrap();
        let mut second = store.subscribe("ch").await.unwrap();
        assert_eq!(store.publish("ch", "one").await.unwrap(), 2);
        assert_eq!(store.publish("ch", "two").await.unwrap(), 2);
        assert_eq!(first.next().await.as_deref(), Some("one"));
        assert_eq!(first.next().await.as_deref(), Some("two"));
        assert_eq!(second.next().await.as_deref(), Some("one"));
        assert_eq!(first.channel(), "ch");
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned() {
        let store = MemoryStore::new();
        let sub = store.subscribe("ch").await.unwrap();
        assert_eq!(store.subscriber_count("ch"), 1);
        drop(sub);
        assert_eq!(store.publish("ch", "x").await.unwrap(), 0);
        assert_eq!(store.subscriber_count("ch"), 0);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_zero() {
        let store = MemoryStore::new();
        assert_eq!(store.publish("nobody", "x").await.unwrap(), 0);
    }
}
