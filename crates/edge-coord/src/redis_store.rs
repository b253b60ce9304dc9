use crate::{CoordinationStore, StoreError, StoreResult, Subscription};
use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tokio::sync::{OnceCell, mpsc};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Redis-backed coordination store.
///
/// Commands share one auto-reconnecting [`ConnectionManager`]; every
/// subscription opens its own pub/sub connection because a connection in
/// subscriber mode cannot issue regular commands.
///
/// The manager is created on first use. While Redis is unreachable every
/// command fails with [`StoreError::Connection`] and the next command tries
/// again, so an edge started during an outage joins the fleet once Redis is
/// back.
pub struct RedisStore {
    client: redis::Client,
    commands: OnceCell<ConnectionManager>,
}

impl RedisStore {
    /// Parses `url` and makes a first connection attempt.
    ///
    /// # Errors
    /// Only a malformed URL is an error. An unreachable server is logged and
    /// retried on the next command.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let store = Self::open(url)?;
        match store.commands().await {
            Ok(_) => tracing::info!("redis coordination store connected"),
            Err(err) => {
                tracing::warn!(error = %err, "redis unreachable; commands will retry until it recovers")
            }
        }
        Ok(store)
    }

    /// Parses `url` without connecting.
    pub fn open(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|err| StoreError::Connection(format!("open {url}: {err}")))?;
        Ok(Self {
            client,
            commands: OnceCell::new(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.commands.initialized()
    }

    async fn commands(&self) -> StoreResult<ConnectionManager> {
        let manager = self
            .commands
            .get_or_try_init(|| async {
                tokio::time::timeout(CONNECT_TIMEOUT, self.client.get_connection_manager())
                    .await
                    .map_err(|_| StoreError::Connection("connect timed out".to_string()))?
                    .map_err(StoreError::from)
            })
            .await?;
        Ok(manager.clone())
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.commands().await?;
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.commands().await?;
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.commands().await?;
        Ok(conn.incr::<_, _, i64>(key, 1).await?)
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize> {
        let mut conn = self.commands().await?;
        let receivers = conn.publish::<_, _, i64>(channel, payload).await?;
        Ok(receivers.max(0) as usize)
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        let subscribe_err = |err: redis::RedisError| StoreError::Subscribe {
            channel: channel.to_string(),
            message: err.to_string(),
        };
        let mut pubsub = tokio::time::timeout(CONNECT_TIMEOUT, self.client.get_async_pubsub())
            .await
            .map_err(|_| StoreError::Subscribe {
                channel: channel.to_string(),
                message: "connect timed out".to_string(),
            })?
            .map_err(subscribe_err)?;
        pubsub.subscribe(channel).await.map_err(subscribe_err)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let channel_name = channel.to_string();
        let forwarder = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(message) = messages.next().await {
                match message.get_payload::<String>() {
                    Ok(payload) => {
                        if tx.send(payload).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, channel = %channel_name, "undecodable pub/sub payload");
                    }
                }
            }
            tracing::debug!(channel = %channel_name, "redis subscription closed");
        });
        Ok(Subscription::new(channel, rx, Some(forwarder)))
    }

    async fn health_check(&self) -> StoreResult<()> {
        let mut conn = self.commands().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
