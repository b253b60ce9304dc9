//! Change streaming fanout.
//!
//! # Purpose
//! Holds every long-lived client connection on this edge, keyed by
//! environment, and turns upstream flag changes into `flags_changed` pushes.
//!
//! # Key invariants
//! - The revision for an environment lives only in the coordination store;
//!   this module reads it at a point in time and never caches it.
//! - The flag cache is refreshed before clients are told to refetch.
//! - A failed write evicts that one connection and never stops a fanout.
//! - Registry entries are never removed while the registry is being iterated;
//!   failures are collected first and removed afterwards.
mod connection;
mod events;

pub use connection::{ChannelTransport, CloseReason, ConnectionTransport, TransportError};
pub use events::StreamEvent;

use crate::cache::FlagCache;
use crate::changes::spawn_change_listener;
use chrono::Utc;
use connection::StreamingConnection;
use dashmap::DashMap;
use edge_coord::{ChannelEvent, CoordinationStore, RevisionKeys};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct StreamingOptions {
    pub channel: String,
    pub revision_keys: RevisionKeys,
    pub heartbeat_interval: Duration,
    pub stale_sweep_interval: Duration,
}

impl Default for StreamingOptions {
    fn default() -> Self {
        Self {
            channel: edge_coord::DEFAULT_CHANGE_CHANNEL.to_string(),
            revision_keys: RevisionKeys::default(),
            heartbeat_interval: Duration::from_secs(30),
            stale_sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingStats {
    pub started: bool,
    pub total_connections: usize,
    pub by_environment: BTreeMap<String, usize>,
}

pub struct StreamingService {
    store: Arc<dyn CoordinationStore>,
    cache: Arc<FlagCache>,
    options: StreamingOptions,
    connections: DashMap<String, StreamingConnection>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamingService {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        cache: Arc<FlagCache>,
        options: StreamingOptions,
    ) -> Self {
        Self {
            store,
            cache,
            options,
            connections: DashMap::new(),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to the change channel and start the heartbeat and sweep
    /// timers. Calling it again is a no-op.
    pub async fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.store.health_check().await {
            tracing::warn!(
                backend = self.store.backend_name(),
                error = %err,
                "coordination store unhealthy; revisions will read as 0 until it recovers"
            );
        }
        let mut tasks = Vec::with_capacity(3);
        match self.store.subscribe(&self.options.channel).await {
            Ok(subscription) => {
                let service = Arc::downgrade(self);
                tasks.push(spawn_change_listener(
                    "streaming",
                    Arc::clone(&self.store),
                    subscription,
                    move |event| {
                        let service = service.clone();
                        async move {
                            if let ChannelEvent::FlagsChanged {
                                environment,
                                changed_keys,
                            } = event
                                && let Some(service) = service.upgrade()
                            {
                                service.handle_flags_changed(&environment, changed_keys).await;
                            }
                        }
                    },
                ));
            }
            Err(err) => {
                tracing::warn!(
                    channel = %self.options.channel,
                    error = %err,
                    "flag change subscription failed; streaming clients will not be notified"
                );
            }
        }
        tasks.push(spawn_ticker(
            Arc::downgrade(self),
            self.options.heartbeat_interval,
            |service| {
                service.send_heartbeats();
            },
        ));
        tasks.push(spawn_ticker(
            Arc::downgrade(self),
            self.options.stale_sweep_interval,
            |service| {
                service.sweep_stale();
            },
        ));
        self.tasks.lock().extend(tasks);
        tracing::info!(channel = %self.options.channel, "streaming service started");
    }

    /// Register a connection and send it `connected` with the current
    /// revision. Registration happens before the revision read, so a change
    /// that lands in between reaches the client either way.
    pub async fn add_connection(
        &self,
        id: String,
        environment: String,
        transport: Box<dyn ConnectionTransport>,
    ) -> Result<u64, TransportError> {
        self.connections.insert(
            id.clone(),
            StreamingConnection::new(environment.clone(), transport),
        );
        self.record_connection_gauge();
        let revision = self.current_revision(&environment).await;
        let event = StreamEvent::Connected {
            connection_id: id.clone(),
            environment: environment.clone(),
            revision,
            timestamp: Utc::now(),
        };
        let sent = match self.connections.get(&id) {
            Some(connection) => connection.push(&event),
            None => Err(TransportError::Closed),
        };
        if let Err(err) = sent {
            self.remove_connection(&id, CloseReason::Error);
            return Err(err);
        }
        tracing::debug!(connection_id = %id, environment = %environment, revision, "stream connected");
        Ok(revision)
    }

    /// Point-in-time revision for an environment; 0 when absent or when the
    /// store cannot be read.
    pub async fn current_revision(&self, environment: &str) -> u64 {
        match self
            .options
            .revision_keys
            .current(self.store.as_ref(), environment)
            .await
        {
            Ok(revision) => revision,
            Err(err) => {
                tracing::warn!(environment = %environment, error = %err, "revision read failed");
                0
            }
        }
    }

    /// Refresh the local cache, advance the shared revision, then notify
    /// every connection in the environment. Returns the revision sent.
    pub async fn handle_flags_changed(&self, environment: &str, changed_keys: Vec<String>) -> u64 {
        if let Err(err) = self.cache.refresh(environment).await {
            tracing::warn!(
                environment = %environment,
                error = %err,
                "flag cache refresh failed; notifying anyway"
            );
        }
        let revision = match self
            .options
            .revision_keys
            .advance(self.store.as_ref(), environment)
            .await
        {
            Ok(revision) => revision,
            Err(err) => {
                tracing::warn!(environment = %environment, error = %err, "revision increment failed");
                self.current_revision(environment).await
            }
        };
        let event = StreamEvent::FlagsChanged {
            revision,
            changed_keys,
            timestamp: Utc::now(),
        };
        let mut delivered = 0usize;
        let mut failed = Vec::new();
        for entry in self.connections.iter() {
            if entry.environment != environment {
                continue;
            }
            match entry.push(&event) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::debug!(connection_id = %entry.key(), error = %err, "flags_changed write failed");
                    failed.push(entry.key().clone());
                }
            }
        }
        for id in &failed {
            self.remove_connection(id, CloseReason::Error);
        }
        metrics::counter!("edge_stream_notifications_total").increment(delivered as u64);
        tracing::info!(
            environment = %environment,
            revision,
            delivered,
            evicted = failed.len(),
            "flags_changed fanout"
        );
        revision
    }

    /// Heartbeat every connection; returns how many were evicted.
    pub fn send_heartbeats(&self) -> usize {
        let event = StreamEvent::Heartbeat {
            timestamp: Utc::now(),
        };
        let failed: Vec<String> = self
            .connections
            .iter()
            .filter(|entry| entry.push(&event).is_err())
            .map(|entry| entry.key().clone())
            .collect();
        for id in &failed {
            self.remove_connection(id, CloseReason::Error);
        }
        failed.len()
    }

    /// Evict connections whose transport already ended.
    pub fn sweep_stale(&self) -> usize {
        let stale: Vec<String> = self
            .connections
            .iter()
            .filter(|entry| entry.transport.is_closed())
            .map(|entry| entry.key().clone())
            .collect();
        for id in &stale {
            self.remove_connection(id, CloseReason::Stale);
        }
        stale.len()
    }

    /// Single removal path for every terminal state.
    pub fn remove_connection(&self, id: &str, reason: CloseReason) -> bool {
        let Some((_, connection)) = self.connections.remove(id) else {
            return false;
        };
        connection.transport.close();
        metrics::counter!("edge_stream_disconnects_total", "reason" => reason.as_str())
            .increment(1);
        self.record_connection_gauge();
        let last_activity = *connection.last_activity.lock();
        tracing::debug!(
            connection_id = %id,
            environment = %connection.environment,
            reason = reason.as_str(),
            connected_at = %connection.connected_at,
            last_activity = %last_activity,
            "stream connection removed"
        );
        true
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn stats(&self) -> StreamingStats {
        let mut by_environment = BTreeMap::new();
        for entry in self.connections.iter() {
            *by_environment.entry(entry.environment.clone()).or_insert(0) += 1;
        }
        StreamingStats {
            started: self.started.load(Ordering::SeqCst),
            total_connections: self.connections.len(),
            by_environment,
        }
    }

    /// Stop timers and the subscription, then close every connection.
    pub fn shutdown(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        let ids: Vec<String> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in &ids {
            self.remove_connection(id, CloseReason::Shutdown);
        }
        self.started.store(false, Ordering::SeqCst);
        tracing::info!(closed = ids.len(), "streaming service stopped");
    }

    fn record_connection_gauge(&self) {
        metrics::gauge!("edge_stream_connections").set(self.connections.len() as f64);
    }
}

fn spawn_ticker(
    service: Weak<StreamingService>,
    period: Duration,
    tick: fn(&StreamingService),
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(service) = service.upgrade() else {
                return;
            };
            tick(&service);
        }
    })
}
