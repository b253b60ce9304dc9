//! Local mirror of every issued access token.
//!
//! # Purpose
//! Serves credential checks on the request path without contacting the
//! authority. The whole token set is refetched on any token change event and
//! swapped in as one generation.
//!
//! # Key invariants
//! - Lookups by secret and by id always come from the same [`TokenIndex`].
//! - A failed resync keeps the last known good generation.
//! - Only the initial fetch is fatal.
use crate::authority::AuthorityApi;
use crate::changes::spawn_change_listener;
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use chrono::Utc;
use edge_coord::{ChannelEvent, CoordinationStore};
use edge_tokens::{MirroredToken, TokenIndex, TokenType, TokenValidation};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct TokenMirror {
    authority: Arc<dyn AuthorityApi>,
    store: Arc<dyn CoordinationStore>,
    channel: String,
    index: ArcSwap<TokenIndex>,
    started: AtomicBool,
    initialized: AtomicBool,
    // Serializes fetch-and-swap so an older fetch never lands after a newer one.
    refresh_lock: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TokenMirror {
    pub fn new(
        authority: Arc<dyn AuthorityApi>,
        store: Arc<dyn CoordinationStore>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            authority,
            store,
            channel: channel.into(),
            index: ArcSwap::from_pointee(TokenIndex::default()),
            started: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            refresh_lock: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Change subscription plus the first wholesale fetch.
    ///
    /// The subscription is opened first so a change published during the
    /// initial fetch still triggers a resync. Calling this again while the
    /// mirror is running is a no-op.
    ///
    /// # Errors
    /// Fails when the initial fetch fails. A subscription failure only
    /// degrades the mirror to manual refreshes.
    pub async fn initialize(self: &Arc<Self>, resync_interval: Option<Duration>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::debug!("token mirror already initialized");
            return Ok(());
        }

        match self.store.subscribe(&self.channel).await {
            Ok(subscription) => {
                let mirror = Arc::downgrade(self);
                let handle = spawn_change_listener(
                    "token_mirror",
                    Arc::clone(&self.store),
                    subscription,
                    move |event| {
                        let mirror = mirror.clone();
                        async move {
                            if let ChannelEvent::TokensChanged { event_type } = event
                                && let Some(mirror) = mirror.upgrade()
                            {
                                tracing::debug!(event_type = %event_type, "token change event");
                                if let Err(err) = mirror.refresh().await {
                                    tracing::warn!(error = %err, "token resync failed");
                                }
                            }
                        }
                    },
                );
                self.tasks.lock().push(handle);
            }
            Err(err) => {
                tracing::warn!(
                    channel = %self.channel,
                    error = %err,
                    "token change subscription failed; mirror will only update on refresh"
                );
            }
        }

        let count = match self.refresh().await.context("initial token fetch") {
            Ok(count) => count,
            Err(err) => {
                self.stop_tasks();
                self.started.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        self.initialized.store(true, Ordering::SeqCst);
        tracing::info!(tokens = count, "token mirror initialized");

        if let Some(interval) = resync_interval {
            let handle = spawn_periodic_resync(Arc::downgrade(self), interval);
            self.tasks.lock().push(handle);
        }
        Ok(())
    }

    /// Refetch every token and swap the index. Returns the mirrored count.
    pub async fn refresh(&self) -> Result<usize> {
        let _guard = self.refresh_lock.lock().await;
        let result = self.fetch_index().await;
        let label = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!("edge_token_resyncs_total", "result" => label).increment(1);
        let index = result?;
        let count = index.len();
        self.index.store(Arc::new(index));
        metrics::gauge!("edge_tokens_mirrored").set(count as f64);
        tracing::debug!(tokens = count, "token index swapped");
        Ok(count)
    }

    async fn fetch_index(&self) -> Result<TokenIndex> {
        let tokens = self.authority.fetch_tokens().await?;
        TokenIndex::build(tokens).context("build token index")
    }

    pub fn validate(
        &self,
        secret: &str,
        required: TokenType,
        environment: Option<&str>,
    ) -> TokenValidation {
        self.index
            .load()
            .validate(secret, required, environment, Utc::now())
    }

    pub fn token_by_id(&self, id: u64) -> Option<Arc<MirroredToken>> {
        self.index.load().get_by_id(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.index.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Stop listening and drop every mirrored token.
    pub fn shutdown(&self) {
        self.stop_tasks();
        self.index.store(Arc::new(TokenIndex::default()));
        self.initialized.store(false, Ordering::SeqCst);
        self.started.store(false, Ordering::SeqCst);
        metrics::gauge!("edge_tokens_mirrored").set(0.0);
    }
}

impl TokenMirror {
    fn stop_tasks(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

fn spawn_periodic_resync(mirror: Weak<TokenMirror>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(mirror) = mirror.upgrade() else {
                return;
            };
            if let Err(err) = mirror.refresh().await {
                tracing::warn!(error = %err, "periodic token resync failed");
            }
        }
    })
}
