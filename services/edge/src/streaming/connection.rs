// Streaming connection state and the transport seam.
use super::events::StreamEvent;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("transport queue full")]
    Full,
}

/// Write side of one client connection. Writes never block; a transport
/// that cannot take an event right now reports an error and is evicted.
pub trait ConnectionTransport: Send + Sync {
    fn send(&self, event: &StreamEvent) -> Result<(), TransportError>;
    fn is_closed(&self) -> bool;
    fn close(&self);
}

/// Bounded queue drained by the SSE body or the WebSocket writer.
#[derive(Debug)]
pub struct ChannelTransport {
    sender: Mutex<Option<mpsc::Sender<StreamEvent>>>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender: Mutex::new(Some(tx)),
            },
            rx,
        )
    }
}

impl ConnectionTransport for ChannelTransport {
    fn send(&self, event: &StreamEvent) -> Result<(), TransportError> {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return Err(TransportError::Closed);
        };
        sender.try_send(event.clone()).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => TransportError::Full,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .as_ref()
            .is_none_or(|sender| sender.is_closed())
    }

    fn close(&self) {
        // Dropping the sender ends the reader once it drains the queue.
        self.sender.lock().take();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Peer,
    Error,
    Stale,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Peer => "peer",
            CloseReason::Error => "error",
            CloseReason::Stale => "stale",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

pub(crate) struct StreamingConnection {
    pub(crate) environment: String,
    pub(crate) transport: Box<dyn ConnectionTransport>,
    pub(crate) connected_at: DateTime<Utc>,
    pub(crate) last_activity: Mutex<DateTime<Utc>>,
}

impl StreamingConnection {
    pub(crate) fn new(environment: String, transport: Box<dyn ConnectionTransport>) -> Self {
        let now = Utc::now();
        Self {
            environment,
            transport,
            connected_at: now,
            last_activity: Mutex::new(now),
        }
    }

    pub(crate) fn push(&self, event: &StreamEvent) -> Result<(), TransportError> {
        self.transport.send(event)?;
        *self.last_activity.lock() = Utc::now();
        Ok(())
    }
}
