//! Transport seam between the protocol and a real connection.
//!
//! The core never opens sockets. A transport delivers outbound payloads
//! ([`Transport::send`]) and surfaces inbound lifecycle events
//! ([`TransportEvent`]) on a channel the owner drives. Wrap a WebSocket, TCP
//! stream or anything else that moves text frames.
//!
//! [`memory_link`] builds an in-process pair for tests and single-process
//! deployments:
//!
//! ```text
//!   client endpoint                      server endpoint
//!   transport.send(p) ──────────────→ events: Message(p)
//!   events: Message(p) ←───────────── transport.send(p)
//!   close() ─────────── Close ──────→ both sides
//! ```

use crate::error::ReplicationError;
use crate::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Lifecycle event observed on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Close,
    Error(String),
}

/// Outbound half of a connection.
pub trait Transport: Send + Sync + 'static {
    /// Label for logs.
    fn id(&self) -> &str;

    /// Deliver one encoded message.
    fn send(&self, payload: String) -> BoxFuture<'_, ()>;

    /// Close the connection. Idempotent.
    fn close(&self) -> BoxFuture<'_, ()>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn id(&self) -> &str {
        (**self).id()
    }

    fn send(&self, payload: String) -> BoxFuture<'_, ()> {
        (**self).send(payload)
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        (**self).close()
    }
}

static NEXT_LINK: AtomicU64 = AtomicU64::new(1);

/// One side of an in-process link.
#[derive(Debug)]
pub struct MemoryTransport {
    id: String,
    /// Delivers to the other side's event stream.
    peer: mpsc::Sender<TransportEvent>,
    /// Delivers to this side's own event stream (close/fail notifications).
    local: mpsc::Sender<TransportEvent>,
    /// Shared by both sides of the link.
    closed: Arc<AtomicBool>,
}

impl MemoryTransport {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Tear the link down with an error on both sides.
    pub async fn fail(&self, reason: impl Into<String>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let reason = reason.into();
        debug!(transport = %self.id, reason = %reason, "Memory link failed");
        let _ = self.peer.send(TransportEvent::Error(reason.clone())).await;
        let _ = self.local.send(TransportEvent::Error(reason)).await;
    }
}

impl Transport for MemoryTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, payload: String) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.is_closed() {
                return Err(ReplicationError::transport(&self.id, "link closed"));
            }
            self.peer
                .send(TransportEvent::Message(payload))
                .await
                .map_err(|_| ReplicationError::transport(&self.id, "peer dropped"))
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            debug!(transport = %self.id, "Memory link closed");
            let _ = self.peer.send(TransportEvent::Close).await;
            let _ = self.local.send(TransportEvent::Close).await;
            Ok(())
        })
    }
}

/// A transport plus the events arriving at it.
#[derive(Debug)]
pub struct MemoryEndpoint {
    pub transport: Arc<MemoryTransport>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Build a connected pair `(client, server)`.
///
/// Each side's event stream starts with [`TransportEvent::Open`]. `capacity`
/// bounds the per-direction queue (minimum 2 so `Open` and a close always fit).
pub fn memory_link(capacity: usize) -> (MemoryEndpoint, MemoryEndpoint) {
    let capacity = capacity.max(2);
    let link = NEXT_LINK.fetch_add(1, Ordering::Relaxed);
    let closed = Arc::new(AtomicBool::new(false));

    let (client_tx, client_rx) = mpsc::channel(capacity);
    let (server_tx, server_rx) = mpsc::channel(capacity);

    // Fresh channels with room for at least two events
    let _ = client_tx.try_send(TransportEvent::Open);
    let _ = server_tx.try_send(TransportEvent::Open);

    let client = MemoryTransport {
        id: format!("link-{}-client", link),
        peer: server_tx.clone(),
        local: client_tx.clone(),
        closed: Arc::clone(&closed),
    };
    let server = MemoryTransport {
        id: format!("link-{}-server", link),
        peer: client_tx,
        local: server_tx,
        closed,
    };

    (
        MemoryEndpoint {
            transport: Arc::new(client),
            events: client_rx,
        },
        MemoryEndpoint {
            transport: Arc::new(server),
            events: server_rx,
        },
    )
}
