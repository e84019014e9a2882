//! Recording transport for coordinator tests.
//!
//! Records every payload sent through it. Can be switched into a failing
//! mode to simulate a dead peer.

use versioned_replication::protocol::{decode_push, Push};
use versioned_replication::{BoxFuture, Record, ReplicationError, Transport};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Transport that records sends instead of delivering them.
///
/// # Example
/// ```rust,ignore
/// let transport = Arc::new(RecordingTransport::new("a"));
/// let id = coordinator.open(transport.clone())?;
/// coordinator.handle_command(id, Command::catch_up(0)).await?;
/// assert_eq!(transport.pushes().len(), 1);
/// ```
pub struct RecordingTransport {
    id: String,
    sent: Mutex<Vec<String>>,
    failing: AtomicBool,
    attempts: AtomicUsize,
    closed: AtomicBool,
}

impl RecordingTransport {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            sent: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// A transport whose every send fails.
    pub fn failing(id: &str) -> Self {
        let transport = Self::new(id);
        transport.set_failing(true);
        transport
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Raw payloads successfully sent, in order.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// Sent payloads decoded as pushes.
    pub fn pushes(&self) -> Vec<Push<Record>> {
        self.sent()
            .iter()
            .map(|payload| decode_push(payload).unwrap())
            .collect()
    }

    /// Send attempts, including failed ones.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

impl Transport for RecordingTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, payload: String) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(ReplicationError::transport(&self.id, "simulated send failure"));
            }
            self.sent.lock().unwrap().push(payload);
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}
