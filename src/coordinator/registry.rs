//! Connection registry.
//!
//! The coordinator owns exactly one registry. Connections are added on open
//! and removed on close, error or a failed send. Broadcast iterates a
//! [`snapshot`](ConnectionRegistry::snapshot), so a connection removed during
//! fan-out never invalidates the iteration.

use crate::transport::Transport;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identity of a registered connection. Never reused within a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Registered connections keyed by id.
pub struct ConnectionRegistry {
    connections: dashmap::DashMap<ConnectionId, Arc<dyn Transport>>,
    next_id: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: dashmap::DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a connection and assign it a fresh id.
    pub fn add(&self, transport: Arc<dyn Transport>) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.connections.insert(id, transport);
        id
    }

    /// Remove a connection. Returns it if it was still registered.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<dyn Transport>> {
        self.connections.remove(&id).map(|(_, transport)| transport)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<dyn Transport>> {
        self.connections.get(&id).map(|r| r.value().clone())
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Copy of the current members, ordered by id.
    pub fn snapshot(&self) -> Vec<(ConnectionId, Arc<dyn Transport>)> {
        let mut members: Vec<_> = self
            .connections
            .iter()
            .map(|r| (*r.key(), r.value().clone()))
            .collect();
        members.sort_by_key(|(id, _)| *id);
        members
    }

    /// Remove and return every connection.
    pub fn drain(&self) -> Vec<(ConnectionId, Arc<dyn Transport>)> {
        let members = self.snapshot();
        for (id, _) in &members {
            self.connections.remove(id);
        }
        members
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
