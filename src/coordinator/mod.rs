// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fan-out coordinator.
//!
//! Server side of the protocol. Holds the authoritative
//! [`OwnedStore`](crate::owned::OwnedStore) and a registry of open
//! connections:
//!
//! ```text
//!            Command{v, mutate}                 Notify{v'}
//! conn A ─────────────────────→ Coordinator ─────────────→ conn B, C, ...
//!        ←─────────────────────     │
//!         Changes(v → v')           │ one critical section:
//!                                   │ mutate, delta, broadcast
//!                                   ↓
//!                              OwnedStore
//! ```
//!
//! # Command Handling
//!
//! 1. Pure catch-up (no mutations, or an empty list): `get_changes(v)` to the
//!    sender only.
//! 2. Mutating: apply each mutation in order, answer the sender with
//!    `get_changes(v)`, then send `Notify{new version}` to every *other*
//!    connection.
//!
//! Mutation, delta computation and broadcast run under one mutex so every
//! observer sees each version bump exactly once and in order.
//!
//! # Failures
//!
//! A failed send is logged and the connection is dropped from the registry.
//! Nothing is retried. Every push is bounded by `send_timeout`; a peer that
//! stops draining its inbox counts as a failed send, so the critical section
//! is held for at most one timeout per command. Malformed payloads are logged and dropped; the
//! connection stays open.

mod registry;
mod types;

pub use registry::{ConnectionId, ConnectionRegistry};
pub use types::CoordinatorState;

use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::owned::OwnedStore;
use crate::protocol::{self, ChangeSet, Command, MutationKind, Notify, Push};
use crate::reference::{Reference, Version};
use crate::transport::{Transport, TransportEvent};
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

/// The fan-out coordinator.
pub struct Coordinator<R: Reference> {
    node_id: String,

    /// Drain timeout for connection tasks on shutdown.
    drain_timeout: Duration,

    /// Upper bound on each push, catch-up reply or close.
    send_timeout: Duration,

    /// Authoritative store; the lock is the critical section.
    store: Mutex<OwnedStore<R>>,

    registry: ConnectionRegistry,

    state_tx: watch::Sender<CoordinatorState>,
    state_rx: watch::Receiver<CoordinatorState>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    /// Per-connection tasks spawned by `accept`.
    tasks: RwLock<Vec<JoinHandle<()>>>,
}

impl<R: Reference> Coordinator<R> {
    /// Coordinator over an empty store.
    pub fn new(config: &ReplicationConfig) -> Self {
        Self::with_owned_store(config, OwnedStore::new())
    }

    /// Coordinator over an existing (e.g. pre-seeded) store.
    pub fn with_owned_store(config: &ReplicationConfig, store: OwnedStore<R>) -> Self {
        let (state_tx, state_rx) = watch::channel(CoordinatorState::Running);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        metrics::set_coordinator_state("Running");

        Self {
            node_id: config.node_id.clone(),
            drain_timeout: config.server.drain_timeout_duration(),
            send_timeout: config.server.send_timeout_duration(),
            store: Mutex::new(store),
            registry: ConnectionRegistry::new(),
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            tasks: RwLock::new(Vec::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Get current coordinator state.
    pub fn state(&self) -> CoordinatorState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<CoordinatorState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_accepting()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Current authoritative version.
    pub async fn version(&self) -> Version {
        self.store.lock().await.get_version()
    }

    /// Delta from `from_version` to the current version.
    pub async fn changes_since(&self, from_version: Version) -> ChangeSet<R> {
        self.store.lock().await.get_changes(from_version)
    }

    /// Run `f` against the store under the coordinator lock.
    ///
    /// Intended for seeding before serving: changes made here are not
    /// announced to connected clients.
    pub async fn with_store<T>(&self, f: impl FnOnce(&mut OwnedStore<R>) -> T) -> T {
        let mut store = self.store.lock().await;
        f(&mut store)
    }

    /// Register a connection. It receives notifies from now on, even before
    /// its own catch-up arrives.
    pub fn open(&self, transport: Arc<dyn Transport>) -> Result<ConnectionId> {
        if !self.is_running() {
            return Err(ReplicationError::Shutdown);
        }
        let label = transport.id().to_string();
        let id = self.registry.add(transport);
        metrics::set_connections(self.registry.len());
        info!(connection = %id, transport = %label, "Connection opened");
        Ok(id)
    }

    /// Connection closed by the peer.
    pub fn close(&self, id: ConnectionId) {
        if self.registry.remove(id).is_some() {
            metrics::set_connections(self.registry.len());
            info!(connection = %id, "Connection closed");
        }
    }

    /// Connection failed at the transport level.
    pub fn fail(&self, id: ConnectionId, reason: &str) {
        if self.registry.remove(id).is_some() {
            metrics::set_connections(self.registry.len());
            warn!(connection = %id, reason = %reason, "Connection failed");
        }
    }

    /// Decode and handle a raw payload. Malformed payloads are dropped and
    /// the connection stays open.
    pub async fn handle_message(&self, id: ConnectionId, payload: &str) -> Result<()> {
        match protocol::decode_command::<R>(payload) {
            Ok(command) => self.handle_command(id, command).await,
            Err(e) => {
                warn!(connection = %id, error = %e, "Dropping malformed command");
                metrics::record_malformed_message("server");
                Ok(())
            }
        }
    }

    /// Handle one decoded command from connection `id`.
    pub async fn handle_command(&self, id: ConnectionId, command: Command<R>) -> Result<()> {
        let sender = self.registry.get(id).ok_or_else(|| ReplicationError::InvalidState {
            expected: "registered connection".to_string(),
            actual: id.to_string(),
        })?;
        let start = Instant::now();
        let mut store = self.store.lock().await;

        if command.is_catch_up() {
            let changes = store.get_changes(command.version);
            drop(store);
            debug!(connection = %id, from = command.version, to = changes.version, "Catch-up");
            self.send_changes(id, sender.as_ref(), changes).await;
            metrics::record_command("catch_up", start.elapsed());
            return Ok(());
        }

        let mutations = command.mutate.unwrap_or_default();
        let count = mutations.len();
        for mutation in mutations {
            match mutation.command {
                MutationKind::Put => {
                    store.put(mutation.data);
                }
                MutationKind::Delete => {
                    store.delete(&mutation.data);
                }
            }
        }

        let version = store.get_version();
        let changes = store.get_changes(command.version);
        debug!(connection = %id, count, version, "Applied mutations");

        self.send_changes(id, sender.as_ref(), changes).await;
        self.broadcast_notify(id, version).await?;
        drop(store);

        metrics::record_command("mutate", start.elapsed());
        Ok(())
    }

    async fn send_changes(&self, id: ConnectionId, transport: &dyn Transport, changes: ChangeSet<R>) {
        let entries = changes.len();
        let payload = match protocol::encode(&Push::Changes(changes)) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(connection = %id, error = %e, "Failed to encode changes");
                return;
            }
        };

        match self.deliver(transport, payload).await {
            Ok(()) => metrics::record_changes_sent(transport.id(), entries),
            Err(e) => self.drop_connection(id, &e),
        }
    }

    /// `transport.send` bounded by the send timeout.
    async fn deliver(&self, transport: &dyn Transport, payload: String) -> Result<()> {
        match tokio::time::timeout(self.send_timeout, transport.send(payload)).await {
            Ok(result) => result,
            Err(_) => Err(ReplicationError::transport(
                transport.id(),
                format!("send timed out after {}", humantime::format_duration(self.send_timeout)),
            )),
        }
    }

    /// Notify every connection except `origin`. Caller holds the store lock.
    async fn broadcast_notify(&self, origin: ConnectionId, version: Version) -> Result<()> {
        let start = Instant::now();
        let payload = protocol::encode(&Push::<R>::Notify(Notify { version }))?;
        let recipients: Vec<_> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|(id, _)| *id != origin)
            .collect();

        let sends = recipients.iter().map(|(id, transport)| {
            let payload = payload.clone();
            async move { (*id, self.deliver(transport.as_ref(), payload).await) }
        });
        let results = join_all(sends).await;

        for (id, result) in results {
            if let Err(e) = result {
                self.drop_connection(id, &e);
            }
        }

        debug!(version, recipients = recipients.len(), "Broadcast notify");
        metrics::record_notify_broadcast(recipients.len(), start.elapsed());
        Ok(())
    }

    fn drop_connection(&self, id: ConnectionId, error: &ReplicationError) {
        warn!(connection = %id, error = %error, "Send failed, dropping connection");
        metrics::record_send_failure(&id.to_string());
        if let Some(transport) = self.registry.remove(id) {
            metrics::set_connections(self.registry.len());
            // The peer may be stalled; close off the critical path.
            let send_timeout = self.send_timeout;
            tokio::spawn(async move {
                let _ = tokio::time::timeout(send_timeout, transport.close()).await;
            });
        }
    }

    /// Register `transport` and spawn a task that feeds it `events`.
    ///
    /// The task ends on close, error, end of stream or shutdown.
    pub async fn accept(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> Result<ConnectionId> {
        let id = self.open(transport)?;
        let coordinator = Arc::clone(self);
        let shutdown_rx = self.shutdown_rx.clone();
        let span = info_span!("connection", node_id = %self.node_id, connection = %id);

        let handle = tokio::spawn(coordinator.serve(id, events, shutdown_rx).instrument(span));

        let mut tasks = self.tasks.write().await;
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
        Ok(id)
    }

    async fn serve(
        self: Arc<Self>,
        id: ConnectionId,
        mut events: mpsc::Receiver<TransportEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        debug!("Serving connection");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(TransportEvent::Open) => {
                        // Registered already in accept()
                    }
                    Some(TransportEvent::Message(payload)) => {
                        if let Err(e) = self.handle_message(id, &payload).await {
                            warn!(error = %e, "Command failed");
                        }
                        if !self.registry.contains(id) {
                            debug!("Connection dropped after failed send");
                            break;
                        }
                    }
                    Some(TransportEvent::Close) | None => {
                        self.close(id);
                        break;
                    }
                    Some(TransportEvent::Error(reason)) => {
                        self.fail(id, &reason);
                        break;
                    }
                },
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        debug!("Connection task stopping");
                        break;
                    }
                }
            }
        }
    }

    /// Shutdown gracefully.
    ///
    /// 1. Signal connection tasks to stop
    /// 2. Wait for each task (bounded by the drain timeout)
    /// 3. Close and unregister every connection
    pub async fn shutdown(&self) {
        if self.state() == CoordinatorState::Stopped {
            return;
        }
        info!(node_id = %self.node_id, "Shutting down coordinator");
        let _ = self.state_tx.send(CoordinatorState::ShuttingDown);
        metrics::set_coordinator_state("ShuttingDown");

        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.tasks.write().await;
            std::mem::take(&mut *guard)
        };

        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for connection tasks to complete");
        }

        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(self.drain_timeout, handle).await {
                Ok(Ok(())) => {
                    debug!(task = i + 1, "Task completed gracefully");
                }
                Ok(Err(e)) => {
                    warn!(task = i + 1, error = %e, "Task panicked during shutdown");
                }
                Err(_) => {
                    warn!(task = i + 1, "Task timed out during shutdown");
                }
            }
        }

        for (id, transport) in self.registry.drain() {
            match tokio::time::timeout(self.send_timeout, transport.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(connection = %id, error = %e, "Close failed during shutdown");
                }
                Err(_) => {
                    warn!(connection = %id, "Close timed out during shutdown");
                }
            }
        }
        metrics::set_connections(0);

        let _ = self.state_tx.send(CoordinatorState::Stopped);
        metrics::set_coordinator_state("Stopped");
        info!("Coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Mutation;
    use crate::reference::Record;
    use crate::transport::{memory_link, MemoryEndpoint};

    fn coordinator() -> Coordinator<Record> {
        Coordinator::new(&ReplicationConfig::for_testing("test-node"))
    }

    /// Registers the server end; returns the client end with `Open` consumed.
    fn connect(coordinator: &Coordinator<Record>) -> (ConnectionId, MemoryEndpoint) {
        let (mut client, server) = memory_link(16);
        let _ = client.events.try_recv();
        let id = coordinator.open(server.transport).unwrap();
        (id, client)
    }

    /// A peer that never drains: every send and close waits forever.
    struct StalledTransport;

    impl Transport for StalledTransport {
        fn id(&self) -> &str {
            "stalled"
        }

        fn send(&self, _payload: String) -> crate::BoxFuture<'_, ()> {
            Box::pin(std::future::pending())
        }

        fn close(&self) -> crate::BoxFuture<'_, ()> {
            Box::pin(std::future::pending())
        }
    }

    fn next_push(client: &mut MemoryEndpoint) -> Push<Record> {
        match client.events.try_recv() {
            Ok(TransportEvent::Message(payload)) => protocol::decode_push(&payload).unwrap(),
            other => panic!("expected push, got {:?}", other),
        }
    }

    #[test]
    fn test_initial_state() {
        let coordinator = coordinator();
        assert_eq!(coordinator.state(), CoordinatorState::Running);
        assert!(coordinator.is_running());
        assert_eq!(coordinator.node_id(), "test-node");
        assert_eq!(coordinator.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_catch_up_answers_sender_only() {
        let coordinator = coordinator();
        coordinator.with_store(|store| store.put(Record::new("user", "1"))).await;
        let (a, mut client_a) = connect(&coordinator);
        let (_b, mut client_b) = connect(&coordinator);

        coordinator.handle_command(a, Command::catch_up(0)).await.unwrap();

        match next_push(&mut client_a) {
            Push::Changes(changes) => {
                assert_eq!(changes.version, 1);
                assert_eq!(changes.update.len(), 1);
            }
            Push::Notify(_) => panic!("expected changes"),
        }
        assert!(client_b.events.try_recv().is_err());
        assert_eq!(coordinator.version().await, 1);
    }

    #[tokio::test]
    async fn test_mutation_answers_sender_and_notifies_others() {
        let coordinator = coordinator();
        let (a, mut client_a) = connect(&coordinator);
        let (_b, mut client_b) = connect(&coordinator);

        let command = Command::mutate(0, vec![Mutation::put(Record::new("post", "p1"))]);
        coordinator.handle_command(a, command).await.unwrap();

        assert_eq!(next_push(&mut client_a), Push::Changes(coordinator.changes_since(0).await));
        assert_eq!(next_push(&mut client_b), Push::Notify(Notify { version: 1 }));
        assert!(client_a.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_each_mutation_bumps_version() {
        let coordinator = coordinator();
        let (a, _client) = connect(&coordinator);

        let command = Command::mutate(
            0,
            vec![
                Mutation::put(Record::new("user", "1")),
                Mutation::put(Record::new("user", "2")),
                Mutation::delete(Record::new("user", "1")),
            ],
        );
        coordinator.handle_command(a, command).await.unwrap();

        assert_eq!(coordinator.version().await, 3);
        let changes = coordinator.changes_since(0).await;
        assert_eq!(changes.update.len(), 1);
        assert_eq!(changes.delete.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_mutate_is_catch_up() {
        let coordinator = coordinator();
        let (a, mut client_a) = connect(&coordinator);
        let (_b, mut client_b) = connect(&coordinator);

        coordinator.handle_command(a, Command::mutate(0, vec![])).await.unwrap();

        assert_eq!(coordinator.version().await, 0);
        assert_eq!(next_push(&mut client_a).kind(), "changes");
        assert!(client_b.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_message_keeps_connection() {
        let coordinator = coordinator();
        let (a, mut client_a) = connect(&coordinator);

        coordinator.handle_message(a, "garbage").await.unwrap();
        coordinator.handle_message(a, r#"{"mutate":[]}"#).await.unwrap();

        assert_eq!(coordinator.connection_count(), 1);
        assert!(client_a.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_send_drops_connection() {
        let coordinator = coordinator();
        let (a, _client_a) = connect(&coordinator);
        let (b, client_b) = connect(&coordinator);
        drop(client_b);

        let command = Command::mutate(0, vec![Mutation::put(Record::new("user", "1"))]);
        coordinator.handle_command(a, command).await.unwrap();

        assert!(!coordinator.registry().contains(b));
        assert!(coordinator.registry().contains(a));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_peer_is_dropped_after_send_timeout() {
        let coordinator = coordinator();
        let (a, mut client_a) = connect(&coordinator);
        let (_b, mut client_b) = connect(&coordinator);
        let stalled = coordinator.open(Arc::new(StalledTransport)).unwrap();

        let started = tokio::time::Instant::now();
        let command = Command::mutate(0, vec![Mutation::put(Record::new("user", "1"))]);
        coordinator.handle_command(a, command).await.unwrap();
        let waited = started.elapsed();

        assert!(waited >= Duration::from_millis(250));
        assert!(waited < Duration::from_secs(1));
        assert!(!coordinator.registry().contains(stalled));
        assert_eq!(next_push(&mut client_a).kind(), "changes");
        assert_eq!(next_push(&mut client_b), Push::Notify(Notify { version: 1 }));

        // Later commands go only to the live connections
        let command = Command::mutate(1, vec![Mutation::put(Record::new("user", "2"))]);
        coordinator.handle_command(a, command).await.unwrap();
        assert_eq!(coordinator.connection_count(), 2);
        assert_eq!(coordinator.version().await, 2);
        assert_eq!(next_push(&mut client_b), Push::Notify(Notify { version: 2 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_catch_up_releases_connection() {
        let coordinator = coordinator();
        let stalled = coordinator.open(Arc::new(StalledTransport)).unwrap();

        coordinator.handle_command(stalled, Command::catch_up(0)).await.unwrap();

        assert_eq!(coordinator.connection_count(), 0);
        assert_eq!(coordinator.version().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_does_not_wait_forever_on_close() {
        let coordinator = coordinator();
        coordinator.open(Arc::new(StalledTransport)).unwrap();

        coordinator.shutdown().await;

        assert_eq!(coordinator.state(), CoordinatorState::Stopped);
        assert_eq!(coordinator.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_close_and_fail_unregister() {
        let coordinator = coordinator();
        let (a, _client_a) = connect(&coordinator);
        let (b, _client_b) = connect(&coordinator);

        coordinator.close(a);
        coordinator.fail(b, "reset");
        coordinator.close(a);

        assert_eq!(coordinator.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_connection_is_rejected() {
        let coordinator = coordinator();
        let (a, _client) = connect(&coordinator);
        coordinator.close(a);

        let err = coordinator.handle_command(a, Command::catch_up(0)).await.unwrap_err();
        assert!(matches!(err, ReplicationError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_connections() {
        let coordinator = Arc::new(coordinator());
        let (_client, server) = memory_link(4);
        coordinator.accept(server.transport, server.events).await.unwrap();

        coordinator.shutdown().await;

        assert_eq!(coordinator.state(), CoordinatorState::Stopped);
        assert_eq!(coordinator.connection_count(), 0);
        let (_client, server) = memory_link(4);
        let err = coordinator.open(server.transport).unwrap_err();
        assert!(matches!(err, ReplicationError::Shutdown));
    }
}
