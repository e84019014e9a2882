// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Protocol connector over a transport.
//!
//! # Lifecycle
//!
//! ```text
//! Open     → init replica, send Command{ version: watermark }   (Synchronizing)
//! Changes  → apply delta, watermark = changes.version           (Steady)
//! Notify v → v == watermark ? ignore : send Command{ watermark }
//! Close    → Disconnected
//! ```
//!
//! # Ordering
//!
//! Every outbound command goes through one lock. `on_open` holds it from
//! replica init until the catch-up command is sent, so an application
//! mutation issued during connect always reaches the server after the
//! catch-up.
//!
//! # Mutations
//!
//! Mutations are not applied locally. The replica only changes when the
//! resulting delta comes back. A mutation in flight when the connection drops
//! is lost; reconnecting catches up from the last applied watermark and never
//! replays it.

use super::{Capabilities, Connector, ConnectorState};
use crate::config::ConnectorConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::protocol::{self, Command, Mutation, Notify, Push};
use crate::reference::Reference;
use crate::replica::ReplicaStore;
use crate::transport::{Transport, TransportEvent};
use crate::BoxFuture;
use std::marker::PhantomData;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{debug, info, info_span, warn, Instrument};

/// Connector that mirrors a remote owned store into `S` over `T`.
pub struct RemoteConnector<R: Reference, S, T> {
    store: S,
    transport: T,
    state_tx: watch::Sender<ConnectorState>,
    state_rx: watch::Receiver<ConnectorState>,
    /// Serializes outbound commands.
    outbound: Mutex<()>,
    /// Every push received, for application observers.
    pushes: broadcast::Sender<Push<R>>,
    _marker: PhantomData<fn() -> R>,
}

impl<R, S, T> RemoteConnector<R, S, T>
where
    R: Reference,
    S: ReplicaStore<R>,
    T: Transport,
{
    pub fn new(store: S, transport: T, config: &ConnectorConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectorState::Disconnected);
        let (pushes, _) = broadcast::channel(config.push_buffer.max(1));
        Self {
            store,
            transport,
            state_tx,
            state_rx,
            outbound: Mutex::new(()),
            pushes,
            _marker: PhantomData,
        }
    }

    /// The replica this connector keeps in sync.
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Get current connector state.
    pub fn state(&self) -> ConnectorState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectorState> {
        self.state_rx.clone()
    }

    /// Receive every push this connector handles, after it was applied.
    pub fn subscribe(&self) -> broadcast::Receiver<Push<R>> {
        self.pushes.subscribe()
    }

    fn set_state(&self, state: ConnectorState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(transport = %self.transport.id(), from = %previous, to = %state, "Connector state changed");
            metrics::set_connector_state(self.transport.id(), &state.to_string());
        }
    }

    /// Caller holds the outbound lock.
    async fn send_command(&self, command: &Command<R>) -> Result<()> {
        let payload = protocol::encode(command)?;
        self.transport.send(payload).await
    }

    /// Connection opened: initialize the replica and request catch-up.
    pub async fn on_open(&self) -> Result<()> {
        let _outbound = self.outbound.lock().await;
        self.set_state(ConnectorState::Connecting);

        let result = async {
            self.store.init().await?;
            let version = self.store.get_version().await?;
            self.send_command(&Command::catch_up(version)).await?;
            Ok::<_, ReplicationError>(version)
        }
        .await;

        match result {
            Ok(version) => {
                info!(transport = %self.transport.id(), version, "Connected, catch-up requested");
                self.set_state(ConnectorState::Synchronizing);
                Ok(())
            }
            Err(e) => {
                warn!(transport = %self.transport.id(), error = %e, "Connect failed");
                self.set_state(ConnectorState::Disconnected);
                Err(e)
            }
        }
    }

    /// Handle one decoded push.
    pub async fn receive(&self, push: Push<R>) -> Result<()> {
        match &push {
            Push::Changes(changes) => {
                let version = changes.version;
                let entries = changes.len();
                self.store.apply_changes(changes.clone()).await?;
                debug!(transport = %self.transport.id(), version, entries, "Applied changes");
                if self.state().is_connected() {
                    self.set_state(ConnectorState::Steady);
                }
            }
            Push::Notify(Notify { version }) => {
                let _outbound = self.outbound.lock().await;
                let watermark = self.store.get_version().await?;
                if *version == watermark {
                    debug!(transport = %self.transport.id(), version, "Notify at watermark, ignoring");
                } else {
                    debug!(transport = %self.transport.id(), notified = version, watermark, "Notify, pulling");
                    self.send_command(&Command::catch_up(watermark)).await?;
                }
            }
        }

        if self.pushes.receiver_count() > 0 {
            let _ = self.pushes.send(push);
        }
        Ok(())
    }

    /// Decode and handle a raw payload. Malformed payloads are dropped.
    pub async fn receive_raw(&self, payload: &str) -> Result<()> {
        match protocol::decode_push::<R>(payload) {
            Ok(push) => self.receive(push).await,
            Err(e) => {
                warn!(transport = %self.transport.id(), error = %e, "Dropping malformed push");
                metrics::record_malformed_message("client");
                Ok(())
            }
        }
    }

    /// Connection closed or failed.
    pub fn on_close(&self) {
        if self.state().is_connected() {
            info!(transport = %self.transport.id(), "Disconnected");
        }
        self.set_state(ConnectorState::Disconnected);
    }

    /// Dispatch one transport event.
    pub async fn handle_event(&self, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::Open => self.on_open().await,
            TransportEvent::Message(payload) => self.receive_raw(&payload).await,
            TransportEvent::Close => {
                self.on_close();
                Ok(())
            }
            TransportEvent::Error(reason) => {
                warn!(transport = %self.transport.id(), reason = %reason, "Transport error");
                self.on_close();
                Ok(())
            }
        }
    }

    /// Drive the connector from `events` until the connection closes, the
    /// stream ends or shutdown is signalled.
    pub async fn run(&self, mut events: mpsc::Receiver<TransportEvent>, mut shutdown_rx: watch::Receiver<bool>) {
        let span = info_span!("connector", transport = %self.transport.id());

        async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else {
                            self.on_close();
                            break;
                        };
                        let terminal = matches!(event, TransportEvent::Close | TransportEvent::Error(_));
                        if let Err(e) = self.handle_event(event).await {
                            warn!(error = %e, "Connector event failed");
                        }
                        if terminal {
                            break;
                        }
                    }
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            debug!("Connector stopping");
                            self.on_close();
                            break;
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn mutate(&self, mutations: Vec<Mutation<R>>) -> Result<()> {
        let _outbound = self.outbound.lock().await;
        let state = self.state();
        if !state.is_connected() {
            return Err(ReplicationError::InvalidState {
                expected: "connected".to_string(),
                actual: state.to_string(),
            });
        }

        let version = self.store.get_version().await?;
        debug!(transport = %self.transport.id(), version, count = mutations.len(), "Sending mutations");
        self.send_command(&Command::mutate(version, mutations)).await
    }
}

impl<R, S, T> Connector<R> for RemoteConnector<R, S, T>
where
    R: Reference,
    S: ReplicaStore<R>,
    T: Transport,
{
    fn capabilities(&self) -> Capabilities {
        Capabilities::ALL
    }

    fn init(&self) -> BoxFuture<'_, ()> {
        self.store.init()
    }

    fn put_one(&self, reference: R) -> BoxFuture<'_, ()> {
        Box::pin(self.mutate(vec![Mutation::put(reference)]))
    }

    fn put_many(&self, references: Vec<R>) -> BoxFuture<'_, ()> {
        Box::pin(self.mutate(references.into_iter().map(Mutation::put).collect()))
    }

    fn delete(&self, reference: R) -> BoxFuture<'_, ()> {
        Box::pin(self.mutate(vec![Mutation::delete(reference)]))
    }
}
