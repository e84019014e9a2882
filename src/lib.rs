//! # Versioned Replication
//!
//! One authoritative store publishes a monotonically versioned stream of
//! entity mutations; any number of replicas converge to it by applying
//! version-bounded deltas.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────── server ────────────────────────────┐
//! │                                                                │
//! │  ┌──────────────┐     ┌─────────────────────────────────────┐  │
//! │  │ OwnedStore   │◄────│ Coordinator                         │  │
//! │  │ (versions,   │     │ mutate → Changes to sender          │  │
//! │  │  tombstones) │     │        → Notify to everyone else    │  │
//! │  └──────────────┘     └─────────────────────────────────────┘  │
//! └───────────────────────────────│────────────────────────────────┘
//!                       Transport │ (Command / Changes / Notify, JSON)
//! ┌────────────────────────────── │ ─────── client ────────────────┐
//! │                               ▼                                │
//! │  ┌─────────────────┐     ┌──────────────────────────────────┐  │
//! │  │ RemoteConnector │────►│ ReplicaStore (memory or SQLite)  │  │
//! │  │ catch-up, pull  │     │ entities + watermark             │  │
//! │  └─────────────────┘     └──────────────────────────────────┘  │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Notify-Then-Pull
//!
//! The mutator gets its delta directly. Every other connection only gets a
//! version-only `Notify` and pulls its own delta from its own watermark, so a
//! replica that missed notifications still converges on the next pull.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use versioned_replication::{
//!     memory_link, Connector, ConnectorState, Coordinator, MemoryReplicaStore, Record,
//!     RemoteConnector, ReplicationConfig,
//! };
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> versioned_replication::Result<()> {
//!     let config = ReplicationConfig::default();
//!     let coordinator = Arc::new(Coordinator::<Record>::new(&config));
//!
//!     let (client, server) = memory_link(config.server.channel_capacity);
//!     coordinator.accept(server.transport, server.events).await?;
//!
//!     let connector = Arc::new(RemoteConnector::new(
//!         MemoryReplicaStore::<Record>::new(),
//!         client.transport,
//!         &config.connector,
//!     ));
//!     let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//!     let driver = Arc::clone(&connector);
//!     tokio::spawn(async move { driver.run(client.events, shutdown_rx).await });
//!
//!     // Mutations are refused while disconnected; wait for the first catch-up
//!     let mut state = connector.state_receiver();
//!     let _ = state.wait_for(|s| *s == ConnectorState::Steady).await;
//!
//!     connector.put_one(Record::new("user", "1").with("name", "Ada")).await?;
//!
//!     coordinator.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod config;
pub mod connector;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod owned;
pub mod persist;
pub mod protocol;
pub mod reference;
pub mod replica;
pub mod transport;

/// Boxed future returned by the async seams (`ReplicaStore`, `Transport`,
/// `Connector`), keeping them object safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

// Re-exports for convenience
pub use config::{ConnectorConfig, ReplicaBackend, ReplicaConfig, ReplicationConfig, ServerConfig};
pub use connector::{Capabilities, Connector, ConnectorState, LocalConnector, Operation, RemoteConnector};
pub use coordinator::{ConnectionId, ConnectionRegistry, Coordinator, CoordinatorState};
pub use error::{ReplicationError, Result};
pub use owned::{OwnedStore, Tombstone};
pub use persist::{replica_from_config, SqliteReplicaStore};
pub use protocol::{ChangeSet, Command, Mutation, MutationKind, Notify, Push};
pub use reference::{EntityKey, Record, Reference, Version};
pub use replica::{MemoryReplicaStore, ReplicaStore};
pub use transport::{memory_link, MemoryEndpoint, MemoryTransport, Transport, TransportEvent};
