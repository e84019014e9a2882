//! Replica store contract and in-memory implementation.
//!
//! A replica is a passive mirror. It never generates versions: the watermark
//! and entity versions are always those assigned by the owned store and
//! accepted verbatim.
//!
//! # Apply Semantics
//!
//! [`ReplicaStore::apply_changes`] writes every `update` (overwrite by key),
//! then removes every `delete` (by key), then sets the watermark to the
//! change set's version, as one atomic step with respect to readers. Update
//! before delete means a key present in both lists of one delta ends deleted.
//!
//! Re-applying an identical change set is a no-op: puts overwrite with the
//! same data and deletes of absent keys do nothing.
//!
//! # Example
//!
//! ```rust
//! # async fn example() -> versioned_replication::Result<()> {
//! use versioned_replication::replica::{MemoryReplicaStore, ReplicaStore};
//! use versioned_replication::protocol::ChangeSet;
//! use versioned_replication::reference::{Record, Reference};
//!
//! let replica = MemoryReplicaStore::<Record>::new();
//! replica.init().await?;
//! replica
//!     .apply_changes(ChangeSet {
//!         version: 2,
//!         update: vec![Record::new("user", "1").stamped(2)],
//!         delete: vec![],
//!     })
//!     .await?;
//! assert_eq!(replica.get_version().await?, 2);
//! # Ok(())
//! # }
//! ```

use crate::metrics;
use crate::protocol::ChangeSet;
use crate::reference::{EntityKey, Reference, Version};
use crate::BoxFuture;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Contract every replica backend satisfies.
///
/// Object safe, so connectors can hold `Arc<dyn ReplicaStore<R>>` when the
/// backend is chosen at runtime.
pub trait ReplicaStore<R: Reference>: Send + Sync + 'static {
    /// Prepare the backend. Other calls may fail with
    /// [`Uninitialized`](crate::ReplicationError::Uninitialized) until this
    /// completes.
    fn init(&self) -> BoxFuture<'_, ()>;

    /// Last-known watermark (`0` for a fresh replica).
    fn get_version(&self) -> BoxFuture<'_, Version>;

    /// Overwrite the watermark. Out-of-order values are accepted; only the
    /// protocol layer decides when to advance.
    fn set_version(&self, version: Version) -> BoxFuture<'_, ()>;

    /// Apply a delta and adopt its version as the watermark, atomically.
    fn apply_changes(&self, changes: ChangeSet<R>) -> BoxFuture<'_, ()>;

    /// Write one entity without touching the watermark.
    fn put(&self, reference: R) -> BoxFuture<'_, ()>;

    /// Write many entities without touching the watermark.
    fn put_many(&self, references: Vec<R>) -> BoxFuture<'_, ()>;

    /// Entities with `version >= from_version`.
    fn get_all(&self, from_version: Version) -> BoxFuture<'_, Vec<R>>;

    /// Look up one entity. Absence is not an error.
    fn get_one(&self, key: &EntityKey) -> BoxFuture<'_, Option<R>>;
}

impl<R: Reference, S: ReplicaStore<R> + ?Sized> ReplicaStore<R> for Arc<S> {
    fn init(&self) -> BoxFuture<'_, ()> {
        (**self).init()
    }

    fn get_version(&self) -> BoxFuture<'_, Version> {
        (**self).get_version()
    }

    fn set_version(&self, version: Version) -> BoxFuture<'_, ()> {
        (**self).set_version(version)
    }

    fn apply_changes(&self, changes: ChangeSet<R>) -> BoxFuture<'_, ()> {
        (**self).apply_changes(changes)
    }

    fn put(&self, reference: R) -> BoxFuture<'_, ()> {
        (**self).put(reference)
    }

    fn put_many(&self, references: Vec<R>) -> BoxFuture<'_, ()> {
        (**self).put_many(references)
    }

    fn get_all(&self, from_version: Version) -> BoxFuture<'_, Vec<R>> {
        (**self).get_all(from_version)
    }

    fn get_one(&self, key: &EntityKey) -> BoxFuture<'_, Option<R>> {
        (**self).get_one(key)
    }
}

/// Watermark and entities behind one lock so apply + watermark are atomic.
#[derive(Debug)]
struct ReplicaState<R> {
    version: Version,
    entities: BTreeMap<EntityKey, R>,
}

/// In-memory replica, always initialized.
#[derive(Debug)]
pub struct MemoryReplicaStore<R: Reference> {
    state: RwLock<ReplicaState<R>>,
}

impl<R: Reference> Default for MemoryReplicaStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Reference> MemoryReplicaStore<R> {
    /// Empty replica at watermark 0.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ReplicaState {
                version: 0,
                entities: BTreeMap::new(),
            }),
        }
    }

    /// Number of mirrored entities.
    pub async fn len(&self) -> usize {
        self.state.read().await.entities.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entities.is_empty()
    }

    /// Consistent view of watermark and every entity.
    pub async fn snapshot(&self) -> (Version, Vec<R>) {
        let state = self.state.read().await;
        (state.version, state.entities.values().cloned().collect())
    }
}

impl<R: Reference> ReplicaStore<R> for MemoryReplicaStore<R> {
    fn init(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn get_version(&self) -> BoxFuture<'_, Version> {
        Box::pin(async move { Ok(self.state.read().await.version) })
    }

    fn set_version(&self, version: Version) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.state.write().await.version = version;
            metrics::set_replica_watermark("memory", version);
            Ok(())
        })
    }

    fn apply_changes(&self, changes: ChangeSet<R>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let updated = changes.update.len();
            let deleted = changes.delete.len();

            for reference in changes.update {
                state.entities.insert(reference.key(), reference);
            }
            for reference in &changes.delete {
                state.entities.remove(&reference.key());
            }
            state.version = changes.version;

            debug!(version = changes.version, updated, deleted, "Applied changes to memory replica");
            metrics::record_replica_apply("memory", updated, deleted);
            metrics::set_replica_watermark("memory", changes.version);
            Ok(())
        })
    }

    fn put(&self, reference: R) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.state.write().await.entities.insert(reference.key(), reference);
            Ok(())
        })
    }

    fn put_many(&self, references: Vec<R>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            for reference in references {
                state.entities.insert(reference.key(), reference);
            }
            Ok(())
        })
    }

    fn get_all(&self, from_version: Version) -> BoxFuture<'_, Vec<R>> {
        Box::pin(async move {
            Ok(self
                .state
                .read()
                .await
                .entities
                .values()
                .filter(|entity| entity.version() >= from_version)
                .cloned()
                .collect())
        })
    }

    fn get_one(&self, key: &EntityKey) -> BoxFuture<'_, Option<R>> {
        let key = key.clone();
        Box::pin(async move { Ok(self.state.read().await.entities.get(&key).cloned()) })
    }
}
