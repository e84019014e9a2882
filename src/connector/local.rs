//! In-process connector.
//!
//! Binds an owned store living in the same process straight to a replica,
//! with no wire protocol in between. Each write goes to the owned store and
//! the resulting delta is applied to the replica before the call returns.
//!
//! Deletes are not supported here: [`Connector::delete`] returns
//! [`ReplicationError::Unsupported`](crate::ReplicationError::Unsupported).

use super::{Capabilities, Connector};
use crate::error::Result;
use crate::owned::OwnedStore;
use crate::reference::Reference;
use crate::replica::ReplicaStore;
use crate::BoxFuture;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub struct LocalConnector<R: Reference, S> {
    owned: Arc<Mutex<OwnedStore<R>>>,
    replica: S,
}

impl<R: Reference, S: ReplicaStore<R>> LocalConnector<R, S> {
    pub fn new(owned: Arc<Mutex<OwnedStore<R>>>, replica: S) -> Self {
        Self { owned, replica }
    }

    pub fn replica(&self) -> &S {
        &self.replica
    }

    pub fn owned(&self) -> &Arc<Mutex<OwnedStore<R>>> {
        &self.owned
    }

    /// Pull everything the replica is missing. Caller holds the owned lock.
    async fn sync(&self, owned: &OwnedStore<R>) -> Result<()> {
        let watermark = self.replica.get_version().await?;
        let changes = owned.get_changes(watermark);
        debug!(watermark, version = changes.version, entries = changes.len(), "Local sync");
        self.replica.apply_changes(changes).await
    }

    async fn write(&self, references: Vec<R>) -> Result<()> {
        let mut owned = self.owned.lock().await;
        owned.put_many(references);
        self.sync(&owned).await
    }

    async fn write_one(&self, reference: R) -> Result<()> {
        let mut owned = self.owned.lock().await;
        owned.put(reference);
        self.sync(&owned).await
    }
}

impl<R: Reference, S: ReplicaStore<R>> Connector<R> for LocalConnector<R, S> {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            put: true,
            delete: false,
        }
    }

    fn init(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.replica.init().await?;
            let owned = self.owned.lock().await;
            self.sync(&owned).await
        })
    }

    fn put_one(&self, reference: R) -> BoxFuture<'_, ()> {
        Box::pin(self.write_one(reference))
    }

    fn put_many(&self, references: Vec<R>) -> BoxFuture<'_, ()> {
        Box::pin(self.write(references))
    }
}
