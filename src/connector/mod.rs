// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Client-side connectors.
//!
//! A connector keeps a [`ReplicaStore`](crate::replica::ReplicaStore) in sync
//! with an authoritative owned store and forwards application mutations to
//! it. Two flavours exist:
//!
//! - [`RemoteConnector`]: speaks the delta protocol over a
//!   [`Transport`](crate::transport::Transport).
//! - [`LocalConnector`]: binds an in-process owned store directly.
//!
//! # Capabilities
//!
//! Not every connector implements every mutation. Callers check
//! [`Connector::supports`] up front, and an unsupported call fails with
//! [`ReplicationError::Unsupported`] rather than a transport error.

mod local;
mod remote;
mod state;

pub use local::LocalConnector;
pub use remote::RemoteConnector;
pub use state::ConnectorState;

use crate::error::ReplicationError;
use crate::reference::Reference;
use crate::BoxFuture;
use std::fmt;

/// Mutating operation a connector may or may not support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Put,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Put => write!(f, "put"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// Operations a connector implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub put: bool,
    pub delete: bool,
}

impl Capabilities {
    pub const ALL: Capabilities = Capabilities { put: true, delete: true };

    pub fn supports(&self, operation: Operation) -> bool {
        match operation {
            Operation::Put => self.put,
            Operation::Delete => self.delete,
        }
    }
}

/// Interface the application uses regardless of where the owned store lives.
pub trait Connector<R: Reference>: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    fn supports(&self, operation: Operation) -> bool {
        self.capabilities().supports(operation)
    }

    /// Prepare the replica and pull whatever it is missing.
    fn init(&self) -> BoxFuture<'_, ()>;

    fn put_one(&self, reference: R) -> BoxFuture<'_, ()>;

    fn put_many(&self, references: Vec<R>) -> BoxFuture<'_, ()>;

    fn delete(&self, reference: R) -> BoxFuture<'_, ()> {
        drop(reference);
        Box::pin(async {
            Err(ReplicationError::Unsupported {
                operation: Operation::Delete,
            })
        })
    }
}
