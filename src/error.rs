// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for versioned replication.
//!
//! Errors are categorized by where they originate (wire decoding, replica
//! backend, transport, connector capabilities) and carry enough context to
//! tell them apart without string matching.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `MalformedMessage` | No | Wire payload failed schema decoding |
//! | `Uninitialized` | No | Store used before `init()` completed |
//! | `Unsupported` | No | Connector does not implement the operation |
//! | `Transport` | Yes | Send failed or connection dropped |
//! | `ReplicaStore` | No | Durable backend (SQLite) error |
//! | `Serialization` | No | Stored entity could not be encoded/decoded |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Connector/coordinator state machine violation |
//! | `Shutdown` | No | Coordinator is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! The core never retries on its own. [`ReplicationError::is_retryable()`]
//! tells the surrounding transport layer whether reconnecting could help.
//! Absence of an entity is never an error: lookups return `None` and deletes
//! of unknown keys succeed.

use crate::connector::Operation;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Wire payload failed decoding.
    ///
    /// The message is dropped and logged; the connection stays open.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// A store-backed operation ran before the store finished `init()`.
    ///
    /// Callers must initialize the store before retrying.
    #[error("Store not initialized: {0}")]
    Uninitialized(String),

    /// The connector variant does not implement this operation.
    ///
    /// Distinct from transport failures so callers can detect the
    /// capability gap instead of treating it as a network error.
    #[error("Operation not supported by this connector: {operation}")]
    Unsupported { operation: Operation },

    /// Send failure or dropped connection.
    #[error("Transport error ({connection}): {message}")]
    Transport { connection: String, message: String },

    /// SQLite error in the durable replica backend.
    #[error("Replica store error: {0}")]
    ReplicaStore(#[from] sqlx::Error),

    /// Entity data could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation attempted in the wrong state
    /// (e.g. mutating through a disconnected connector).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a transport error for a connection.
    pub fn transport(connection: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            connection: connection.into(),
            message: message.into(),
        }
    }

    /// Create an uninitialized-store error.
    pub fn uninitialized(store: impl Into<String>) -> Self {
        Self::Uninitialized(store.into())
    }

    /// Check if this error is retryable by the surrounding transport layer.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::MalformedMessage(_) => false,
            Self::Uninitialized(_) => false, // Needs init(), not a retry
            Self::Unsupported { .. } => false,
            Self::ReplicaStore(_) => false,
            Self::Serialization(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this error reports a missing connector capability.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedMessage(_) => "malformed_message",
            Self::Uninitialized(_) => "uninitialized",
            Self::Unsupported { .. } => "unsupported",
            Self::Transport { .. } => "transport",
            Self::ReplicaStore(_) => "replica_store",
            Self::Serialization(_) => "serialization",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}
