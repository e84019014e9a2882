// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Delta protocol: wire messages and codec.
//!
//! Three message shapes cross the wire, all JSON:
//!
//! ```text
//! client → server   Command  { version, mutate?: [{ data, command: "put"|"delete" }] }
//! server → client   Changes  { type: "changes", version, update?: [..], delete?: [..] }
//! server → client   Notify   { type: "notify", version }
//! ```
//!
//! `Changes` and `Notify` share one tagged union, [`Push`]. Receivers match on
//! it exhaustively, so adding a third push kind is a compile error at every
//! handler rather than a silent fallthrough.
//!
//! # Delta Rule
//!
//! A [`ChangeSet`] computed from baseline `b` carries every live entity with
//! `version >= b` in `update` and every tombstone with `version >= b` in
//! `delete`, stamped with the authoritative version at computation time.
//! Replicas apply updates first, then deletes.
//!
//! # Validation
//!
//! Decoding is the schema check. Anything that fails to decode into the typed
//! message becomes [`ReplicationError::MalformedMessage`]; callers drop it and
//! keep the connection open.

use crate::error::{ReplicationError, Result};
use crate::reference::{Reference, Version};
use serde::{Deserialize, Serialize};

/// Operation requested by a [`Mutation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Put,
    Delete,
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationKind::Put => write!(f, "put"),
            MutationKind::Delete => write!(f, "delete"),
        }
    }
}

/// One operation inside a [`Command`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "R: Reference")]
pub struct Mutation<R> {
    /// The entity (payload for puts, identity for deletes).
    pub data: R,
    /// The operation to apply.
    pub command: MutationKind,
}

impl<R: Reference> Mutation<R> {
    pub fn put(data: R) -> Self {
        Self {
            data,
            command: MutationKind::Put,
        }
    }

    pub fn delete(data: R) -> Self {
        Self {
            data,
            command: MutationKind::Delete,
        }
    }
}

/// Client-to-server message.
///
/// `version` is the client's watermark. Without `mutate` the command is a
/// pure catch-up request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "R: Reference")]
pub struct Command<R> {
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutate: Option<Vec<Mutation<R>>>,
}

impl<R: Reference> Command<R> {
    /// Pure catch-up request from watermark `version`.
    pub fn catch_up(version: Version) -> Self {
        Self {
            version,
            mutate: None,
        }
    }

    /// Mutating command with baseline `version`.
    pub fn mutate(version: Version, mutations: Vec<Mutation<R>>) -> Self {
        Self {
            version,
            mutate: Some(mutations),
        }
    }

    /// True when the command carries no mutations (absent or empty list).
    pub fn is_catch_up(&self) -> bool {
        self.mutate.as_ref().map_or(true, |m| m.is_empty())
    }
}

/// A delta between a baseline and the authoritative version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "R: Reference")]
pub struct ChangeSet<R> {
    /// Authoritative version when the delta was computed.
    pub version: Version,
    /// Entities written at or after the baseline.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub update: Vec<R>,
    /// Entities removed at or after the baseline, stamped with their
    /// tombstone version.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delete: Vec<R>,
}

impl<R: Reference> ChangeSet<R> {
    /// Empty delta at `version` (nothing to apply, only a watermark).
    pub fn empty(version: Version) -> Self {
        Self {
            version,
            update: Vec::new(),
            delete: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.update.is_empty() && self.delete.is_empty()
    }

    /// Total number of entries (updates + deletes).
    pub fn len(&self) -> usize {
        self.update.len() + self.delete.len()
    }
}

/// Version-only announcement that the authoritative store advanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notify {
    pub version: Version,
}

/// Server-to-client message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", bound = "R: Reference")]
pub enum Push<R> {
    /// Point-to-point delta.
    Changes(ChangeSet<R>),
    /// Broadcast hint to pull.
    Notify(Notify),
}

impl<R: Reference> Push<R> {
    pub fn version(&self) -> Version {
        match self {
            Push::Changes(changes) => changes.version,
            Push::Notify(notify) => notify.version,
        }
    }

    /// Label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Push::Changes(_) => "changes",
            Push::Notify(_) => "notify",
        }
    }
}

/// Encode any wire message as JSON.
pub fn encode<M: Serialize>(message: &M) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Decode a client command, mapping schema failures to `MalformedMessage`.
pub fn decode_command<R: Reference>(payload: &str) -> Result<Command<R>> {
    serde_json::from_str(payload).map_err(|e| ReplicationError::MalformedMessage(e.to_string()))
}

/// Decode a server push, mapping schema failures to `MalformedMessage`.
pub fn decode_push<R: Reference>(payload: &str) -> Result<Push<R>> {
    serde_json::from_str(payload).map_err(|e| ReplicationError::MalformedMessage(e.to_string()))
}
