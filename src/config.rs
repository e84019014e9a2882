//! Configuration for versioned replication.
//!
//! Configuration can be constructed programmatically or deserialized from
//! YAML/JSON. Every section has defaults, so an empty document is valid.
//!
//! # Quick Start
//!
//! ```rust
//! use versioned_replication::config::{ReplicaConfig, ReplicationConfig};
//!
//! let config = ReplicationConfig {
//!     node_id: "server-1".into(),
//!     replica: ReplicaConfig::sqlite("/var/lib/app/replica.db"),
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── node_id: String              # Label for logs
//! ├── server: ServerConfig         # Fan-out coordinator
//! │   ├── drain_timeout: "10s"
//! │   └── channel_capacity: 256
//! ├── connector: ConnectorConfig   # Client side
//! │   ├── channel_capacity: 256
//! │   └── push_buffer: 64
//! └── replica: ReplicaConfig       # Client-side mirror backend
//!     ├── backend: memory | sqlite
//!     ├── sqlite_path
//!     └── wal_mode
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! node_id: "edge-7"
//!
//! server:
//!   drain_timeout: "5s"
//!
//! replica:
//!   backend: sqlite
//!   sqlite_path: "/var/lib/app/replica.db"
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Identity of this process, attached to log spans.
    #[serde(default = "default_node_id")]
    pub node_id: String,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub connector: ConnectorConfig,

    #[serde(default)]
    pub replica: ReplicaConfig,
}

fn default_node_id() -> String {
    "local.dev.node.default".to_string()
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            server: ServerConfig::default(),
            connector: ConnectorConfig::default(),
            replica: ReplicaConfig::default(),
        }
    }
}

impl ReplicationConfig {
    /// Create a minimal config for testing.
    pub fn for_testing(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            server: ServerConfig {
                drain_timeout: "1s".to_string(),
                send_timeout: "250ms".to_string(),
                ..Default::default()
            },
            connector: ConnectorConfig::default(),
            replica: ReplicaConfig::in_memory(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ServerConfig: fan-out coordinator
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// How long `shutdown()` waits for each connection task (humantime).
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,

    /// Longest a single push may wait on a peer before the connection is
    /// dropped (humantime).
    #[serde(default = "default_send_timeout")]
    pub send_timeout: String,

    /// Per-direction queue size for in-process links.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_drain_timeout() -> String {
    "10s".to_string()
}

fn default_send_timeout() -> String {
    "5s".to_string()
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            drain_timeout: default_drain_timeout(),
            send_timeout: default_send_timeout(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl ServerConfig {
    /// Parse drain_timeout string to Duration.
    pub fn drain_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.drain_timeout).unwrap_or(Duration::from_secs(10))
    }

    /// Parse send_timeout string to Duration.
    pub fn send_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.send_timeout).unwrap_or(Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ConnectorConfig: client side
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Per-direction queue size for in-process links.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Buffered pushes per `subscribe()` receiver before it lags.
    #[serde(default = "default_push_buffer")]
    pub push_buffer: usize,
}

fn default_push_buffer() -> usize {
    64
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            push_buffer: default_push_buffer(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicaConfig: client-side mirror backend
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaBackend {
    #[default]
    Memory,
    Sqlite,
}

/// Replica backend configuration.
///
/// The SQLite backend survives restarts, so a client resumes catch-up from
/// its persisted watermark instead of from version 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    #[serde(default)]
    pub backend: ReplicaBackend,

    /// Path to the SQLite database (required for the sqlite backend).
    #[serde(default)]
    pub sqlite_path: Option<String>,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            backend: ReplicaBackend::Memory,
            sqlite_path: None,
            wal_mode: true,
        }
    }
}

impl ReplicaConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            backend: ReplicaBackend::Memory,
            sqlite_path: None,
            wal_mode: false,
        }
    }

    /// SQLite-backed replica at `path`.
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            backend: ReplicaBackend::Sqlite,
            sqlite_path: Some(path.into()),
            wal_mode: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_timeout_parsing() {
        let test_cases = [
            ("5s", Duration::from_secs(5)),
            ("1m", Duration::from_secs(60)),
            ("500ms", Duration::from_millis(500)),
            ("2min", Duration::from_secs(120)),
        ];

        for (input, expected) in test_cases {
            let config = ServerConfig {
                drain_timeout: input.to_string(),
                ..Default::default()
            };
            assert_eq!(config.drain_timeout_duration(), expected, "Failed for input: {}", input);
        }
    }

    #[test]
    fn test_drain_timeout_invalid_fallback() {
        let config = ServerConfig {
            drain_timeout: "invalid".to_string(),
            ..Default::default()
        };
        // Should fall back to 10 seconds
        assert_eq!(config.drain_timeout_duration(), Duration::from_secs(10));
    }

    #[test]
    fn test_send_timeout_parsing() {
        assert_eq!(ServerConfig::default().send_timeout_duration(), Duration::from_secs(5));

        let config = ServerConfig {
            send_timeout: "250ms".to_string(),
            ..Default::default()
        };
        assert_eq!(config.send_timeout_duration(), Duration::from_millis(250));

        let config = ServerConfig {
            send_timeout: "soon".to_string(),
            ..Default::default()
        };
        assert_eq!(config.send_timeout_duration(), Duration::from_secs(5));
    }

    #[test]
    fn test_connector_config_default() {
        let config = ConnectorConfig::default();
        assert_eq!(config.channel_capacity, 256);
        assert_eq!(config.push_buffer, 64);
    }

    #[test]
    fn test_replica_config_default() {
        let config = ReplicaConfig::default();
        assert_eq!(config.backend, ReplicaBackend::Memory);
        assert!(config.sqlite_path.is_none());
        assert!(config.wal_mode);
    }

    #[test]
    fn test_replica_config_in_memory() {
        let config = ReplicaConfig::in_memory();
        assert_eq!(config.backend, ReplicaBackend::Memory);
        assert!(!config.wal_mode);
    }

    #[test]
    fn test_replica_config_sqlite() {
        let config = ReplicaConfig::sqlite("/tmp/replica.db");
        assert_eq!(config.backend, ReplicaBackend::Sqlite);
        assert_eq!(config.sqlite_path.as_deref(), Some("/tmp/replica.db"));
    }

    #[test]
    fn test_replication_config_default() {
        let config = ReplicationConfig::default();
        assert_eq!(config.node_id, "local.dev.node.default");
        assert_eq!(config.server.drain_timeout_duration(), Duration::from_secs(10));
        assert_eq!(config.server.channel_capacity, 256);
    }

    #[test]
    fn test_for_testing_config() {
        let config = ReplicationConfig::for_testing("test-node-1");
        assert_eq!(config.node_id, "test-node-1");
        assert_eq!(config.server.drain_timeout_duration(), Duration::from_secs(1));
        assert_eq!(config.replica.backend, ReplicaBackend::Memory);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: ReplicationConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.node_id, "local.dev.node.default");
        assert_eq!(config.connector.push_buffer, 64);
        assert_eq!(config.replica.backend, ReplicaBackend::Memory);
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = ReplicationConfig {
            node_id: "node-roundtrip".to_string(),
            replica: ReplicaConfig::sqlite("replica.db"),
            ..Default::default()
        };

        let json = serde_json::to_string(&config).unwrap();
        let parsed: ReplicationConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.node_id, "node-roundtrip");
        assert_eq!(parsed.replica.backend, ReplicaBackend::Sqlite);
        assert_eq!(parsed.replica.sqlite_path.as_deref(), Some("replica.db"));
    }

    #[test]
    fn test_backend_wire_names() {
        let parsed: ReplicaConfig = serde_json::from_str(r#"{"backend":"sqlite","sqlite_path":"x.db"}"#).unwrap();
        assert_eq!(parsed.backend, ReplicaBackend::Sqlite);
        assert!(parsed.wal_mode);
    }
}
