//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Owned store version and mutation volume
//! - Coordinator connections, deltas sent and notify fan-out
//! - Replica applies and watermarks
//! - Connector state
//! - Malformed messages and send failures
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use versioned_replication::metrics;
//! use std::time::Duration;
//!
//! // In the coordinator after a mutating command
//! metrics::record_changes_sent("link-1-server", 3);
//! metrics::record_notify_broadcast(4, Duration::from_millis(2));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Owned Store Metrics
// =============================================================================

/// Set the authoritative version.
pub fn set_owned_version(version: u64) {
    gauge!("replication_owned_version").set(version as f64);
}

/// Record entities touched by one mutating call.
pub fn record_mutation(kind: &str, count: usize) {
    counter!("replication_mutation_calls_total", "kind" => kind.to_string()).increment(1);
    counter!("replication_mutated_entities_total", "kind" => kind.to_string()).increment(count as u64);
}

// =============================================================================
// Coordinator Metrics
// =============================================================================

/// Record a command handled by the coordinator.
pub fn record_command(kind: &str, duration: Duration) {
    counter!("replication_commands_total", "kind" => kind.to_string()).increment(1);
    histogram!("replication_command_duration_seconds", "kind" => kind.to_string()).record(duration.as_secs_f64());
}

/// Record a delta sent point-to-point.
pub fn record_changes_sent(connection: &str, entries: usize) {
    counter!("replication_changes_sent_total", "connection" => connection.to_string()).increment(1);
    histogram!("replication_changes_entries").record(entries as f64);
}

/// Record a notify fan-out.
pub fn record_notify_broadcast(recipients: usize, duration: Duration) {
    counter!("replication_notify_broadcasts_total").increment(1);
    counter!("replication_notify_sent_total").increment(recipients as u64);
    histogram!("replication_notify_fanout_seconds").record(duration.as_secs_f64());
}

/// Set number of registered connections.
pub fn set_connections(count: usize) {
    gauge!("replication_connections").set(count as f64);
}

/// Record a send that failed and dropped its connection.
pub fn record_send_failure(connection: &str) {
    counter!("replication_send_failures_total", "connection" => connection.to_string()).increment(1);
}

/// Set coordinator state.
pub fn set_coordinator_state(state: &str) {
    let value = match state {
        "Running" => 0.0,
        "ShuttingDown" => 1.0,
        "Stopped" => 2.0,
        _ => -1.0,
    };
    gauge!("replication_coordinator_state").set(value);
}

// =============================================================================
// Wire Metrics
// =============================================================================

/// Record a payload that failed decoding. `side` is "server" or "client".
pub fn record_malformed_message(side: &str) {
    counter!("replication_malformed_messages_total", "side" => side.to_string()).increment(1);
}

// =============================================================================
// Replica Metrics
// =============================================================================

/// Record a delta applied to a replica.
pub fn record_replica_apply(backend: &str, updated: usize, deleted: usize) {
    counter!("replication_replica_applies_total", "backend" => backend.to_string()).increment(1);
    counter!("replication_replica_updated_total", "backend" => backend.to_string()).increment(updated as u64);
    counter!("replication_replica_deleted_total", "backend" => backend.to_string()).increment(deleted as u64);
}

/// Set the replica watermark.
pub fn set_replica_watermark(backend: &str, version: u64) {
    gauge!("replication_replica_watermark", "backend" => backend.to_string()).set(version as f64);
}

/// Record SQLite retry due to SQLITE_BUSY/SQLITE_LOCKED.
pub fn replica_retries_total(operation: &str) {
    counter!("replication_replica_sqlite_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Connector Metrics
// =============================================================================

/// Set connector state for one connection.
pub fn set_connector_state(connector: &str, state: &str) {
    // Encode state as numeric for alerting
    let value = match state {
        "Disconnected" => 0.0,
        "Connecting" => 1.0,
        "Synchronizing" => 2.0,
        "Steady" => 3.0,
        _ => -1.0,
    };
    gauge!("replication_connector_state", "connector" => connector.to_string()).set(value);
}
