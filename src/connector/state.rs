//! Connector state types.
//!
//! # State Transitions
//!
//! ```text
//!                open
//! Disconnected ───────→ Connecting
//!      ↑                    │ catch-up sent
//!      │                    ↓
//!      │              Synchronizing
//!      │                    │ first changes applied
//!      │                    ↓
//!      └──── close ─────  Steady
//! ```
//!
//! Any state returns to `Disconnected` on close or transport error.

/// State of one connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectorState {
    /// No live connection. Mutations are rejected.
    #[default]
    Disconnected,

    /// Connection open, replica initializing and catch-up being sent.
    Connecting,

    /// Catch-up sent, waiting for the first delta.
    Synchronizing,

    /// At least one delta applied; following notifies.
    Steady,
}

impl ConnectorState {
    /// True when mutations may be sent.
    pub fn is_connected(&self) -> bool {
        !matches!(self, ConnectorState::Disconnected)
    }
}

impl std::fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectorState::Disconnected => write!(f, "Disconnected"),
            ConnectorState::Connecting => write!(f, "Connecting"),
            ConnectorState::Synchronizing => write!(f, "Synchronizing"),
            ConnectorState::Steady => write!(f, "Steady"),
        }
    }
}
