//! Coordinator state types.
//!
//! # State Transitions
//!
//! ```text
//!            shutdown()
//! Running ──────────────→ ShuttingDown ──→ Stopped
//! ```
//!
//! - **Running**: Accepting connections and commands.
//! - **ShuttingDown**: `shutdown()` called. Connection tasks are draining.
//! - **Stopped**: All tasks joined, registry cleared. `open()` and
//!   `accept()` fail with `Shutdown`.

/// State of the fan-out coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Running,
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinatorState::Running => write!(f, "Running"),
            CoordinatorState::ShuttingDown => write!(f, "ShuttingDown"),
            CoordinatorState::Stopped => write!(f, "Stopped"),
        }
    }
}

impl CoordinatorState {
    /// True when new connections are accepted.
    pub fn is_accepting(&self) -> bool {
        matches!(self, CoordinatorState::Running)
    }
}
