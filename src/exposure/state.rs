//! Session State Machine

use std::fmt;

/// Lifecycle of an exposure session.
///
/// `Idle -> Negotiating -> Running -> ShuttingDown -> Stopped`, with
/// failures before `Running` jumping straight to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Negotiating,
    Running,
    ShuttingDown,
    Stopped,
}

impl SessionState {
    /// Whether moving to `next` is a legal transition
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Negotiating)
                | (Idle, Stopped)
                | (Negotiating, Running)
                | (Negotiating, Stopped)
                | (Running, ShuttingDown)
                | (ShuttingDown, Stopped)
        )
    }

    /// Stopped sessions never change state again
    pub fn is_terminal(self) -> bool {
        self == SessionState::Stopped
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Negotiating => "negotiating",
            SessionState::Running => "running",
            SessionState::ShuttingDown => "shutting-down",
            SessionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}
