use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one call attempt
///
/// `Ended` and `PermissionDenied` are terminal. `PermissionDenied` is only
/// reachable from `Initializing`; `Ended` from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Initializing,
    WaitingForPeer,
    Negotiating,
    Connected,
    Reconnecting,
    Ended,
    PermissionDenied,
}

impl CallState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::PermissionDenied)
    }

    /// Whether `self -> next` is an edge of the lifecycle.
    ///
    /// Staying in the same state is not a transition; callers treat it as a
    /// no-op before consulting the table.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use CallState::{
            Connected, Ended, Initializing, Negotiating, PermissionDenied, Reconnecting,
            WaitingForPeer,
        };

        match (self, next) {
            (Initializing, WaitingForPeer | PermissionDenied)
            | (WaitingForPeer, Negotiating)
            | (WaitingForPeer | Negotiating | Reconnecting, Connected)
            | (Connected, Reconnecting) => true,
            (Ended | PermissionDenied, _) => false,
            (_, Ended) => true,
            _ => false,
        }
    }

    /// Text shown to the user for this state
    #[must_use]
    pub const fn status_text(self) -> &'static str {
        match self {
            Self::Initializing => "Initializing camera…",
            Self::WaitingForPeer => "Waiting for other user…",
            Self::Negotiating => "Connecting…",
            Self::Connected => "Connected",
            Self::Reconnecting => "Reconnecting…",
            Self::Ended => "Call ended",
            Self::PermissionDenied => "Camera/Microphone permission denied",
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::WaitingForPeer => "waiting_for_peer",
            Self::Negotiating => "negotiating",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Ended => "ended",
            Self::PermissionDenied => "permission_denied",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
