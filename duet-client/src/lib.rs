//! Client side of a duet call
//!
//! A [`CallSession`] owns one call attempt: the local media, the peer
//! transport, the retry and call timers and the chat log. It runs as a single
//! task that consumes remote signaling events, transport reports and user
//! commands in order, and publishes its observable status through a
//! [`SessionHandle`].

pub mod chat;
pub mod config;
pub mod reconnect;
pub mod session;
pub mod signaling;
pub mod state;
pub mod transport;

pub use chat::{ChatLog, ChatMessage};
pub use config::SessionConfig;
pub use reconnect::{ReconnectionManager, RetryDecision, RetryPolicy};
pub use session::{format_duration, CallSession, EndReason, SessionHandle, SessionStatus};
pub use state::CallState;
pub use transport::{
    CallBackend, IceCandidate, LocalMedia, PeerTransport, SdpType, SessionDescription,
    SignalingSink, TransportEvent, TransportState,
};
