//! In-memory room hub for the duet signaling server
//!
//! - **`RoomRegistry`**: room id -> ordered members (capacity 2), plus the
//!   connection -> room index used to clean up after abrupt disconnects
//! - **`SignalingRelay`**: dispatches decoded client events, forwarding
//!   negotiation and chat payloads to the other member of the sender's room
//!
//! State lives only in this process. Running several server processes would
//! need a shared store, since the capacity check needs one owner per room.

mod registry;
mod relay;

pub use registry::{
    deliver, JoinOutcome, LeaveOutcome, OutboundSender, Participant, RoomRegistry, RoomSnapshot,
};
pub use relay::{ConnectionHandle, SignalingRelay};
