//! Shared building blocks for the duet signaling service and its client.
//!
//! - [`config`]: layered server configuration (file + `DUET_*` environment)
//! - [`error`]: the error taxonomy shared by server and client
//! - [`logging`]: `tracing` subscriber setup
//! - [`models`]: room and connection identifiers
//! - [`protocol`]: the JSON events exchanged over the signaling socket

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod protocol;

pub use config::Config;
pub use error::{Error, Result};
pub use models::{ConnectionId, RoomId};
pub use protocol::{ClientMessage, ServerMessage};

/// Number of participants a room admits. Rooms pair exactly two callers.
pub const ROOM_CAPACITY: usize = 2;
