pub mod id;

pub use id::{ConnectionId, RoomId};
