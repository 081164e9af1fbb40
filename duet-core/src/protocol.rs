//! Signaling wire protocol
//!
//! Every WebSocket text frame carries one JSON object of the form
//! `{"event": "<kebab-case name>", "data": {...}}`. Payload-less events omit
//! `data`. Negotiation payloads (`description`, `candidate`) are opaque JSON
//! values: the server routes them by room id and never looks inside.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::RoomId;

/// Events sent by a client to the signaling server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    /// Request admission to a room
    JoinRoom { room_id: RoomId, name: String },
    Offer { room_id: RoomId, description: Value },
    Answer { room_id: RoomId, description: Value },
    IceCandidate { room_id: RoomId, candidate: Value },
    /// In-call chat line
    SendMessage {
        room_id: RoomId,
        text: String,
        sender_name: String,
    },
    /// Manual termination notice for the peer
    EndCall { room_id: RoomId },
}

impl ClientMessage {
    #[must_use]
    pub const fn room_id(&self) -> &RoomId {
        match self {
            Self::JoinRoom { room_id, .. }
            | Self::Offer { room_id, .. }
            | Self::Answer { room_id, .. }
            | Self::IceCandidate { room_id, .. }
            | Self::SendMessage { room_id, .. }
            | Self::EndCall { room_id } => room_id,
        }
    }

    /// Event name as it appears on the wire
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join-room",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::SendMessage { .. } => "send-message",
            Self::EndCall { .. } => "end-call",
        }
    }

    /// The event the relay delivers to the other room member, if this message is relayed.
    /// `join-room` is handled by the registry and yields `None`.
    #[must_use]
    pub fn into_relayed(self) -> Option<(RoomId, ServerMessage)> {
        match self {
            Self::JoinRoom { .. } => None,
            Self::Offer {
                room_id,
                description,
            } => Some((room_id, ServerMessage::Offer { description })),
            Self::Answer {
                room_id,
                description,
            } => Some((room_id, ServerMessage::Answer { description })),
            Self::IceCandidate { room_id, candidate } => {
                Some((room_id, ServerMessage::IceCandidate { candidate }))
            }
            Self::SendMessage {
                room_id,
                text,
                sender_name,
            } => Some((room_id, ServerMessage::ReceiveMessage { text, sender_name })),
            Self::EndCall { room_id } => Some((room_id, ServerMessage::EndCall)),
        }
    }
}

/// Events sent by the signaling server to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    /// Admission rejected, the room already has two members
    RoomFull,
    /// Sent to the first member when the second one is admitted
    PeerJoined { name: String },
    Offer { description: Value },
    Answer { description: Value },
    IceCandidate { candidate: Value },
    ReceiveMessage { text: String, sender_name: String },
    /// The peer ended the call on purpose
    EndCall,
    /// The peer's connection went away without an end-call
    PeerLeft,
}

impl ServerMessage {
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::RoomFull => "room-full",
            Self::PeerJoined { .. } => "peer-joined",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::ReceiveMessage { .. } => "receive-message",
            Self::EndCall => "end-call",
            Self::PeerLeft => "peer-left",
        }
    }
}
