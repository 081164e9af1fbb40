use duet_core::{ClientMessage, ConnectionId, RoomId, ServerMessage};
use tracing::{debug, warn};

use crate::registry::{deliver, JoinOutcome, OutboundSender, Participant, RoomRegistry};

/// The server side of one signaling connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub sender: OutboundSender,
}

impl ConnectionHandle {
    #[must_use]
    pub fn new(sender: OutboundSender) -> Self {
        Self {
            id: ConnectionId::new(),
            sender,
        }
    }
}

/// Routes decoded client events
///
/// `join-room` goes to the registry. Everything else is forwarded verbatim to
/// the other member of the named room and never echoed back. There is no
/// buffering: with nobody else present the event is dropped. Each connection's
/// events are dispatched in arrival order, so one sender's stream reaches the
/// peer in order.
#[derive(Clone, Default)]
pub struct SignalingRelay {
    registry: RoomRegistry,
}

impl SignalingRelay {
    #[must_use]
    pub const fn new(registry: RoomRegistry) -> Self {
        Self { registry }
    }

    #[must_use]
    pub const fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// Handle one event from `conn`
    pub fn dispatch(&self, conn: &ConnectionHandle, message: ClientMessage) {
        match message {
            ClientMessage::JoinRoom { room_id, name } => self.join(conn, &room_id, name),
            other => {
                let Some((room_id, event)) = other.into_relayed() else {
                    return;
                };
                // Same normalization as join-room
                if let Some(room_id) = RoomId::parse(room_id.as_str()) {
                    self.relay(&conn.id, &room_id, event);
                }
            }
        }
    }

    fn join(&self, conn: &ConnectionHandle, room_id: &RoomId, name: String) {
        let Some(room_id) = RoomId::parse(room_id.as_str()) else {
            debug!(connection_id = %conn.id, "Ignoring join-room with empty room id");
            return;
        };

        let participant = Participant {
            connection_id: conn.id.clone(),
            name,
            sender: conn.sender.clone(),
        };

        match self.registry.join(&room_id, participant) {
            JoinOutcome::Admitted { prior_count: 1 } => {
                self.registry.notify_if_second(&room_id, &conn.id);
            }
            JoinOutcome::Admitted { .. } | JoinOutcome::AlreadyMember => {}
            JoinOutcome::RoomFull => {
                deliver(&conn.sender, &conn.id, ServerMessage::RoomFull);
            }
        }
    }

    /// Forward `event` to every member of `room_id` except `from`.
    ///
    /// Events from a connection that is not a member of `room_id` are dropped.
    /// Returns the number of members the event was queued for (0 or 1).
    pub fn relay(&self, from: &ConnectionId, room_id: &RoomId, event: ServerMessage) -> usize {
        if self.registry.room_of(from).as_ref() != Some(room_id) {
            warn!(
                connection_id = %from,
                room_id = %room_id,
                event_type = event.event_type(),
                "Dropping event for a room the sender has not joined"
            );
            return 0;
        }

        let recipients = self.registry.others(room_id, from);
        if recipients.is_empty() {
            debug!(
                room_id = %room_id,
                event_type = event.event_type(),
                "No peer present, event dropped"
            );
            return 0;
        }

        recipients
            .iter()
            .filter(|peer| deliver(&peer.sender, &peer.connection_id, event.clone()))
            .count()
    }

    /// Clean up after a connection closed, with or without a prior end-call
    pub fn disconnect(&self, connection_id: &ConnectionId) {
        if self.registry.leave(connection_id).is_none() {
            debug!(connection_id = %connection_id, "Disconnected before joining a room");
        }
    }
}
