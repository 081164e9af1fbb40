use dashmap::DashMap;
use duet_core::{ConnectionId, RoomId, ServerMessage, ROOM_CAPACITY};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Outbound queue of one signaling connection
pub type OutboundSender = mpsc::Sender<ServerMessage>;

/// A live connection admitted to a room
#[derive(Debug, Clone)]
pub struct Participant {
    pub connection_id: ConnectionId,
    /// Display name, free-form and not unique
    pub name: String,
    pub sender: OutboundSender,
}

#[derive(Debug, Default)]
struct Room {
    /// Join order is preserved; never more than `ROOM_CAPACITY` entries
    participants: Vec<Participant>,
}

/// Result of a join attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Added to the room. `prior_count` is the membership before this join (0 or 1).
    Admitted { prior_count: usize },
    /// The connection is already a member of this room; nothing changed
    AlreadyMember,
    /// The room already has two members; nothing changed
    RoomFull,
}

/// Result of removing a connection from its room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub room_id: RoomId,
    /// Whether a remaining member was sent `peer-left`
    pub peer_notified: bool,
    /// Whether the room became empty and was dropped
    pub room_removed: bool,
}

/// Read-only view of a room for inspection endpoints
#[derive(Debug, Clone, Serialize)]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    pub member_names: Vec<String>,
}

/// Push an event onto a connection's outbound queue without waiting.
///
/// Delivery is at most once: a full or closed queue drops the event.
pub fn deliver(sender: &OutboundSender, connection_id: &ConnectionId, event: ServerMessage) -> bool {
    let event_type = event.event_type();
    match sender.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(
                connection_id = %connection_id,
                event_type,
                "Outbound queue full, dropping event"
            );
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!(
                connection_id = %connection_id,
                event_type,
                "Connection closed, dropping event"
            );
            false
        }
    }
}

/// In-memory registry of two-party rooms
///
/// Join and leave are check-and-mutate operations under the per-key lock of
/// the room map, so concurrent joiners of one room are serialized while
/// unrelated rooms proceed independently.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    /// Map of room_id -> members
    rooms: Arc<DashMap<RoomId, Room>>,

    /// Map of connection_id -> room_id, consulted on disconnect
    memberships: Arc<DashMap<ConnectionId, RoomId>>,
}

impl RoomRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a participant to a room, creating the room on first join.
    ///
    /// A connection belongs to at most one room: once admitted to a different
    /// room it leaves the current one (notifying whoever stays behind there).
    /// A rejected join leaves every room untouched.
    pub fn join(&self, room_id: &RoomId, participant: Participant) -> JoinOutcome {
        let connection_id = participant.connection_id.clone();

        if self.room_of(&connection_id).as_ref() == Some(room_id) {
            debug!(room_id = %room_id, connection_id = %connection_id, "Already a member");
            return JoinOutcome::AlreadyMember;
        }

        let name = participant.name.clone();
        let prior_count = {
            let mut room = self.rooms.entry(room_id.clone()).or_default();
            let prior_count = room.participants.len();
            if prior_count >= ROOM_CAPACITY {
                drop(room);
                info!(
                    room_id = %room_id,
                    connection_id = %connection_id,
                    "Join rejected, room is full"
                );
                return JoinOutcome::RoomFull;
            }
            room.participants.push(participant);
            prior_count
        };

        // The old room is only touched after the new room's guard is released
        let previous = self.memberships.insert(connection_id.clone(), room_id.clone());
        if let Some(previous) = previous.filter(|previous| previous != room_id) {
            self.remove_from_room(&previous, &connection_id);
        }

        info!(
            room_id = %room_id,
            connection_id = %connection_id,
            name = %name,
            member_count = prior_count + 1,
            "Participant joined room"
        );

        JoinOutcome::Admitted { prior_count }
    }

    /// Tell the member that was already waiting that `joining` has arrived.
    ///
    /// Only meaningful right after a join that reported `prior_count == 1`.
    /// The joiner itself is never notified.
    pub fn notify_if_second(&self, room_id: &RoomId, joining: &ConnectionId) -> bool {
        let Some((recipient, name)) = self.rooms.get(room_id).and_then(|room| {
            let joiner = room
                .participants
                .iter()
                .find(|p| p.connection_id == *joining)?;
            let first = room
                .participants
                .iter()
                .find(|p| p.connection_id != *joining)?;
            Some((first.clone(), joiner.name.clone()))
        }) else {
            return false;
        };

        debug!(
            room_id = %room_id,
            recipient = %recipient.connection_id,
            "Notifying first member of peer arrival"
        );
        deliver(
            &recipient.sender,
            &recipient.connection_id,
            ServerMessage::PeerJoined { name },
        )
    }

    /// Remove a connection from whatever room it belongs to.
    ///
    /// The room is looked up from the registry's own records, so this works for
    /// abrupt disconnects that carry no room id. Returns `None` if the connection
    /// was not in a room.
    pub fn leave(&self, connection_id: &ConnectionId) -> Option<LeaveOutcome> {
        let (_, room_id) = self.memberships.remove(connection_id)?;
        Some(self.remove_from_room(&room_id, connection_id))
    }

    fn remove_from_room(&self, room_id: &RoomId, connection_id: &ConnectionId) -> LeaveOutcome {
        // peer-left is queued under the room lock so a later peer-joined can't overtake it
        let peer_notified = self.rooms.get_mut(room_id).is_some_and(|mut room| {
            room.participants
                .retain(|p| p.connection_id != *connection_id);
            room.participants.first().is_some_and(|peer| {
                deliver(&peer.sender, &peer.connection_id, ServerMessage::PeerLeft)
            })
        });

        // Re-checked under the key lock; a concurrent join may have refilled it
        let room_removed = self
            .rooms
            .remove_if(room_id, |_, room| room.participants.is_empty())
            .is_some();
        if room_removed {
            debug!(room_id = %room_id, "Room has no more members, removed");
        }

        info!(
            room_id = %room_id,
            connection_id = %connection_id,
            peer_notified,
            "Participant left room"
        );

        LeaveOutcome {
            room_id: room_id.clone(),
            peer_notified,
            room_removed,
        }
    }

    /// Room the connection currently belongs to
    #[must_use]
    pub fn room_of(&self, connection_id: &ConnectionId) -> Option<RoomId> {
        self.memberships
            .get(connection_id)
            .map(|room| room.value().clone())
    }

    /// Members of `room_id` other than `connection_id`
    #[must_use]
    pub fn others(&self, room_id: &RoomId, connection_id: &ConnectionId) -> Vec<Participant> {
        self.rooms
            .get(room_id)
            .map(|room| {
                room.participants
                    .iter()
                    .filter(|p| p.connection_id != *connection_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn member_count(&self, room_id: &RoomId) -> usize {
        self.rooms
            .get(room_id)
            .map_or(0, |room| room.participants.len())
    }

    #[must_use]
    pub fn snapshot(&self, room_id: &RoomId) -> Option<RoomSnapshot> {
        self.rooms.get(room_id).map(|room| RoomSnapshot {
            room_id: room_id.clone(),
            member_names: room.participants.iter().map(|p| p.name.clone()).collect(),
        })
    }

    /// Number of live rooms
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Number of connections currently in a room
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.memberships.len()
    }
}
