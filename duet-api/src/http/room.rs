//! Room inspection and ICE server configuration

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::http::{AppError, AppResult, AppState};
use duet_core::{RoomId, ROOM_CAPACITY};

/// ICE Server configuration (STUN/TURN)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// URLs for the ICE server (e.g., ["stun:stun.example.com:3478"])
    pub urls: Vec<String>,
}

/// Response for ICE servers request
#[derive(Debug, Serialize, Deserialize)]
pub struct GetIceServersResponse {
    pub servers: Vec<IceServerConfig>,
}

/// Get ICE servers configured for this deployment
///
/// Path: `GET /api/ice-servers`
pub async fn get_ice_servers(State(state): State<AppState>) -> Json<GetIceServersResponse> {
    let servers = state
        .config
        .signaling
        .ice_servers
        .iter()
        .map(|url| IceServerConfig {
            urls: vec![url.clone()],
        })
        .collect();

    Json(GetIceServersResponse { servers })
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStatusResponse {
    pub room_id: String,
    pub member_count: usize,
    pub members: Vec<String>,
    pub full: bool,
}

/// Current membership of a room
///
/// Path: `GET /api/rooms/{room_id}`
/// Returns 404 when nobody is in the room.
pub async fn get_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> AppResult<Json<RoomStatusResponse>> {
    let room_id = RoomId::parse(&room_id).ok_or_else(|| AppError::bad_request("Empty room id"))?;

    let snapshot = state
        .relay
        .registry()
        .snapshot(&room_id)
        .ok_or_else(|| duet_core::Error::NotFound(format!("Room {room_id}")))?;

    Ok(Json(RoomStatusResponse {
        room_id: snapshot.room_id.0,
        member_count: snapshot.member_names.len(),
        full: snapshot.member_names.len() >= ROOM_CAPACITY,
        members: snapshot.member_names,
    }))
}
