//! Signaling WebSocket handler
//!
//! Each connection gets a bounded outbound queue drained by a writer task.
//! Inbound frames are decoded and handed to the relay one at a time, in
//! arrival order. When the socket closes, for any reason, the connection is
//! removed from its room so the remaining member learns of it.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::http::AppState;
use duet_core::{ClientMessage, ServerMessage};
use duet_hub::ConnectionHandle;

/// Upgrade `GET /ws` to a signaling socket
pub async fn websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(state.config.signaling.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(state.config.signaling.outbound_buffer);
    let conn = ConnectionHandle::new(tx);
    let connection_id = conn.id.clone();

    info!(connection_id = %connection_id, "WebSocket connection established");

    let (mut ws_sink, mut ws_stream) = socket.split();

    // Server events -> WebSocket
    let writer_id = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    error!(connection_id = %writer_id, error = %e, "Failed to encode event");
                    continue;
                }
            };
            if let Err(e) = ws_sink.send(Message::Text(text.into())).await {
                debug!(connection_id = %writer_id, error = %e, "WebSocket send failed");
                break;
            }
        }
    });

    // WebSocket -> relay
    while let Some(frame) = ws_stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(message) => {
                    debug!(
                        connection_id = %connection_id,
                        event_type = message.event_type(),
                        room_id = %message.room_id(),
                        "Received signaling event"
                    );
                    state.relay.dispatch(&conn, message);
                }
                Err(e) => {
                    warn!(connection_id = %connection_id, error = %e, "Ignoring malformed frame");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {
                // Binary, ping and pong frames carry no signaling
            }
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    state.relay.disconnect(&connection_id);
    drop(conn);
    writer.abort();

    info!(connection_id = %connection_id, "WebSocket connection closed");
}
