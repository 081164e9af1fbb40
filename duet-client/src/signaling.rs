//! WebSocket connection to the signaling server

use duet_core::{ClientMessage, Error, Result, ServerMessage};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::session::SessionHandle;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open a signaling connection.
///
/// Returns a sender for outbound events (usable as a
/// [`SignalingSink`](crate::SignalingSink)) and a receiver of decoded server
/// events. The receiver closes when the socket does.
pub async fn connect(
    url: &str,
) -> Result<(
    mpsc::UnboundedSender<ClientMessage>,
    mpsc::UnboundedReceiver<ServerMessage>,
)> {
    info!(url, "Connecting to signaling server");

    let (ws, _) = connect_async(url)
        .await
        .map_err(|e| Error::Signaling(format!("Failed to connect to {url}: {e}")))?;

    let (write, read) = ws.split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    tokio::spawn(sender_task(write, outbound_rx));
    tokio::spawn(receiver_task(read, inbound_tx));

    Ok((outbound_tx, inbound_rx))
}

/// Feed every server event into `session` until the connection closes
pub fn forward_to(
    mut inbound: mpsc::UnboundedReceiver<ServerMessage>,
    session: SessionHandle,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = inbound.recv().await {
            session.deliver(message);
        }
        debug!(room_id = %session.room_id(), "Signaling stream ended");
    })
}

async fn sender_task(
    mut write: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<ClientMessage>,
) {
    while let Some(message) = rx.recv().await {
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "Failed to encode signaling event");
                continue;
            }
        };
        if let Err(e) = write.send(Message::text(text)).await {
            error!(error = %e, "Failed to send signaling event");
            break;
        }
    }

    let _ = write.close().await;
    debug!("Signaling sender finished");
}

async fn receiver_task(
    mut read: SplitStream<WsStream>,
    tx: mpsc::UnboundedSender<ServerMessage>,
) {
    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(text.as_str()) {
                Ok(message) => {
                    if tx.send(message).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Ignoring malformed signaling frame"),
            },
            Ok(Message::Close(_)) => {
                info!("Signaling connection closed by server");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "Signaling connection error");
                break;
            }
        }
    }

    debug!("Signaling receiver finished");
}
