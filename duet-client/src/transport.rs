//! Seams to the platform: media devices, the peer transport and the
//! signaling channel
//!
//! The session never negotiates media itself. It asks the transport for
//! descriptions, hands it what the peer sent and reacts to the connectivity
//! reports the transport pushes back through [`TransportEvent`].

use async_trait::async_trait;
use duet_core::{ClientMessage, Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[cfg(test)]
use mockall::automock;

/// Kind of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// An offer or answer as exchanged through signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

/// A connectivity candidate gathered by one side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

/// Connectivity as reported by the peer transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connected,
    /// Path lost, may recover on its own or after a connectivity restart
    Disconnected,
    /// Unrecoverable
    Failed,
    Closed,
}

/// Reports pushed by a transport to its owning session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    StateChanged(TransportState),
    LocalCandidate(IceCandidate),
}

/// Captured camera and microphone
pub trait LocalMedia: Send {
    /// Release the devices. Calling it again is harmless.
    fn stop(&mut self);

    fn audio_enabled(&self) -> bool;

    fn set_audio_enabled(&mut self, enabled: bool);

    fn video_enabled(&self) -> bool;

    fn set_video_enabled(&mut self, enabled: bool);
}

/// The peer-to-peer media channel
#[async_trait]
pub trait PeerTransport: Send {
    /// Create an offer and apply it locally. `ice_restart` forces fresh
    /// connectivity checks on an existing connection.
    async fn create_offer(&mut self, ice_restart: bool) -> Result<SessionDescription>;

    /// Apply a remote offer and return the local answer
    async fn accept_offer(&mut self, offer: SessionDescription) -> Result<SessionDescription>;

    async fn accept_answer(&mut self, answer: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<()>;

    /// Tear the connection down. Calling it again is harmless.
    fn close(&mut self);
}

/// Factory for the platform resources a session owns
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CallBackend: Send + Sync {
    /// Ask for camera and microphone. A refusal is `Error::PermissionDenied`.
    async fn acquire_media(&self) -> Result<Box<dyn LocalMedia>>;

    /// Create a transport carrying `media`'s tracks. Connectivity changes and
    /// local candidates are reported on `events`.
    async fn open_transport(
        &self,
        ice_servers: Vec<String>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn PeerTransport>>;
}

/// Outbound half of the signaling channel
pub trait SignalingSink: Send + Sync {
    fn send(&self, message: ClientMessage) -> Result<()>;
}

impl SignalingSink for mpsc::UnboundedSender<ClientMessage> {
    fn send(&self, message: ClientMessage) -> Result<()> {
        Self::send(self, message).map_err(|e| Error::Signaling(format!("channel closed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_description_wire_shape() {
        let desc = SessionDescription {
            kind: SdpType::Offer,
            sdp: "v=0".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&desc).unwrap(),
            json!({"type": "offer", "sdp": "v=0"})
        );
    }

    #[test]
    fn test_candidate_wire_shape() {
        let raw = json!({"candidate": "candidate:1 1 udp", "sdpMid": "0", "sdpMLineIndex": 0});
        let candidate: IceCandidate = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_m_line_index, Some(0));
        assert_eq!(serde_json::to_value(&candidate).unwrap(), raw);
    }

    #[test]
    fn test_channel_sink_reports_closed() {
        let (tx, rx) = mpsc::unbounded_channel::<ClientMessage>();
        drop(rx);
        let result = SignalingSink::send(
            &tx,
            ClientMessage::EndCall {
                room_id: "ROOM1".into(),
            },
        );
        assert!(matches!(result, Err(Error::Signaling(_))));
    }
}
