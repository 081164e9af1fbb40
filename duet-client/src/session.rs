//! Call session controller
//!
//! One task owns every resource of a call attempt and applies inputs strictly
//! one at a time. Three sources feed it: commands from [`SessionHandle`]s
//! (user actions and remote signaling events), timer ticks, and transport
//! reports. All teardown paths go through `cancel_all`, which is idempotent,
//! so resources are released exactly once however the call ends.

use std::{future::Future, sync::Arc, time::Duration};

use duet_core::{ClientMessage, Error, Result, RoomId, ServerMessage};
use serde::Serialize;
use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    chat::{ChatLog, ChatMessage},
    config::SessionConfig,
    reconnect::{ReconnectionManager, RetryDecision, RetryPolicy},
    state::CallState,
    transport::{
        CallBackend, IceCandidate, LocalMedia, PeerTransport, SdpType, SessionDescription,
        SignalingSink, TransportEvent, TransportState,
    },
};

/// Why a session reached `Ended`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The local user hung up. The peer is sent `end-call` if the room was joined.
    Manual,
    /// The peer sent `end-call`
    RemoteEnded,
    /// The peer's signaling connection went away
    PeerLeft,
    RetryExhausted,
    TransportFailed,
    RoomFull,
    /// Every handle was dropped
    Abandoned,
}

/// Observable snapshot of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: CallState,
    /// Time spent in `Connected`; frozen while reconnecting, zero once ended
    pub elapsed: Duration,
    pub end_reason: Option<EndReason>,
    pub peer_name: Option<String>,
    pub microphone_on: bool,
    pub camera_on: bool,
}

impl SessionStatus {
    #[must_use]
    pub const fn status_text(&self) -> &'static str {
        self.state.status_text()
    }
}

/// Render a call duration as `MM:SS`
#[must_use]
pub fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

enum Command {
    Remote(ServerMessage),
    End,
    SendChat(String),
    ToggleMicrophone(oneshot::Sender<Option<bool>>),
    ToggleCamera(oneshot::Sender<Option<bool>>),
}

#[derive(Debug, Clone, Copy)]
enum Tick {
    Retry,
    Duration,
}

enum Input {
    Command(Option<Command>),
    Tick(Tick),
    Transport(TransportEvent),
}

/// Handle to a running [`CallSession`]
#[derive(Clone)]
pub struct SessionHandle {
    room_id: RoomId,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
    chat: watch::Receiver<Vec<ChatMessage>>,
}

impl SessionHandle {
    #[must_use]
    pub const fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    #[must_use]
    pub fn state(&self) -> CallState {
        self.status.borrow().state
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    #[must_use]
    pub fn chat_messages(&self) -> Vec<ChatMessage> {
        self.chat.borrow().clone()
    }

    /// Feed an event received from the signaling server
    pub fn deliver(&self, message: ServerMessage) {
        self.command(Command::Remote(message));
    }

    /// Hang up. Only the first call has an effect.
    pub fn end(&self) {
        self.command(Command::End);
    }

    pub fn send_chat(&self, text: impl Into<String>) {
        self.command(Command::SendChat(text.into()));
    }

    /// Flip the microphone. `None` when there is no local media.
    pub async fn toggle_microphone(&self) -> Option<bool> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::ToggleMicrophone(tx));
        rx.await.ok().flatten()
    }

    /// Flip the camera. `None` when there is no local media.
    pub async fn toggle_camera(&self) -> Option<bool> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::ToggleCamera(tx));
        rx.await.ok().flatten()
    }

    /// Wait until the session is in `target`. `None` if it finished elsewhere.
    pub async fn wait_for_state(&self, target: CallState) -> Option<SessionStatus> {
        let mut rx = self.status.clone();
        let status = rx.wait_for(|s| s.state == target).await.ok().map(|s| s.clone());
        status
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!(room_id = %self.room_id, "Session already finished");
        }
    }
}

pub struct CallSession {
    room_id: RoomId,
    name: String,
    config: SessionConfig,
    backend: Arc<dyn CallBackend>,
    signaling: Arc<dyn SignalingSink>,

    state: CallState,
    peer_name: Option<String>,
    end_reason: Option<EndReason>,

    media: Option<Box<dyn LocalMedia>>,
    transport: Option<Box<dyn PeerTransport>>,

    reconnect: ReconnectionManager,
    duration_ticker: Option<JoinHandle<()>>,
    elapsed: Duration,
    chat: ChatLog,

    commands: mpsc::UnboundedReceiver<Command>,
    /// Commands that arrived while local setup was still pending
    deferred: Vec<Command>,
    ticks_tx: mpsc::UnboundedSender<Tick>,
    ticks: mpsc::UnboundedReceiver<Tick>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    status_tx: watch::Sender<SessionStatus>,
    chat_tx: watch::Sender<Vec<ChatMessage>>,
}

impl CallSession {
    /// Build a session. Fails if `config` does not validate.
    pub fn new(
        room_id: RoomId,
        name: impl Into<String>,
        config: SessionConfig,
        backend: Arc<dyn CallBackend>,
        signaling: Arc<dyn SignalingSink>,
    ) -> Result<(Self, SessionHandle)> {
        config
            .validate()
            .map_err(|errors| Error::InvalidInput(errors.join("; ")))?;

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (ticks_tx, ticks) = mpsc::unbounded_channel();
        let (transport_tx, transport_events) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus {
            state: CallState::Initializing,
            elapsed: Duration::ZERO,
            end_reason: None,
            peer_name: None,
            microphone_on: false,
            camera_on: false,
        });
        let (chat_tx, chat_rx) = watch::channel(Vec::new());

        let reconnect = ReconnectionManager::new(RetryPolicy {
            interval: config.retry_interval,
            budget: config.retry_budget,
        });

        let handle = SessionHandle {
            room_id: room_id.clone(),
            commands: commands_tx,
            status: status_rx,
            chat: chat_rx,
        };

        let session = Self {
            room_id,
            name: name.into(),
            config,
            backend,
            signaling,
            state: CallState::Initializing,
            peer_name: None,
            end_reason: None,
            media: None,
            transport: None,
            reconnect,
            duration_ticker: None,
            elapsed: Duration::ZERO,
            chat: ChatLog::new(),
            commands,
            deferred: Vec::new(),
            ticks_tx,
            ticks,
            transport_tx,
            transport_events,
            status_tx,
            chat_tx,
        };

        Ok((session, handle))
    }

    /// Create a session and run it on its own task
    pub fn spawn(
        room_id: RoomId,
        name: impl Into<String>,
        config: SessionConfig,
        backend: Arc<dyn CallBackend>,
        signaling: Arc<dyn SignalingSink>,
    ) -> Result<(SessionHandle, JoinHandle<()>)> {
        let (session, handle) = Self::new(room_id, name, config, backend, signaling)?;
        Ok((handle, tokio::spawn(session.run())))
    }

    /// Drive the session until it reaches a terminal state
    pub async fn run(mut self) {
        self.start().await;

        for command in std::mem::take(&mut self.deferred) {
            if self.state.is_terminal() {
                break;
            }
            self.handle_command(command).await;
        }

        while !self.state.is_terminal() {
            let input = tokio::select! {
                command = self.commands.recv() => Input::Command(command),
                Some(tick) = self.ticks.recv() => Input::Tick(tick),
                Some(event) = self.transport_events.recv() => Input::Transport(event),
            };

            match input {
                Input::Command(Some(command)) => self.handle_command(command).await,
                Input::Command(None) => {
                    debug!(room_id = %self.room_id, "All session handles dropped");
                    self.end_locally(EndReason::Abandoned);
                }
                Input::Tick(Tick::Retry) => self.on_retry_tick().await,
                Input::Tick(Tick::Duration) => self.on_duration_tick(),
                Input::Transport(event) => self.handle_transport_event(event),
            }
        }

        self.cancel_all();
        info!(room_id = %self.room_id, state = %self.state, "Session finished");
    }

    /// Acquire media, open the transport and join the room.
    ///
    /// A hang-up or the loss of every handle while either step is pending ends
    /// the session before anything is sent.
    async fn start(&mut self) {
        info!(room_id = %self.room_id, "Acquiring local media");
        let backend = Arc::clone(&self.backend);
        let Some(acquired) = self.interruptible(backend.acquire_media()).await else {
            return;
        };
        let media = match acquired {
            Ok(media) => media,
            Err(e) => {
                warn!(room_id = %self.room_id, error = %e, "Local media unavailable");
                self.transition(CallState::PermissionDenied);
                return;
            }
        };
        self.media = Some(media);

        let opening =
            backend.open_transport(self.config.ice_servers.clone(), self.transport_tx.clone());
        let Some(transport) = self.interruptible(opening).await else {
            return;
        };
        match transport {
            Ok(transport) => self.transport = Some(transport),
            Err(e) => {
                warn!(room_id = %self.room_id, error = %e, "Failed to open peer transport");
                self.end_locally(EndReason::TransportFailed);
                return;
            }
        }

        if self.transition(CallState::WaitingForPeer) {
            self.send(ClientMessage::JoinRoom {
                room_id: self.room_id.clone(),
                name: self.name.clone(),
            });
        }
    }

    /// Await `pending` while still honouring hang-up. Other commands are kept
    /// for after setup. `None` if the session ended first.
    async fn interruptible<T>(&mut self, pending: impl Future<Output = T>) -> Option<T> {
        tokio::pin!(pending);
        loop {
            tokio::select! {
                output = &mut pending => return Some(output),
                command = self.commands.recv() => match command {
                    Some(Command::End) => {
                        info!(room_id = %self.room_id, "Hung up during setup");
                        self.end_locally(EndReason::Manual);
                        return None;
                    }
                    Some(command) => self.deferred.push(command),
                    None => {
                        debug!(room_id = %self.room_id, "All session handles dropped during setup");
                        self.end_locally(EndReason::Abandoned);
                        return None;
                    }
                },
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Remote(message) => self.handle_remote(message).await,
            Command::End => self.end_manually(),
            Command::SendChat(text) => self.send_chat(text),
            Command::ToggleMicrophone(reply) => {
                let _ = reply.send(self.toggle_microphone());
            }
            Command::ToggleCamera(reply) => {
                let _ = reply.send(self.toggle_camera());
            }
        }
    }

    async fn handle_remote(&mut self, message: ServerMessage) {
        debug!(
            room_id = %self.room_id,
            state = %self.state,
            event_type = message.event_type(),
            "Remote event"
        );

        match message {
            ServerMessage::PeerJoined { name } => {
                if self.state != CallState::WaitingForPeer {
                    debug!(room_id = %self.room_id, "Ignoring peer-joined outside of waiting");
                    return;
                }
                info!(room_id = %self.room_id, peer = %name, "Peer joined");
                self.peer_name = Some(name);
                self.transition(CallState::Negotiating);
                self.send_offer(false).await;
            }
            ServerMessage::Offer { description } => self.on_remote_offer(description).await,
            ServerMessage::Answer { description } => self.on_remote_answer(description).await,
            ServerMessage::IceCandidate { candidate } => self.on_remote_candidate(candidate).await,
            ServerMessage::ReceiveMessage { text, sender_name } => {
                self.chat.push_remote(&sender_name, &text);
                self.publish_chat();
            }
            ServerMessage::RoomFull => {
                if self.state == CallState::WaitingForPeer {
                    let err = Error::CapacityExceeded(self.room_id.to_string());
                    warn!(room_id = %self.room_id, error = %err, "Join rejected");
                    self.end_locally(EndReason::RoomFull);
                }
            }
            ServerMessage::EndCall => self.end_locally(EndReason::RemoteEnded),
            ServerMessage::PeerLeft => self.end_locally(EndReason::PeerLeft),
        }
    }

    async fn on_remote_offer(&mut self, description: Value) {
        // Renegotiation, including the peer's connectivity restarts, is
        // answered in place
        if !matches!(
            self.state,
            CallState::WaitingForPeer
                | CallState::Negotiating
                | CallState::Connected
                | CallState::Reconnecting
        ) {
            debug!(room_id = %self.room_id, state = %self.state, "Ignoring offer");
            return;
        }

        let offer = match decode_description(description, SdpType::Offer) {
            Ok(offer) => offer,
            Err(e) => {
                warn!(room_id = %self.room_id, error = %e, "Bad offer");
                return;
            }
        };

        if self.state == CallState::WaitingForPeer {
            self.transition(CallState::Negotiating);
        }

        let Some(transport) = self.transport.as_mut() else {
            debug!(room_id = %self.room_id, "No transport, offer dropped");
            return;
        };

        let answered = transport.accept_offer(offer).await;
        match answered.and_then(|answer| encode(&answer)) {
            Ok(description) => self.send(ClientMessage::Answer {
                room_id: self.room_id.clone(),
                description,
            }),
            Err(e) => self.on_transport_error("answer offer", &e),
        }
    }

    async fn on_remote_answer(&mut self, description: Value) {
        if !matches!(
            self.state,
            CallState::Negotiating | CallState::Connected | CallState::Reconnecting
        ) {
            debug!(room_id = %self.room_id, state = %self.state, "Ignoring answer");
            return;
        }

        let answer = match decode_description(description, SdpType::Answer) {
            Ok(answer) => answer,
            Err(e) => {
                warn!(room_id = %self.room_id, error = %e, "Bad answer");
                return;
            }
        };

        let Some(transport) = self.transport.as_mut() else {
            debug!(room_id = %self.room_id, "No transport, answer dropped");
            return;
        };

        let applied = transport.accept_answer(answer).await;
        if let Err(e) = applied {
            self.on_transport_error("apply answer", &e);
            return;
        }

        if self.state == CallState::Negotiating {
            self.enter_connected();
        }
    }

    async fn on_remote_candidate(&mut self, candidate: Value) {
        let candidate: IceCandidate = match serde_json::from_value(candidate) {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!(room_id = %self.room_id, error = %e, "Bad ICE candidate");
                return;
            }
        };

        let Some(transport) = self.transport.as_mut() else {
            debug!(room_id = %self.room_id, "No transport, candidate dropped");
            return;
        };

        let added = transport.add_ice_candidate(candidate).await;
        if let Err(e) = added {
            self.on_transport_error("add ICE candidate", &e);
        }
    }

    /// A failed negotiation step is skipped; a transport that is gone ends the call
    fn on_transport_error(&mut self, operation: &'static str, err: &Error) {
        if err.is_terminal() {
            warn!(room_id = %self.room_id, operation, error = %err, "Transport unusable");
            self.end_locally(EndReason::TransportFailed);
        } else {
            warn!(room_id = %self.room_id, operation, error = %err, "Transport operation failed");
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if self.state == CallState::Initializing {
                    return;
                }
                match encode(&candidate) {
                    Ok(candidate) => self.send(ClientMessage::IceCandidate {
                        room_id: self.room_id.clone(),
                        candidate,
                    }),
                    Err(e) => warn!(room_id = %self.room_id, error = %e, "Bad local candidate"),
                }
            }
            TransportEvent::StateChanged(TransportState::Connected) => self.enter_connected(),
            TransportEvent::StateChanged(TransportState::Disconnected) => match self.state {
                CallState::Connected => {
                    warn!(room_id = %self.room_id, error = %Error::TransientDisconnect, "Connection lost");
                    self.transition(CallState::Reconnecting);
                    self.stop_duration_timer();
                    self.reconnect.start(self.ticks_tx.clone(), Tick::Retry);
                }
                CallState::Reconnecting => {
                    self.reconnect.start(self.ticks_tx.clone(), Tick::Retry);
                }
                _ => debug!(room_id = %self.room_id, state = %self.state, "Ignoring disconnect"),
            },
            TransportEvent::StateChanged(state @ (TransportState::Failed | TransportState::Closed)) => {
                let err = Error::HardFailure(format!("transport {state:?}"));
                warn!(room_id = %self.room_id, error = %err, "Transport unusable");
                self.end_locally(EndReason::TransportFailed);
            }
        }
    }

    fn enter_connected(&mut self) {
        if self.transition(CallState::Connected) {
            self.reconnect.cancel();
            self.start_duration_timer();
        }
    }

    async fn on_retry_tick(&mut self) {
        if self.state != CallState::Reconnecting {
            return;
        }

        match self.reconnect.on_tick() {
            RetryDecision::Attempt(attempt) => {
                info!(room_id = %self.room_id, attempt, "Restarting connectivity");
                self.send_offer(true).await;
            }
            RetryDecision::Exhausted => self.end_locally(EndReason::RetryExhausted),
            RetryDecision::Idle => {}
        }
    }

    fn on_duration_tick(&mut self) {
        if self.state == CallState::Connected {
            self.elapsed += self.config.duration_tick;
            self.publish();
        }
    }

    fn start_duration_timer(&mut self) {
        self.stop_duration_timer();

        let tick = self.config.duration_tick;
        let tx = self.ticks_tx.clone();
        self.duration_ticker = Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval_at(Instant::now() + tick, tick);
            loop {
                timer.tick().await;
                if tx.send(Tick::Duration).is_err() {
                    break;
                }
            }
        }));
    }

    fn stop_duration_timer(&mut self) {
        if let Some(ticker) = self.duration_ticker.take() {
            ticker.abort();
        }
    }

    async fn send_offer(&mut self, ice_restart: bool) {
        let Some(transport) = self.transport.as_mut() else {
            debug!(room_id = %self.room_id, "No transport, offer skipped");
            return;
        };

        let created = transport.create_offer(ice_restart).await;
        match created.and_then(|offer| encode(&offer)) {
            Ok(description) => self.send(ClientMessage::Offer {
                room_id: self.room_id.clone(),
                description,
            }),
            Err(e) => self.on_transport_error("create offer", &e),
        }
    }

    fn send_chat(&mut self, text: String) {
        if self.state.is_terminal() {
            return;
        }
        if let Err(e) = self.chat.push_local(&self.name, &text) {
            debug!(room_id = %self.room_id, error = %e, "Chat message not sent");
            return;
        }
        self.send(ClientMessage::SendMessage {
            room_id: self.room_id.clone(),
            text,
            sender_name: self.name.clone(),
        });
        self.publish_chat();
    }

    fn toggle_microphone(&mut self) -> Option<bool> {
        let media = self.media.as_mut()?;
        let enabled = !media.audio_enabled();
        media.set_audio_enabled(enabled);
        self.publish();
        Some(enabled)
    }

    fn toggle_camera(&mut self) -> Option<bool> {
        let media = self.media.as_mut()?;
        let enabled = !media.video_enabled();
        media.set_video_enabled(enabled);
        self.publish();
        Some(enabled)
    }

    /// Hang up: release everything, then tell the peer
    fn end_manually(&mut self) {
        if self.state.is_terminal() {
            debug!(room_id = %self.room_id, "Call already over");
            return;
        }
        self.end_locally(EndReason::Manual);
        self.send(ClientMessage::EndCall {
            room_id: self.room_id.clone(),
        });
    }

    /// End without notifying the peer
    fn end_locally(&mut self, reason: EndReason) {
        if self.state.is_terminal() {
            return;
        }
        self.cancel_all();
        self.elapsed = Duration::ZERO;
        self.chat.clear();
        self.end_reason = Some(reason);
        info!(room_id = %self.room_id, reason = ?reason, "Call ended");
        self.transition(CallState::Ended);
        self.publish_chat();
    }

    /// Stop timers and release media and transport. Idempotent.
    fn cancel_all(&mut self) {
        self.reconnect.cancel();
        self.stop_duration_timer();
        if let Some(mut media) = self.media.take() {
            media.stop();
        }
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
    }

    fn transition(&mut self, next: CallState) -> bool {
        if self.state == next {
            return false;
        }
        if !self.state.can_transition_to(next) {
            let err = Error::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            };
            warn!(room_id = %self.room_id, error = %err, "Rejected state change");
            return false;
        }

        info!(room_id = %self.room_id, from = %self.state, to = %next, "Call state changed");
        self.state = next;
        self.publish();
        true
    }

    fn send(&self, message: ClientMessage) {
        let event_type = message.event_type();
        if let Err(e) = self.signaling.send(message) {
            warn!(room_id = %self.room_id, event_type, error = %e, "Signaling send failed");
        }
    }

    fn publish(&self) {
        let media = self.media.as_deref();
        self.status_tx.send_replace(SessionStatus {
            state: self.state,
            elapsed: self.elapsed,
            end_reason: self.end_reason,
            peer_name: self.peer_name.clone(),
            microphone_on: media.is_some_and(|m| m.audio_enabled()),
            camera_on: media.is_some_and(|m| m.video_enabled()),
        });
    }

    fn publish_chat(&self) {
        self.chat_tx.send_replace(self.chat.messages().to_vec());
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

fn decode_description(value: Value, expected: SdpType) -> Result<SessionDescription> {
    let description: SessionDescription =
        serde_json::from_value(value).map_err(|e| Error::Negotiation(e.to_string()))?;
    if description.kind != expected {
        return Err(Error::Negotiation(format!(
            "expected {expected:?}, got {:?}",
            description.kind
        )));
    }
    Ok(description)
}

fn encode<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockCallBackend;
    use serde_json::json;
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    };
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Recorder {
        media_stopped: AtomicUsize,
        transport_closed: AtomicUsize,
        offers: Mutex<Vec<bool>>,
        candidates: Mutex<Vec<IceCandidate>>,
        fail_candidates: AtomicBool,
        transport_gone: AtomicBool,
        events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    }

    impl Recorder {
        fn restart_offers(&self) -> usize {
            self.offers.lock().unwrap().iter().filter(|r| **r).count()
        }
    }

    struct FakeMedia {
        recorder: Arc<Recorder>,
        audio: bool,
        video: bool,
    }

    impl FakeMedia {
        fn boxed(recorder: Arc<Recorder>) -> Box<dyn LocalMedia> {
            Box::new(Self {
                recorder,
                audio: true,
                video: true,
            })
        }
    }

    impl LocalMedia for FakeMedia {
        fn stop(&mut self) {
            self.recorder.media_stopped.fetch_add(1, Ordering::SeqCst);
        }
        fn audio_enabled(&self) -> bool {
            self.audio
        }
        fn set_audio_enabled(&mut self, enabled: bool) {
            self.audio = enabled;
        }
        fn video_enabled(&self) -> bool {
            self.video
        }
        fn set_video_enabled(&mut self, enabled: bool) {
            self.video = enabled;
        }
    }

    struct FakeTransport {
        recorder: Arc<Recorder>,
    }

    #[async_trait::async_trait]
    impl PeerTransport for FakeTransport {
        async fn create_offer(&mut self, ice_restart: bool) -> Result<SessionDescription> {
            self.recorder.offers.lock().unwrap().push(ice_restart);
            Ok(SessionDescription {
                kind: SdpType::Offer,
                sdp: "fake-offer".to_string(),
            })
        }

        async fn accept_offer(&mut self, _offer: SessionDescription) -> Result<SessionDescription> {
            Ok(SessionDescription {
                kind: SdpType::Answer,
                sdp: "fake-answer".to_string(),
            })
        }

        async fn accept_answer(&mut self, _answer: SessionDescription) -> Result<()> {
            Ok(())
        }

        async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
            if self.recorder.transport_gone.load(Ordering::SeqCst) {
                return Err(Error::HardFailure("peer connection closed".to_string()));
            }
            if self.recorder.fail_candidates.load(Ordering::SeqCst) {
                return Err(Error::Negotiation("candidate rejected".to_string()));
            }
            self.recorder.candidates.lock().unwrap().push(candidate);
            Ok(())
        }

        fn close(&mut self) {
            self.recorder.transport_closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeBackend {
        recorder: Arc<Recorder>,
    }

    #[async_trait::async_trait]
    impl CallBackend for FakeBackend {
        async fn acquire_media(&self) -> Result<Box<dyn LocalMedia>> {
            Ok(FakeMedia::boxed(self.recorder.clone()))
        }

        async fn open_transport(
            &self,
            _ice_servers: Vec<String>,
            events: mpsc::UnboundedSender<TransportEvent>,
        ) -> Result<Box<dyn PeerTransport>> {
            *self.recorder.events.lock().unwrap() = Some(events);
            Ok(Box::new(FakeTransport {
                recorder: self.recorder.clone(),
            }))
        }
    }

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Stage {
        Media,
        Transport,
    }

    /// Holds one setup step until `gate` is notified
    struct GatedBackend {
        inner: FakeBackend,
        stage: Stage,
        gate: Arc<Notify>,
    }

    #[async_trait::async_trait]
    impl CallBackend for GatedBackend {
        async fn acquire_media(&self) -> Result<Box<dyn LocalMedia>> {
            if self.stage == Stage::Media {
                self.gate.notified().await;
            }
            self.inner.acquire_media().await
        }

        async fn open_transport(
            &self,
            ice_servers: Vec<String>,
            events: mpsc::UnboundedSender<TransportEvent>,
        ) -> Result<Box<dyn PeerTransport>> {
            if self.stage == Stage::Transport {
                self.gate.notified().await;
            }
            self.inner.open_transport(ice_servers, events).await
        }
    }

    struct Harness {
        handle: SessionHandle,
        outbound: mpsc::UnboundedReceiver<ClientMessage>,
        recorder: Arc<Recorder>,
        task: JoinHandle<()>,
    }

    impl Harness {
        fn spawn(backend: Arc<dyn CallBackend>, recorder: Arc<Recorder>) -> Self {
            let (tx, outbound) = mpsc::unbounded_channel();
            let (handle, task) = CallSession::spawn(
                RoomId::from("ROOM1"),
                "Alice",
                SessionConfig::default(),
                backend,
                Arc::new(tx),
            )
            .unwrap();
            Self {
                handle,
                outbound,
                recorder,
                task,
            }
        }

        fn new() -> Self {
            let recorder = Arc::new(Recorder::default());
            let backend = Arc::new(FakeBackend {
                recorder: recorder.clone(),
            });
            Self::spawn(backend, recorder)
        }

        fn gated(stage: Stage) -> (Self, Arc<Notify>) {
            let recorder = Arc::new(Recorder::default());
            let gate = Arc::new(Notify::new());
            let backend = Arc::new(GatedBackend {
                inner: FakeBackend {
                    recorder: recorder.clone(),
                },
                stage,
                gate: gate.clone(),
            });
            (Self::spawn(backend, recorder), gate)
        }

        async fn next_out(&mut self) -> ClientMessage {
            self.outbound.recv().await.unwrap()
        }

        fn transport(&self, state: TransportState) {
            self.transport_event(TransportEvent::StateChanged(state));
        }

        fn transport_event(&self, event: TransportEvent) {
            self.recorder
                .events
                .lock()
                .unwrap()
                .as_ref()
                .unwrap()
                .send(event)
                .unwrap();
        }

        async fn wait(&self, state: CallState) -> SessionStatus {
            self.handle.wait_for_state(state).await.unwrap()
        }

        /// Caller side up to `Connected`, with the join and offer consumed
        async fn connected() -> Self {
            let mut h = Self::new();
            assert!(matches!(h.next_out().await, ClientMessage::JoinRoom { .. }));
            h.handle.deliver(ServerMessage::PeerJoined {
                name: "Bob".to_string(),
            });
            assert!(matches!(h.next_out().await, ClientMessage::Offer { .. }));
            h.handle.deliver(ServerMessage::Answer {
                description: json!({"type": "answer", "sdp": "remote"}),
            });
            h.wait(CallState::Connected).await;
            h
        }

        /// Wait for the session task and return everything it sent afterwards
        async fn finish(mut self) -> (Vec<ClientMessage>, Arc<Recorder>) {
            self.task.await.unwrap();
            drop(self.handle);
            let mut rest = Vec::new();
            while let Some(message) = self.outbound.recv().await {
                rest.push(message);
            }
            (rest, self.recorder)
        }
    }

    fn count_end_calls(messages: &[ClientMessage]) -> usize {
        messages
            .iter()
            .filter(|m| matches!(m, ClientMessage::EndCall { .. }))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_reaches_connected() {
        let mut h = Harness::new();

        assert_eq!(
            h.next_out().await,
            ClientMessage::JoinRoom {
                room_id: RoomId::from("ROOM1"),
                name: "Alice".to_string(),
            }
        );
        let status = h.wait(CallState::WaitingForPeer).await;
        assert!(status.microphone_on && status.camera_on);

        h.handle.deliver(ServerMessage::PeerJoined {
            name: "Bob".to_string(),
        });
        assert_eq!(
            h.next_out().await,
            ClientMessage::Offer {
                room_id: RoomId::from("ROOM1"),
                description: json!({"type": "offer", "sdp": "fake-offer"}),
            }
        );
        let status = h.wait(CallState::Negotiating).await;
        assert_eq!(status.peer_name.as_deref(), Some("Bob"));

        h.handle.deliver(ServerMessage::Answer {
            description: json!({"type": "answer", "sdp": "remote"}),
        });
        let status = h.wait(CallState::Connected).await;
        assert_eq!(status.status_text(), "Connected");
        assert_eq!(*h.recorder.offers.lock().unwrap(), vec![false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callee_answers_offer() {
        let mut h = Harness::new();
        let _ = h.next_out().await;

        h.handle.deliver(ServerMessage::Offer {
            description: json!({"type": "offer", "sdp": "remote"}),
        });
        assert_eq!(
            h.next_out().await,
            ClientMessage::Answer {
                room_id: RoomId::from("ROOM1"),
                description: json!({"type": "answer", "sdp": "fake-answer"}),
            }
        );
        h.wait(CallState::Negotiating).await;

        h.transport(TransportState::Connected);
        h.wait(CallState::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_is_terminal() {
        let mut backend = MockCallBackend::new();
        backend
            .expect_acquire_media()
            .times(1)
            .returning(|| Err(Error::PermissionDenied("camera".to_string())));
        backend.expect_open_transport().never();

        let h = Harness::spawn(Arc::new(backend), Arc::new(Recorder::default()));
        let status = h.wait(CallState::PermissionDenied).await;
        assert_eq!(status.status_text(), "Camera/Microphone permission denied");

        h.handle.end();
        let (sent, _) = h.finish().await;
        assert!(sent.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_open_failure_releases_media() {
        let recorder = Arc::new(Recorder::default());
        let media_recorder = recorder.clone();
        let mut backend = MockCallBackend::new();
        backend
            .expect_acquire_media()
            .returning(move || Ok(FakeMedia::boxed(media_recorder.clone())));
        backend
            .expect_open_transport()
            .times(1)
            .returning(|_, _| Err(Error::HardFailure("no network".to_string())));

        let h = Harness::spawn(Arc::new(backend), recorder);
        let status = h.wait(CallState::Ended).await;
        assert_eq!(status.end_reason, Some(EndReason::TransportFailed));

        let (sent, recorder) = h.finish().await;
        assert!(sent.is_empty());
        assert_eq!(recorder.media_stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_up_while_acquiring_media_never_joins() {
        let (h, _gate) = Harness::gated(Stage::Media);

        h.handle.end();
        let status = h.wait(CallState::Ended).await;
        assert_eq!(status.end_reason, Some(EndReason::Manual));

        let (sent, recorder) = h.finish().await;
        assert!(sent.is_empty());
        assert_eq!(recorder.media_stopped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_up_while_opening_transport_releases_media() {
        let (h, _gate) = Harness::gated(Stage::Transport);

        // Let the session park on the transport gate with media in hand
        tokio::time::sleep(Duration::from_millis(1)).await;
        h.handle.end();
        let status = h.wait(CallState::Ended).await;
        assert_eq!(status.end_reason, Some(EndReason::Manual));

        let (sent, recorder) = h.finish().await;
        assert!(sent.is_empty());
        assert_eq!(recorder.media_stopped.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.transport_closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handles_during_setup_abandons() {
        let (h, _gate) = Harness::gated(Stage::Media);
        let Harness {
            handle,
            mut outbound,
            task,
            ..
        } = h;
        let status = handle.subscribe();

        drop(handle);
        task.await.unwrap();

        assert_eq!(status.borrow().state, CallState::Ended);
        assert_eq!(status.borrow().end_reason, Some(EndReason::Abandoned));
        assert!(outbound.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_during_setup_apply_afterwards() {
        let (mut h, gate) = Harness::gated(Stage::Media);

        let handle = h.handle.clone();
        let toggle = tokio::spawn(async move { handle.toggle_microphone().await });
        tokio::task::yield_now().await;
        gate.notify_one();

        assert!(matches!(h.next_out().await, ClientMessage::JoinRoom { .. }));
        assert_eq!(toggle.await.unwrap(), Some(false));
        assert!(!h.handle.status().microphone_on);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel::<ClientMessage>();
        let config = SessionConfig {
            retry_interval: Duration::ZERO,
            ..SessionConfig::default()
        };

        let result = CallSession::new(
            RoomId::from("ROOM1"),
            "Alice",
            config,
            Arc::new(MockCallBackend::new()),
            Arc::new(tx),
        );
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_offer_keeps_waiting() {
        let mut h = Harness::new();
        let _ = h.next_out().await;
        h.wait(CallState::WaitingForPeer).await;

        h.handle.deliver(ServerMessage::Offer {
            description: json!({"type": "answer", "sdp": "wrong kind"}),
        });
        h.handle.deliver(ServerMessage::Offer {
            description: json!("not a description"),
        });
        h.handle.toggle_camera().await;
        assert_eq!(h.handle.state(), CallState::WaitingForPeer);

        h.handle.deliver(ServerMessage::Offer {
            description: json!({"type": "offer", "sdp": "remote"}),
        });
        assert!(matches!(h.next_out().await, ClientMessage::Answer { .. }));
        h.wait(CallState::Negotiating).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_gone_during_negotiation_step_ends_call() {
        let h = Harness::connected().await;

        h.recorder.transport_gone.store(true, Ordering::SeqCst);
        h.handle.deliver(ServerMessage::IceCandidate {
            candidate: json!({"candidate": "candidate:9"}),
        });
        let status = h.wait(CallState::Ended).await;
        assert_eq!(status.end_reason, Some(EndReason::TransportFailed));

        let (sent, recorder) = h.finish().await;
        assert_eq!(count_end_calls(&sent), 0);
        assert_eq!(recorder.transport_closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_end_is_idempotent() {
        let h = Harness::connected().await;

        h.handle.end();
        h.handle.end();
        let status = h.wait(CallState::Ended).await;
        assert_eq!(status.end_reason, Some(EndReason::Manual));
        assert_eq!(status.elapsed, Duration::ZERO);

        let (sent, recorder) = h.finish().await;
        assert_eq!(count_end_calls(&sent), 1);
        assert_eq!(recorder.media_stopped.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.transport_closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_end_does_not_echo() {
        for (event, reason) in [
            (ServerMessage::EndCall, EndReason::RemoteEnded),
            (ServerMessage::PeerLeft, EndReason::PeerLeft),
        ] {
            let h = Harness::connected().await;
            h.handle.deliver(event);
            let status = h.wait(CallState::Ended).await;
            assert_eq!(status.end_reason, Some(reason));

            let (sent, recorder) = h.finish().await;
            assert_eq!(count_end_calls(&sent), 0);
            assert_eq!(recorder.media_stopped.load(Ordering::SeqCst), 1);
            assert_eq!(recorder.transport_closed.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_recovers() {
        let mut h = Harness::connected().await;

        h.transport(TransportState::Disconnected);
        h.wait(CallState::Reconnecting).await;

        let restart = h.next_out().await;
        assert!(matches!(restart, ClientMessage::Offer { .. }));
        assert_eq!(h.recorder.restart_offers(), 1);

        h.transport(TransportState::Connected);
        h.wait(CallState::Connected).await;

        // The retry loop is gone
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.recorder.restart_offers(), 1);
        assert_eq!(h.handle.state(), CallState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_budget_ends_without_notification() {
        let h = Harness::connected().await;

        let lost_at = Instant::now();
        h.transport(TransportState::Disconnected);
        h.wait(CallState::Reconnecting).await;
        // A second disconnect report must not start a second loop
        h.transport(TransportState::Disconnected);

        let status = h.wait(CallState::Ended).await;
        assert_eq!(status.end_reason, Some(EndReason::RetryExhausted));
        assert!(lost_at.elapsed() >= Duration::from_secs(30));

        let (sent, recorder) = h.finish().await;
        assert_eq!(count_end_calls(&sent), 0);
        assert_eq!(recorder.restart_offers(), 5);
        assert_eq!(recorder.transport_closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_failure_ends_without_notification() {
        let h = Harness::connected().await;

        h.transport(TransportState::Failed);
        let status = h.wait(CallState::Ended).await;
        assert_eq!(status.end_reason, Some(EndReason::TransportFailed));

        let (sent, recorder) = h.finish().await;
        assert_eq!(count_end_calls(&sent), 0);
        assert_eq!(recorder.media_stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timer_pauses_while_reconnecting() {
        let h = Harness::connected().await;

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(h.handle.status().elapsed, Duration::from_secs(3));

        h.transport(TransportState::Disconnected);
        h.wait(CallState::Reconnecting).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.handle.status().elapsed, Duration::from_secs(3));

        h.transport(TransportState::Connected);
        h.wait(CallState::Connected).await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let status = h.handle.status();
        assert_eq!(status.elapsed, Duration::from_secs(4));
        assert_eq!(format_duration(status.elapsed), "00:04");
    }

    #[tokio::test(start_paused = true)]
    async fn test_chat_echo_and_receive() {
        let mut h = Harness::connected().await;

        h.handle.send_chat("   ");
        h.handle.send_chat("hi");
        assert_eq!(
            h.next_out().await,
            ClientMessage::SendMessage {
                room_id: RoomId::from("ROOM1"),
                text: "hi".to_string(),
                sender_name: "Alice".to_string(),
            }
        );

        h.handle.deliver(ServerMessage::ReceiveMessage {
            text: "hello".to_string(),
            sender_name: "Bob".to_string(),
        });
        // Round-trip through the session so both commands are applied
        h.handle.toggle_camera().await;

        let lines: Vec<_> = h
            .handle
            .chat_messages()
            .into_iter()
            .map(|m| (m.sender_name, m.text, m.is_local))
            .collect();
        assert_eq!(
            lines,
            vec![
                ("Alice".to_string(), "hi".to_string(), true),
                ("Bob".to_string(), "hello".to_string(), false),
            ]
        );

        h.handle.end();
        h.wait(CallState::Ended).await;
        assert!(h.handle.chat_messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_toggles() {
        let h = Harness::connected().await;

        assert_eq!(h.handle.toggle_microphone().await, Some(false));
        assert_eq!(h.handle.toggle_microphone().await, Some(true));
        assert_eq!(h.handle.toggle_camera().await, Some(false));

        let status = h.handle.status();
        assert!(status.microphone_on);
        assert!(!status.camera_on);

        h.handle.end();
        h.wait(CallState::Ended).await;
        assert_eq!(h.handle.toggle_microphone().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_candidates_flow_both_ways() {
        let mut h = Harness::connected().await;

        let local = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        };
        h.transport_event(TransportEvent::LocalCandidate(local));
        assert_eq!(
            h.next_out().await,
            ClientMessage::IceCandidate {
                room_id: RoomId::from("ROOM1"),
                candidate: json!({
                    "candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host",
                    "sdpMid": "0",
                    "sdpMLineIndex": 0
                }),
            }
        );

        h.handle.deliver(ServerMessage::IceCandidate {
            candidate: json!({"candidate": "candidate:2"}),
        });
        h.recorder.fail_candidates.store(true, Ordering::SeqCst);
        h.handle.deliver(ServerMessage::IceCandidate {
            candidate: json!({"candidate": "candidate:3"}),
        });
        h.handle.toggle_camera().await;

        assert_eq!(h.recorder.candidates.lock().unwrap().len(), 1);
        assert_eq!(h.handle.state(), CallState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renegotiation_while_connected_keeps_state() {
        let mut h = Harness::connected().await;

        h.handle.deliver(ServerMessage::Offer {
            description: json!({"type": "offer", "sdp": "restart"}),
        });
        assert!(matches!(h.next_out().await, ClientMessage::Answer { .. }));
        assert_eq!(h.handle.state(), CallState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_room_full_ends_session() {
        let mut h = Harness::new();
        let _ = h.next_out().await;

        h.handle.deliver(ServerMessage::RoomFull);
        let status = h.wait(CallState::Ended).await;
        assert_eq!(status.end_reason, Some(EndReason::RoomFull));

        let (sent, _) = h.finish().await;
        assert_eq!(count_end_calls(&sent), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_every_handle_releases_resources() {
        let h = Harness::connected().await;
        let Harness {
            handle,
            mut outbound,
            recorder,
            task,
        } = h;

        drop(handle);
        task.await.unwrap();

        let mut sent = Vec::new();
        while let Some(message) = outbound.recv().await {
            sent.push(message);
        }
        assert_eq!(count_end_calls(&sent), 0);
        assert_eq!(recorder.media_stopped.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.transport_closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::ZERO), "00:00");
        assert_eq!(format_duration(Duration::from_secs(75)), "01:15");
        assert_eq!(format_duration(Duration::from_secs(3600)), "60:00");
    }
}
