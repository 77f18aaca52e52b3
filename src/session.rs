//! Session controller: the two-party connection state machine
//!
//! A [`SessionActor`] owns all session state and processes a serialized
//! input stream (handle commands, signaling envelopes, transport events,
//! timer firings) through one event loop, so state transitions never race.
//! Applications hold a cheap-clone [`PeerSession`] handle.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::channel::{ChannelMessage, MessageChannel, MessageKind, SendOutcome};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::quality::{
    self, AdaptationEngine, MonitorHandle, OptimizationSettings, QualityPreset, QualitySample,
    RelayPreference,
};
use crate::relay::{RelayNegotiator, RelayPath};
use crate::signaling::SignalingMessage;
use crate::transport::{PeerTransport, TransportEvent, TransportKind};

/// Session connection states
///
/// ```text
/// [*] --> Idle
/// Idle --> AwaitingRemote: join()
/// AwaitingRemote --> Negotiating: remote discovered / offer received
/// Negotiating --> Connected: transport connected
/// Negotiating --> Failed: unrecoverable negotiation error
/// Connected --> Reconnecting: transport error, retries remain
/// Reconnecting --> Negotiating: backoff elapsed, fresh attempt
/// Reconnecting --> Failed: retry budget exhausted
/// any --> Closed: leave()
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    AwaitingRemote,
    Negotiating,
    Connected,
    Reconnecting,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Terminal states cannot be left except through `leave()`
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

/// Notifications surfaced to the embedding application
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    RemoteJoined {
        user_id: Uuid,
        nickname: String,
    },
    RemoteLeft {
        user_id: Uuid,
    },
    /// The data channel is live; buffered messages have been flushed
    TransportReady,
    Error {
        message: String,
    },
}

/// The opaque `sdp` payload this implementation generates: the sender's
/// participant id, its address candidates, and the relay path when the
/// sender negotiated one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    pub participant_id: Uuid,
    pub candidates: Vec<String>,
    #[serde(default)]
    pub relay: Option<RelayPath>,
}

impl SessionDescription {
    pub fn encode(&self) -> String {
        // serialization of a plain value struct cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn parse(sdp: &str) -> Result<Self, SessionError> {
        serde_json::from_str(sdp)
            .map_err(|e| SessionError::Negotiation(format!("malformed description: {e}")))
    }
}

enum SessionCommand {
    Join {
        room_id: String,
        ack: oneshot::Sender<Result<(), SessionError>>,
    },
    Leave {
        ack: oneshot::Sender<()>,
    },
    Send {
        kind: MessageKind,
        content: String,
        ack: oneshot::Sender<Result<SendOutcome, SessionError>>,
    },
    RegisterRelayCandidate {
        peer_id: Uuid,
        addr: SocketAddr,
    },
}

#[derive(Debug, Clone, Copy)]
enum TimerEvent {
    /// Backoff elapsed; start a fresh negotiation attempt
    RetryDue,
    /// Negotiation made no progress within the connection timeout
    NegotiationTimeout,
}

enum Input {
    Command(Option<SessionCommand>),
    Signal(Option<SignalingMessage>),
    Transport(Option<TransportEvent>),
    Timer(Option<TimerEvent>),
}

/// Handle to a running peer session
///
/// Cloneable; all clones address the same session actor.
#[derive(Clone)]
pub struct PeerSession {
    local_id: Uuid,
    cmd_tx: mpsc::Sender<SessionCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    events_tx: broadcast::Sender<SessionEvent>,
    messages_tx: broadcast::Sender<ChannelMessage>,
    settings_rx: watch::Receiver<OptimizationSettings>,
    sample_rx: watch::Receiver<Option<QualitySample>>,
    engine: Arc<Mutex<AdaptationEngine>>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl PeerSession {
    /// Spawn a session actor wired to an injected signaling transport
    ///
    /// `signaling_out` carries envelopes toward the signaling server;
    /// `signaling_in` delivers envelopes addressed to this participant.
    /// Multiple sessions with independent signaling pairs can coexist,
    /// which is how the integration tests run two participants in one
    /// process.
    pub fn spawn(
        config: SessionConfig,
        local_id: Uuid,
        nickname: impl Into<String>,
        signaling_out: mpsc::Sender<SignalingMessage>,
        signaling_in: mpsc::Receiver<SignalingMessage>,
    ) -> Self {
        let config = config.validated();
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (events_tx, _) = broadcast::channel(64);
        let (timer_tx, timer_rx) = mpsc::channel(8);
        let (sample_tx, sample_rx) = watch::channel(None);

        let initial_settings = OptimizationSettings {
            connection_timeout_ms: config.connection_timeout_ms,
            max_retries: config.max_retries,
            ..OptimizationSettings::default()
        };
        let (engine, settings_rx) = AdaptationEngine::new(initial_settings);
        let engine = Arc::new(Mutex::new(engine));

        let channel = MessageChannel::new();
        let messages_tx = channel.incoming_sender();
        let last_error = Arc::new(Mutex::new(None));

        let actor = SessionActor {
            config,
            local_id,
            nickname: nickname.into(),
            state: ConnectionState::Idle,
            state_tx,
            events: events_tx.clone(),
            signaling_out,
            room_id: None,
            remote_id: None,
            transport: None,
            transport_events: None,
            pending_data_rx: None,
            remote_description_applied: false,
            pending_candidates: VecDeque::new(),
            attempt: 0,
            timer: None,
            monitor: None,
            channel,
            negotiator: Arc::new(RelayNegotiator::new(local_id)),
            engine: engine.clone(),
            settings_rx: settings_rx.clone(),
            sample_tx,
            last_error: last_error.clone(),
            timer_tx,
        };

        tokio::spawn(actor.run(cmd_rx, signaling_in, timer_rx));

        Self {
            local_id,
            cmd_tx,
            state_rx,
            events_tx,
            messages_tx,
            settings_rx,
            sample_rx,
            engine,
            last_error,
        }
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    /// Join a room; idempotent when already joined to the same room
    pub async fn join(&self, room_id: &str) -> Result<(), SessionError> {
        let (ack, done) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::Join {
                room_id: room_id.to_string(),
                ack,
            })
            .await
            .map_err(|_| SessionError::Closed)?;
        done.await.map_err(|_| SessionError::Closed)?
    }

    /// Leave the session: closes the transport, cancels timers and the
    /// quality monitor, and moves to the terminal `Closed` state.
    /// Resources are released by the time this returns.
    pub async fn leave(&self) -> Result<(), SessionError> {
        let (ack, done) = oneshot::channel();
        if self
            .cmd_tx
            .send(SessionCommand::Leave { ack })
            .await
            .is_err()
        {
            // actor already gone: nothing left to release
            return Ok(());
        }
        let _ = done.await;
        Ok(())
    }

    /// Send an application message over the reliable channel
    pub async fn send_message(
        &self,
        kind: MessageKind,
        content: &str,
    ) -> Result<SendOutcome, SessionError> {
        let (ack, done) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::Send {
                kind,
                content: content.to_string(),
                ack,
            })
            .await
            .map_err(|_| SessionError::Closed)?;
        done.await.map_err(|_| SessionError::Closed)?
    }

    /// Make a relay-capable peer available to the negotiator
    pub async fn register_relay_candidate(
        &self,
        peer_id: Uuid,
        addr: SocketAddr,
    ) -> Result<(), SessionError> {
        self.cmd_tx
            .send(SessionCommand::RegisterRelayCandidate { peer_id, addr })
            .await
            .map_err(|_| SessionError::Closed)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Incoming reliable-channel messages
    pub fn subscribe_messages(&self) -> broadcast::Receiver<ChannelMessage> {
        self.messages_tx.subscribe()
    }

    pub fn settings(&self) -> OptimizationSettings {
        self.settings_rx.borrow().clone()
    }

    pub fn subscribe_settings(&self) -> watch::Receiver<OptimizationSettings> {
        self.settings_rx.clone()
    }

    /// The most recent quality sample, if the monitor has run
    pub fn latest_sample(&self) -> Option<QualitySample> {
        self.sample_rx.borrow().clone()
    }

    /// Pin the video quality, or `None` to restore automatic adaptation
    pub fn override_video_quality(&self, preset: Option<QualityPreset>) {
        self.engine.lock().override_video_quality(preset);
    }

    /// Pin the relay preference, or `None` to restore automatic adaptation
    pub fn override_relay_preference(&self, preference: Option<RelayPreference>) {
        self.engine.lock().override_relay_preference(preference);
    }

    /// The message of the most recent failure, for the UI layer
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}

struct SessionActor {
    config: SessionConfig,
    local_id: Uuid,
    nickname: String,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
    signaling_out: mpsc::Sender<SignalingMessage>,
    room_id: Option<String>,
    remote_id: Option<Uuid>,
    transport: Option<Arc<PeerTransport>>,
    transport_events: Option<mpsc::Receiver<TransportEvent>>,
    pending_data_rx: Option<mpsc::Receiver<Vec<u8>>>,
    remote_description_applied: bool,
    pending_candidates: VecDeque<String>,
    attempt: u32,
    timer: Option<tokio::task::JoinHandle<()>>,
    monitor: Option<MonitorHandle>,
    channel: MessageChannel,
    negotiator: Arc<RelayNegotiator>,
    engine: Arc<Mutex<AdaptationEngine>>,
    settings_rx: watch::Receiver<OptimizationSettings>,
    sample_tx: watch::Sender<Option<QualitySample>>,
    last_error: Arc<Mutex<Option<String>>>,
    timer_tx: mpsc::Sender<TimerEvent>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<SessionCommand>,
        mut sig_rx: mpsc::Receiver<SignalingMessage>,
        mut timer_rx: mpsc::Receiver<TimerEvent>,
    ) {
        let mut signaling_open = true;

        loop {
            let input = {
                let transport_rx = self.transport_events.as_mut();
                tokio::select! {
                    cmd = cmd_rx.recv() => Input::Command(cmd),
                    sig = async {
                        if signaling_open {
                            sig_rx.recv().await
                        } else {
                            std::future::pending().await
                        }
                    } => Input::Signal(sig),
                    ev = async {
                        match transport_rx {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => Input::Transport(ev),
                    timer = timer_rx.recv() => Input::Timer(timer),
                }
            };

            match input {
                Input::Command(Some(cmd)) => {
                    if self.handle_command(cmd).await {
                        break;
                    }
                }
                Input::Command(None) => {
                    // every handle dropped; release resources and stop
                    self.teardown().await;
                    break;
                }
                Input::Signal(Some(msg)) => self.handle_signal(msg).await,
                Input::Signal(None) => {
                    signaling_open = false;
                    if !self.state.is_terminal() {
                        self.record_error("signaling transport closed".to_string());
                    }
                }
                Input::Transport(Some(event)) => self.handle_transport_event(event).await,
                Input::Transport(None) => {
                    // sender side dropped with the transport; nothing to do
                    self.transport_events = None;
                }
                Input::Timer(Some(event)) => self.handle_timer(event).await,
                Input::Timer(None) => break,
            }
        }

        debug!("session actor stopped");
    }

    /// Returns true when the actor should stop
    async fn handle_command(&mut self, cmd: SessionCommand) -> bool {
        match cmd {
            SessionCommand::Join { room_id, ack } => {
                let _ = ack.send(self.handle_join(room_id).await);
                false
            }
            SessionCommand::Leave { ack } => {
                self.teardown().await;
                self.set_state(ConnectionState::Closed);
                let _ = ack.send(());
                true
            }
            SessionCommand::Send { kind, content, ack } => {
                let _ = ack.send(self.channel.send(kind, &content).await);
                false
            }
            SessionCommand::RegisterRelayCandidate { peer_id, addr } => {
                self.negotiator.register_candidate(peer_id, addr);
                false
            }
        }
    }

    async fn handle_join(&mut self, room_id: String) -> Result<(), SessionError> {
        if self.state == ConnectionState::Closed {
            return Err(SessionError::Closed);
        }
        if self.room_id.as_deref() == Some(room_id.as_str())
            && self.state != ConnectionState::Idle
        {
            trace!("join({}) is a no-op: already joined", room_id);
            return Ok(());
        }
        if let Some(current) = &self.room_id {
            if self.state != ConnectionState::Idle {
                return Err(SessionError::Transport(format!(
                    "already joined room {current}; leave first"
                )));
            }
        }

        self.signaling_out
            .send(SignalingMessage::JoinRoom {
                room_id: room_id.clone(),
                user_id: self.local_id,
                nickname: self.nickname.clone(),
                relay_capable: false,
            })
            .await
            .map_err(|_| {
                SessionError::SignalingUnavailable("signaling transport closed".to_string())
            })?;

        info!("joining room {}", room_id);
        self.room_id = Some(room_id);
        self.set_state(ConnectionState::AwaitingRemote);
        Ok(())
    }

    async fn handle_signal(&mut self, msg: SignalingMessage) {
        if self.state == ConnectionState::Closed {
            return;
        }

        match msg {
            SignalingMessage::RoomStatus { users, can_join } => {
                if !can_join {
                    self.record_error("room is full".to_string());
                    self.room_id = None;
                    if self.state == ConnectionState::AwaitingRemote {
                        self.set_state(ConnectionState::Idle);
                    }
                    return;
                }
                let remote = users.iter().find(|u| u.user_id != self.local_id).cloned();
                if let Some(user) = remote {
                    self.handle_remote_join(user.user_id, user.nickname).await;
                }
            }
            SignalingMessage::UserJoined {
                user_id, nickname, ..
            } => {
                self.handle_remote_join(user_id, nickname).await;
            }
            SignalingMessage::UserLeft { user_id } => {
                if self.remote_id == Some(user_id) {
                    info!("remote participant {} left", user_id);
                    let _ = self.events.send(SessionEvent::RemoteLeft { user_id });
                    self.remote_id = None;
                    self.drop_transport();
                    self.cancel_timer();
                    self.attempt = 0;
                    if !self.state.is_terminal() {
                        self.set_state(ConnectionState::AwaitingRemote);
                    }
                }
            }
            SignalingMessage::Offer { from_id, sdp, .. } => {
                self.handle_offer(from_id, sdp).await;
            }
            SignalingMessage::Answer { from_id, sdp, .. } => {
                self.handle_answer(from_id, sdp).await;
            }
            SignalingMessage::IceCandidate { candidate, .. } => {
                self.handle_candidate(candidate);
            }
            SignalingMessage::Error { message } => {
                self.record_error(format!("signaling error: {message}"));
            }
            // client -> server shapes are not expected here
            _ => {}
        }
    }

    async fn handle_remote_join(&mut self, user_id: Uuid, nickname: String) {
        if user_id == self.local_id {
            return;
        }
        if self.remote_id == Some(user_id)
            && matches!(
                self.state,
                ConnectionState::Negotiating | ConnectionState::Connected
            )
        {
            return;
        }
        if self.state != ConnectionState::AwaitingRemote {
            trace!("ignoring remote join in state {:?}", self.state);
            return;
        }

        info!("remote participant {} ({}) discovered", nickname, user_id);
        self.remote_id = Some(user_id);
        let _ = self
            .events
            .send(SessionEvent::RemoteJoined { user_id, nickname });

        if self.is_initiator() {
            self.start_offer().await;
        } else {
            // the designated initiator offers; we answer when it arrives
            self.set_state(ConnectionState::Negotiating);
            self.schedule_negotiation_timeout();
        }
    }

    /// Deterministic tie-break: the lower participant id initiates
    fn is_initiator(&self) -> bool {
        match self.remote_id {
            Some(remote) => self.local_id < remote,
            None => false,
        }
    }

    /// Create a transport and emit the offer (initiator side)
    async fn start_offer(&mut self) {
        let Some(remote) = self.remote_id else {
            return;
        };
        self.set_state(ConnectionState::Negotiating);

        let relay = self.pick_relay_path(remote).await;
        let kind = match relay {
            Some(path) => TransportKind::Relayed {
                relay_addr: path.relay_addr,
                connection_id: path.connection_id,
            },
            None => TransportKind::Direct,
        };

        let transport = match self.create_transport(kind).await {
            Ok(transport) => transport,
            Err(e) => {
                self.negotiation_failure(format!("transport bind failed: {e}"))
                    .await;
                return;
            }
        };

        let candidates = transport.gather_local_candidates().await;
        let description = SessionDescription {
            participant_id: self.local_id,
            candidates: candidates.iter().map(|c| c.encode()).collect(),
            relay,
        };

        let offer = SignalingMessage::Offer {
            target_id: remote,
            from_id: self.local_id,
            sdp: description.encode(),
        };
        if self.signaling_out.send(offer).await.is_err() {
            self.negotiation_failure("signaling transport closed".to_string())
                .await;
            return;
        }

        debug!("offer sent to {}", remote);
        // the answer carries the remote candidates; until then the
        // timeout guard is the only failure source
        self.remote_description_applied = false;
        self.schedule_negotiation_timeout();
    }

    async fn handle_offer(&mut self, from_id: Uuid, sdp: String) {
        if self.state == ConnectionState::Connected {
            trace!("ignoring offer while connected");
            return;
        }

        info!("offer received from {}", from_id);
        self.remote_id = Some(from_id);

        // any stale transport is torn down before the new attempt
        self.drop_transport();
        self.cancel_timer();
        self.set_state(ConnectionState::Negotiating);

        let description = match SessionDescription::parse(&sdp) {
            Ok(description) => description,
            Err(e) => {
                self.negotiation_failure(e.to_string()).await;
                return;
            }
        };

        let kind = match description.relay {
            Some(path) => TransportKind::Relayed {
                relay_addr: path.relay_addr,
                connection_id: path.connection_id,
            },
            None => TransportKind::Direct,
        };

        let transport = match self.create_transport(kind).await {
            Ok(transport) => transport,
            Err(e) => {
                self.negotiation_failure(format!("transport bind failed: {e}"))
                    .await;
                return;
            }
        };

        self.apply_remote_candidates(&transport, &description.candidates);
        self.remote_description_applied = true;
        self.drain_candidate_queue();

        let local_candidates = transport.gather_local_candidates().await;
        let answer_description = SessionDescription {
            participant_id: self.local_id,
            candidates: local_candidates.iter().map(|c| c.encode()).collect(),
            relay: None,
        };
        let answer = SignalingMessage::Answer {
            target_id: from_id,
            from_id: self.local_id,
            sdp: answer_description.encode(),
        };
        if self.signaling_out.send(answer).await.is_err() {
            self.negotiation_failure("signaling transport closed".to_string())
                .await;
            return;
        }

        debug!("answer sent to {}", from_id);
        self.spawn_establish();
    }

    async fn handle_answer(&mut self, from_id: Uuid, sdp: String) {
        if self.state != ConnectionState::Negotiating || self.remote_id != Some(from_id) {
            trace!("ignoring answer in state {:?}", self.state);
            return;
        }
        let Some(transport) = self.transport.clone() else {
            trace!("answer without a transport");
            return;
        };

        let description = match SessionDescription::parse(&sdp) {
            Ok(description) => description,
            Err(e) => {
                self.negotiation_failure(e.to_string()).await;
                return;
            }
        };

        debug!("answer received from {}", from_id);
        self.apply_remote_candidates(&transport, &description.candidates);
        self.remote_description_applied = true;
        self.drain_candidate_queue();
        self.spawn_establish();
    }

    /// Queue candidates that arrive before the transport accepted the
    /// remote description; apply them immediately afterwards. Candidates
    /// are never dropped silently.
    fn handle_candidate(&mut self, candidate: String) {
        if self.remote_description_applied {
            if let Some(transport) = &self.transport {
                apply_candidate(transport, &candidate);
                return;
            }
        }
        trace!("queueing early candidate");
        self.pending_candidates.push_back(candidate);
    }

    /// Drain the early-candidate queue, exactly once per transport, in
    /// arrival order
    fn drain_candidate_queue(&mut self) {
        let Some(transport) = &self.transport else {
            return;
        };
        while let Some(candidate) = self.pending_candidates.pop_front() {
            apply_candidate(transport, &candidate);
        }
    }

    fn apply_remote_candidates(&self, transport: &Arc<PeerTransport>, candidates: &[String]) {
        for candidate in candidates {
            apply_candidate(transport, candidate);
        }
    }

    /// Consult the relay negotiator when the adaptation engine prefers a
    /// relayed path, or when repeated direct attempts have failed
    async fn pick_relay_path(&mut self, remote: Uuid) -> Option<RelayPath> {
        let preference = self.settings_rx.borrow().relay_preference;
        let want_relay = match preference {
            RelayPreference::Relay => true,
            RelayPreference::Direct => false,
            RelayPreference::Auto => self.attempt >= 2,
        };
        if !want_relay {
            return None;
        }

        match self.negotiator.negotiate(remote).await {
            Ok(path) => Some(path),
            Err(e) => {
                // fall back to the direct path and the normal retry cycle
                debug!("relay negotiation failed: {}", e);
                None
            }
        }
    }

    /// Bind a fresh transport, destroying any prior one first so at most
    /// one transport exists per session at any instant
    async fn create_transport(
        &mut self,
        kind: TransportKind,
    ) -> Result<Arc<PeerTransport>, SessionError> {
        self.drop_transport();

        let keepalive = Duration::from_millis(self.config.keepalive_interval_ms);
        let (transport, events_rx, data_rx) =
            PeerTransport::bind(
            kind,
            self.local_id,
            0,
            keepalive,
            self.config.enable_reflexive_discovery,
        )
        .await?;

        self.transport = Some(transport.clone());
        self.transport_events = Some(events_rx);
        self.pending_data_rx = Some(data_rx);
        self.remote_description_applied = false;
        Ok(transport)
    }

    fn spawn_establish(&mut self) {
        let Some(transport) = self.transport.clone() else {
            return;
        };
        let limit = Duration::from_millis(self.settings_rx.borrow().connection_timeout_ms);
        tokio::spawn(async move {
            // outcome arrives through the transport event stream
            let _ = transport.establish(limit).await;
        });
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                if self.state.is_terminal() {
                    return;
                }
                self.cancel_timer();
                self.attempt = 0;
                self.set_state(ConnectionState::Connected);

                if let Some(transport) = self.transport.clone() {
                    self.monitor = Some(quality::spawn_monitor(
                        transport.clone(),
                        self.engine.clone(),
                        self.sample_tx.clone(),
                        Duration::from_millis(self.config.quality_monitor_interval_ms),
                    ));

                    if let Some(data_rx) = self.pending_data_rx.take() {
                        self.channel.attach(transport, data_rx).await;
                    }
                }

                let _ = self.events.send(SessionEvent::TransportReady);
            }
            TransportEvent::Failed(reason) => {
                self.negotiation_failure(reason).await;
            }
        }
    }

    async fn handle_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::RetryDue => {
                if self.state != ConnectionState::Reconnecting {
                    return;
                }
                info!("reconnect attempt {}", self.attempt);
                if self.is_initiator() {
                    self.start_offer().await;
                } else if self.remote_id.is_some() {
                    // wait for the initiator's fresh offer, bounded by the
                    // negotiation timeout
                    self.set_state(ConnectionState::Negotiating);
                    self.schedule_negotiation_timeout();
                } else {
                    self.set_state(ConnectionState::AwaitingRemote);
                }
            }
            TimerEvent::NegotiationTimeout => {
                let connected = self
                    .transport
                    .as_ref()
                    .map(|t| t.is_connected())
                    .unwrap_or(false);
                if self.state == ConnectionState::Negotiating && !connected {
                    self.negotiation_failure("negotiation timed out".to_string())
                        .await;
                }
            }
        }
    }

    /// One negotiation attempt failed: tear down, then either schedule a
    /// retry with linear backoff or surface the terminal `Failed` state
    async fn negotiation_failure(&mut self, reason: String) {
        if !matches!(
            self.state,
            ConnectionState::Negotiating | ConnectionState::Connected
        ) {
            return;
        }

        warn!("attempt failed: {}", reason);
        self.record_error(reason);
        self.drop_transport();
        self.cancel_timer();

        if self.attempt >= self.config.max_retries {
            info!(
                "retry budget exhausted after {} attempts",
                self.config.max_retries
            );
            self.set_state(ConnectionState::Failed);
            return;
        }

        self.attempt += 1;
        self.set_state(ConnectionState::Reconnecting);

        let delay = Duration::from_millis(self.config.backoff_ms(self.attempt));
        debug!("retry {} scheduled in {:?}", self.attempt, delay);
        self.schedule_timer(TimerEvent::RetryDue, delay);
    }

    fn schedule_negotiation_timeout(&mut self) {
        let limit = Duration::from_millis(self.settings_rx.borrow().connection_timeout_ms);
        self.schedule_timer(TimerEvent::NegotiationTimeout, limit);
    }

    /// Replace the pending timer; at most one is armed at a time
    fn schedule_timer(&mut self, event: TimerEvent, delay: Duration) {
        self.cancel_timer();
        let timer_tx = self.timer_tx.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timer_tx.send(event).await;
        }));
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Stop the monitor, detach the channel, and destroy the transport
    fn drop_transport(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.stop();
        }
        self.channel.detach();
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        self.transport_events = None;
        self.pending_data_rx = None;
        self.remote_description_applied = false;
    }

    /// Release every resource the session holds. Called on leave and when
    /// the last handle is dropped; synchronous except for the best-effort
    /// leave notification.
    async fn teardown(&mut self) {
        self.cancel_timer();
        self.drop_transport();
        self.pending_candidates.clear();
        if self.room_id.take().is_some() {
            let _ = self.signaling_out.send(SignalingMessage::LeaveRoom).await;
        }
        self.remote_id = None;
    }

    fn set_state(&mut self, to: ConnectionState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        info!("session state {:?} -> {:?}", from, to);
        self.state = to;
        self.state_tx.send_replace(to);
        let _ = self.events.send(SessionEvent::StateChanged { from, to });
    }

    fn record_error(&mut self, message: String) {
        warn!("{}", message);
        *self.last_error.lock() = Some(message.clone());
        let _ = self.events.send(SessionEvent::Error { message });
    }
}

fn apply_candidate(transport: &Arc<PeerTransport>, candidate: &str) {
    match crate::candidate::IceCandidate::parse(candidate) {
        Ok(parsed) => transport.add_remote_candidate(parsed.addr),
        Err(e) => warn!("dropping malformed candidate: {}", e),
    }
}
