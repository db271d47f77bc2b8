//! Reconnection supervisor
//!
//! One actor task per camera owns the current [`ConnectionSession`] and the
//! failure memory that survives it. Transport and peer callbacks, timers and
//! the quality sampler never touch the session directly: they post messages
//! tagged with the session generation, and messages from an older generation
//! are dropped. The previous session is always torn down before a new one is
//! created.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::BackoffState;
use super::heartbeat::{BeaconSink, HeartbeatScheduler, StopReason};
use super::quality::{spawn_sampler, QualityMonitor, QualityScore, QualitySignal};
use super::sink::{FrameSink, VisibilityPort};
use crate::config::ConfigStore;
use crate::error::Result;
use crate::events::{EventBus, SystemEvent};
use crate::utils::LogThrottler;
use crate::warn_throttled;
use crate::webrtc::peer::{PeerEvent, PeerEventHandler, PeerFactory, PeerState};
use crate::webrtc::sdp::OfferConstraints;
use crate::webrtc::session::{FailureReason, MediaInput, MediaSession, MediaState, Severity, Transition};
use crate::webrtc::signaling::{ConnectionId, ConnectionStatus, SignalingEnvelope};
use crate::webrtc::transport::{
    MessageHandler, SignalingTransport, TransportConnector, TransportEvent, TransportState,
};

/// How long shutdown waits for in-flight disconnect beacons
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Collaborators injected into the supervisor
#[derive(Clone)]
pub struct SupervisorDeps {
    pub connector: Arc<dyn TransportConnector>,
    pub peers: Arc<dyn PeerFactory>,
    pub beacons: Arc<dyn BeaconSink>,
    pub sink: Arc<dyn FrameSink>,
    pub events: EventBus,
    pub visibility: VisibilityPort,
}

/// Handle to the per-camera supervisor actor
pub struct ReconnectionSupervisor {
    config: ConfigStore,
    deps: SupervisorDeps,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    running: Option<Running>,
}

struct Running {
    camera: String,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ReconnectionSupervisor {
    pub fn new(config: ConfigStore, deps: SupervisorDeps) -> Self {
        let (status_tx, _rx) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            config,
            deps,
            status_tx: Arc::new(status_tx),
            running: None,
        }
    }

    /// Consumer-visible status
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn camera(&self) -> Option<&str> {
        self.running.as_ref().map(|r| r.camera.as_str())
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Supervise `camera`, replacing any camera supervised so far
    pub async fn start(&mut self, camera: &str) {
        self.stop().await;

        let config = self.config.get();
        let shutdown = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = SupervisorActor {
            camera: camera.to_string(),
            config: self.config.clone(),
            deps: self.deps.clone(),
            status_tx: self.status_tx.clone(),
            tx,
            shutdown: shutdown.clone(),
            backoff: BackoffState::new(config.reconnect.policy()),
            generation: 0,
            session: None,
            retry_epoch: 0,
            retry_pending: None,
            visible: true,
            hidden_since: None,
            disconnects: Vec::new(),
            throttler: LogThrottler::with_secs(10),
        };

        let visibility = self.deps.visibility.subscribe();
        let task = tokio::spawn(actor.run(rx, visibility));
        self.running = Some(Running {
            camera: camera.to_string(),
            shutdown,
            task,
        });
    }

    /// Tear down the current session and wait for the actor to exit
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.shutdown.cancel();
        if let Err(e) = running.task.await {
            warn!(camera = %running.camera, "Supervisor task ended abnormally: {}", e);
        }
    }
}

impl Drop for ReconnectionSupervisor {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.shutdown.cancel();
        }
    }
}

/// One connection attempt and everything it owns
pub struct ConnectionSession {
    pub generation: u64,
    /// Backoff attempt number this session was started with
    pub attempt: u32,
    /// Server-assigned id, once known
    pub session_id: Option<String>,
    pub last_frame_at: Option<Instant>,
    pub quality: QualityScore,
    pub created_at: DateTime<Utc>,
    token: CancellationToken,
    transport: Option<Arc<dyn SignalingTransport>>,
    /// Transport events received before the open call returned
    buffered: Vec<TransportEvent>,
    media: MediaSession,
    heartbeat: HeartbeatScheduler,
    monitor: QualityMonitor,
    failure_message: Option<String>,
}

impl ConnectionSession {
    pub fn state(&self) -> MediaState {
        self.media.state()
    }

    fn fail(&mut self, reason: FailureReason, message: impl Into<String>) -> Option<Transition> {
        let transition = self.media.apply(MediaInput::Fail(reason));
        if transition.is_some() {
            self.failure_message = Some(message.into());
        }
        transition
    }
}

enum ActorMsg {
    Opened {
        generation: u64,
        result: Result<Arc<dyn SignalingTransport>>,
    },
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    Peer {
        generation: u64,
        event: PeerEvent,
    },
    GraceExpired {
        generation: u64,
    },
    ConnectDeadline {
        generation: u64,
    },
    QualityTick {
        generation: u64,
    },
    RetryDue {
        epoch: u64,
    },
}

struct SupervisorActor {
    camera: String,
    config: ConfigStore,
    deps: SupervisorDeps,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    tx: mpsc::UnboundedSender<ActorMsg>,
    shutdown: CancellationToken,
    backoff: BackoffState,
    generation: u64,
    session: Option<ConnectionSession>,
    retry_epoch: u64,
    retry_pending: Option<u64>,
    visible: bool,
    hidden_since: Option<Instant>,
    disconnects: Vec<JoinHandle<()>>,
    throttler: LogThrottler,
}

impl SupervisorActor {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<ActorMsg>,
        mut visibility: watch::Receiver<bool>,
    ) {
        info!(camera = %self.camera, "Connection supervisor started");

        let mut config_changes = self.config.subscribe();
        self.visible = *visibility.borrow_and_update();
        if self.visible {
            self.connect().await;
        } else {
            self.hidden_since = Some(Instant::now());
            self.deps.sink.pause();
            // The watch already reads disconnected, so tell the sink directly
            self.status_tx.send_replace(ConnectionStatus::Disconnected);
            self.deps
                .sink
                .on_status(ConnectionStatus::Disconnected, Some("paused while hidden"));
        }

        let shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Ok(()) = visibility.changed() => {
                    let visible = *visibility.borrow_and_update();
                    self.on_visibility(visible).await;
                }
                Ok(_) = config_changes.recv() => self.on_config_changed(),
                Some(msg) = rx.recv() => self.handle(msg).await,
            }
        }

        self.finish_run().await;
    }

    async fn handle(&mut self, msg: ActorMsg) {
        match msg {
            ActorMsg::Opened { generation, result } => self.on_opened(generation, result).await,
            ActorMsg::Transport { generation, event } => {
                self.on_transport_event(generation, event).await
            }
            ActorMsg::Peer { generation, event } => self.on_peer_event(generation, event).await,
            ActorMsg::GraceExpired { generation } => self.on_grace_expired(generation).await,
            ActorMsg::ConnectDeadline { generation } => {
                self.on_connect_deadline(generation).await
            }
            ActorMsg::QualityTick { generation } => self.on_quality_tick(generation).await,
            ActorMsg::RetryDue { epoch } => {
                if self.retry_pending == Some(epoch) && self.visible && self.session.is_none() {
                    self.connect().await;
                }
            }
        }
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    async fn connect(&mut self) {
        self.retry_pending = None;
        if let Some(previous) = self.session.take() {
            self.teardown(previous).await;
        }

        let config = self.config.get();
        self.generation += 1;
        let generation = self.generation;
        let attempt = self.backoff.attempt();
        info!(camera = %self.camera, generation, attempt, "Starting connection attempt");
        self.set_status(ConnectionStatus::Connecting, None);

        let tx = self.tx.clone();
        let peer_handler: PeerEventHandler = Arc::new(move |event| {
            let _ = tx.send(ActorMsg::Peer { generation, event });
        });
        let peer = match self.deps.peers.create(&self.camera, peer_handler).await {
            Ok(peer) => peer,
            Err(e) => {
                self.deps.events.publish(SystemEvent::SystemError {
                    module: "peer".to_string(),
                    severity: "error".to_string(),
                    message: format!("{}: {}", self.camera, e),
                });
                let reason = FailureReason::from_error(&e);
                self.after_failure(generation, attempt, MediaState::Failed(reason), e.to_string());
                return;
            }
        };

        let mut media = MediaSession::new(
            &self.camera,
            peer,
            config.webrtc.video_codec,
            self.deps.events.clone(),
        )
        .with_attempt(attempt);
        media.apply(MediaInput::Open);

        let heartbeat = HeartbeatScheduler::new(
            &self.camera,
            &config.heartbeat,
            self.deps.beacons.clone(),
            self.deps.events.clone(),
        );
        heartbeat.set_visibility(self.visible);

        let session = ConnectionSession {
            generation,
            attempt,
            session_id: None,
            last_frame_at: None,
            quality: QualityScore::Good,
            created_at: Utc::now(),
            token: self.shutdown.child_token(),
            transport: None,
            buffered: Vec::new(),
            media,
            heartbeat,
            monitor: QualityMonitor::new(config.quality.clone()),
            failure_message: None,
        };
        self.publish_state(&session, None);

        let token = session.token.clone();
        let connector = self.deps.connector.clone();
        let camera = self.camera.clone();
        let tx = self.tx.clone();
        let transport_tx = self.tx.clone();
        let handler: MessageHandler = Arc::new(move |event| {
            let _ = transport_tx.send(ActorMsg::Transport { generation, event });
        });
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                result = connector.open(&camera, handler) => {
                    let _ = tx.send(ActorMsg::Opened { generation, result });
                }
            }
        });

        self.session = Some(session);
    }

    /// Release everything a session owns
    async fn teardown(&mut self, mut session: ConnectionSession) {
        debug!(
            camera = %self.camera,
            generation = session.generation,
            "Tearing down session created at {}",
            session.created_at
        );
        session.token.cancel();
        if let Some(transport) = session.transport.take() {
            transport.close("session ended");
        }
        session.heartbeat.set_connected(false);
        if let Some(handle) = session.heartbeat.stop(StopReason::Teardown) {
            self.disconnects.retain(|h| !h.is_finished());
            self.disconnects.push(handle);
        }
        session.media.close().await;
    }

    /// Apply side effects of a state change and keep or end the session
    async fn settle(&mut self, mut session: ConnectionSession, transition: Option<Transition>) {
        let Some(transition) = transition else {
            self.session = Some(session);
            return;
        };

        match transition.to {
            MediaState::Connected => {
                if transition.from == MediaState::Connecting {
                    self.on_connected(&mut session);
                } else {
                    info!(
                        camera = %self.camera,
                        generation = session.generation,
                        attempt = session.attempt,
                        "Frames resumed"
                    );
                    session.heartbeat.set_paused(false);
                    session.heartbeat.start(session.session_id.as_deref());
                }
                self.set_status(ConnectionStatus::Connected, None);
                self.publish_state(&session, None);
                self.session = Some(session);
            }
            MediaState::Stalled => {
                warn!(
                    camera = %self.camera,
                    generation = session.generation,
                    attempt = session.attempt,
                    "Media stalled"
                );
                // Beacons stop until frames return; the sampler keeps running
                // so a hard stall can still end the session
                session.heartbeat.set_paused(true);
                session.heartbeat.stop(StopReason::Interval);
                self.set_status(ConnectionStatus::Stalled, Some("no frames received"));
                self.publish_state(&session, None);
                self.session = Some(session);
            }
            MediaState::Idle | MediaState::Connecting => self.session = Some(session),
            MediaState::Disconnected | MediaState::Failed(_) | MediaState::Closed => {
                let reason = transition.to.failure().unwrap_or(FailureReason::TransportLost);
                let message = session
                    .failure_message
                    .take()
                    .unwrap_or_else(|| format!("session ended: {}", reason));
                self.publish_state(&session, Some(reason));
                let generation = session.generation;
                let attempt = session.attempt;
                self.teardown(session).await;
                self.after_failure(generation, attempt, transition.to, message);
            }
        }
    }

    fn on_connected(&mut self, session: &mut ConnectionSession) {
        let config = self.config.get();
        info!(
            camera = %self.camera,
            generation = session.generation,
            attempt = session.attempt,
            "Media connected"
        );
        self.backoff.reset();

        session.monitor.reset();
        session.heartbeat.set_connected(true);
        session.heartbeat.start(session.session_id.as_deref());

        let generation = session.generation;
        let tx = self.tx.clone();
        spawn_sampler(
            config.quality.sample_interval(),
            session.token.child_token(),
            move || tx.send(ActorMsg::QualityTick { generation }).is_ok(),
        );
    }

    /// Report a finished attempt and schedule the next one
    fn after_failure(&mut self, generation: u64, attempt: u32, state: MediaState, message: String) {
        let reason = state.failure().unwrap_or(FailureReason::TransportLost);
        match reason.severity() {
            Severity::Error => {
                error!(
                    camera = %self.camera,
                    generation,
                    attempt,
                    reason = %reason,
                    "Session failed: {}",
                    message
                );
                self.deps.events.publish(SystemEvent::NegotiationFailed {
                    camera: self.camera.clone(),
                    attempt,
                    reason: reason.code().to_string(),
                    message: message.clone(),
                });
            }
            Severity::Warning => {
                warn!(
                    camera = %self.camera,
                    generation,
                    attempt,
                    reason = %reason,
                    "Session failed: {}",
                    message
                )
            }
        }
        self.set_status(state.status(), Some(&message));

        if !self.visible {
            return;
        }
        let retry = self.backoff.on_failure(Instant::now());
        self.retry_epoch += 1;
        let epoch = self.retry_epoch;
        self.retry_pending = Some(epoch);

        if retry.cooldown {
            warn!(
                camera = %self.camera,
                attempt = retry.attempt,
                "Repeated rapid failures, cooling down for {:?}", retry.delay
            );
        } else {
            info!(
                camera = %self.camera,
                attempt = retry.attempt,
                "Reconnecting in {:?}", retry.delay
            );
        }
        self.deps.events.publish(SystemEvent::ConnectionReconnecting {
            camera: self.camera.clone(),
            attempt: retry.attempt,
            delay_ms: retry.delay.as_millis() as u64,
            reason: reason.code().to_string(),
            cooldown: retry.cooldown,
        });
        self.schedule(&self.shutdown, retry.delay, ActorMsg::RetryDue { epoch });
    }

    async fn finish_run(&mut self) {
        self.retry_pending = None;
        if let Some(session) = self.session.take() {
            self.teardown(session).await;
        }
        self.set_status(ConnectionStatus::Disconnected, Some("stopped"));

        for handle in std::mem::take(&mut self.disconnects) {
            if tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, handle).await.is_err() {
                debug!(camera = %self.camera, "Disconnect beacon still in flight at shutdown");
            }
        }
        info!(camera = %self.camera, "Connection supervisor stopped");
    }

    async fn on_visibility(&mut self, visible: bool) {
        if visible == self.visible {
            return;
        }
        self.visible = visible;

        if !visible {
            info!(camera = %self.camera, "Consumer hidden, releasing connection");
            self.hidden_since = Some(Instant::now());
            self.retry_pending = None;
            if let Some(mut session) = self.session.take() {
                session.heartbeat.set_visibility(false);
                session.heartbeat.set_paused(true);
                session.media.apply(MediaInput::Close);
                self.publish_state(&session, None);
                self.teardown(session).await;
            }
            self.deps.sink.pause();
            self.set_status(ConnectionStatus::Disconnected, Some("paused while hidden"));
            return;
        }

        let hidden_for = self
            .hidden_since
            .take()
            .map(|since| since.elapsed())
            .unwrap_or_default();
        if hidden_for >= self.config.get().reconnect.long_hide() {
            debug!(camera = %self.camera, "Hidden for {:?}, resetting backoff", hidden_for);
            self.backoff.reset();
        }
        info!(camera = %self.camera, "Consumer visible again");
        self.deps.sink.resume();
        self.connect().await;
    }

    /// Pick up reconnect tuning edits; the failure history is kept
    fn on_config_changed(&mut self) {
        let policy = self.config.get().reconnect.policy();
        if &policy != self.backoff.policy() {
            info!(camera = %self.camera, "Reconnect policy updated: {:?}", policy);
            self.backoff.set_policy(policy);
        }
    }

    // ========================================================================
    // Message handlers
    // ========================================================================

    fn take_session(&mut self, generation: u64) -> Option<ConnectionSession> {
        match &self.session {
            Some(session) if session.generation == generation => self.session.take(),
            _ => {
                debug!(
                    camera = %self.camera,
                    generation,
                    current = self.generation,
                    "Discarding event from stale session"
                );
                None
            }
        }
    }

    async fn on_opened(&mut self, generation: u64, result: Result<Arc<dyn SignalingTransport>>) {
        let Some(mut session) = self.take_session(generation) else {
            if let Ok(transport) = result {
                transport.close("superseded");
            }
            return;
        };

        let transport = match result {
            Ok(transport) => transport,
            Err(e) => {
                let transition = session.fail(FailureReason::from_error(&e), e.to_string());
                self.settle(session, transition).await;
                return;
            }
        };
        session.transport = Some(transport.clone());

        let config = self.config.get();
        self.schedule(
            &session.token,
            config.session.negotiation_timeout(),
            ActorMsg::ConnectDeadline { generation },
        );

        let constraints = OfferConstraints {
            receive_video: true,
            receive_audio: config.webrtc.enable_audio,
            codec: config.webrtc.video_codec,
        };
        if let Err(e) = session.media.negotiate(transport.as_ref(), &constraints).await {
            let transition = session.fail(FailureReason::from_error(&e), e.to_string());
            self.settle(session, transition).await;
            return;
        }

        let buffered = std::mem::take(&mut session.buffered);
        self.session = Some(session);
        for event in buffered {
            self.on_transport_event(generation, event).await;
        }
    }

    async fn on_transport_event(&mut self, generation: u64, event: TransportEvent) {
        let Some(mut session) = self.take_session(generation) else {
            return;
        };
        if session.transport.is_none() {
            session.buffered.push(event);
            self.session = Some(session);
            return;
        }

        let transition = match event {
            TransportEvent::State(TransportState::Open) => None,
            TransportEvent::State(TransportState::Error(message)) => {
                self.on_signaling_lost(&mut session, FailureReason::TransportError, message)
            }
            TransportEvent::State(TransportState::Closed(reason)) => {
                self.on_signaling_lost(&mut session, FailureReason::SignalingClosed, reason)
            }
            TransportEvent::Message(envelope) => self.on_envelope(&mut session, envelope).await,
        };
        self.settle(session, transition).await;
    }

    /// Signaling went away; fatal only while negotiation is in progress
    fn on_signaling_lost(
        &mut self,
        session: &mut ConnectionSession,
        reason: FailureReason,
        message: String,
    ) -> Option<Transition> {
        if let Some(transport) = &session.transport {
            transport.close("lost");
        }
        if session.state() == MediaState::Connecting {
            session.fail(reason, format!("signaling lost: {}", message))
        } else {
            warn!(
                camera = %self.camera,
                generation = session.generation,
                attempt = session.attempt,
                "Signaling closed after negotiation ({}), keeping media",
                message
            );
            None
        }
    }

    async fn on_envelope(
        &mut self,
        session: &mut ConnectionSession,
        envelope: SignalingEnvelope,
    ) -> Option<Transition> {
        match envelope {
            SignalingEnvelope::ConnectionId(ConnectionId { id }) => {
                info!(camera = %self.camera, session_id = %id, "Session id assigned");
                session.heartbeat.set_session_id(&id);
                session.session_id = Some(id);
                None
            }
            SignalingEnvelope::Answer(answer) => match session.media.apply_answer(&answer.sdp).await {
                Ok(applied) => {
                    debug!(
                        camera = %self.camera,
                        attempt = session.attempt,
                        "Remote answer applied ({} repairs)",
                        applied.repairs.len()
                    );
                    applied.transition
                }
                Err(e) => session.fail(FailureReason::Negotiation, e.to_string()),
            },
            SignalingEnvelope::IceCandidate(candidate) => {
                session.media.add_remote_candidate(candidate).await;
                None
            }
            SignalingEnvelope::Error(err) => {
                if session.state() == MediaState::Connecting {
                    session.fail(
                        FailureReason::ServerError,
                        format!("server error: {}", err.message),
                    )
                } else {
                    warn!(
                        camera = %self.camera,
                        attempt = session.attempt,
                        "Server error after connect: {}",
                        err.message
                    );
                    None
                }
            }
            SignalingEnvelope::Close => self.on_signaling_lost(
                session,
                FailureReason::SignalingClosed,
                "server requested close".to_string(),
            ),
            SignalingEnvelope::Offer(_) => {
                warn_throttled!(
                    self.throttler,
                    "unexpected_offer",
                    camera = %self.camera,
                    attempt = session.attempt,
                    "Ignoring offer from server"
                );
                None
            }
        }
    }

    async fn on_peer_event(&mut self, generation: u64, event: PeerEvent) {
        let Some(mut session) = self.take_session(generation) else {
            return;
        };

        let transition = match event {
            PeerEvent::State(state) => {
                let first_connect =
                    state == PeerState::Connected && session.media.transport_connected_at().is_none();
                let transition = session.media.on_peer_state(state, Instant::now());
                if first_connect && session.state() == MediaState::Connecting {
                    let grace = self.config.get().session.first_frame_grace();
                    self.schedule(&session.token, grace, ActorMsg::GraceExpired { generation });
                }
                if transition.is_some_and(|t| t.to.is_terminal()) {
                    session.failure_message = Some(format!("peer connection {}", state));
                }
                transition
            }
            PeerEvent::LocalCandidate(candidate) => {
                if let Some(transport) = &session.transport {
                    if let Err(e) = transport.send(SignalingEnvelope::IceCandidate(candidate)).await {
                        debug!(
                            camera = %self.camera,
                            attempt = session.attempt,
                            "Failed to trickle candidate: {}",
                            e
                        );
                    }
                }
                None
            }
            PeerEvent::TrackAdded { kind } => {
                debug!(camera = %self.camera, "Remote {} track added", kind);
                None
            }
            PeerEvent::FrameArrived => {
                session.last_frame_at = Some(Instant::now());
                session.media.on_frame()
            }
        };
        self.settle(session, transition).await;
    }

    async fn on_grace_expired(&mut self, generation: u64) {
        let Some(mut session) = self.take_session(generation) else {
            return;
        };
        let transition = session.media.apply(MediaInput::GraceExpired);
        if transition.is_some() {
            session.failure_message = Some(format!(
                "no frame within {:?} of transport connect",
                self.config.get().session.first_frame_grace()
            ));
        }
        self.settle(session, transition).await;
    }

    async fn on_connect_deadline(&mut self, generation: u64) {
        let Some(mut session) = self.take_session(generation) else {
            return;
        };
        let pending = !session.media.remote_applied() || session.media.transport_connected_at().is_none();
        let transition = if pending {
            session.media.apply(MediaInput::NegotiationTimeout)
        } else {
            None
        };
        if transition.is_some() {
            session.failure_message = Some(format!(
                "negotiation did not complete within {:?}",
                self.config.get().session.negotiation_timeout()
            ));
        }
        self.settle(session, transition).await;
    }

    async fn on_quality_tick(&mut self, generation: u64) {
        let Some(mut session) = self.take_session(generation) else {
            return;
        };
        if !matches!(session.state(), MediaState::Connected | MediaState::Stalled) {
            self.session = Some(session);
            return;
        }

        let signals = session.monitor.tick(
            Instant::now(),
            session.last_frame_at,
            self.deps.sink.current_frame(),
        );

        let mut transition = None;
        for signal in signals {
            let next = match signal {
                QualitySignal::ScoreChanged {
                    score,
                    brightness,
                    bad_ticks,
                } => {
                    self.on_score_changed(&mut session, score, brightness, bad_ticks);
                    None
                }
                QualitySignal::SoftStall { since } => {
                    debug!(camera = %self.camera, "No frames for {:?}", since);
                    session.media.apply(MediaInput::SoftStall)
                }
                QualitySignal::HardStall { since } => {
                    session.failure_message = Some(format!("no frames for {:?}", since));
                    session.media.apply(MediaInput::HardStall)
                }
                QualitySignal::HardFailure { bad_ticks } => session.fail(
                    FailureReason::MediaFrozen,
                    format!("{} consecutive black or frozen samples", bad_ticks),
                ),
            };
            if next.is_some() {
                transition = next;
                break;
            }
        }
        self.settle(session, transition).await;
    }

    fn on_score_changed(
        &self,
        session: &mut ConnectionSession,
        score: QualityScore,
        brightness: f32,
        bad_ticks: u32,
    ) {
        if score == QualityScore::Good {
            info!(camera = %self.camera, "Video quality recovered");
        } else {
            warn!(
                camera = %self.camera,
                attempt = session.attempt,
                brightness,
                bad_ticks,
                "Video quality {}", score
            );
        }
        session.quality = score;
        session.heartbeat.set_quality(score, Some(brightness));
        self.deps.sink.on_quality(score);
        self.deps.events.publish(SystemEvent::ConnectionQualityChanged {
            camera: self.camera.clone(),
            score,
            brightness,
            bad_ticks,
        });
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn schedule(&self, token: &CancellationToken, delay: Duration, msg: ActorMsg) {
        let tx = self.tx.clone();
        let token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(msg);
                }
            }
        });
    }

    fn set_status(&self, status: ConnectionStatus, message: Option<&str>) {
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            self.deps.sink.on_status(status, message);
        }
    }

    fn publish_state(&self, session: &ConnectionSession, reason: Option<FailureReason>) {
        let state = session.state();
        self.deps.events.publish(SystemEvent::ConnectionStateChanged {
            camera: self.camera.clone(),
            generation: session.generation,
            status: state.status(),
            state: state.to_string(),
            reason: reason.map(|r| r.code().to_string()),
        });
    }
}
