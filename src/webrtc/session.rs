//! Per-attempt media session
//!
//! A [`MediaSession`] owns one peer connection and drives it from offer to
//! first frame. All transitions go through [`MediaState::apply`], so the
//! supervisor sees every state change exactly once and in order.

use std::fmt;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::VideoCodec;
use super::peer::{PeerBackend, PeerState};
use super::sdp::{OfferConstraints, SdpNegotiator, SdpRepair, SessionDescription};
use super::signaling::{ConnectionStatus, IceCandidate, SdpOffer, SignalingEnvelope};
use super::transport::SignalingTransport;
use crate::error::{AppError, ErrorCategory, Result};
use crate::events::{EventBus, SystemEvent};

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    ConnectTimeout,
    TransportError,
    /// Signaling closed before negotiation finished
    SignalingClosed,
    /// Server sent an error envelope
    ServerError,
    Negotiation,
    NegotiationTimeout,
    /// Transport connected but no frame arrived within the grace period
    NoMedia,
    TransportLost,
    HardStall,
    MediaFrozen,
    Resource,
}

/// Log/event severity of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

impl FailureReason {
    /// Stable code used in events
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::ConnectTimeout => "connect_timeout",
            FailureReason::TransportError => "transport_error",
            FailureReason::SignalingClosed => "signaling_closed",
            FailureReason::ServerError => "server_error",
            FailureReason::Negotiation => "negotiation",
            FailureReason::NegotiationTimeout => "negotiation_timeout",
            FailureReason::NoMedia => "no_media",
            FailureReason::TransportLost => "transport_lost",
            FailureReason::HardStall => "hard_stall",
            FailureReason::MediaFrozen => "media_frozen",
            FailureReason::Resource => "resource",
        }
    }

    /// Negotiation defects are reported louder than network churn
    pub fn severity(&self) -> Severity {
        match self {
            FailureReason::Negotiation => Severity::Error,
            _ => Severity::Warning,
        }
    }

    /// Classify an error that ended an attempt
    pub fn from_error(err: &AppError) -> Self {
        match err {
            AppError::ConnectTimeout(_) => FailureReason::ConnectTimeout,
            AppError::TransportClosed => FailureReason::SignalingClosed,
            _ => match err.category() {
                ErrorCategory::Transport => FailureReason::TransportError,
                ErrorCategory::Negotiation => FailureReason::Negotiation,
                ErrorCategory::Resource | ErrorCategory::Internal => FailureReason::Resource,
            },
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Media session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaState {
    Idle,
    Connecting,
    Connected,
    /// Frames stopped for longer than the soft threshold
    Stalled,
    /// Network path lost while media was healthy
    Disconnected,
    Failed(FailureReason),
    Closed,
}

impl MediaState {
    pub fn name(&self) -> &'static str {
        match self {
            MediaState::Idle => "idle",
            MediaState::Connecting => "connecting",
            MediaState::Connected => "connected",
            MediaState::Stalled => "stalled",
            MediaState::Disconnected => "disconnected",
            MediaState::Failed(_) => "failed",
            MediaState::Closed => "closed",
        }
    }

    /// The session is over and must be torn down
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MediaState::Disconnected | MediaState::Failed(_) | MediaState::Closed
        )
    }

    pub fn failure(&self) -> Option<FailureReason> {
        match self {
            MediaState::Failed(reason) => Some(*reason),
            MediaState::Disconnected => Some(FailureReason::TransportLost),
            _ => None,
        }
    }

    /// Coarse status shown to the consumer
    pub fn status(&self) -> ConnectionStatus {
        match self {
            MediaState::Idle | MediaState::Connecting => ConnectionStatus::Connecting,
            MediaState::Connected => ConnectionStatus::Connected,
            MediaState::Stalled => ConnectionStatus::Stalled,
            MediaState::Failed(reason) if reason.severity() == Severity::Error => {
                ConnectionStatus::Error
            }
            MediaState::Disconnected | MediaState::Failed(_) | MediaState::Closed => {
                ConnectionStatus::Disconnected
            }
        }
    }

    /// Next state for `input`, or `None` when the input does not apply
    pub fn apply(&self, input: MediaInput) -> Option<MediaState> {
        use MediaInput as I;
        use MediaState as S;

        match (*self, input) {
            (S::Closed, _) => None,
            (_, I::Close) => Some(S::Closed),
            (S::Failed(_) | S::Disconnected, _) => None,
            (S::Idle, I::Open) => Some(S::Connecting),
            (S::Connecting, I::MediaReady) => Some(S::Connected),
            (S::Connecting, I::GraceExpired) => Some(S::Failed(FailureReason::NoMedia)),
            (S::Connecting, I::NegotiationTimeout) => {
                Some(S::Failed(FailureReason::NegotiationTimeout))
            }
            (S::Connecting, I::TransportLost) => Some(S::Failed(FailureReason::TransportLost)),
            (S::Connected, I::TransportLost) => Some(S::Disconnected),
            // A stall that ends in network loss is attributed to the stall
            (S::Stalled, I::TransportLost) => Some(S::Failed(FailureReason::HardStall)),
            (S::Connected, I::SoftStall) => Some(S::Stalled),
            (S::Stalled, I::FramesResumed) => Some(S::Connected),
            (S::Connected | S::Stalled, I::HardStall) => Some(S::Failed(FailureReason::HardStall)),
            (S::Idle | S::Connecting | S::Connected | S::Stalled, I::Fail(reason)) => {
                Some(S::Failed(reason))
            }
            _ => None,
        }
    }
}

impl fmt::Display for MediaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaState::Failed(reason) => write!(f, "failed({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// Inputs that drive [`MediaState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaInput {
    Open,
    /// Remote description applied and a frame observed
    MediaReady,
    GraceExpired,
    NegotiationTimeout,
    SoftStall,
    FramesResumed,
    HardStall,
    TransportLost,
    Fail(FailureReason),
    Close,
}

/// A state change produced by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: MediaState,
    pub to: MediaState,
}

/// Result of applying a remote answer
#[derive(Debug, Default)]
pub struct AnswerApplied {
    pub repairs: Vec<SdpRepair>,
    /// Set when a frame was already seen and the session became connected
    pub transition: Option<Transition>,
}

/// One peer connection and its negotiation bookkeeping
pub struct MediaSession {
    camera: String,
    /// Reconnect attempt this session belongs to, for log tagging
    attempt: u32,
    peer: Arc<dyn PeerBackend>,
    negotiator: SdpNegotiator,
    events: EventBus,
    state: MediaState,
    remote_applied: bool,
    frame_seen: bool,
    transport_connected_at: Option<Instant>,
    pending_candidates: Vec<IceCandidate>,
}

impl MediaSession {
    pub fn new(camera: &str, peer: Arc<dyn PeerBackend>, codec: VideoCodec, events: EventBus) -> Self {
        Self {
            camera: camera.to_string(),
            attempt: 0,
            peer,
            negotiator: SdpNegotiator::new(codec),
            events,
            state: MediaState::Idle,
            remote_applied: false,
            frame_seen: false,
            transport_connected_at: None,
            pending_candidates: Vec::new(),
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn state(&self) -> MediaState {
        self.state
    }

    pub fn remote_applied(&self) -> bool {
        self.remote_applied
    }

    /// When the peer reported a transport-level connect
    pub fn transport_connected_at(&self) -> Option<Instant> {
        self.transport_connected_at
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Feed an input through the state machine
    pub fn apply(&mut self, input: MediaInput) -> Option<Transition> {
        let from = self.state;
        let to = from.apply(input)?;
        self.state = to;
        debug!(camera = %self.camera, "Media state {} -> {} ({:?})", from, to, input);
        Some(Transition { from, to })
    }

    /// Create the local offer, repair it and send it to the device
    pub async fn negotiate(
        &mut self,
        transport: &dyn SignalingTransport,
        constraints: &OfferConstraints,
    ) -> Result<()> {
        let raw = self.peer.create_offer().await?;
        let outcome = self.negotiator.build_offer(&raw, constraints)?;
        if outcome.synthesized {
            self.events.publish(SystemEvent::OfferSynthesized {
                camera: self.camera.clone(),
                codec: constraints.codec.to_string(),
            });
        }

        let sdp = outcome.description.to_string();
        self.peer.set_local_offer(sdp.clone()).await?;
        transport
            .send(SignalingEnvelope::Offer(SdpOffer::new(sdp)))
            .await?;
        info!(camera = %self.camera, "Offer sent");
        Ok(())
    }

    /// Repair and apply the remote answer, then flush queued candidates
    ///
    /// When the repaired answer is still rejected, grouping lines are
    /// stripped and the answer is applied once more before giving up.
    pub async fn apply_answer(&mut self, raw: &str) -> Result<AnswerApplied> {
        if self.remote_applied {
            warn!(camera = %self.camera, attempt = self.attempt, "Ignoring duplicate answer");
            return Ok(AnswerApplied::default());
        }

        let (description, repairs) = match self.negotiator.repair_answer(raw) {
            Ok(outcome) => {
                if outcome.was_repaired() {
                    self.events.publish(SystemEvent::NegotiationRepaired {
                        camera: self.camera.clone(),
                        repairs: outcome.repairs.iter().map(|r| r.to_string()).collect(),
                    });
                }
                match self.peer.set_remote_answer(outcome.description.to_string()).await {
                    Ok(()) => {
                        let transition = self.on_remote_applied().await;
                        return Ok(AnswerApplied {
                            repairs: outcome.repairs,
                            transition,
                        });
                    }
                    Err(e) => {
                        warn!(camera = %self.camera, attempt = self.attempt, "Repaired answer rejected: {}", e);
                        (outcome.description, outcome.repairs)
                    }
                }
            }
            Err(AppError::NoMediaSection) => return Err(AppError::NoMediaSection),
            Err(e) => {
                warn!(camera = %self.camera, attempt = self.attempt, "Answer repair incomplete: {}", e);
                (SessionDescription::parse(raw), Vec::new())
            }
        };

        let mut fallback = description;
        let stripped = fallback.strip_grouping();
        info!(
            camera = %self.camera,
            "Retrying answer without grouping ({} lines removed)", stripped
        );
        self.peer
            .set_remote_answer(fallback.to_string())
            .await
            .map_err(|e| AppError::SdpRepair(format!("answer rejected after fallback: {}", e)))?;
        let transition = self.on_remote_applied().await;
        Ok(AnswerApplied {
            repairs,
            transition,
        })
    }

    async fn on_remote_applied(&mut self) -> Option<Transition> {
        self.remote_applied = true;
        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            debug!(camera = %self.camera, "Flushing {} queued candidates", pending.len());
        }
        for candidate in pending {
            self.add_candidate_now(candidate).await;
        }
        // A frame may have beaten the answer
        if self.state == MediaState::Connecting {
            self.try_ready()
        } else {
            None
        }
    }

    /// Add a remote candidate, queueing it until the answer is applied
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.remote_applied {
            self.add_candidate_now(candidate).await;
        } else {
            self.pending_candidates.push(candidate);
        }
    }

    async fn add_candidate_now(&self, candidate: IceCandidate) {
        if let Err(e) = self.peer.add_ice_candidate(candidate).await {
            warn!(camera = %self.camera, attempt = self.attempt, "Failed to add remote candidate: {}", e);
        }
    }

    /// Peer connection state from the stack
    pub fn on_peer_state(&mut self, state: PeerState, now: Instant) -> Option<Transition> {
        match state {
            PeerState::Connected => {
                if self.transport_connected_at.is_none() {
                    self.transport_connected_at = Some(now);
                }
                self.try_ready()
            }
            PeerState::Disconnected | PeerState::Failed => self.apply(MediaInput::TransportLost),
            PeerState::New | PeerState::Connecting | PeerState::Closed => None,
        }
    }

    /// A frame arrived on the video track
    pub fn on_frame(&mut self) -> Option<Transition> {
        self.frame_seen = true;
        match self.state {
            MediaState::Stalled => self.apply(MediaInput::FramesResumed),
            MediaState::Connecting => self.try_ready(),
            _ => None,
        }
    }

    fn try_ready(&mut self) -> Option<Transition> {
        if self.remote_applied && self.frame_seen {
            self.apply(MediaInput::MediaReady)
        } else {
            None
        }
    }

    /// Close the session and release the peer
    pub async fn close(&mut self) -> Option<Transition> {
        let transition = self.apply(MediaInput::Close);
        if let Err(e) = self.peer.close().await {
            warn!(camera = %self.camera, attempt = self.attempt, "Failed to close peer: {}", e);
        }
        transition
    }
}
