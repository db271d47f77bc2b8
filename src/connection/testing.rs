//! In-memory doubles for the connection seams

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::heartbeat::{BeaconKind, BeaconSink, HeartbeatBeacon, HeartbeatResponse};
use super::quality::QualityScore;
use super::sink::FrameSink;
use crate::error::{AppError, Result};
use crate::video::{PixelFormat, Resolution, VideoFrame};
use crate::webrtc::peer::{PeerBackend, PeerEvent, PeerEventHandler, PeerFactory, PeerState};
use crate::webrtc::signaling::{
    ConnectionId, ConnectionStatus, IceCandidate, SdpAnswer, SignalingEnvelope,
};
use crate::webrtc::transport::{
    MessageHandler, SignalingTransport, TransportConnector, TransportEvent, TransportState,
};

pub const VALID_OFFER: &str = "v=0\r\n\
o=- 1001 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=recvonly\r\n\
a=rtcp-mux\r\n\
a=rtpmap:96 H264/90000\r\n";

pub const VALID_ANSWER: &str = "v=0\r\n\
o=- 4215 2 IN IP4 10.0.0.2\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0\r\n\
a=msid-semantic: WMS cam\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
c=IN IP4 0.0.0.0\r\n\
a=ice-ufrag:f00d\r\n\
a=ice-pwd:0123456789abcdef01234567\r\n\
a=setup:active\r\n\
a=mid:0\r\n\
a=sendonly\r\n\
a=rtcp-mux\r\n\
a=rtpmap:96 H264/90000\r\n";

/// Grey test frame filled with `level`
pub fn grey_frame(level: u8, sequence: u64) -> VideoFrame {
    VideoFrame::from_vec(
        vec![level; 64 * 48],
        Resolution::new(64, 48),
        PixelFormat::Grey,
        0,
        sequence,
    )
}

// ============================================================================
// Beacons
// ============================================================================

#[derive(Default)]
pub struct RecordingBeaconSink {
    sent: Mutex<Vec<(HeartbeatBeacon, BeaconKind)>>,
    failing: AtomicBool,
}

impl RecordingBeaconSink {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(HeartbeatBeacon, BeaconKind)> {
        self.sent.lock().clone()
    }

    pub fn count(&self, kind: BeaconKind) -> usize {
        self.sent.lock().iter().filter(|(_, k)| *k == kind).count()
    }
}

#[async_trait]
impl BeaconSink for RecordingBeaconSink {
    async fn send(&self, beacon: HeartbeatBeacon, kind: BeaconKind) -> Result<HeartbeatResponse> {
        self.sent.lock().push((beacon, kind));
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::Heartbeat("device unreachable".into()));
        }
        Ok(HeartbeatResponse::ok())
    }
}

// ============================================================================
// Signaling
// ============================================================================

/// Transport that records sent envelopes and can answer offers by itself
#[derive(Default)]
pub struct FakeTransport {
    handler: Option<MessageHandler>,
    session_id: String,
    answer: Option<String>,
    sent: Mutex<Vec<SignalingEnvelope>>,
    closed: AtomicBool,
}

impl FakeTransport {
    pub fn sent(&self) -> Vec<SignalingEnvelope> {
        self.sent.lock().clone()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Deliver an event as if it came from the socket
    pub fn inject(&self, event: TransportEvent) {
        if let Some(handler) = &self.handler {
            handler(event);
        }
    }

    pub fn inject_message(&self, envelope: SignalingEnvelope) {
        self.inject(TransportEvent::Message(envelope));
    }
}

#[async_trait]
impl SignalingTransport for FakeTransport {
    async fn send(&self, envelope: SignalingEnvelope) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let is_offer = matches!(envelope, SignalingEnvelope::Offer(_));
        self.sent.lock().push(envelope);

        if let (true, Some(answer), Some(handler)) = (is_offer, &self.answer, &self.handler) {
            handler(TransportEvent::Message(SignalingEnvelope::ConnectionId(
                ConnectionId {
                    id: self.session_id.clone(),
                },
            )));
            handler(TransportEvent::Message(SignalingEnvelope::Answer(
                SdpAnswer::new(answer.clone()),
            )));
        }
        Ok(())
    }

    fn close(&self, _reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Connector with scripted failures
pub struct FakeConnector {
    failures: AtomicUsize,
    opens: AtomicUsize,
    auto_answer: AtomicBool,
    answer: Mutex<String>,
    transports: Mutex<Vec<Arc<FakeTransport>>>,
}

impl Default for FakeConnector {
    fn default() -> Self {
        Self {
            failures: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
            auto_answer: AtomicBool::new(true),
            answer: Mutex::new(VALID_ANSWER.to_string()),
            transports: Mutex::new(Vec::new()),
        }
    }
}

impl FakeConnector {
    /// Fail the next `n` opens
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn set_auto_answer(&self, enabled: bool) {
        self.auto_answer.store(enabled, Ordering::SeqCst);
    }

    pub fn set_answer(&self, answer: &str) {
        *self.answer.lock() = answer.to_string();
    }

    /// Number of open attempts, failed ones included
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn transports(&self) -> Vec<Arc<FakeTransport>> {
        self.transports.lock().clone()
    }

    pub fn last_transport(&self) -> Option<Arc<FakeTransport>> {
        self.transports.lock().last().cloned()
    }
}

#[async_trait]
impl TransportConnector for FakeConnector {
    async fn open(
        &self,
        _target_id: &str,
        handler: MessageHandler,
    ) -> Result<Arc<dyn SignalingTransport>> {
        let n = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| f.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AppError::Transport("connection refused".into()));
        }

        let answer = self
            .auto_answer
            .load(Ordering::SeqCst)
            .then(|| self.answer.lock().clone());
        let transport = Arc::new(FakeTransport {
            handler: Some(handler.clone()),
            session_id: format!("session-{}", n),
            answer,
            ..Default::default()
        });
        handler(TransportEvent::State(TransportState::Open));
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

// ============================================================================
// Peers
// ============================================================================

/// Peer that connects as soon as an answer is applied and then emits frames
pub struct FakePeer {
    handler: Option<PeerEventHandler>,
    frame_interval: Duration,
    frames_paused: Arc<AtomicBool>,
    raw_offer: Mutex<String>,
    local_offer: Mutex<Option<String>>,
    remote_answer: Mutex<Option<String>>,
    rejected_answers: AtomicUsize,
    candidates: AtomicUsize,
    closed: CancellationToken,
}

impl FakePeer {
    /// Standalone peer without event delivery
    pub fn new() -> Self {
        Self {
            handler: None,
            frame_interval: Duration::from_millis(500),
            frames_paused: Arc::new(AtomicBool::new(false)),
            raw_offer: Mutex::new(VALID_OFFER.to_string()),
            local_offer: Mutex::new(None),
            remote_answer: Mutex::new(None),
            rejected_answers: AtomicUsize::new(0),
            candidates: AtomicUsize::new(0),
            closed: CancellationToken::new(),
        }
    }

    pub fn set_raw_offer(&self, sdp: &str) {
        *self.raw_offer.lock() = sdp.to_string();
    }

    /// Reject the next `n` remote answers
    pub fn reject_answers(&self, n: usize) {
        self.rejected_answers.store(n, Ordering::SeqCst);
    }

    pub fn local_offer(&self) -> Option<String> {
        self.local_offer.lock().clone()
    }

    pub fn remote_answer(&self) -> Option<String> {
        self.remote_answer.lock().clone()
    }

    pub fn candidates(&self) -> usize {
        self.candidates.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Raise a peer event as the stack would
    pub fn emit(&self, event: PeerEvent) {
        if let Some(handler) = &self.handler {
            handler(event);
        }
    }

    fn start_frames(&self, handler: PeerEventHandler) {
        let token = self.closed.clone();
        let paused = self.frames_paused.clone();
        let period = self.frame_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if !paused.load(Ordering::SeqCst) {
                            handler(PeerEvent::FrameArrived);
                        }
                    }
                }
            }
        });
    }
}

impl Default for FakePeer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerBackend for FakePeer {
    async fn create_offer(&self) -> Result<String> {
        Ok(self.raw_offer.lock().clone())
    }

    async fn set_local_offer(&self, sdp: String) -> Result<()> {
        *self.local_offer.lock() = Some(sdp);
        Ok(())
    }

    async fn set_remote_answer(&self, sdp: String) -> Result<()> {
        let rejected = self
            .rejected_answers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(AppError::Negotiation("remote description rejected".into()));
        }
        *self.remote_answer.lock() = Some(sdp);

        if let Some(handler) = &self.handler {
            handler(PeerEvent::State(PeerState::Connected));
            self.start_frames(handler.clone());
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<()> {
        self.candidates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        Ok(())
    }
}

pub struct FakePeerFactory {
    failures: AtomicUsize,
    frames_paused: Arc<AtomicBool>,
    peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl Default for FakePeerFactory {
    fn default() -> Self {
        Self {
            failures: AtomicUsize::new(0),
            frames_paused: Arc::new(AtomicBool::new(false)),
            peers: Mutex::new(Vec::new()),
        }
    }
}

impl FakePeerFactory {
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Stop or restart frame delivery on every peer
    pub fn pause_frames(&self, paused: bool) {
        self.frames_paused.store(paused, Ordering::SeqCst);
    }

    pub fn peers(&self) -> Vec<Arc<FakePeer>> {
        self.peers.lock().clone()
    }

    pub fn last_peer(&self) -> Option<Arc<FakePeer>> {
        self.peers.lock().last().cloned()
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(&self, _camera: &str, handler: PeerEventHandler) -> Result<Arc<dyn PeerBackend>> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AppError::Resource("camera track unavailable".into()));
        }

        let peer = Arc::new(FakePeer {
            handler: Some(handler),
            frames_paused: self.frames_paused.clone(),
            ..FakePeer::new()
        });
        self.peers.lock().push(peer.clone());
        Ok(peer)
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// Frame sink with either changing or frozen content
pub struct RecordingFrameSink {
    frozen: Mutex<Option<VideoFrame>>,
    sequence: AtomicU64,
    statuses: Mutex<Vec<ConnectionStatus>>,
    qualities: Mutex<Vec<QualityScore>>,
    pauses: AtomicUsize,
    resumes: AtomicUsize,
    messages: Mutex<Vec<String>>,
}

impl Default for RecordingFrameSink {
    fn default() -> Self {
        Self {
            frozen: Mutex::new(None),
            sequence: AtomicU64::new(0),
            statuses: Mutex::new(Vec::new()),
            qualities: Mutex::new(Vec::new()),
            pauses: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
            messages: Mutex::new(Vec::new()),
        }
    }
}

impl RecordingFrameSink {
    /// Always return the same mid-grey frame from now on
    pub fn freeze(&self) {
        *self.frozen.lock() = Some(grey_frame(128, 0));
    }

    pub fn statuses(&self) -> Vec<ConnectionStatus> {
        self.statuses.lock().clone()
    }

    pub fn last_status(&self) -> Option<ConnectionStatus> {
        self.statuses.lock().last().copied()
    }

    pub fn qualities(&self) -> Vec<QualityScore> {
        self.qualities.lock().clone()
    }

    pub fn pauses(&self) -> usize {
        self.pauses.load(Ordering::SeqCst)
    }

    pub fn resumes(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }

    /// Status messages, oldest first
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }
}

impl FrameSink for RecordingFrameSink {
    fn current_frame(&self) -> Option<VideoFrame> {
        if let Some(frame) = self.frozen.lock().clone() {
            return Some(frame);
        }
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let level = if sequence % 2 == 0 { 70 } else { 150 };
        Some(grey_frame(level, sequence))
    }

    fn on_status(&self, status: ConnectionStatus, message: Option<&str>) {
        self.statuses.lock().push(status);
        if let Some(message) = message {
            self.messages.lock().push(message.to_string());
        }
    }

    fn on_quality(&self, score: QualityScore) {
        self.qualities.lock().push(score);
    }

    fn pause(&self) {
        self.pauses.fetch_add(1, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
    }
}
