//! WebRTC peer connection backend
//!
//! [`PeerBackend`] is the seam between [`MediaSession`](super::session::MediaSession)
//! and the actual peer connection. [`RtcPeer`] implements it on webrtc-rs as a
//! receive-only consumer of the camera's video track.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_remote::TrackRemote;

use super::config::WebRtcConfig;
use super::signaling::IceCandidate;
use crate::error::{AppError, Result};

/// Frame notifications closer together than this are coalesced
const FRAME_NOTIFY_INTERVAL: Duration = Duration::from_millis(250);

/// Peer connection state as reported by the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerState::New => write!(f, "new"),
            PeerState::Connecting => write!(f, "connecting"),
            PeerState::Connected => write!(f, "connected"),
            PeerState::Disconnected => write!(f, "disconnected"),
            PeerState::Failed => write!(f, "failed"),
            PeerState::Closed => write!(f, "closed"),
        }
    }
}

/// Events raised by a peer
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    State(PeerState),
    /// Local ICE candidate to trickle to the device
    LocalCandidate(IceCandidate),
    /// Remote track negotiated
    TrackAdded { kind: String },
    /// A complete frame was received on the video track
    FrameArrived,
}

pub type PeerEventHandler = Arc<dyn Fn(PeerEvent) + Send + Sync>;

/// Operations the media session needs from a peer connection
#[async_trait]
pub trait PeerBackend: Send + Sync {
    /// Generate a raw local offer
    async fn create_offer(&self) -> Result<String>;
    /// Apply the (possibly rewritten) local offer
    async fn set_local_offer(&self, sdp: String) -> Result<()>;
    /// Apply the repaired remote answer
    async fn set_remote_answer(&self, sdp: String) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    /// Release the connection and its tracks; idempotent
    async fn close(&self) -> Result<()>;
}

/// Creates one peer per connection attempt
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self, camera: &str, handler: PeerEventHandler) -> Result<Arc<dyn PeerBackend>>;
}

/// webrtc-rs peer factory
pub struct RtcPeerFactory {
    config: WebRtcConfig,
}

impl RtcPeerFactory {
    pub fn new(config: WebRtcConfig) -> Self {
        Self { config }
    }

    fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut ice_servers = vec![];

        for stun_url in &self.config.stun_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }

        for turn in &self.config.turn_servers {
            ice_servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        ice_servers
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(&self, camera: &str, handler: PeerEventHandler) -> Result<Arc<dyn PeerBackend>> {
        let peer = RtcPeer::new(&self.config, self.ice_servers(), camera, handler).await?;
        Ok(Arc::new(peer))
    }
}

/// Receive-only webrtc-rs peer connection
pub struct RtcPeer {
    camera: String,
    pc: Arc<RTCPeerConnection>,
    closed: AtomicBool,
}

impl RtcPeer {
    async fn new(
        config: &WebRtcConfig,
        ice_servers: Vec<RTCIceServer>,
        camera: &str,
        handler: PeerEventHandler,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            AppError::WebRtcError(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?;
        let pc = Arc::new(pc);

        let recvonly = || RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Recvonly,
            send_encodings: vec![],
        };
        pc.add_transceiver_from_kind(RTPCodecType::Video, Some(recvonly()))
            .await
            .map_err(|e| AppError::Resource(format!("Failed to add video transceiver: {}", e)))?;
        if config.enable_audio {
            pc.add_transceiver_from_kind(RTPCodecType::Audio, Some(recvonly()))
                .await
                .map_err(|e| {
                    AppError::Resource(format!("Failed to add audio transceiver: {}", e))
                })?;
        }

        let peer = Self {
            camera: camera.to_string(),
            pc,
            closed: AtomicBool::new(false),
        };
        peer.setup_event_handlers(handler);
        Ok(peer)
    }

    fn setup_event_handlers(&self, handler: PeerEventHandler) {
        let state_handler = handler.clone();
        let camera = self.camera.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                if let Some(state) = map_state(s) {
                    debug!(camera = %camera, "Peer connection state: {}", state);
                    state_handler(PeerEvent::State(state));
                }
                Box::pin(async {})
            }));

        let candidate_handler = handler.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(json) = candidate.and_then(|c| c.to_json().ok()) {
                    candidate_handler(PeerEvent::LocalCandidate(IceCandidate {
                        candidate: json.candidate,
                        sdp_mid: json.sdp_mid,
                        sdp_mline_index: json.sdp_mline_index,
                        username_fragment: json.username_fragment,
                    }));
                }
                Box::pin(async {})
            }));

        let camera = self.camera.clone();
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = track.kind();
            info!(camera = %camera, "Remote {} track {} added", kind, track.id());
            handler(PeerEvent::TrackAdded {
                kind: kind.to_string(),
            });
            if kind == RTPCodecType::Video {
                tokio::spawn(read_video_track(track, handler.clone(), camera.clone()));
            }
            Box::pin(async {})
        }));
    }
}

fn map_state(s: RTCPeerConnectionState) -> Option<PeerState> {
    match s {
        RTCPeerConnectionState::New => Some(PeerState::New),
        RTCPeerConnectionState::Connecting => Some(PeerState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerState::Closed),
        _ => None,
    }
}

/// Drain RTP and report frame boundaries (marker bit)
async fn read_video_track(track: Arc<TrackRemote>, handler: PeerEventHandler, camera: String) {
    let mut last_notify: Option<Instant> = None;
    let mut packets = 0u64;

    loop {
        match track.read_rtp().await {
            Ok((packet, _attributes)) => {
                packets += 1;
                if !packet.header.marker {
                    continue;
                }
                let now = Instant::now();
                if last_notify.map_or(true, |t| now.duration_since(t) >= FRAME_NOTIFY_INTERVAL) {
                    last_notify = Some(now);
                    handler(PeerEvent::FrameArrived);
                }
            }
            Err(e) => {
                debug!(camera = %camera, "Video track ended after {} packets: {}", packets, e);
                break;
            }
        }
    }
}

#[async_trait]
impl PeerBackend for RtcPeer {
    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to create offer: {}", e)))?;
        Ok(offer.sdp)
    }

    async fn set_local_offer(&self, sdp: String) -> Result<()> {
        let offer = RTCSessionDescription::offer(sdp)
            .map_err(|e| AppError::Negotiation(format!("Invalid local offer: {}", e)))?;
        self.pc.set_local_description(offer).await.map_err(|e| {
            AppError::Negotiation(format!("Failed to set local description: {}", e))
        })
    }

    async fn set_remote_answer(&self, sdp: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| AppError::Negotiation(format!("Invalid SDP answer: {}", e)))?;
        self.pc.set_remote_description(answer).await.map_err(|e| {
            AppError::Negotiation(format!("Failed to set remote description: {}", e))
        })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to close peer connection: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offer_is_receive_only_video() {
        let factory = RtcPeerFactory::new(WebRtcConfig::default());
        let handler: PeerEventHandler = Arc::new(|_| {});
        let peer = factory.create("front", handler).await.unwrap();

        let offer = peer.create_offer().await.unwrap();
        assert!(offer.contains("m=video"));
        assert!(offer.contains("a=recvonly"));
        assert!(!offer.contains("m=audio"));

        peer.close().await.unwrap();
        peer.close().await.unwrap();
    }

    #[test]
    fn test_ice_servers_from_config() {
        let mut config = WebRtcConfig::default();
        config.stun_servers = vec!["stun:stun.l.google.com:19302".to_string()];
        config.turn_servers = vec![super::super::config::TurnServer::new(
            "turn:10.0.0.1:3478".to_string(),
            "user".to_string(),
            "pass".to_string(),
        )];
        let servers = RtcPeerFactory::new(config).ice_servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].username, "user");
    }
}
