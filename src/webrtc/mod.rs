//! WebRTC consumer side of the camera link
//!
//! ```text
//! SignalingTransport (WebSocket)
//!        |  offer / answer / candidates
//!        v
//! MediaSession -- SdpNegotiator (offer synthesis, answer repair)
//!        |
//!        v
//! PeerBackend (webrtc-rs, receive-only)
//!        |
//!        +------- FrameArrived ------> ReconnectionSupervisor
//! ```

pub mod config;
pub mod peer;
pub mod sdp;
pub mod session;
pub mod signaling;
pub mod transport;

pub use config::{VideoCodec, WebRtcConfig};
pub use peer::{PeerBackend, PeerEvent, PeerFactory, PeerState, RtcPeerFactory};
pub use sdp::{OfferConstraints, SdpNegotiator, SdpRepair, SessionDescription};
pub use session::{AnswerApplied, FailureReason, MediaSession, MediaState};
pub use signaling::{ConnectionStatus, IceCandidate, SdpAnswer, SdpOffer, SignalingEnvelope};
pub use transport::{SignalingTransport, TransportConnector, WsConnector};
