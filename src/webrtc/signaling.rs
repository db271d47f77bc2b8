//! WebRTC signaling types and messages

use serde::{Deserialize, Serialize};
use typeshare::typeshare;

/// Signaling envelope exchanged over the signaling transport
///
/// ```json
/// {"type": "ice-candidate", "candidate": "candidate:1 1 UDP ...", "sdpMid": "0", "sdpMLineIndex": 0}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingEnvelope {
    /// Server-assigned session identifier
    ConnectionId(ConnectionId),
    /// SDP offer (client to server)
    Offer(SdpOffer),
    /// SDP answer (server to client)
    Answer(SdpAnswer),
    /// Trickled ICE candidate (either direction)
    IceCandidate(IceCandidate),
    /// Server-side error
    Error(SignalingError),
    /// Peer requested close
    Close,
}

impl SignalingEnvelope {
    /// Wire name of the envelope type, for logs
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingEnvelope::ConnectionId(_) => "connection-id",
            SignalingEnvelope::Offer(_) => "offer",
            SignalingEnvelope::Answer(_) => "answer",
            SignalingEnvelope::IceCandidate(_) => "ice-candidate",
            SignalingEnvelope::Error(_) => "error",
            SignalingEnvelope::Close => "close",
        }
    }
}

/// Session identifier assigned by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionId {
    pub id: String,
}

/// SDP Offer from client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdpOffer {
    /// SDP content
    pub sdp: String,
}

impl SdpOffer {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self { sdp: sdp.into() }
    }
}

/// SDP Answer from server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdpAnswer {
    /// SDP content
    pub sdp: String,
}

impl SdpAnswer {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self { sdp: sdp.into() }
    }
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }
}

/// Signaling error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingError {
    /// Error message
    pub message: String,
    /// Optional numeric code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u32>,
}

impl SignalingError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }
}

/// Connection status shown to the consumer
///
/// Deliberately coarse: protocol internals never cross this boundary.
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Stalled,
    Disconnected,
    Error,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Stalled => write!(f, "stalled"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Error => write!(f, "error"),
        }
    }
}
