//! Connection event types
//!
//! Everything the connection core reports to the outside world goes
//! through these variants; protocol payloads never do.

use serde::{Deserialize, Serialize};

use crate::connection::quality::QualityScore;
use crate::webrtc::signaling::ConnectionStatus;

/// Connection event enumeration
///
/// Serialized as:
/// ```json
/// {
///   "event": "connection.reconnecting",
///   "data": { "camera": "front", "attempt": 2, "delay_ms": 2000, "reason": "transport_error", "cooldown": false }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SystemEvent {
    // ============================================================================
    // Connection Events
    // ============================================================================
    /// Consumer-visible status changed
    #[serde(rename = "connection.state_changed")]
    ConnectionStateChanged {
        camera: String,
        /// Session generation that produced the change
        generation: u64,
        status: ConnectionStatus,
        /// Internal media state name, for diagnostics
        state: String,
        /// Failure reason code when the session failed
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// A retry has been scheduled
    #[serde(rename = "connection.reconnecting")]
    ConnectionReconnecting {
        camera: String,
        /// Attempt number of the upcoming session
        attempt: u32,
        delay_ms: u64,
        /// Failure reason code of the session that ended
        reason: String,
        /// The delay is a rapid-failure cooldown rather than backoff
        cooldown: bool,
    },

    /// Frame quality score changed
    #[serde(rename = "connection.quality_changed")]
    ConnectionQualityChanged {
        camera: String,
        score: QualityScore,
        /// Mean luma of the latest sample (0-255)
        brightness: f32,
        /// Consecutive bad samples at the time of the change
        bad_ticks: u32,
    },

    // ============================================================================
    // Negotiation Events
    // ============================================================================
    /// Remote answer needed structural repair before it could be applied
    #[serde(rename = "negotiation.repaired")]
    NegotiationRepaired { camera: String, repairs: Vec<String> },

    /// Local offer had no media section and one was synthesized
    #[serde(rename = "negotiation.offer_synthesized")]
    OfferSynthesized { camera: String, codec: String },

    /// Negotiation failed for the current attempt
    #[serde(rename = "negotiation.failed")]
    NegotiationFailed {
        camera: String,
        /// Attempt number of the failed session
        attempt: u32,
        reason: String,
        message: String,
    },

    // ============================================================================
    // Heartbeat Events
    // ============================================================================
    /// A liveness beacon could not be delivered
    #[serde(rename = "heartbeat.failed")]
    HeartbeatFailed {
        session_id: String,
        message: String,
        /// The failed request was the teardown disconnect
        disconnect: bool,
    },

    // ============================================================================
    // System Events
    // ============================================================================
    /// System error or warning
    #[serde(rename = "system.error")]
    SystemError {
        /// Module that generated the error: "signaling", "session", "heartbeat"
        module: String,
        /// Severity: "warning", "error"
        severity: String,
        message: String,
    },
}

impl SystemEvent {
    /// Get the event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::ConnectionStateChanged { .. } => "connection.state_changed",
            Self::ConnectionReconnecting { .. } => "connection.reconnecting",
            Self::ConnectionQualityChanged { .. } => "connection.quality_changed",
            Self::NegotiationRepaired { .. } => "negotiation.repaired",
            Self::OfferSynthesized { .. } => "negotiation.offer_synthesized",
            Self::NegotiationFailed { .. } => "negotiation.failed",
            Self::HeartbeatFailed { .. } => "heartbeat.failed",
            Self::SystemError { .. } => "system.error",
        }
    }

    /// Check if event name matches a topic pattern (`*`, `connection.*` or exact)
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();

        if let Some(prefix) = topic.strip_suffix(".*") {
            event_name
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.'))
        } else {
            event_name == topic
        }
    }
}
