use std::time::Duration;

use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Signaling connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Signaling transport error: {0}")]
    Transport(String),

    #[error("Signaling transport closed")]
    TransportClosed,

    #[error("Session description has no media section")]
    NoMediaSection,

    #[error("Unrepairable session description: {0}")]
    SdpRepair(String),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    #[error("Media resource error: {0}")]
    Resource(String),

    #[error("Heartbeat error: {0}")]
    Heartbeat(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Coarse error classes used by the reconnection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Socket failed to open or dropped; recoverable through backoff
    Transport,
    /// Protocol-level defect; terminal for the current attempt only
    Negotiation,
    /// Track/stream acquisition failure; recoverable by recreating the session
    Resource,
    /// Local misconfiguration or bookkeeping failure
    Internal,
}

impl AppError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            AppError::ConnectTimeout(_)
            | AppError::Transport(_)
            | AppError::TransportClosed
            | AppError::Http(_)
            | AppError::Heartbeat(_) => ErrorCategory::Transport,
            AppError::NoMediaSection | AppError::SdpRepair(_) | AppError::Negotiation(_) => {
                ErrorCategory::Negotiation
            }
            AppError::WebRtcError(_) | AppError::Resource(_) => ErrorCategory::Resource,
            AppError::Config(_) | AppError::Io(_) | AppError::Serialization(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Whether the error ends the current attempt without retrying the same description
    pub fn is_terminal_for_attempt(&self) -> bool {
        self.category() == ErrorCategory::Negotiation
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            AppError::ConnectTimeout(Duration::from_secs(10)).category(),
            ErrorCategory::Transport
        );
        assert_eq!(AppError::NoMediaSection.category(), ErrorCategory::Negotiation);
        assert_eq!(
            AppError::Resource("track".into()).category(),
            ErrorCategory::Resource
        );
        assert!(AppError::SdpRepair("bundle".into()).is_terminal_for_attempt());
        assert!(!AppError::TransportClosed.is_terminal_for_attempt());
    }
}
