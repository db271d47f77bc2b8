use serde::{Deserialize, Serialize};
use std::time::Duration;
use typeshare::typeshare;

use crate::connection::backoff::BackoffPolicy;
use crate::error::{AppError, Result};
use crate::webrtc::config::WebRtcConfig;

/// Lower bound for the quality sampling interval; tighter sampling starves decode
pub const MIN_SAMPLE_INTERVAL_MS: u64 = 1000;

/// Main application configuration
#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Signaling channel settings
    pub signaling: SignalingConfig,
    /// Liveness beacon settings
    pub heartbeat: HeartbeatConfig,
    /// Frame quality watchdog settings
    pub quality: QualityConfig,
    /// Reconnection backoff settings
    pub reconnect: ReconnectConfig,
    /// Per-attempt session timing
    pub session: SessionConfig,
    /// Peer connection settings
    pub webrtc: WebRtcConfig,
}

impl AppConfig {
    /// Reject combinations the connection core cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.signaling.url.trim().is_empty() {
            return Err(AppError::Config("signaling.url must not be empty".into()));
        }
        if self.quality.sample_interval_ms < MIN_SAMPLE_INTERVAL_MS {
            return Err(AppError::Config(format!(
                "quality.sample_interval_ms must be >= {}",
                MIN_SAMPLE_INTERVAL_MS
            )));
        }
        if self.quality.poor_ticks == 0 || self.quality.hard_ticks < self.quality.poor_ticks {
            return Err(AppError::Config(
                "quality.hard_ticks must be >= quality.poor_ticks > 0".into(),
            ));
        }
        if self.quality.window < self.quality.hard_ticks as usize {
            return Err(AppError::Config(
                "quality.window must hold at least quality.hard_ticks samples".into(),
            ));
        }
        if self.quality.hard_stall_ms < self.quality.soft_stall_ms {
            return Err(AppError::Config(
                "quality.hard_stall_ms must be >= quality.soft_stall_ms".into(),
            ));
        }
        if !(self.reconnect.growth >= 1.0) {
            return Err(AppError::Config("reconnect.growth must be >= 1.0".into()));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(AppError::Config(
                "reconnect.max_delay_ms must be >= reconnect.base_delay_ms".into(),
            ));
        }
        if self.heartbeat.interval_ms == 0 {
            return Err(AppError::Config("heartbeat.interval_ms must be > 0".into()));
        }
        Ok(())
    }
}

/// Signaling configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// WebSocket base URL; the camera type is appended as the last path segment
    pub url: String,
    /// Time allowed for the socket to reach the open state
    pub connect_timeout_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/api/webrtc/ws".to_string(),
            connect_timeout_ms: 10_000,
        }
    }
}

impl SignalingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Heartbeat configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Enable liveness beacons
    pub enabled: bool,
    /// HTTP base URL of the device API
    pub url: String,
    /// Beacon interval
    pub interval_ms: u64,
    /// Per-request timeout
    pub request_timeout_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "http://127.0.0.1:8080".to_string(),
            interval_ms: 5_000,
            request_timeout_ms: 3_000,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Quality watchdog configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Sampling interval (clamped to at least one second)
    pub sample_interval_ms: u64,
    /// Mean luma below this counts as a black frame (0-255)
    pub black_threshold: f32,
    /// Mean absolute luma difference below this counts as a frozen frame
    pub freeze_threshold: f32,
    /// Sample every Nth pixel of the downsampled plane
    pub pixel_stride: usize,
    /// Consecutive bad ticks before the score drops to poor
    pub poor_ticks: u32,
    /// Consecutive bad ticks before a hard failure forces reconnect
    pub hard_ticks: u32,
    /// Sliding window capacity
    pub window: usize,
    /// No frame for this long marks the session stalled
    pub soft_stall_ms: u64,
    /// No frame for this long fails the session
    pub hard_stall_ms: u64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 2_000,
            black_threshold: 8.0,
            freeze_threshold: 0.5,
            pixel_stride: 4,
            poor_ticks: 3,
            hard_ticks: 7,
            window: 10,
            soft_stall_ms: 3_000,
            hard_stall_ms: 6_000,
        }
    }
}

impl QualityConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(MIN_SAMPLE_INTERVAL_MS))
    }

    pub fn soft_stall(&self) -> Duration {
        Duration::from_millis(self.soft_stall_ms)
    }

    pub fn hard_stall(&self) -> Duration {
        Duration::from_millis(self.hard_stall_ms)
    }
}

/// Reconnection configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// First retry delay
    pub base_delay_ms: u64,
    /// Multiplier applied per failed attempt
    pub growth: f64,
    /// Upper bound for the computed delay
    pub max_delay_ms: u64,
    /// Failures inside the window that trigger a cooldown
    pub rapid_failures: u32,
    /// Window for counting rapid failures
    pub rapid_window_ms: u64,
    /// Delay applied instead of the backoff formula after rapid failures
    pub cooldown_ms: u64,
    /// Hidden longer than this resets the backoff on the next show
    pub long_hide_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            growth: 2.0,
            max_delay_ms: 30_000,
            rapid_failures: 3,
            rapid_window_ms: 10_000,
            cooldown_ms: 30_000,
            long_hide_ms: 30_000,
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.base_delay_ms),
            growth: self.growth,
            cap: Duration::from_millis(self.max_delay_ms),
            rapid_failures: self.rapid_failures,
            rapid_window: Duration::from_millis(self.rapid_window_ms),
            cooldown: Duration::from_millis(self.cooldown_ms),
        }
    }

    pub fn long_hide(&self) -> Duration {
        Duration::from_millis(self.long_hide_ms)
    }
}

/// Per-attempt session timing
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Time allowed between transport-level connect and the first frame
    pub first_frame_grace_ms: u64,
    /// Time allowed from socket open until the answer is applied and the transport connects
    pub negotiation_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            first_frame_grace_ms: 6_000,
            negotiation_timeout_ms: 15_000,
        }
    }
}

impl SessionConfig {
    pub fn first_frame_grace(&self) -> Duration {
        Duration::from_millis(self.first_frame_grace_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }
}
