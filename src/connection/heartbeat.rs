//! Server-side liveness beacons
//!
//! While a session is connected the device gets a beacon every few seconds
//! so it knows the stream is still wanted. On intentional teardown one
//! explicit disconnect lets it free the encoder right away instead of
//! waiting for the beacon timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::quality::QualityScore;
use crate::config::HeartbeatConfig;
use crate::error::{AppError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::utils::LogThrottler;
use crate::{debug_throttled, warn_throttled};

/// Quality the consumer currently observes, forwarded so the device can adapt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityHints {
    pub score: QualityScore,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<f32>,
}

/// Describes the consuming client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceHints {
    pub client: String,
    pub platform: String,
    pub camera: String,
}

impl DeviceHints {
    pub fn new(camera: &str) -> Self {
        Self {
            client: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            platform: std::env::consts::OS.to_string(),
            camera: camera.to_string(),
        }
    }
}

/// Beacon body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatBeacon {
    pub session_id: String,
    pub visible: bool,
    pub connected: bool,
    pub paused: bool,
    pub quality: QualityHints,
    pub device: DeviceHints,
    pub timestamp: DateTime<Utc>,
}

/// Device reply to a beacon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimizations: Option<serde_json::Value>,
}

impl HeartbeatResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            client_id: None,
            optimizations: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconKind {
    Liveness,
    Disconnect,
}

/// Where beacons go
#[async_trait]
pub trait BeaconSink: Send + Sync {
    async fn send(&self, beacon: HeartbeatBeacon, kind: BeaconKind) -> Result<HeartbeatResponse>;
}

/// POSTs beacons to `{base}/api/webrtc/heartbeat/{session_id}`
pub struct HttpBeaconSink {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBeaconSink {
    pub fn new(config: &HeartbeatConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self, session_id: &str) -> String {
        format!(
            "{}/api/webrtc/heartbeat/{}",
            self.base_url,
            urlencoding::encode(session_id)
        )
    }
}

#[async_trait]
impl BeaconSink for HttpBeaconSink {
    async fn send(&self, beacon: HeartbeatBeacon, kind: BeaconKind) -> Result<HeartbeatResponse> {
        let mut request = self.client.post(self.endpoint(&beacon.session_id)).json(&beacon);
        if kind == BeaconKind::Disconnect {
            request = request.query(&[("disconnect", "true")]);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Heartbeat(format!("HTTP {}", status)));
        }

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(HeartbeatResponse::ok());
        }
        Ok(serde_json::from_str(&body)?)
    }
}

/// Why the scheduler is being stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Beacons pause (session left the connected state)
    Interval,
    /// Session is being torn down; the device is told once
    Teardown,
}

#[derive(Debug, Clone)]
struct BeaconState {
    session_id: Option<String>,
    visible: bool,
    connected: bool,
    paused: bool,
    quality: QualityHints,
}

/// Periodic beacon sender for one connection session
pub struct HeartbeatScheduler {
    camera: String,
    sink: Arc<dyn BeaconSink>,
    interval: Duration,
    enabled: bool,
    state: Arc<Mutex<BeaconState>>,
    token: Option<CancellationToken>,
    disconnect_sent: Arc<AtomicBool>,
    events: EventBus,
    throttler: Arc<LogThrottler>,
}

impl HeartbeatScheduler {
    pub fn new(
        camera: &str,
        config: &HeartbeatConfig,
        sink: Arc<dyn BeaconSink>,
        events: EventBus,
    ) -> Self {
        Self {
            camera: camera.to_string(),
            sink,
            interval: config.interval(),
            enabled: config.enabled,
            state: Arc::new(Mutex::new(BeaconState {
                session_id: None,
                visible: true,
                connected: false,
                paused: false,
                quality: QualityHints::default(),
            })),
            token: None,
            disconnect_sent: Arc::new(AtomicBool::new(false)),
            events,
            throttler: Arc::new(LogThrottler::with_secs(30)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.token.is_some()
    }

    pub fn session_id(&self) -> Option<String> {
        self.state.lock().session_id.clone()
    }

    pub fn set_session_id(&self, session_id: &str) {
        self.state.lock().session_id = Some(session_id.to_string());
    }

    pub fn set_visibility(&self, visible: bool) {
        self.state.lock().visible = visible;
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.lock().connected = connected;
    }

    pub fn set_paused(&self, paused: bool) {
        self.state.lock().paused = paused;
    }

    pub fn set_quality(&self, score: QualityScore, brightness: Option<f32>) {
        self.state.lock().quality = QualityHints { score, brightness };
    }

    /// Begin sending beacons; no-op while already running
    pub fn start(&mut self, session_id: Option<&str>) {
        if let Some(id) = session_id {
            self.set_session_id(id);
        }
        if !self.enabled || self.token.is_some() {
            return;
        }

        let token = CancellationToken::new();
        self.token = Some(token.clone());

        let camera = self.camera.clone();
        let sink = self.sink.clone();
        let state = self.state.clone();
        let events = self.events.clone();
        let throttler = self.throttler.clone();
        let interval = self.interval;

        debug!(camera = %camera, "Heartbeat started ({:?} interval)", interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(beacon) = snapshot(&state, &camera) else {
                    debug_throttled!(throttler, "beacon_dropped", camera = %camera, "Beacon dropped: no session id or hidden");
                    continue;
                };
                let session_id = beacon.session_id.clone();

                let result = tokio::select! {
                    _ = token.cancelled() => break,
                    r = sink.send(beacon, BeaconKind::Liveness) => r,
                };
                match result {
                    Ok(response) => {
                        throttler.clear("beacon_failed");
                        if !response.is_ok() {
                            debug!(camera = %camera, "Heartbeat status: {}", response.status);
                        }
                    }
                    Err(e) => {
                        warn_throttled!(
                            throttler,
                            "beacon_failed",
                            camera = %camera,
                            session_id = %session_id,
                            "Heartbeat failed: {}",
                            e
                        );
                        events.publish(SystemEvent::HeartbeatFailed {
                            session_id,
                            message: e.to_string(),
                            disconnect: false,
                        });
                    }
                }
            }
        });
    }

    /// Stop beacons; a teardown also sends the single disconnect signal
    ///
    /// Safe to call repeatedly. Returns the disconnect task when one was sent.
    pub fn stop(&mut self, reason: StopReason) -> Option<JoinHandle<()>> {
        if let Some(token) = self.token.take() {
            token.cancel();
            debug!(camera = %self.camera, "Heartbeat stopped ({:?})", reason);
        }

        if reason != StopReason::Teardown || !self.enabled {
            return None;
        }
        let beacon = {
            let state = self.state.lock();
            let session_id = state.session_id.clone()?;
            HeartbeatBeacon {
                session_id,
                visible: state.visible,
                connected: false,
                paused: state.paused,
                quality: state.quality.clone(),
                device: DeviceHints::new(&self.camera),
                timestamp: Utc::now(),
            }
        };
        if self.disconnect_sent.swap(true, Ordering::SeqCst) {
            return None;
        }

        info!(camera = %self.camera, session_id = %beacon.session_id, "Sending disconnect");
        let sink = self.sink.clone();
        let events = self.events.clone();
        let camera = self.camera.clone();
        Some(tokio::spawn(async move {
            let session_id = beacon.session_id.clone();
            if let Err(e) = sink.send(beacon, BeaconKind::Disconnect).await {
                tracing::warn!(camera = %camera, session_id = %session_id, "Disconnect signal failed: {}", e);
                events.publish(SystemEvent::HeartbeatFailed {
                    session_id,
                    message: e.to_string(),
                    disconnect: true,
                });
            }
        }))
    }
}

impl Drop for HeartbeatScheduler {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }
}

fn snapshot(state: &Mutex<BeaconState>, camera: &str) -> Option<HeartbeatBeacon> {
    let state = state.lock();
    if !state.visible {
        return None;
    }
    Some(HeartbeatBeacon {
        session_id: state.session_id.clone()?,
        visible: state.visible,
        connected: state.connected,
        paused: state.paused,
        quality: state.quality.clone(),
        device: DeviceHints::new(camera),
        timestamp: Utc::now(),
    })
}
