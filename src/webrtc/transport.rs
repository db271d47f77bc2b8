//! Signaling transport
//!
//! A persistent message-oriented channel to the device. The connection core
//! only sees [`SignalingTransport`] / [`TransportConnector`]; the WebSocket
//! implementation lives in [`WsConnector`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::signaling::SignalingEnvelope;
use crate::config::SignalingConfig;
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Socket lifecycle as seen by the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportState {
    Open,
    Error(String),
    Closed(String),
}

/// Everything a transport reports, in receipt order
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(SignalingEnvelope),
    State(TransportState),
}

/// Callback receiving transport events
pub type MessageHandler = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// An open signaling channel
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Queue an envelope; after `close` this is a logged no-op
    async fn send(&self, envelope: SignalingEnvelope) -> Result<()>;

    /// Close the channel; idempotent, no events are delivered afterwards
    fn close(&self, reason: &str);

    fn is_closed(&self) -> bool;
}

/// Opens signaling channels
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Open a channel for `target_id` (the camera type)
    ///
    /// Fails with [`AppError::ConnectTimeout`] when the socket does not open in time.
    /// No retry happens here.
    async fn open(
        &self,
        target_id: &str,
        handler: MessageHandler,
    ) -> Result<Arc<dyn SignalingTransport>>;
}

/// WebSocket connector
pub struct WsConnector {
    base_url: String,
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(config: &SignalingConfig) -> Self {
        Self {
            base_url: config.url.clone(),
            connect_timeout: config.connect_timeout(),
        }
    }

    /// `{base}/{target}` with the target percent-encoded
    pub fn target_url(&self, target_id: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            urlencoding::encode(target_id)
        )
    }
}

#[async_trait]
impl TransportConnector for WsConnector {
    async fn open(
        &self,
        target_id: &str,
        handler: MessageHandler,
    ) -> Result<Arc<dyn SignalingTransport>> {
        let url = self.target_url(target_id);
        debug!("Opening signaling socket {}", url);

        let stream = match tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
        {
            Err(_) => return Err(AppError::ConnectTimeout(self.connect_timeout)),
            Ok(Err(e)) => return Err(AppError::Transport(format!("{}: {}", url, e))),
            Ok(Ok((stream, _response))) => stream,
        };
        info!(camera = target_id, "Signaling socket open");

        let (mut write, mut read) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let closed = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let throttler = Arc::new(LogThrottler::with_secs(10));

        handler(TransportEvent::State(TransportState::Open));

        // Writer task owns the sink
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    debug!("Signaling write failed: {}", e);
                    break;
                }
                if is_close {
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Reader task delivers envelopes in receipt order
        let reader_closed = closed.clone();
        let reader_cancel = cancel.clone();
        let reader_throttler = throttler.clone();
        let camera = target_id.to_string();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    msg = read.next() => msg,
                };

                let parsed = match msg {
                    Some(Ok(Message::Text(text))) => serde_json::from_str::<SignalingEnvelope>(&text),
                    Some(Ok(Message::Binary(data))) => serde_json::from_slice::<SignalingEnvelope>(&data),
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "closed by server".to_string());
                        reader_closed.store(true, Ordering::SeqCst);
                        if !reader_cancel.is_cancelled() {
                            handler(TransportEvent::State(TransportState::Closed(reason)));
                        }
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        reader_closed.store(true, Ordering::SeqCst);
                        if !reader_cancel.is_cancelled() {
                            handler(TransportEvent::State(TransportState::Error(e.to_string())));
                        }
                        break;
                    }
                    None => {
                        reader_closed.store(true, Ordering::SeqCst);
                        if !reader_cancel.is_cancelled() {
                            handler(TransportEvent::State(TransportState::Closed(
                                "stream ended".to_string(),
                            )));
                        }
                        break;
                    }
                };

                match parsed {
                    Ok(envelope) => {
                        if reader_cancel.is_cancelled() {
                            break;
                        }
                        handler(TransportEvent::Message(envelope));
                    }
                    Err(e) => {
                        warn_throttled!(
                            reader_throttler,
                            "malformed_frame",
                            camera = %camera,
                            "Skipping malformed signaling frame: {}",
                            e
                        );
                    }
                }
            }
            debug!(camera = %camera, "Signaling reader stopped");
        });

        Ok(Arc::new(WsTransport {
            camera: target_id.to_string(),
            out_tx,
            closed,
            cancel,
            throttler,
        }))
    }
}

struct WsTransport {
    camera: String,
    out_tx: mpsc::UnboundedSender<Message>,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
    throttler: Arc<LogThrottler>,
}

#[async_trait]
impl SignalingTransport for WsTransport {
    async fn send(&self, envelope: SignalingEnvelope) -> Result<()> {
        if self.is_closed() {
            warn_throttled!(
                self.throttler,
                "send_after_close",
                camera = %self.camera,
                "Dropping '{}' envelope: signaling socket closed",
                envelope.kind()
            );
            return Ok(());
        }

        let text = serde_json::to_string(&envelope)?;
        self.out_tx
            .send(Message::Text(text))
            .map_err(|_| AppError::TransportClosed)
    }

    fn close(&self, reason: &str) {
        let already_closed = self.closed.swap(true, Ordering::SeqCst);
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        if already_closed {
            return;
        }
        debug!(camera = %self.camera, "Closing signaling socket: {}", reason);
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: reason.to_string().into(),
        };
        let _ = self.out_tx.send(Message::Close(Some(frame)));
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
