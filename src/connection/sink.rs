//! Consumer-facing ports: where frames come from and where status goes

use std::sync::Arc;

use tokio::sync::watch;

use super::quality::QualityScore;
use crate::video::VideoFrame;
use crate::webrtc::signaling::ConnectionStatus;

/// The video consumer the supervisor reports to
///
/// Implementations must not block: calls are made from the supervisor loop.
pub trait FrameSink: Send + Sync {
    /// Latest decoded frame, if any has been rendered
    fn current_frame(&self) -> Option<VideoFrame>;
    fn on_status(&self, status: ConnectionStatus, message: Option<&str>);
    fn on_quality(&self, score: QualityScore);
    /// Stop rendering (consumer hidden)
    fn pause(&self);
    fn resume(&self);
}

/// Visibility signal fed by the embedding application
///
/// Cloning shares the same underlying channel.
#[derive(Clone)]
pub struct VisibilityPort {
    tx: Arc<watch::Sender<bool>>,
}

impl VisibilityPort {
    /// New port; the consumer starts visible
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(true);
        Self { tx: Arc::new(tx) }
    }

    pub fn set_visible(&self, visible: bool) {
        self.tx.send_if_modified(|current| {
            if *current == visible {
                false
            } else {
                *current = visible;
                true
            }
        });
    }

    pub fn is_visible(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for VisibilityPort {
    fn default() -> Self {
        Self::new()
    }
}
