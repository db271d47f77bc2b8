//! Frame quality watchdog
//!
//! The transport happily reports "connected" while the camera sends a black
//! or frozen picture. The monitor samples the sink's current frame on a
//! fixed interval, counts consecutive bad samples and escalates:
//! `poor_ticks` flags the score for display, `hard_ticks` forces a reconnect.
//! It also watches the frame-arrival clock for soft and hard stalls.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use typeshare::typeshare;

use crate::config::QualityConfig;
use crate::video::{LumaPlane, VideoFrame};

/// Displayed link quality
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityScore {
    #[default]
    Good,
    Poor,
    Stalled,
}

impl fmt::Display for QualityScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityScore::Good => write!(f, "good"),
            QualityScore::Poor => write!(f, "poor"),
            QualityScore::Stalled => write!(f, "stalled"),
        }
    }
}

/// One downsampled reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualitySample {
    /// Mean luma over the strided subset (0-255)
    pub brightness: f32,
    /// Mean absolute luma difference to the previous sample; `None` without one
    pub difference: Option<f32>,
    pub black: bool,
    pub frozen: bool,
}

impl QualitySample {
    pub fn is_bad(&self) -> bool {
        self.black || self.frozen
    }
}

/// Fixed-capacity sliding window, oldest evicted
#[derive(Debug, Clone)]
pub struct QualityWindow {
    capacity: usize,
    samples: VecDeque<QualitySample>,
}

impl QualityWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, sample: QualitySample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<&QualitySample> {
        self.samples.back()
    }

    /// Consecutive bad samples counted back from the newest
    pub fn trailing_bad(&self) -> u32 {
        self.samples.iter().rev().take_while(|s| s.is_bad()).count() as u32
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Score derived from the trailing run of bad samples
pub fn evaluate(window: &QualityWindow, config: &QualityConfig) -> QualityScore {
    let bad = window.trailing_bad();
    if bad >= config.hard_ticks {
        QualityScore::Stalled
    } else if bad >= config.poor_ticks {
        QualityScore::Poor
    } else {
        QualityScore::Good
    }
}

/// Outcome of one monitor tick
#[derive(Debug, Clone, PartialEq)]
pub enum QualitySignal {
    ScoreChanged {
        score: QualityScore,
        brightness: f32,
        bad_ticks: u32,
    },
    /// No frame for at least the soft stall threshold
    SoftStall { since: Duration },
    /// No frame for at least the hard stall threshold
    HardStall { since: Duration },
    /// Bad samples reached the hard threshold
    HardFailure { bad_ticks: u32 },
}

/// Per-session quality state
#[derive(Debug)]
pub struct QualityMonitor {
    config: QualityConfig,
    previous: Option<(u64, LumaPlane)>,
    window: QualityWindow,
    score: QualityScore,
}

impl QualityMonitor {
    pub fn new(config: QualityConfig) -> Self {
        let window = QualityWindow::new(config.window);
        Self {
            config,
            previous: None,
            window,
            score: QualityScore::Good,
        }
    }

    pub fn score(&self) -> QualityScore {
        self.score
    }

    pub fn window(&self) -> &QualityWindow {
        &self.window
    }

    /// Forget history; the next sample has nothing to compare against
    pub fn reset(&mut self) {
        self.previous = None;
        self.window.clear();
        self.score = QualityScore::Good;
    }

    /// Measure one frame; `None` when the buffer is unusable
    pub fn sample(&mut self, frame: &VideoFrame) -> Option<QualitySample> {
        let hash = frame.get_hash();
        let plane = frame.quarter_luma()?;
        let stride = self.config.pixel_stride.max(1);

        let brightness = strided_mean(&plane, stride);
        let difference = match &self.previous {
            Some((prev_hash, _)) if *prev_hash == hash => Some(0.0),
            Some((_, prev)) if prev.width == plane.width && prev.height == plane.height => {
                Some(strided_mean_abs_diff(prev, &plane, stride))
            }
            // Resolution change counts as motion
            Some(_) => None,
            None => None,
        };
        self.previous = Some((hash, plane));

        Some(QualitySample {
            brightness,
            difference,
            black: brightness < self.config.black_threshold,
            frozen: difference.is_some_and(|d| d < self.config.freeze_threshold),
        })
    }

    /// Add a sample to the window and re-score
    pub fn record(&mut self, sample: QualitySample) -> Vec<QualitySignal> {
        self.window.push(sample);
        let score = evaluate(&self.window, &self.config);
        let bad_ticks = self.window.trailing_bad();

        let mut signals = Vec::new();
        if score != self.score {
            self.score = score;
            signals.push(QualitySignal::ScoreChanged {
                score,
                brightness: sample.brightness,
                bad_ticks,
            });
            if score == QualityScore::Stalled {
                signals.push(QualitySignal::HardFailure { bad_ticks });
            }
        }
        signals
    }

    /// One watchdog tick: check the frame clock, then sample if frames flow
    pub fn tick(
        &mut self,
        now: Instant,
        last_frame_at: Option<Instant>,
        frame: Option<VideoFrame>,
    ) -> Vec<QualitySignal> {
        if let Some(last) = last_frame_at {
            let since = now.saturating_duration_since(last);
            if since >= self.config.hard_stall() {
                return vec![QualitySignal::HardStall { since }];
            }
            if since >= self.config.soft_stall() {
                return vec![QualitySignal::SoftStall { since }];
            }
        }

        let Some(frame) = frame else {
            return Vec::new();
        };
        match self.sample(&frame) {
            Some(sample) => {
                debug!(
                    brightness = sample.brightness,
                    difference = ?sample.difference,
                    "Quality sample"
                );
                self.record(sample)
            }
            None => Vec::new(),
        }
    }
}

fn strided_mean(plane: &LumaPlane, stride: usize) -> f32 {
    let (sum, count) = plane
        .data
        .iter()
        .step_by(stride)
        .fold((0u64, 0u64), |(s, c), &v| (s + v as u64, c + 1));
    if count == 0 {
        0.0
    } else {
        sum as f32 / count as f32
    }
}

fn strided_mean_abs_diff(a: &LumaPlane, b: &LumaPlane, stride: usize) -> f32 {
    let (sum, count) = a
        .data
        .iter()
        .zip(b.data.iter())
        .step_by(stride)
        .fold((0u64, 0u64), |(s, c), (&x, &y)| {
            (s + x.abs_diff(y) as u64, c + 1)
        });
    if count == 0 {
        0.0
    } else {
        sum as f32 / count as f32
    }
}

/// Run `on_tick` every `interval` (clamped to at least one second) until
/// cancelled or `on_tick` returns `false`. The immediate first tick is skipped.
pub fn spawn_sampler<F>(interval: Duration, token: CancellationToken, on_tick: F) -> JoinHandle<()>
where
    F: Fn() -> bool + Send + 'static,
{
    let interval = interval.max(Duration::from_millis(crate::config::schema::MIN_SAMPLE_INTERVAL_MS));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if !on_tick() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::{PixelFormat, Resolution};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn grey(value: u8) -> VideoFrame {
        VideoFrame::from_vec(vec![value; 16 * 16], Resolution::new(16, 16), PixelFormat::Grey, 0, 0)
    }

    fn gradient(offset: u8) -> VideoFrame {
        let data = (0..256u32).map(|i| (i as u8).wrapping_add(offset)).collect();
        VideoFrame::from_vec(data, Resolution::new(16, 16), PixelFormat::Grey, 0, 0)
    }

    fn good() -> QualitySample {
        QualitySample {
            brightness: 120.0,
            difference: Some(20.0),
            black: false,
            frozen: false,
        }
    }

    fn frozen() -> QualitySample {
        QualitySample {
            frozen: true,
            difference: Some(0.0),
            ..good()
        }
    }

    #[test]
    fn test_first_sample_is_never_frozen() {
        let mut monitor = QualityMonitor::new(QualityConfig::default());
        let first = monitor.sample(&grey(128)).unwrap();
        assert_eq!(first.difference, None);
        assert!(!first.is_bad());

        let second = monitor.sample(&grey(128)).unwrap();
        assert_eq!(second.difference, Some(0.0));
        assert!(second.frozen);

        monitor.reset();
        assert!(!monitor.sample(&grey(128)).unwrap().frozen);
    }

    #[test]
    fn test_black_and_motion() {
        let mut monitor = QualityMonitor::new(QualityConfig::default());
        let black = monitor.sample(&grey(2)).unwrap();
        assert!(black.black);

        let moving = monitor.sample(&gradient(0)).unwrap();
        assert!(!moving.black);
        let moved = monitor.sample(&gradient(40)).unwrap();
        assert!(moved.difference.unwrap() > 1.0);
        assert!(!moved.is_bad());
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut window = QualityWindow::new(3);
        window.push(frozen());
        window.push(good());
        window.push(frozen());
        window.push(frozen());
        assert_eq!(window.len(), 3);
        assert_eq!(window.trailing_bad(), 2);
    }

    #[test]
    fn test_escalation_and_immediate_recovery() {
        let config = QualityConfig::default();
        let mut monitor = QualityMonitor::new(config.clone());

        let mut scores = Vec::new();
        let mut failures = 0;
        for _ in 0..config.hard_ticks {
            for signal in monitor.record(frozen()) {
                match signal {
                    QualitySignal::ScoreChanged { score, .. } => scores.push(score),
                    QualitySignal::HardFailure { bad_ticks } => {
                        assert_eq!(bad_ticks, config.hard_ticks);
                        failures += 1;
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
        }
        assert_eq!(scores, vec![QualityScore::Poor, QualityScore::Stalled]);
        assert_eq!(failures, 1);

        // Further bad samples do not repeat the hard failure
        assert!(monitor.record(frozen()).is_empty());

        let signals = monitor.record(good());
        assert!(matches!(
            signals.as_slice(),
            [QualitySignal::ScoreChanged { score: QualityScore::Good, bad_ticks: 0, .. }]
        ));
    }

    #[test]
    fn test_stalled_only_at_hard_threshold() {
        let config = QualityConfig::default();
        let mut window = QualityWindow::new(config.window);
        for i in 1..=config.hard_ticks {
            window.push(frozen());
            let score = evaluate(&window, &config);
            if i < config.poor_ticks {
                assert_eq!(score, QualityScore::Good);
            } else if i < config.hard_ticks {
                assert_eq!(score, QualityScore::Poor);
            } else {
                assert_eq!(score, QualityScore::Stalled);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_checks_frame_clock() {
        let mut monitor = QualityMonitor::new(QualityConfig::default());
        let start = Instant::now();

        tokio::time::advance(Duration::from_secs(2)).await;
        let signals = monitor.tick(Instant::now(), Some(start), Some(grey(128)));
        assert!(signals.is_empty());
        assert_eq!(monitor.window().len(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(matches!(
            monitor.tick(Instant::now(), Some(start), Some(grey(128))).as_slice(),
            [QualitySignal::SoftStall { .. }]
        ));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(matches!(
            monitor.tick(Instant::now(), Some(start), None).as_slice(),
            [QualitySignal::HardStall { .. }]
        ));
        // Stalled ticks do not sample
        assert_eq!(monitor.window().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_interval_is_clamped() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();
        let token = CancellationToken::new();
        let handle = spawn_sampler(Duration::from_millis(100), token.clone(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);

        token.cancel();
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }
}
