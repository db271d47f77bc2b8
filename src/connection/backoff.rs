//! Capped exponential backoff with a rapid-failure cooldown

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Retry timing parameters
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    /// Multiplier per failed attempt, >= 1.0
    pub growth: f64,
    pub cap: Duration,
    /// Failures inside `rapid_window` that switch to `cooldown` (0 disables)
    pub rapid_failures: u32,
    pub rapid_window: Duration,
    pub cooldown: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        crate::config::ReconnectConfig::default().policy()
    }
}

impl BackoffPolicy {
    /// `min(cap, base * growth^attempt)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let secs = self.base.as_secs_f64() * self.growth.max(1.0).powi(exponent);
        let cap = self.cap.as_secs_f64();
        if !secs.is_finite() || secs >= cap {
            self.cap
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Delay chosen for the next attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDelay {
    pub delay: Duration,
    /// Attempt number of the upcoming session
    pub attempt: u32,
    /// Delay is the rapid-failure cooldown
    pub cooldown: bool,
}

/// Failure memory that outlives individual sessions
#[derive(Debug)]
pub struct BackoffState {
    policy: BackoffPolicy,
    attempt: u32,
    recent_failures: VecDeque<Instant>,
}

impl BackoffState {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            recent_failures: VecDeque::new(),
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Record a failure at `now` and compute the wait before the next attempt
    pub fn on_failure(&mut self, now: Instant) -> RetryDelay {
        let delay = self.policy.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        self.recent_failures.push_back(now);
        while let Some(first) = self.recent_failures.front() {
            if now.duration_since(*first) > self.policy.rapid_window {
                self.recent_failures.pop_front();
            } else {
                break;
            }
        }

        let threshold = self.policy.rapid_failures as usize;
        if threshold > 0 && self.recent_failures.len() >= threshold {
            self.recent_failures.clear();
            return RetryDelay {
                delay: self.policy.cooldown,
                attempt: self.attempt,
                cooldown: true,
            };
        }

        RetryDelay {
            delay,
            attempt: self.attempt,
            cooldown: false,
        }
    }

    /// Swap the timing parameters, keeping the attempt count and history
    pub fn set_policy(&mut self, policy: BackoffPolicy) {
        self.policy = policy;
    }

    /// Forget failure history (confirmed connect, or shown after a long hide)
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.recent_failures.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[tokio::test(start_paused = true)]
    async fn test_capped_exponential_sequence() {
        let mut state = BackoffState::new(BackoffPolicy {
            rapid_failures: 0,
            ..Default::default()
        });

        let mut delays = Vec::new();
        for _ in 0..7 {
            delays.push(state.on_failure(Instant::now()).delay);
        }
        assert_eq!(
            delays,
            vec![secs(1), secs(2), secs(4), secs(8), secs(16), secs(30), secs(30)]
        );
        assert_eq!(state.attempt(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_failures_trigger_cooldown() {
        let mut state = BackoffState::new(BackoffPolicy::default());

        let first = state.on_failure(Instant::now());
        assert_eq!((first.delay, first.cooldown), (secs(1), false));
        tokio::time::advance(secs(1)).await;

        let second = state.on_failure(Instant::now());
        assert_eq!((second.delay, second.cooldown), (secs(2), false));
        tokio::time::advance(secs(2)).await;

        let third = state.on_failure(Instant::now());
        assert_eq!(third.delay, secs(30));
        assert!(third.cooldown);
        assert_eq!(third.attempt, 3);

        // Window cleared: next failure uses the formula again
        tokio::time::advance(secs(30)).await;
        let fourth = state.on_failure(Instant::now());
        assert!(!fourth.cooldown);
        assert_eq!(fourth.delay, secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spread_out_failures_do_not_cool_down() {
        let mut state = BackoffState::new(BackoffPolicy::default());
        for _ in 0..5 {
            assert!(!state.on_failure(Instant::now()).cooldown);
            tokio::time::advance(secs(6)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_returns_to_base() {
        let mut state = BackoffState::new(BackoffPolicy::default());
        state.on_failure(Instant::now());
        state.on_failure(Instant::now());
        state.reset();
        assert_eq!(state.attempt(), 0);
        assert_eq!(state.on_failure(Instant::now()).delay, secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_swap_keeps_attempt() {
        let mut state = BackoffState::new(BackoffPolicy::default());
        state.on_failure(Instant::now());
        state.set_policy(BackoffPolicy {
            base: secs(5),
            ..Default::default()
        });
        assert_eq!(state.attempt(), 1);
        assert_eq!(state.on_failure(Instant::now()).delay, secs(10));
    }

    proptest! {
        #[test]
        fn prop_delays_non_decreasing_and_capped(
            base_ms in 1u64..5_000,
            growth in 1.0f64..4.0,
            cap_ms in 5_000u64..120_000,
            attempts in 1u32..80,
        ) {
            let policy = BackoffPolicy {
                base: Duration::from_millis(base_ms),
                growth,
                cap: Duration::from_millis(cap_ms),
                rapid_failures: 0,
                ..Default::default()
            };
            let mut previous = Duration::ZERO;
            for attempt in 0..attempts {
                let delay = policy.delay_for(attempt);
                prop_assert!(delay >= previous);
                prop_assert!(delay <= policy.cap);
                previous = delay;
            }
        }
    }
}
