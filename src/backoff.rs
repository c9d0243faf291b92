//! Reconnect delay calculation: exponential backoff with jitter.
//!
//! The policy is a small state machine over the current interval: each
//! failed attempt grows the interval by the configured multiplier up to the
//! cap, each successful `connected` handshake resets it. Jitter perturbs
//! every produced delay by up to ±`jitter` of the interval so that a fleet
//! of clients does not reconnect in lockstep after a server restart.

use crate::config::ReconnectOptions;
use rand::Rng;
use std::time::Duration;

/// Delays are floored here so jitter can never produce a busy-loop retry.
const MIN_DELAY: Duration = Duration::from_millis(100);

/// Reconnect delay policy for one client.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    options: ReconnectOptions,
    current: Duration,
}

impl ReconnectPolicy {
    /// Create a policy starting at the configured initial interval.
    pub fn new(options: ReconnectOptions) -> Self {
        let current = options.initial_interval();
        Self { options, current }
    }

    /// Produce the delay for the next attempt and grow the interval.
    ///
    /// The returned delay is the pre-growth interval with jitter applied,
    /// clamped to [`MIN_DELAY`, `max_interval`].
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.jittered(self.current);
        self.current = self.grown(self.current);
        delay
    }

    /// Interval the next un-jittered delay would be based on.
    pub fn current_interval(&self) -> Duration {
        self.current
    }

    /// Reset to the initial interval after a successful handshake.
    pub fn reset(&mut self) {
        self.current = self.options.initial_interval();
    }

    fn grown(&self, interval: Duration) -> Duration {
        let next_ms = (interval.as_millis() as f64) * self.options.multiplier;
        Duration::from_millis(next_ms as u64).min(self.options.max_interval())
    }

    fn jittered(&self, interval: Duration) -> Duration {
        let base_ms = interval.as_millis() as f64;
        let jitter = self.options.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            1.0 + jitter * rand::thread_rng().gen_range(-1.0..=1.0)
        } else {
            1.0
        };
        let delay = Duration::from_millis((base_ms * factor) as u64);
        delay.clamp(MIN_DELAY, self.options.max_interval().max(MIN_DELAY))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(initial_ms: u64, max_ms: u64, multiplier: f64) -> ReconnectPolicy {
        ReconnectPolicy::new(
            ReconnectOptions::default()
                .with_initial_interval_ms(initial_ms)
                .with_max_interval_ms(max_ms)
                .with_multiplier(multiplier)
                .with_jitter(0.0),
        )
    }

    #[test]
    fn test_exponential_growth() {
        let mut policy = no_jitter(1000, 60_000, 2.0);
        assert_eq!(policy.next_delay(), Duration::from_millis(1000));
        assert_eq!(policy.next_delay(), Duration::from_millis(2000));
        assert_eq!(policy.next_delay(), Duration::from_millis(4000));
        assert_eq!(policy.next_delay(), Duration::from_millis(8000));
    }

    #[test]
    fn test_delays_are_non_decreasing_up_to_cap() {
        let mut policy = no_jitter(500, 5000, 2.0);
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            let delay = policy.next_delay();
            assert!(delay >= last, "delay {:?} decreased below {:?}", delay, last);
            assert!(delay <= Duration::from_millis(5000));
            last = delay;
        }
        assert_eq!(last, Duration::from_millis(5000));
    }

    #[test]
    fn test_reset_returns_to_initial_interval() {
        let mut policy = no_jitter(1000, 60_000, 2.0);
        policy.next_delay();
        policy.next_delay();
        assert!(policy.current_interval() > Duration::from_millis(1000));
        policy.reset();
        assert_eq!(policy.current_interval(), Duration::from_millis(1000));
        assert_eq!(policy.next_delay(), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_within_fraction() {
        let mut policy = ReconnectPolicy::new(
            ReconnectOptions::default()
                .with_initial_interval_ms(10_000)
                .with_max_interval_ms(60_000)
                .with_multiplier(1.0)
                .with_jitter(0.25),
        );
        for _ in 0..100 {
            let delay = policy.next_delay();
            assert!(delay >= Duration::from_millis(7500), "delay {:?} below -25%", delay);
            assert!(delay <= Duration::from_millis(12_500), "delay {:?} above +25%", delay);
        }
    }

    #[test]
    fn test_minimum_floor() {
        let mut policy = no_jitter(1, 10, 2.0);
        assert!(policy.next_delay() >= Duration::from_millis(100));
    }
}
