//! Circuit breaker gating connection attempts.
//!
//! The breaker prevents a client from hammering an unreachable server: it
//! counts consecutive connection failures, opens after a threshold, and
//! only lets probe attempts through again once a reset timeout has passed.
//!
//! # States
//!
//! - **Closed**: normal operation, attempts pass through
//! - **Open**: attempts are denied until `reset_timeout` elapses
//! - **HalfOpen**: a limited number of probes may test recovery
//!
//! The breaker never performs networking itself and never errors; it only
//! advises. The caller decides what counts as a failure and reports
//! outcomes back via [`record_success`](CircuitBreaker::record_success) /
//! [`record_failure`](CircuitBreaker::record_failure).

use crate::config::BreakerOptions;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation; attempts are allowed.
    Closed,
    /// Attempts are denied while the reset timeout runs down.
    Open,
    /// Recovery is being probed with a bounded number of attempts.
    HalfOpen,
}

impl BreakerState {
    /// Returns true in normal operation.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Returns true while attempts are being denied.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Returns true while recovery is being probed.
    pub fn is_half_open(&self) -> bool {
        matches!(self, Self::HalfOpen)
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Observer invoked on every state transition, outside the breaker lock.
pub type StateChangeObserver = Arc<dyn Fn(BreakerState, BreakerState) + Send + Sync>;

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    half_open_successes: u32,
    half_open_probes: u32,
    last_failure_at: Option<Instant>,
    last_failure_reason: Option<String>,
}

impl Default for BreakerInner {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            half_open_successes: 0,
            half_open_probes: 0,
            last_failure_at: None,
            last_failure_reason: None,
        }
    }
}

/// Tri-state failure gate for connection attempts.
pub struct CircuitBreaker {
    options: BreakerOptions,
    inner: Mutex<BreakerInner>,
    observer: Mutex<Option<StateChangeObserver>>,
}

impl CircuitBreaker {
    /// Create a breaker with the given thresholds.
    pub fn new(options: BreakerOptions) -> Self {
        Self {
            options,
            inner: Mutex::new(BreakerInner::default()),
            observer: Mutex::new(None),
        }
    }

    /// Register the state-change observer.
    ///
    /// The observer runs outside the breaker's lock, so it may safely call
    /// back into the breaker.
    pub fn set_observer(&self, observer: impl Fn(BreakerState, BreakerState) + Send + Sync + 'static) {
        *self.observer.lock() = Some(Arc::new(observer));
    }

    /// Should a connection attempt be tried right now?
    ///
    /// In `Open`, the elapsed reset timeout transitions the breaker to
    /// `HalfOpen` as a side effect of this check. In `HalfOpen`, at most
    /// `half_open_max_probes` attempts are admitted per episode.
    pub fn allow_request(&self) -> bool {
        let (allowed, transition) = {
            let mut inner = self.inner.lock();
            match inner.state {
                BreakerState::Closed => (true, None),
                BreakerState::Open => {
                    let elapsed = inner
                        .last_failure_at
                        .map(|at| at.elapsed() >= self.options.reset_timeout())
                        .unwrap_or(true);
                    if elapsed {
                        let from = inner.state;
                        inner.state = BreakerState::HalfOpen;
                        inner.half_open_successes = 0;
                        inner.half_open_probes = 1;
                        (true, Some((from, BreakerState::HalfOpen)))
                    } else {
                        (false, None)
                    }
                }
                BreakerState::HalfOpen => {
                    if inner.half_open_probes < self.options.half_open_max_probes {
                        inner.half_open_probes += 1;
                        (true, None)
                    } else {
                        (false, None)
                    }
                }
            }
        };
        self.notify(transition);
        allowed
    }

    /// Report a successful connection handshake.
    pub fn record_success(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            match inner.state {
                BreakerState::Closed => {
                    inner.failure_count = 0;
                    None
                }
                BreakerState::HalfOpen => {
                    inner.half_open_successes += 1;
                    log::debug!(
                        "[livequery] breaker half-open success {}/{}",
                        inner.half_open_successes,
                        self.options.half_open_successes
                    );
                    if inner.half_open_successes >= self.options.half_open_successes {
                        let from = inner.state;
                        *inner = BreakerInner::default();
                        log::info!("[livequery] breaker closed, connection recovered");
                        Some((from, BreakerState::Closed))
                    } else {
                        None
                    }
                }
                // A success cannot arrive while open; nothing was allowed out.
                BreakerState::Open => None,
            }
        };
        self.notify(transition);
    }

    /// Report a failed connection attempt.
    pub fn record_failure(&self) {
        self.record_failure_with_reason(None);
    }

    /// Report a failed connection attempt with its cause.
    pub fn record_failure_with_reason(&self, reason: Option<String>) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.last_failure_at = Some(Instant::now());
            inner.last_failure_reason = reason.clone();
            match inner.state {
                BreakerState::Closed => {
                    inner.failure_count += 1;
                    log::debug!(
                        "[livequery] breaker failure {}/{} ({:?})",
                        inner.failure_count,
                        self.options.failure_threshold,
                        reason
                    );
                    if inner.failure_count >= self.options.failure_threshold {
                        let from = inner.state;
                        inner.state = BreakerState::Open;
                        log::warn!(
                            "[livequery] breaker opened after {} consecutive failures",
                            inner.failure_count
                        );
                        Some((from, BreakerState::Open))
                    } else {
                        None
                    }
                }
                BreakerState::HalfOpen => {
                    // Any failure during a probe reopens immediately.
                    let from = inner.state;
                    inner.state = BreakerState::Open;
                    inner.half_open_successes = 0;
                    inner.half_open_probes = 0;
                    log::warn!("[livequery] breaker reopened from half-open ({:?})", reason);
                    Some((from, BreakerState::Open))
                }
                BreakerState::Open => None,
            }
        };
        self.notify(transition);
    }

    /// Force the breaker back to `Closed`, clearing all counters.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            let from = inner.state;
            *inner = BreakerInner::default();
            (from != BreakerState::Closed).then_some((from, BreakerState::Closed))
        };
        self.notify(transition);
    }

    /// Current state. Does not trigger the open→half-open transition.
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Consecutive failures recorded while closed.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Reason attached to the most recent failure.
    pub fn last_failure_reason(&self) -> Option<String> {
        self.inner.lock().last_failure_reason.clone()
    }

    /// Time remaining until an open breaker admits a probe, if open.
    pub fn time_until_half_open(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        if inner.state != BreakerState::Open {
            return None;
        }
        inner.last_failure_at.map(|at| {
            self.options.reset_timeout().saturating_sub(at.elapsed())
        })
    }

    fn notify(&self, transition: Option<(BreakerState, BreakerState)>) {
        if let Some((from, to)) = transition {
            let observer = self.observer.lock().clone();
            if let Some(observer) = observer {
                observer(from, to);
            }
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("failure_count", &self.failure_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread::sleep;

    fn breaker(failures: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            BreakerOptions::default()
                .with_failure_threshold(failures)
                .with_reset_timeout_ms(reset_ms),
        )
    }

    #[test]
    fn test_starts_closed_and_allows() {
        let breaker = CircuitBreaker::new(BreakerOptions::default());
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow_request());
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let breaker = breaker(3, 30_000);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_success_resets_failure_count_while_closed() {
        let breaker = breaker(3, 30_000);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.failure_count(), 2);
        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_allow_transitions_open_to_half_open_after_timeout() {
        let breaker = breaker(1, 20);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow_request());

        sleep(Duration::from_millis(30));
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn test_half_open_closes_after_success_target() {
        let breaker = CircuitBreaker::new(
            BreakerOptions::default()
                .with_failure_threshold(1)
                .with_reset_timeout_ms(10)
                .with_half_open_successes(2)
                .with_half_open_max_probes(5),
        );
        breaker.record_failure();
        sleep(Duration::from_millis(15));
        assert!(breaker.allow_request());

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens_immediately() {
        let breaker = breaker(1, 10);
        breaker.record_failure();
        sleep(Duration::from_millis(15));
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_half_open_probe_cap() {
        let breaker = CircuitBreaker::new(
            BreakerOptions::default()
                .with_failure_threshold(1)
                .with_reset_timeout_ms(10)
                .with_half_open_max_probes(2),
        );
        breaker.record_failure();
        sleep(Duration::from_millis(15));

        assert!(breaker.allow_request()); // first probe, transition
        assert!(breaker.allow_request()); // second probe
        assert!(!breaker.allow_request()); // cap reached
    }

    #[test]
    fn test_manual_reset() {
        let breaker = breaker(1, 60_000);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow_request());
    }

    #[test]
    fn test_time_until_half_open() {
        let breaker = breaker(1, 30_000);
        assert!(breaker.time_until_half_open().is_none());
        breaker.record_failure();
        let remaining = breaker.time_until_half_open().unwrap();
        assert!(remaining > Duration::from_secs(29));
        assert!(remaining <= Duration::from_secs(30));
    }

    #[test]
    fn test_observer_sees_transitions() {
        let breaker = Arc::new(breaker(2, 10));
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let seen = transitions.clone();
        breaker.set_observer(move |from, to| seen.lock().push((from, to)));

        breaker.record_failure();
        breaker.record_failure();
        let log = transitions.lock().clone();
        assert_eq!(log, vec![(BreakerState::Closed, BreakerState::Open)]);
    }

    #[test]
    fn test_observer_may_reenter_the_breaker() {
        // The observer runs outside the lock, so calling back in must not
        // deadlock.
        let breaker = Arc::new(breaker(1, 60_000));
        let reentries = Arc::new(AtomicUsize::new(0));
        let breaker_ref = breaker.clone();
        let count = reentries.clone();
        breaker.set_observer(move |_, _| {
            let _ = breaker_ref.state();
            let _ = breaker_ref.allow_request();
            count.fetch_add(1, Ordering::SeqCst);
        });

        breaker.record_failure();
        assert_eq!(reentries.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_reason_is_kept() {
        let breaker = breaker(5, 30_000);
        breaker.record_failure_with_reason(Some("handshake refused".into()));
        assert_eq!(breaker.last_failure_reason().as_deref(), Some("handshake refused"));
    }
}
