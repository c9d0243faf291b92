//! Connection liveness monitoring.
//!
//! The monitor watches two timestamps (last received frame, last sent
//! ping) and decides when the owning client should ping and when the
//! connection must be declared stale. It holds no socket: the decisions
//! surface through injected callbacks, and the clock is a trait so the
//! decision logic tests against a fake clock.
//!
//! A TCP connection can die without either side noticing; reads simply stop
//! returning. The ping/pong exchange bounds how long such a silently-dead
//! connection survives: any received frame counts as activity (so busy
//! connections are never pinged), and a ping that goes unanswered past
//! `pong_timeout` fires the stale callback exactly once.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Time source abstraction; production code uses [`SystemClock`].
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> Instant;
}

/// Real clock backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Callback asking the owner to send a ping frame.
pub type PingRequest = Arc<dyn Fn() + Send + Sync>;

/// Callback telling the owner the connection is stale.
pub type StaleNotice = Arc<dyn Fn() + Send + Sync>;

/// Outcome of one monitor tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tick {
    /// Connection looks alive; nothing to do.
    Idle,
    /// No activity for a full interval; a ping was requested.
    PingRequested,
    /// The pong deadline passed; the stale notice fired.
    Stale,
}

/// Read-only liveness snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthInfo {
    /// Time since the last received frame.
    pub since_activity: Duration,
    /// Time since the last ping was sent, when one is outstanding.
    pub since_ping: Option<Duration>,
    /// A ping has been sent and no frame has arrived since.
    pub awaiting_pong: bool,
    /// Overall verdict; `false` once the pong deadline has passed.
    pub healthy: bool,
}

struct HealthState {
    last_activity: Instant,
    last_ping: Option<Instant>,
    awaiting_pong: bool,
}

/// Periodic liveness check for one connection.
pub struct HealthMonitor {
    ping_interval: Duration,
    pong_timeout: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<HealthState>,
    on_ping: PingRequest,
    on_stale: StaleNotice,
    stale_reported: AtomicBool,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Create a monitor with the system clock.
    pub fn new(
        ping_interval: Duration,
        pong_timeout: Duration,
        on_ping: impl Fn() + Send + Sync + 'static,
        on_stale: impl Fn() + Send + Sync + 'static,
    ) -> Arc<Self> {
        Self::with_clock(ping_interval, pong_timeout, Arc::new(SystemClock), on_ping, on_stale)
    }

    /// Create a monitor with an explicit clock.
    pub fn with_clock(
        ping_interval: Duration,
        pong_timeout: Duration,
        clock: Arc<dyn Clock>,
        on_ping: impl Fn() + Send + Sync + 'static,
        on_stale: impl Fn() + Send + Sync + 'static,
    ) -> Arc<Self> {
        let now = clock.now();
        Arc::new(Self {
            ping_interval,
            pong_timeout,
            clock,
            state: Mutex::new(HealthState {
                last_activity: now,
                last_ping: None,
                awaiting_pong: false,
            }),
            on_ping: Arc::new(on_ping),
            on_stale: Arc::new(on_stale),
            stale_reported: AtomicBool::new(false),
            ticker: Mutex::new(None),
        })
    }

    /// Start the periodic ticker. A zero ping interval disables monitoring.
    pub fn start(self: &Arc<Self>) {
        if self.ping_interval.is_zero() {
            return;
        }
        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(monitor.ping_interval).await;
                if monitor.tick() == Tick::Stale {
                    return;
                }
            }
        });
        let previous = self.ticker.lock().replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stop the ticker. Idempotent.
    pub fn stop(&self) {
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
    }

    /// Note that a frame of any kind arrived.
    pub fn record_activity(&self) {
        self.state.lock().last_activity = self.clock.now();
    }

    /// Note that a pong frame arrived, clearing the outstanding-pong flag.
    pub fn record_pong(&self) {
        let mut state = self.state.lock();
        state.awaiting_pong = false;
        state.last_ping = None;
    }

    /// Current verdict on connection liveness.
    pub fn is_healthy(&self) -> bool {
        if self.stale_reported.load(Ordering::SeqCst) {
            return false;
        }
        let state = self.state.lock();
        !self.pong_overdue(&state)
    }

    /// Snapshot of the liveness timestamps.
    pub fn health_info(&self) -> HealthInfo {
        let now = self.clock.now();
        let state = self.state.lock();
        HealthInfo {
            since_activity: now.duration_since(state.last_activity),
            since_ping: state
                .awaiting_pong
                .then(|| state.last_ping.map(|at| now.duration_since(at)))
                .flatten(),
            awaiting_pong: state.awaiting_pong,
            healthy: !self.stale_reported.load(Ordering::SeqCst) && !self.pong_overdue(&state),
        }
    }

    /// One evaluation step; invoked by the ticker and directly by tests.
    fn tick(&self) -> Tick {
        let action = {
            let mut state = self.state.lock();
            if self.pong_overdue(&state) {
                Tick::Stale
            } else if !state.awaiting_pong
                && self.clock.now().duration_since(state.last_activity) >= self.ping_interval
            {
                state.last_ping = Some(self.clock.now());
                state.awaiting_pong = true;
                Tick::PingRequested
            } else {
                Tick::Idle
            }
        };
        // Callbacks run outside the state lock; they may call back in.
        match action {
            Tick::PingRequested => {
                log::debug!("[livequery] idle for {:?}, requesting ping", self.ping_interval);
                (self.on_ping)();
            }
            Tick::Stale => {
                if !self.stale_reported.swap(true, Ordering::SeqCst) {
                    log::warn!(
                        "[livequery] no pong within {:?}, declaring connection stale",
                        self.pong_timeout
                    );
                    (self.on_stale)();
                }
            }
            Tick::Idle => {}
        }
        action
    }

    fn pong_overdue(&self, state: &HealthState) -> bool {
        if self.pong_timeout.is_zero() || !state.awaiting_pong {
            return false;
        }
        match state.last_ping {
            Some(at) => self.clock.now().duration_since(at) >= self.pong_timeout,
            None => false,
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Manually advanced clock for deterministic liveness tests.
    struct FakeClock {
        now: Mutex<Instant>,
    }

    impl FakeClock {
        fn new() -> Arc<Self> {
            Arc::new(Self { now: Mutex::new(Instant::now()) })
        }

        fn advance(&self, by: Duration) {
            let mut now = self.now.lock();
            *now += by;
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            *self.now.lock()
        }
    }

    fn counters() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)))
    }

    fn monitor(
        clock: Arc<FakeClock>,
        pings: Arc<AtomicUsize>,
        stales: Arc<AtomicUsize>,
    ) -> Arc<HealthMonitor> {
        let ping_count = pings;
        let stale_count = stales;
        HealthMonitor::with_clock(
            Duration::from_secs(1),
            Duration::from_secs(1),
            clock,
            move || {
                ping_count.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                stale_count.fetch_add(1, Ordering::SeqCst);
            },
        )
    }

    #[test]
    fn test_quiet_connection_gets_pinged() {
        let clock = FakeClock::new();
        let (pings, stales) = counters();
        let monitor = monitor(clock.clone(), pings.clone(), stales.clone());

        clock.advance(Duration::from_millis(1100));
        assert_eq!(monitor.tick(), Tick::PingRequested);
        assert_eq!(pings.load(Ordering::SeqCst), 1);
        assert_eq!(stales.load(Ordering::SeqCst), 0);
        assert!(monitor.is_healthy());
    }

    #[test]
    fn test_activity_suppresses_ping() {
        let clock = FakeClock::new();
        let (pings, stales) = counters();
        let monitor = monitor(clock.clone(), pings.clone(), stales);

        clock.advance(Duration::from_millis(900));
        monitor.record_activity();
        clock.advance(Duration::from_millis(900));
        assert_eq!(monitor.tick(), Tick::Idle);
        assert_eq!(pings.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stale_fires_exactly_once() {
        let clock = FakeClock::new();
        let (pings, stales) = counters();
        let monitor = monitor(clock.clone(), pings, stales.clone());

        // Interval passes with no activity: ping goes out.
        clock.advance(Duration::from_millis(1100));
        assert_eq!(monitor.tick(), Tick::PingRequested);

        // Pong deadline passes with no frame at all.
        clock.advance(Duration::from_millis(1100));
        assert!(!monitor.is_healthy());
        assert_eq!(monitor.tick(), Tick::Stale);
        assert_eq!(stales.load(Ordering::SeqCst), 1);

        // Further ticks never re-fire the notice.
        clock.advance(Duration::from_millis(1100));
        assert_eq!(monitor.tick(), Tick::Stale);
        assert_eq!(stales.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pong_clears_outstanding_flag() {
        let clock = FakeClock::new();
        let (pings, stales) = counters();
        let monitor = monitor(clock.clone(), pings, stales.clone());

        clock.advance(Duration::from_millis(1100));
        assert_eq!(monitor.tick(), Tick::PingRequested);

        monitor.record_pong();
        monitor.record_activity();
        clock.advance(Duration::from_millis(1100));
        // Past the old pong deadline, but the pong already arrived.
        assert_eq!(monitor.tick(), Tick::PingRequested);
        assert_eq!(stales.load(Ordering::SeqCst), 0);
        assert!(monitor.is_healthy());
    }

    #[test]
    fn test_health_info_snapshot() {
        let clock = FakeClock::new();
        let (pings, stales) = counters();
        let monitor = monitor(clock.clone(), pings, stales);

        clock.advance(Duration::from_millis(1100));
        monitor.tick();
        let info = monitor.health_info();
        assert!(info.awaiting_pong);
        assert!(info.healthy);
        assert!(info.since_activity >= Duration::from_millis(1100));
        assert_eq!(info.since_ping, Some(Duration::ZERO));
    }
}
