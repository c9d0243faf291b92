//! Timeout configuration for client operations.
//!
//! Centralizes every time bound the connection pipeline uses: connection
//! establishment, partial-frame reads, and the ping/pong liveness window.

use std::time::Duration;

/// Time bounds for connection and liveness handling.
///
/// # Examples
///
/// ```rust
/// use livequery_client::Timeouts;
/// use std::time::Duration;
///
/// // Defaults work for most deployments
/// let timeouts = Timeouts::default();
///
/// // Local development against a server on localhost
/// let timeouts = Timeouts::fast();
///
/// // Custom tuning
/// let timeouts = Timeouts::default()
///     .with_connect_timeout(Duration::from_secs(20))
///     .with_ping_interval(Duration::from_secs(15));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// Bound on TCP connect + TLS handshake + WebSocket upgrade.
    /// Default: 10 seconds.
    pub connect_timeout: Duration,

    /// Bound on each read that continues a partially received frame.
    /// Waiting for a new frame to start is not bounded by this; silent
    /// connections are the health monitor's concern.
    /// Default: 30 seconds.
    pub read_timeout: Duration,

    /// Interval between liveness pings on an otherwise idle connection.
    /// Set to zero to disable pings.
    /// Default: 10 seconds.
    pub ping_interval: Duration,

    /// Maximum wait for any frame after a ping before the connection is
    /// declared stale and torn down.
    /// Default: 5 seconds.
    pub pong_timeout: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(5),
        }
    }
}

impl Timeouts {
    /// Aggressive bounds for localhost development.
    pub fn fast() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(5),
            pong_timeout: Duration::from_secs(2),
        }
    }

    /// Relaxed bounds for high-latency or unreliable networks.
    pub fn relaxed() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(120),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
        }
    }

    /// Set the connection establishment timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the partial-frame read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the liveness ping interval. Zero disables pings.
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the pong deadline after a ping.
    pub fn with_pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let timeouts = Timeouts::default();
        assert_eq!(timeouts.connect_timeout, Duration::from_secs(10));
        assert_eq!(timeouts.read_timeout, Duration::from_secs(30));
        assert_eq!(timeouts.ping_interval, Duration::from_secs(10));
        assert_eq!(timeouts.pong_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_fast_preset_is_tighter_than_default() {
        let fast = Timeouts::fast();
        let default = Timeouts::default();
        assert!(fast.connect_timeout < default.connect_timeout);
        assert!(fast.pong_timeout <= default.pong_timeout);
    }

    #[test]
    fn test_builder_setters() {
        let timeouts = Timeouts::default()
            .with_connect_timeout(Duration::from_secs(60))
            .with_ping_interval(Duration::ZERO);
        assert_eq!(timeouts.connect_timeout, Duration::from_secs(60));
        assert!(timeouts.ping_interval.is_zero());
    }
}
