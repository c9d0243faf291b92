//! Client configuration.
//!
//! [`ClientConfig`] groups the recognized options by concern: reconnect
//! backoff, circuit breaker thresholds, event-queue backpressure, TLS and
//! frame limits. Each group is a small serde-friendly struct with builder
//! setters and documented defaults, so configurations can be embedded in
//! application config files.

use crate::credentials::Credentials;
use crate::timeouts::Timeouts;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default cap on a single frame's declared payload length (16 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 << 20;

/// Options for the exponential-backoff reconnection scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectOptions {
    /// Delay before the first reconnection attempt, in milliseconds.
    /// Default: 1000.
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,

    /// Upper bound on the delay between attempts, in milliseconds.
    /// Default: 30000.
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,

    /// Growth factor applied to the delay after each failed attempt.
    /// Default: 2.0.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Jitter fraction; each delay is perturbed by up to ±`jitter` of
    /// itself. Default: 0.25.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_initial_interval_ms() -> u64 {
    1000
}

fn default_max_interval_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.25
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl ReconnectOptions {
    /// Set the initial delay in milliseconds.
    pub fn with_initial_interval_ms(mut self, ms: u64) -> Self {
        self.initial_interval_ms = ms;
        self
    }

    /// Set the delay cap in milliseconds.
    pub fn with_max_interval_ms(mut self, ms: u64) -> Self {
        self.max_interval_ms = ms;
        self
    }

    /// Set the backoff growth factor.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the jitter fraction (0.0 disables jitter).
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Initial delay as a [`Duration`].
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    /// Delay cap as a [`Duration`].
    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }
}

/// Thresholds for the connection circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerOptions {
    /// Consecutive connection failures before the circuit opens.
    /// Default: 5.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time the circuit stays open before allowing a probe, in
    /// milliseconds. Default: 30000.
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Consecutive half-open successes needed to close the circuit.
    /// Default: 2.
    #[serde(default = "default_half_open_successes")]
    pub half_open_successes: u32,

    /// Probe attempts admitted per half-open episode.
    /// Default: 3.
    #[serde(default = "default_half_open_max_probes")]
    pub half_open_max_probes: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_successes() -> u32 {
    2
}

fn default_half_open_max_probes() -> u32 {
    3
}

impl Default for BreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            half_open_successes: default_half_open_successes(),
            half_open_max_probes: default_half_open_max_probes(),
        }
    }
}

impl BreakerOptions {
    /// Set the consecutive-failure threshold.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the open-state reset timeout in milliseconds.
    pub fn with_reset_timeout_ms(mut self, ms: u64) -> Self {
        self.reset_timeout_ms = ms;
        self
    }

    /// Set the half-open success target.
    pub fn with_half_open_successes(mut self, successes: u32) -> Self {
        self.half_open_successes = successes;
        self
    }

    /// Set the half-open probe cap.
    pub fn with_half_open_max_probes(mut self, probes: u32) -> Self {
        self.half_open_max_probes = probes;
        self
    }

    /// Reset timeout as a [`Duration`].
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// What `enqueue` does when the event queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait until the consumer frees a slot (or the queue stops).
    Block,
    /// Evict the oldest queued item to make room for the new one.
    DropOldest,
    /// Reject the incoming item, leaving the queue unchanged.
    DropNewest,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        Self::Block
    }
}

/// Sizing and backpressure policy for the event queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Maximum number of queued, undelivered events. Default: 1024.
    #[serde(default = "default_queue_max_size")]
    pub max_size: usize,

    /// Overflow policy applied when the queue is full.
    #[serde(default)]
    pub policy: OverflowPolicy,
}

fn default_queue_max_size() -> usize {
    1024
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_size: default_queue_max_size(),
            policy: OverflowPolicy::default(),
        }
    }
}

impl QueueOptions {
    /// Set the queue capacity.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set the overflow policy.
    pub fn with_policy(mut self, policy: OverflowPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// TLS protocol versions the client can pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsVersion {
    /// TLS 1.2.
    Tls12,
    /// TLS 1.3.
    Tls13,
}

/// TLS behavior for `wss://` endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsOptions {
    /// Lowest acceptable protocol version. Default: unrestricted.
    #[serde(default)]
    pub min_version: Option<TlsVersion>,

    /// Highest acceptable protocol version. Default: unrestricted.
    #[serde(default)]
    pub max_version: Option<TlsVersion>,

    /// Verify the server certificate chain and hostname. Default: true.
    /// Disabling this is for test environments with self-signed
    /// certificates only.
    #[serde(default = "default_verify_peer")]
    pub verify_peer: bool,
}

fn default_verify_peer() -> bool {
    true
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            min_version: None,
            max_version: None,
            verify_peer: default_verify_peer(),
        }
    }
}

impl TlsOptions {
    /// Pin the minimum TLS version.
    pub fn with_min_version(mut self, version: TlsVersion) -> Self {
        self.min_version = Some(version);
        self
    }

    /// Pin the maximum TLS version.
    pub fn with_max_version(mut self, version: TlsVersion) -> Self {
        self.max_version = Some(version);
        self
    }

    /// Enable or disable peer verification.
    pub fn with_verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }
}

/// Complete configuration for a [`LiveQueryClient`](crate::LiveQueryClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// LiveQuery server endpoint, `ws://host[:port][/path]` or `wss://…`.
    pub endpoint: String,

    /// Application credentials for the `connect` handshake.
    pub credentials: Credentials,

    /// Connect automatically when `subscribe` is called while
    /// disconnected. Default: true.
    pub auto_connect: bool,

    /// Reconnect automatically after unexpected disconnects.
    /// Default: true.
    pub auto_reconnect: bool,

    /// Time bounds for connection and liveness handling.
    pub timeouts: Timeouts,

    /// Reconnection backoff tuning.
    pub reconnect: ReconnectOptions,

    /// Circuit breaker thresholds.
    pub breaker: BreakerOptions,

    /// Event queue sizing and overflow policy.
    pub queue: QueueOptions,

    /// Reject frames whose declared payload exceeds this many bytes.
    pub max_message_size: usize,

    /// TLS behavior for `wss://` endpoints.
    pub tls: TlsOptions,
}

impl ClientConfig {
    /// Configuration with defaults for everything but endpoint and
    /// credentials.
    pub fn new(endpoint: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            endpoint: endpoint.into(),
            credentials,
            auto_connect: true,
            auto_reconnect: true,
            timeouts: Timeouts::default(),
            reconnect: ReconnectOptions::default(),
            breaker: BreakerOptions::default(),
            queue: QueueOptions::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            tls: TlsOptions::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_defaults() {
        let opts = ReconnectOptions::default();
        assert_eq!(opts.initial_interval_ms, 1000);
        assert_eq!(opts.max_interval_ms, 30_000);
        assert_eq!(opts.multiplier, 2.0);
        assert_eq!(opts.jitter, 0.25);
        assert_eq!(opts.initial_interval(), Duration::from_millis(1000));
    }

    #[test]
    fn test_breaker_defaults() {
        let opts = BreakerOptions::default();
        assert_eq!(opts.failure_threshold, 5);
        assert_eq!(opts.reset_timeout(), Duration::from_secs(30));
        assert_eq!(opts.half_open_successes, 2);
        assert_eq!(opts.half_open_max_probes, 3);
    }

    #[test]
    fn test_queue_options_serde_round_trip() {
        let opts = QueueOptions::default()
            .with_max_size(64)
            .with_policy(OverflowPolicy::DropOldest);
        let text = serde_json::to_string(&opts).unwrap();
        assert!(text.contains("drop_oldest"));
        let parsed: QueueOptions = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, opts);
    }

    #[test]
    fn test_queue_options_defaults_from_empty_json() {
        let parsed: QueueOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed.max_size, 1024);
        assert_eq!(parsed.policy, OverflowPolicy::Block);
    }

    #[test]
    fn test_tls_version_ordering() {
        assert!(TlsVersion::Tls12 < TlsVersion::Tls13);
    }

    #[test]
    fn test_client_config_defaults() {
        let config = ClientConfig::new("ws://localhost:8080", Credentials::new("app"));
        assert!(config.auto_connect);
        assert!(config.auto_reconnect);
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert!(config.tls.verify_peer);
    }
}
