//! Error types for the LiveQuery client.
//!
//! A single crate-wide error enum with explicit kinds. Connection-class
//! failures (handshake, timeout, oversized frame, socket i/o, TLS) are the
//! ones the [`CircuitBreaker`](crate::breaker::CircuitBreaker) counts;
//! everything else is handled locally and never torn down the connection.

use thiserror::Error;

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LiveQueryError>;

/// Errors produced by the LiveQuery client.
#[derive(Error, Debug)]
pub enum LiveQueryError {
    /// The connection could not be established or was lost unexpectedly.
    #[error("connection error: {0}")]
    Connection(String),

    /// An operation did not complete within its configured timeout.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A frame declared a payload larger than the configured limit.
    ///
    /// Raised before any payload bytes are read.
    #[error("frame of {size} bytes exceeds the {limit} byte message limit")]
    MessageTooLarge {
        /// Declared payload length.
        size: usize,
        /// Configured `max_message_size`.
        limit: usize,
    },

    /// The peer sent something this sub-protocol cannot interpret.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server rejected a subscription.
    #[error("subscription {request_id} rejected: {message}")]
    Subscription {
        /// Request id of the rejected subscription.
        request_id: u64,
        /// Server-supplied error code, if any.
        code: Option<i32>,
        /// Server-supplied error message.
        message: String,
    },

    /// The event queue rejected an item under its overflow policy.
    #[error("event queue is full")]
    QueueFull,

    /// A user-supplied callback panicked.
    #[error("callback panicked: {0}")]
    Callback(String),

    /// Invalid client configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Underlying socket i/o failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS setup or handshake failure.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The client was shut down; no further connections will be attempted.
    #[error("client has been closed")]
    ClientClosed,
}

impl LiveQueryError {
    /// Returns `true` for failures that count against the circuit breaker.
    ///
    /// The breaker only cares about the connection being unusable; protocol
    /// hiccups, queue pressure and callback bugs are recovered locally.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::Timeout(_)
                | Self::MessageTooLarge { .. }
                | Self::Io(_)
                | Self::Tls(_)
        )
    }
}
