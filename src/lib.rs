//! # livequery-client: real-time push notifications over WebSocket
//!
//! A resilient client for LiveQuery servers: it keeps one WebSocket
//! session per client, authenticates with application credentials,
//! registers per-query subscriptions and delivers
//! create/update/delete/enter/leave notifications to typed callbacks as
//! they arrive.
//!
//! ## Features
//!
//! - **Raw RFC 6455 framing** with client-side masking, size-capped reads
//!   and a verified upgrade handshake, over TCP or TLS
//! - **Automatic reconnection** with exponential backoff, jitter and a
//!   circuit breaker that stops hammering an unreachable server
//! - **Liveness monitoring** via ping/pong with a stale-connection
//!   detector
//! - **Backpressure-aware delivery**: a bounded event queue decouples the
//!   frame reader from application callbacks, with block / drop-oldest /
//!   drop-newest overflow policies
//! - **Isolated callbacks**: a panicking callback is contained, logged and
//!   re-emitted as an error event; it can never take down delivery
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use livequery_client::{Credentials, LiveQueryClient};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> livequery_client::Result<()> {
//!     let client = LiveQueryClient::builder()
//!         .endpoint("wss://example.com/livequery")
//!         .credentials(Credentials::new("my-app").with_client_key("my-key"))
//!         .build()?;
//!
//!     let scores = client
//!         .subscribe("GameScore", json!({"score": {"$gt": 100}}))
//!         .await?;
//!     scores
//!         .on_create(|event| println!("created: {:?}", event.object()))
//!         .on_update(|event| println!("updated: {:?}", event.object()))
//!         .on_error(|error| eprintln!("subscription error: {error}"));
//!
//!     client.connect().await?;
//!     # Ok(())
//! }
//! ```
//!
//! The filter passed to [`LiveQueryClient::subscribe`] is the compiled
//! `where` clause produced by a query layer; this crate treats it as
//! opaque JSON. Decoding of pushed objects into application types happens
//! behind the [`ObjectDecoder`] seam.

pub mod backoff;
pub mod breaker;
pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod frame;
pub mod handlers;
pub mod health;
pub mod protocol;
pub mod queue;
pub mod subscription;
pub mod timeouts;
pub mod transport;

// Re-export the primary types for convenience.
pub use backoff::ReconnectPolicy;
pub use breaker::{BreakerState, CircuitBreaker};
pub use client::{ConnectionState, LiveQueryClient, LiveQueryClientBuilder};
pub use config::{
    BreakerOptions, ClientConfig, OverflowPolicy, QueueOptions, ReconnectOptions, TlsOptions,
    TlsVersion,
};
pub use credentials::Credentials;
pub use error::{LiveQueryError, Result};
pub use events::{Event, EventKind, JsonDecoder, LiveObject, ObjectDecoder};
pub use handlers::{CloseReason, ConnectionHandlers};
pub use health::{HealthInfo, HealthMonitor};
pub use queue::{EventQueue, QueueStats};
pub use subscription::{RequestIdSequence, Subscription, SubscriptionInfo, SubscriptionState};
pub use timeouts::Timeouts;

/// Library version, from the crate metadata.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
