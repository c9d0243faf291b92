//! Connection lifecycle callbacks.
//!
//! Distinct from per-subscription callbacks: these observe the connection
//! itself.
//!
//! - [`on_open`](ConnectionHandlers::on_open): the `connected` handshake
//!   completed; receives the server-assigned client id
//! - [`on_close`](ConnectionHandlers::on_close): the connection ended,
//!   expectedly or not
//! - [`on_error`](ConnectionHandlers::on_error): a connection-level error
//!   occurred
//! - [`on_receive`](ConnectionHandlers::on_receive) /
//!   [`on_send`](ConnectionHandlers::on_send): debug hooks observing every
//!   raw JSON message in either direction
//!
//! All handlers are optional and invoked outside any client lock.

use crate::error::LiveQueryError;
use std::fmt;
use std::sync::Arc;

/// Why a connection ended.
#[derive(Debug, Clone)]
pub struct CloseReason {
    /// Human-readable description.
    pub message: String,
    /// WebSocket close code, when one was exchanged.
    pub code: Option<u16>,
}

impl CloseReason {
    /// Close reason without a code.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), code: None }
    }

    /// Close reason carrying a WebSocket close code.
    pub fn with_code(message: impl Into<String>, code: u16) -> Self {
        Self { message: message.into(), code: Some(code) }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

/// `on_open` callback type.
pub type OnOpenCallback = Arc<dyn Fn(&str) + Send + Sync>;
/// `on_close` callback type.
pub type OnCloseCallback = Arc<dyn Fn(&CloseReason) + Send + Sync>;
/// `on_error` callback type.
pub type OnErrorCallback = Arc<dyn Fn(&LiveQueryError) + Send + Sync>;
/// `on_receive` / `on_send` debug hook type.
pub type OnTrafficCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Optional connection lifecycle callbacks.
#[derive(Clone, Default)]
pub struct ConnectionHandlers {
    pub(crate) on_open: Option<OnOpenCallback>,
    pub(crate) on_close: Option<OnCloseCallback>,
    pub(crate) on_error: Option<OnErrorCallback>,
    pub(crate) on_receive: Option<OnTrafficCallback>,
    pub(crate) on_send: Option<OnTrafficCallback>,
}

impl ConnectionHandlers {
    /// Handlers with nothing registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once per successful `connected` handshake.
    pub fn on_open(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_open = Some(Arc::new(f));
        self
    }

    /// Called whenever the connection ends.
    pub fn on_close(mut self, f: impl Fn(&CloseReason) + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(f));
        self
    }

    /// Called on connection-level errors (handshake failure, circuit open,
    /// protocol-level server errors without a request id).
    pub fn on_error(mut self, f: impl Fn(&LiveQueryError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Debug hook observing every inbound JSON message before parsing.
    pub fn on_receive(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_receive = Some(Arc::new(f));
        self
    }

    /// Debug hook observing every outbound JSON message.
    pub fn on_send(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_send = Some(Arc::new(f));
        self
    }

    pub(crate) fn emit_open(&self, client_id: &str) {
        if let Some(cb) = &self.on_open {
            cb(client_id);
        }
    }

    pub(crate) fn emit_close(&self, reason: &CloseReason) {
        if let Some(cb) = &self.on_close {
            cb(reason);
        }
    }

    pub(crate) fn emit_error(&self, error: &LiveQueryError) {
        if let Some(cb) = &self.on_error {
            cb(error);
        }
    }

    pub(crate) fn emit_receive(&self, raw: &str) {
        if let Some(cb) = &self.on_receive {
            cb(raw);
        }
    }

    pub(crate) fn emit_send(&self, raw: &str) {
        if let Some(cb) = &self.on_send {
            cb(raw);
        }
    }
}

impl fmt::Debug for ConnectionHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandlers")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_receive", &self.on_receive.is_some())
            .field("on_send", &self.on_send.is_some())
            .finish()
    }
}
