//! Application credentials for the LiveQuery handshake.
//!
//! The client never acquires tokens itself; callers obtain an application
//! id, optional client key and optional master key from their platform
//! configuration and hand them to the client as a value object. Session
//! tokens are per-subscription and live on
//! [`Subscription`](crate::subscription::Subscription) instead.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Credentials sent in the `connect` protocol message.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    /// Application identifier (required by every deployment).
    pub application_id: String,

    /// Client key, required by deployments that gate anonymous clients.
    pub client_key: Option<String>,

    /// Master key; grants unrestricted subscriptions. Server-side use only.
    pub master_key: Option<String>,
}

impl Credentials {
    /// Create credentials carrying only an application id.
    pub fn new(application_id: impl Into<String>) -> Self {
        Self {
            application_id: application_id.into(),
            client_key: None,
            master_key: None,
        }
    }

    /// Attach a client key.
    pub fn with_client_key(mut self, key: impl Into<String>) -> Self {
        self.client_key = Some(key.into());
        self
    }

    /// Attach a master key.
    pub fn with_master_key(mut self, key: impl Into<String>) -> Self {
        self.master_key = Some(key.into());
        self
    }
}

// Keys must never end up in logs, so Debug redacts everything but the
// application id.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("application_id", &self.application_id)
            .field("client_key", &self.client_key.as_ref().map(|_| "<redacted>"))
            .field("master_key", &self.master_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
