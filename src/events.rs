//! Server-pushed change notifications.
//!
//! [`Event`] is the immutable value object handed to subscription callbacks:
//! one change notification with its kind, the affected object, the optional
//! prior object and the owning request id. Construction happens on the
//! frame-reader side; destruction happens once callback dispatch completes.
//! Events are never retained by the client.

use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// The five kinds of change notification the server can push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A new object entered the result set by being created.
    Create,
    /// An object already in the result set was modified.
    Update,
    /// An object in the result set was deleted.
    Delete,
    /// An existing object changed so that it now matches the query.
    Enter,
    /// An object changed so that it no longer matches the query.
    Leave,
}

impl EventKind {
    /// Wire name of this event kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Enter => "enter",
            Self::Leave => "leave",
        }
    }

    /// `true` for kinds where the server may attach the prior object state.
    pub fn carries_original(&self) -> bool {
        matches!(self, Self::Update | Self::Enter | Self::Leave)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded object as delivered to callbacks.
///
/// This is the output of the [`ObjectDecoder`] seam: the raw JSON document
/// from the wire, tagged with the class it belongs to and its extracted
/// object id. Applications that map documents onto richer model types do so
/// inside their callbacks, starting from the retained [`data`](Self::data).
#[derive(Debug, Clone, PartialEq)]
pub struct LiveObject {
    /// Collection / class the object belongs to.
    pub class_name: String,
    /// The `objectId` field, when present.
    pub object_id: Option<String>,
    /// Full document body.
    pub data: JsonValue,
}

impl LiveObject {
    /// Look up a top-level field of the document.
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.data.get(key)
    }
}

/// Turns a raw JSON document plus its class name into a [`LiveObject`].
///
/// This is the boundary to the object-mapping layer, which is outside the
/// scope of this crate. The default [`JsonDecoder`] keeps the document
/// as-is; an application wanting eager validation or normalization plugs in
/// its own implementation via the client builder.
pub trait ObjectDecoder: Send + Sync {
    /// Build an object instance from a raw server payload.
    fn build(&self, class_name: &str, raw: JsonValue) -> LiveObject;
}

/// Default decoder: wraps the raw document without transformation.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDecoder;

impl ObjectDecoder for JsonDecoder {
    fn build(&self, class_name: &str, raw: JsonValue) -> LiveObject {
        let object_id = raw
            .get("objectId")
            .and_then(JsonValue::as_str)
            .map(str::to_owned);
        LiveObject {
            class_name: class_name.to_owned(),
            object_id,
            data: raw,
        }
    }
}

/// Shared handle to the configured decoder.
pub type SharedDecoder = Arc<dyn ObjectDecoder>;

/// One server-pushed change notification.
#[derive(Debug, Clone)]
pub struct Event {
    kind: EventKind,
    object: LiveObject,
    original: Option<LiveObject>,
    request_id: u64,
    received_at: SystemTime,
}

impl Event {
    /// Construct an event; `received_at` is stamped at call time.
    pub fn new(
        kind: EventKind,
        object: LiveObject,
        original: Option<LiveObject>,
        request_id: u64,
    ) -> Self {
        Self {
            kind,
            object,
            original,
            request_id,
            received_at: SystemTime::now(),
        }
    }

    /// Kind of change this event describes.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// The object in its current state.
    pub fn object(&self) -> &LiveObject {
        &self.object
    }

    /// The prior object state; only meaningful for update/enter/leave.
    pub fn original(&self) -> Option<&LiveObject> {
        self.original.as_ref()
    }

    /// Request id of the subscription this event belongs to.
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// When the client received the underlying frame.
    pub fn received_at(&self) -> SystemTime {
        self.received_at
    }
}
