//! JSON sub-protocol messages exchanged over the WebSocket.
//!
//! Every text frame carries one JSON object whose `op` field selects the
//! message type. [`ClientMessage`] covers the client→server direction,
//! [`ServerMessage`] the server→client direction.

use crate::credentials::Credentials;
use crate::events::EventKind;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Subprotocol token offered during the WebSocket upgrade.
pub const SUBPROTOCOL: &str = "livequery-json";

/// Client-to-server request messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Authenticated session open; first message after the upgrade.
    #[serde(rename_all = "camelCase")]
    Connect {
        /// Application identifier.
        application_id: String,
        /// Client key, when the deployment requires one.
        #[serde(skip_serializing_if = "Option::is_none")]
        client_key: Option<String>,
        /// Master key for privileged sessions.
        #[serde(skip_serializing_if = "Option::is_none")]
        master_key: Option<String>,
    },

    /// Register a live query.
    #[serde(rename_all = "camelCase")]
    Subscribe {
        /// Client-generated request id, unique process-wide.
        request_id: u64,
        /// The query this subscription watches.
        query: SubscribeQuery,
        /// Session token scoping results to a user's ACLs.
        #[serde(skip_serializing_if = "Option::is_none")]
        session_token: Option<String>,
    },

    /// Cancel a live query.
    #[serde(rename_all = "camelCase")]
    Unsubscribe {
        /// Request id of the subscription to cancel.
        request_id: u64,
    },
}

impl ClientMessage {
    /// Build the `connect` message from credentials.
    pub fn connect(credentials: &Credentials) -> Self {
        Self::Connect {
            application_id: credentials.application_id.clone(),
            client_key: credentials.client_key.clone(),
            master_key: credentials.master_key.clone(),
        }
    }
}

/// Query payload of a `subscribe` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeQuery {
    /// Collection / class name the query targets.
    pub class_name: String,
    /// Compiled filter produced by the query layer; opaque to this crate.
    #[serde(rename = "where")]
    pub filter: JsonValue,
    /// Optional field projection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
}

/// Payload shared by the five change-notification ops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    /// Request id of the owning subscription.
    pub request_id: u64,
    /// The affected object in its current state.
    pub object: JsonValue,
    /// Prior object state, sent for update/enter/leave.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<JsonValue>,
}

/// Server-to-client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Session accepted; carries the server-assigned client id.
    #[serde(rename_all = "camelCase")]
    Connected {
        /// Identifier for this client session.
        client_id: String,
    },

    /// A `subscribe` request was accepted.
    #[serde(rename_all = "camelCase")]
    Subscribed {
        /// Request id of the confirmed subscription.
        request_id: u64,
    },

    /// An `unsubscribe` request was processed.
    #[serde(rename_all = "camelCase")]
    Unsubscribed {
        /// Request id of the cancelled subscription.
        request_id: u64,
    },

    /// An object was created inside a watched result set.
    Create(EventPayload),
    /// An object inside a watched result set changed.
    Update(EventPayload),
    /// An object inside a watched result set was deleted.
    Delete(EventPayload),
    /// An object changed so that it entered a watched result set.
    Enter(EventPayload),
    /// An object changed so that it left a watched result set.
    Leave(EventPayload),

    /// Server-reported error, either scoped to a subscription or global.
    #[serde(rename_all = "camelCase")]
    Error {
        /// Affected subscription, when the error is subscription-scoped.
        #[serde(default)]
        request_id: Option<u64>,
        /// Human-readable error description.
        error: String,
        /// Numeric error code, when the server supplies one.
        #[serde(default)]
        code: Option<i32>,
        /// Server advice on whether reconnecting can help.
        #[serde(default)]
        reconnect: Option<bool>,
    },
}

impl ServerMessage {
    /// For change-notification ops, the event kind and payload.
    pub fn as_event(&self) -> Option<(EventKind, &EventPayload)> {
        match self {
            Self::Create(p) => Some((EventKind::Create, p)),
            Self::Update(p) => Some((EventKind::Update, p)),
            Self::Delete(p) => Some((EventKind::Delete, p)),
            Self::Enter(p) => Some((EventKind::Enter, p)),
            Self::Leave(p) => Some((EventKind::Leave, p)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_connect_message_wire_shape() {
        let creds = Credentials::new("app-1").with_client_key("ck-1");
        let msg = ClientMessage::connect(&creds);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"op": "connect", "applicationId": "app-1", "clientKey": "ck-1"})
        );
    }

    #[test]
    fn test_subscribe_message_wire_shape() {
        let msg = ClientMessage::Subscribe {
            request_id: 3,
            query: SubscribeQuery {
                class_name: "GameScore".into(),
                filter: json!({"score": {"$gt": 100}}),
                fields: Some(vec!["score".into()]),
            },
            session_token: Some("tok".into()),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "op": "subscribe",
                "requestId": 3,
                "query": {
                    "className": "GameScore",
                    "where": {"score": {"$gt": 100}},
                    "fields": ["score"]
                },
                "sessionToken": "tok"
            })
        );
    }

    #[test]
    fn test_unsubscribe_message_wire_shape() {
        let msg = ClientMessage::Unsubscribe { request_id: 3 };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"op": "unsubscribe", "requestId": 3})
        );
    }

    #[test]
    fn test_parse_connected() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"op":"connected","clientId":"c-42"}"#).unwrap();
        assert_eq!(msg, ServerMessage::Connected { client_id: "c-42".into() });
    }

    #[test]
    fn test_parse_event_ops() {
        for (op, kind) in [
            ("create", EventKind::Create),
            ("update", EventKind::Update),
            ("delete", EventKind::Delete),
            ("enter", EventKind::Enter),
            ("leave", EventKind::Leave),
        ] {
            let raw = format!(
                r#"{{"op":"{}","requestId":5,"object":{{"objectId":"o1"}},"original":{{"objectId":"o1","old":true}}}}"#,
                op
            );
            let msg: ServerMessage = serde_json::from_str(&raw).unwrap();
            let (parsed_kind, payload) = msg.as_event().expect("event op");
            assert_eq!(parsed_kind, kind);
            assert_eq!(payload.request_id, 5);
            assert!(payload.original.is_some());
        }
    }

    #[test]
    fn test_parse_error_without_request_id() {
        let msg: ServerMessage = serde_json::from_str(
            r#"{"op":"error","error":"invalid app id","code":1,"reconnect":false}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::Error { request_id, error, code, reconnect } => {
                assert_eq!(request_id, None);
                assert_eq!(error, "invalid app id");
                assert_eq!(code, Some(1));
                assert_eq!(reconnect, Some(false));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_original_omitted_when_absent() {
        let msg = ServerMessage::Create(EventPayload {
            request_id: 1,
            object: json!({"objectId": "o1"}),
            original: None,
        });
        let text = serde_json::to_string(&msg).unwrap();
        assert!(!text.contains("original"));
    }
}
