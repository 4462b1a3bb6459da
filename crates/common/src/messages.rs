//! JSON protocol messages exchanged between clients and the gateway.
//!
//! Every message is an object tagged by its `type` field. Field names on the
//! wire are camelCase (`eventType`), matching the web clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Client → Server Messages
// ============================================================================

/// Message sent from client to gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Attach a principal to the connection.
    Authenticate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<AuthenticateData>,
    },
    /// Start receiving events for a topic.
    Subscribe {
        #[serde(
            rename = "eventType",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        event_type: Option<String>,
    },
    /// Stop receiving events for a topic.
    Unsubscribe {
        #[serde(
            rename = "eventType",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        event_type: Option<String>,
    },
    /// Keepalive probe; answered with [`ServerMessage::Pong`].
    Ping,
    /// Answer to an application-level [`ServerMessage::Ping`].
    Pong,
}

impl ClientMessage {
    pub fn authenticate(token: impl Into<String>) -> Self {
        Self::Authenticate {
            data: Some(AuthenticateData {
                token: Some(token.into()),
            }),
        }
    }

    pub fn subscribe(topic: impl Into<String>) -> Self {
        Self::Subscribe {
            event_type: Some(topic.into()),
        }
    }

    pub fn unsubscribe(topic: impl Into<String>) -> Self {
        Self::Unsubscribe {
            event_type: Some(topic.into()),
        }
    }
}

/// Payload of an `authenticate` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticateData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

// ============================================================================
// Server → Client Messages
// ============================================================================

/// Message sent from gateway to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Positive reply to a client request.
    Success { data: SuccessData },
    /// Negative reply; the connection stays open.
    Error { error: String },
    /// A broadcast event for a subscribed topic.
    Event {
        #[serde(rename = "eventType")]
        event_type: String,
        data: Value,
        /// Epoch milliseconds at dispatch.
        timestamp: i64,
    },
    /// Application-level liveness probe (transports without native ping).
    Ping,
    /// Answer to [`ClientMessage::Ping`].
    Pong,
}

impl ServerMessage {
    pub fn success(message: impl Into<String>) -> Self {
        Self::Success {
            data: SuccessData {
                message: message.into(),
            },
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }

    /// Serialize to the single-line JSON text sent on the wire.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessData {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_messages_parse_from_wire() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"authenticate","data":{"token":"abc"}}"#).unwrap();
        assert_eq!(msg, ClientMessage::authenticate("abc"));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","eventType":"submission.updated"}"#)
                .unwrap();
        assert_eq!(msg, ClientMessage::subscribe("submission.updated"));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"unsubscribe"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Unsubscribe { event_type: None });

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping);
    }

    #[test]
    fn test_server_replies_match_wire_shape() {
        let success = serde_json::to_value(ServerMessage::success("Authentication successful"))
            .unwrap();
        assert_eq!(
            success,
            json!({"type": "success", "data": {"message": "Authentication successful"}})
        );

        let error = serde_json::to_value(ServerMessage::error("Invalid or expired token")).unwrap();
        assert_eq!(error, json!({"type": "error", "error": "Invalid or expired token"}));
    }

    #[test]
    fn test_event_uses_camel_case_event_type() {
        let event = ServerMessage::Event {
            event_type: "grading.completed".to_string(),
            data: json!({"userId": "u1"}),
            timestamp: 1_700_000_000_000,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["eventType"], "grading.completed");
        assert_eq!(value["data"]["userId"], "u1");
        assert_eq!(value["timestamp"], 1_700_000_000_000_i64);
    }
}
