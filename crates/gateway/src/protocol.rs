//! Inbound message decoding and client-facing error text.
//!
//! Message types live in [`gateway_common::messages`]; this module turns raw
//! text into a [`ClientMessage`] and maps every failure to the exact error
//! string clients see.

use gateway_common::{ClientMessage, ServerMessage};
use serde_json::Value;
use thiserror::Error;

pub const AUTH_SUCCESS: &str = "Authentication successful";
pub const AUTH_FAILED: &str = "Invalid or expired token";

/// A client message that could not be handled. Reported back to the client;
/// the connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid message format")]
    Malformed,
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("eventType is required")]
    MissingEventType,
    #[error("Token is required")]
    MissingToken,
    #[error("Authentication required")]
    AuthenticationRequired,
}

impl ProtocolError {
    pub fn to_reply(&self) -> ServerMessage {
        ServerMessage::error(self.to_string())
    }
}

/// Decode one text frame.
pub fn decode_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::Malformed)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::Malformed)?;
    match kind {
        "authenticate" | "subscribe" | "unsubscribe" | "ping" | "pong" => {
            serde_json::from_value(value).map_err(|_| ProtocolError::Malformed)
        }
        other => Err(ProtocolError::UnknownType(other.to_string())),
    }
}

/// A required, non-empty topic from a subscribe/unsubscribe message.
pub fn require_topic(event_type: Option<String>) -> Result<String, ProtocolError> {
    event_type
        .map(|topic| topic.trim().to_string())
        .filter(|topic| !topic.is_empty())
        .ok_or(ProtocolError::MissingEventType)
}
