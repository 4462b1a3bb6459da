//! Gateway error types.

use crate::connection::ConnectionId;
use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Upstream bus failure (unreachable, subscription refused).
    #[error("Bus error: {0}")]
    Bus(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Transport failure on a client channel.
    #[error("Transport error: {0}")]
    Transport(#[from] gateway_common::Error),

    /// A transport write did not finish within the send timeout.
    #[error("Send timed out")]
    SendTimeout,

    /// Generated connection id already registered.
    #[error("Duplicate connection id: {0}")]
    DuplicateConnection(ConnectionId),

    /// Verification key missing or unusable.
    #[error("Invalid verification key: {0}")]
    VerificationKey(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error (key files, listeners).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
