//! Error types for gateway channels and the client connector.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("QUIC error: {0}")]
    Quic(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Frame too large or malformed: {0}")]
    Framing(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timed out")]
    Timeout,

    #[error("Gateway rejected request: {0}")]
    Rejected(String),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),
}

pub type Result<T> = std::result::Result<T, Error>;
