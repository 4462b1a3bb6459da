//! Transport-independent message channel.
//!
//! Each transport (WebSocket, QUIC) implements [`MessageChannel`]. Callers
//! only branch on [`TransportKind`] at connect/accept time.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which protocol carries a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Reliable ordered duplex channel over TCP. Always available.
    #[serde(rename = "websocket")]
    WebSocket,
    /// Stream-capable channel over QUIC. Optional.
    Quic,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::WebSocket => "websocket",
            TransportKind::Quic => "quic",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of traffic on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// One JSON protocol message.
    Text(String),
    /// Liveness probe.
    Ping,
    /// Liveness answer.
    Pong,
    /// Orderly close.
    Close,
}

/// Duplex message channel owned by exactly one connection.
///
/// Message boundaries are preserved and delivery is ordered per channel.
/// `recv` must be cancel-safe: the session loop polls it inside `select!`.
#[async_trait]
pub trait MessageChannel: Send + 'static {
    /// The protocol behind this channel.
    fn kind(&self) -> TransportKind;

    /// Write one frame.
    async fn send(&mut self, frame: Frame) -> Result<()>;

    /// Read the next frame. `None` once the peer is gone.
    async fn recv(&mut self) -> Option<Result<Frame>>;

    /// Close the channel. Errors are ignored; the peer may already be gone.
    async fn close(&mut self);
}

/// Wire text used for [`Frame::Ping`] / [`Frame::Pong`] on transports
/// without native control frames.
pub const APP_PING: &str = r#"{"type":"ping"}"#;
pub const APP_PONG: &str = r#"{"type":"pong"}"#;
