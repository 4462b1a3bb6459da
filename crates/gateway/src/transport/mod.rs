//! Server-side transport adapters.
//!
//! WebSocket is always served. QUIC is optional: at startup the gateway
//! probes for it by binding the listener and falls back to WebSocket only when
//! QUIC is not configured or cannot be bound. Past the accept step every
//! connection is a `Box<dyn MessageChannel>` and nothing else branches on the
//! transport.

#[cfg(feature = "quic")]
pub mod quic;
pub mod websocket;

use gateway_common::TransportKind;
use std::net::SocketAddr;
use std::path::PathBuf;

pub use websocket::WebSocketChannel;

/// Where and how to serve QUIC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuicSettings {
    pub addr: SocketAddr,
    /// PEM certificate chain.
    pub cert_path: PathBuf,
    /// PEM private key.
    pub key_path: PathBuf,
}

/// Transports actually being served.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportSet {
    quic_addr: Option<SocketAddr>,
}

impl TransportSet {
    pub fn websocket_only() -> Self {
        Self::default()
    }

    pub fn with_quic(addr: SocketAddr) -> Self {
        Self {
            quic_addr: Some(addr),
        }
    }

    pub fn quic_addr(&self) -> Option<SocketAddr> {
        self.quic_addr
    }

    /// Active transports, WebSocket first.
    pub fn active(&self) -> Vec<TransportKind> {
        let mut active = vec![TransportKind::WebSocket];
        if self.quic_addr.is_some() {
            active.push(TransportKind::Quic);
        }
        active
    }
}
