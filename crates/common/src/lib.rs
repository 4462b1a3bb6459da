//! Shared building blocks for the realtime gateway and its clients.
//!
//! - [`messages`]: the JSON protocol spoken on every transport
//! - [`channel`]: the transport-independent [`MessageChannel`] capability
//! - [`websocket`] / [`quic`]: client-side channel implementations
//! - [`connector`]: QUIC-first connect with transparent WebSocket fallback

pub mod channel;
pub mod connector;
pub mod error;
pub mod messages;
#[cfg(feature = "quic")]
pub mod quic;
pub mod websocket;

pub use channel::{Frame, MessageChannel, TransportKind};
pub use connector::{ConnectOptions, GatewayClient, QuicTarget};
pub use error::{Error, Result};
pub use messages::{AuthenticateData, ClientMessage, ServerMessage, SuccessData};
