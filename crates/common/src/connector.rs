//! Client connector with QUIC-first connect and WebSocket fallback.
//!
//! [`GatewayClient::connect`] tries QUIC when a target is configured and falls
//! back to WebSocket on any failure (handshake error, timeout, missing trust
//! root, QUIC support not compiled in). The caller only sees a working
//! [`MessageChannel`]; which transport won is available via
//! [`GatewayClient::transport`].

use crate::channel::{Frame, MessageChannel, TransportKind};
use crate::error::{Error, Result};
use crate::messages::{ClientMessage, ServerMessage};
use crate::websocket;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where to reach the gateway's QUIC listener.
#[derive(Debug, Clone)]
pub struct QuicTarget {
    pub addr: SocketAddr,
    /// Name checked against the server certificate.
    pub server_name: String,
    /// PEM trust root for the server certificate.
    pub ca_cert_path: PathBuf,
}

/// Options for [`GatewayClient::connect`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:8085/ws`.
    pub websocket_url: String,
    /// Optional QUIC endpoint, attempted first.
    pub quic: Option<QuicTarget>,
    /// Credential sent with an `authenticate` message once connected.
    pub token: Option<String>,
    /// Bound on the QUIC attempt before falling back.
    pub connect_timeout: Duration,
}

impl ConnectOptions {
    pub fn websocket(url: impl Into<String>) -> Self {
        Self {
            websocket_url: url.into(),
            quic: None,
            token: None,
            connect_timeout: Duration::from_secs(3),
        }
    }

    pub fn with_quic(mut self, target: QuicTarget) -> Self {
        self.quic = Some(target);
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// Open a channel to the gateway, preferring QUIC.
pub async fn open_channel(options: &ConnectOptions) -> Result<Box<dyn MessageChannel>> {
    if let Some(target) = &options.quic {
        match try_quic(target, options.connect_timeout).await {
            Ok(channel) => {
                info!("Connected to gateway over QUIC at {}", target.addr);
                return Ok(channel);
            }
            Err(e) => {
                debug!("QUIC unavailable ({}), falling back to WebSocket", e);
            }
        }
    }

    let channel = websocket::connect(&options.websocket_url, None).await?;
    info!("Connected to gateway over WebSocket at {}", options.websocket_url);
    Ok(Box::new(channel))
}

#[cfg(feature = "quic")]
async fn try_quic(target: &QuicTarget, timeout: Duration) -> Result<Box<dyn MessageChannel>> {
    let connect = crate::quic::connect(target.addr, &target.server_name, &target.ca_cert_path);
    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(channel)) => Ok(Box::new(channel)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Error::Timeout),
    }
}

#[cfg(not(feature = "quic"))]
async fn try_quic(_target: &QuicTarget, _timeout: Duration) -> Result<Box<dyn MessageChannel>> {
    Err(Error::Quic("QUIC support not compiled in".to_string()))
}

/// A connected gateway client.
pub struct GatewayClient {
    channel: Box<dyn MessageChannel>,
    /// Events that arrived while waiting for a request reply.
    pending: VecDeque<ServerMessage>,
}

impl GatewayClient {
    /// Connect (QUIC first, then WebSocket) and authenticate if a token is set.
    pub async fn connect(options: ConnectOptions) -> Result<Self> {
        let channel = open_channel(&options).await?;
        let mut client = Self::from_channel(channel);

        match options.token {
            Some(token) => {
                client.authenticate(&token).await?;
            }
            None if client.transport() == TransportKind::Quic => {
                // A QUIC stream is only visible to the server once written to
                client.send(&ClientMessage::Ping).await?;
            }
            None => {}
        }
        Ok(client)
    }

    pub fn from_channel(channel: Box<dyn MessageChannel>) -> Self {
        Self {
            channel,
            pending: VecDeque::new(),
        }
    }

    /// The transport this client ended up on.
    pub fn transport(&self) -> TransportKind {
        self.channel.kind()
    }

    /// Send one protocol message.
    pub async fn send(&mut self, msg: &ClientMessage) -> Result<()> {
        let json = serde_json::to_string(msg)?;
        self.channel.send(Frame::Text(json)).await
    }

    /// Authenticate and return the gateway's confirmation text.
    pub async fn authenticate(&mut self, token: &str) -> Result<String> {
        self.request(&ClientMessage::authenticate(token)).await
    }

    pub async fn subscribe(&mut self, topic: &str) -> Result<String> {
        self.request(&ClientMessage::subscribe(topic)).await
    }

    pub async fn unsubscribe(&mut self, topic: &str) -> Result<String> {
        self.request(&ClientMessage::unsubscribe(topic)).await
    }

    /// Next message from the gateway. Application pings are answered here and
    /// never returned. `Ok(None)` once the gateway closes the channel.
    pub async fn next_message(&mut self) -> Result<Option<ServerMessage>> {
        if let Some(msg) = self.pending.pop_front() {
            return Ok(Some(msg));
        }
        self.read_message().await
    }

    /// Close the channel.
    pub async fn close(mut self) {
        self.channel.close().await;
    }

    async fn read_message(&mut self) -> Result<Option<ServerMessage>> {
        loop {
            let frame = match self.channel.recv().await {
                Some(frame) => frame?,
                None => return Ok(None),
            };
            match frame {
                Frame::Text(text) => match serde_json::from_str::<ServerMessage>(&text)? {
                    ServerMessage::Ping => {
                        self.send(&ClientMessage::Pong).await?;
                    }
                    msg => return Ok(Some(msg)),
                },
                Frame::Ping => {
                    self.channel.send(Frame::Pong).await?;
                }
                Frame::Pong => {}
                Frame::Close => return Ok(None),
            }
        }
    }

    /// Send a request and wait for its success/error reply.
    async fn request(&mut self, msg: &ClientMessage) -> Result<String> {
        self.send(msg).await?;
        loop {
            match self.read_message().await? {
                Some(ServerMessage::Success { data }) => return Ok(data.message),
                Some(ServerMessage::Error { error }) => return Err(Error::Rejected(error)),
                Some(ServerMessage::Pong) => {}
                Some(event @ ServerMessage::Event { .. }) => self.pending.push_back(event),
                Some(other) => {
                    warn!("Unexpected reply from gateway: {:?}", other);
                    return Err(Error::UnexpectedReply(format!("{other:?}")));
                }
                None => return Err(Error::ConnectionClosed),
            }
        }
    }
}
