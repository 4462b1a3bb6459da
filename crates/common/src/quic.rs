//! QUIC message channel.
//!
//! One bidirectional stream per connection carries newline-delimited JSON.
//! QUIC has no control frames visible to the application, so [`Frame::Ping`]
//! and [`Frame::Pong`] travel as the `ping`/`pong` protocol messages.

use crate::channel::{Frame, MessageChannel, TransportKind, APP_PING, APP_PONG};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use quinn::{Connection, Endpoint, RecvStream, SendStream, VarInt};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::debug;

/// Upper bound for one protocol line.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// A QUIC connection plus the bidirectional stream that carries messages.
pub struct QuicChannel {
    connection: Connection,
    // Client side keeps its endpoint alive for the lifetime of the channel.
    endpoint: Option<Endpoint>,
    reader: FramedRead<RecvStream, LinesCodec>,
    writer: FramedWrite<SendStream, LinesCodec>,
}

impl QuicChannel {
    pub fn new(connection: Connection, send: SendStream, recv: RecvStream) -> Self {
        Self {
            connection,
            endpoint: None,
            reader: FramedRead::new(recv, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            writer: FramedWrite::new(send, LinesCodec::new()),
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        self.writer
            .send(line)
            .await
            .map_err(|e| Error::Quic(e.to_string()))
    }
}

#[async_trait]
impl MessageChannel for QuicChannel {
    fn kind(&self) -> TransportKind {
        TransportKind::Quic
    }

    async fn send(&mut self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Text(text) => self.write_line(&text).await,
            Frame::Ping => self.write_line(APP_PING).await,
            Frame::Pong => self.write_line(APP_PONG).await,
            Frame::Close => {
                self.close().await;
                Ok(())
            }
        }
    }

    async fn recv(&mut self) -> Option<Result<Frame>> {
        match self.reader.next().await? {
            Ok(line) => Some(Ok(Frame::Text(line))),
            Err(e) => Some(Err(Error::Framing(e.to_string()))),
        }
    }

    async fn close(&mut self) {
        let _ = self.writer.get_mut().finish();
        self.connection.close(VarInt::from_u32(0), b"closed");
        if let Some(endpoint) = &self.endpoint {
            endpoint.close(VarInt::from_u32(0), b"closed");
        }
    }
}

/// Load a PEM certificate chain.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(Error::Quic(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load the first PEM private key (PKCS#8, PKCS#1 or SEC1).
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| Error::Quic(format!("no private key found in {}", path.display())))
}

/// Connect to a gateway QUIC listener and open the message stream.
///
/// `ca_cert` is the trust root for the server certificate.
pub async fn connect(addr: SocketAddr, server_name: &str, ca_cert: &Path) -> Result<QuicChannel> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in load_certs(ca_cert)? {
        roots
            .add(cert)
            .map_err(|e| Error::Quic(format!("invalid trust root: {e}")))?;
    }
    let client_config = quinn::ClientConfig::with_root_certificates(Arc::new(roots))
        .map_err(|e| Error::Quic(e.to_string()))?;

    let bind: SocketAddr = if addr.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let endpoint = Endpoint::client(bind)?;

    debug!("Connecting QUIC to {} ({})", addr, server_name);
    let connection = endpoint
        .connect_with(client_config, addr, server_name)
        .map_err(|e| Error::Quic(e.to_string()))?
        .await
        .map_err(|e| Error::Quic(e.to_string()))?;
    let (send, recv) = connection
        .open_bi()
        .await
        .map_err(|e| Error::Quic(e.to_string()))?;
    debug!("QUIC stream open to {}", connection.remote_address());

    let mut channel = QuicChannel::new(connection, send, recv);
    channel.endpoint = Some(endpoint);
    Ok(channel)
}
