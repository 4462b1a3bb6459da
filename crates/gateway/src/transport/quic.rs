//! QUIC listener.
//!
//! Each QUIC connection carries one client session on the first
//! bidirectional stream the client opens. Framing is shared with the client
//! side ([`gateway_common::quic::QuicChannel`]).

use crate::error::{GatewayError, Result};
use crate::session::run_session;
use crate::transport::QuicSettings;
use crate::ws_server::AppState;
use gateway_common::quic::{load_certs, load_private_key, QuicChannel};
use gateway_common::Error;
use quinn::{Endpoint, Incoming, ServerConfig, VarInt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long a new QUIC connection may take to open its message stream.
pub const STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

fn quic_error(e: impl std::fmt::Display) -> GatewayError {
    GatewayError::Transport(Error::Quic(e.to_string()))
}

/// A bound QUIC endpoint accepting gateway sessions.
pub struct QuicListener {
    endpoint: Endpoint,
}

impl QuicListener {
    /// Load the certificate and key and bind the endpoint.
    pub fn bind(settings: &QuicSettings) -> Result<Self> {
        let certs = load_certs(&settings.cert_path)?;
        let key = load_private_key(&settings.key_path)?;
        let server_config = ServerConfig::with_single_cert(certs, key).map_err(quic_error)?;
        let endpoint = Endpoint::server(server_config, settings.addr)?;
        Ok(Self { endpoint })
    }

    /// Capability probe: the listener if QUIC can be served, `None` otherwise.
    pub fn probe(settings: &QuicSettings) -> Option<Self> {
        match Self::bind(settings) {
            Ok(listener) => {
                info!("QUIC transport available on {}", settings.addr);
                Some(listener)
            }
            Err(e) => {
                warn!("QUIC transport unavailable, serving WebSocket only: {}", e);
                None
            }
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Accept connections until the gateway shuts down.
    pub async fn serve(self, state: Arc<AppState>) {
        info!("QUIC listener accepting on {:?}", self.endpoint.local_addr().ok());
        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                incoming = self.endpoint.accept() => {
                    let Some(incoming) = incoming else {
                        break;
                    };
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        if let Err(e) = accept_session(incoming, state).await {
                            debug!("QUIC connection not established: {}", e);
                        }
                    });
                }
            }
        }
        self.endpoint.close(VarInt::from_u32(0), b"shutdown");
        info!("QUIC listener stopped");
    }
}

async fn accept_session(incoming: Incoming, state: Arc<AppState>) -> Result<()> {
    let connection = incoming.await.map_err(quic_error)?;
    debug!("QUIC connection from {}", connection.remote_address());
    let (send, recv) = tokio::time::timeout(STREAM_OPEN_TIMEOUT, connection.accept_bi())
        .await
        .map_err(|_| GatewayError::Transport(Error::Timeout))?
        .map_err(quic_error)?;
    let channel = QuicChannel::new(connection, send, recv);
    run_session(state, Box::new(channel), None).await;
    Ok(())
}
