//! Per-connection session loop.
//!
//! One task per connection. It owns the transport channel, processes inbound
//! messages in receipt order, drains the connection's outbound queue and
//! sends keepalive pings. However the loop ends, the connection is removed
//! from the registry before the task finishes.

use crate::connection::{Connection, ConnectionState, CLIENT_CHANNEL_BUFFER_SIZE};
use crate::error::{GatewayError, Result};
use crate::protocol::{decode_client_message, require_topic, ProtocolError, AUTH_FAILED, AUTH_SUCCESS};
use crate::ws_server::AppState;
use gateway_common::{ClientMessage, Error, Frame, MessageChannel, ServerMessage};
use metrics::{counter, gauge};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Attempts at registering a fresh connection id before giving up.
const REGISTER_ATTEMPTS: usize = 3;

/// Timing and buffering for every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Keepalive period. A connection is stale after twice this.
    pub ping_interval: Duration,
    /// Bound on one transport write.
    pub send_timeout: Duration,
    /// Outbound queue depth per connection.
    pub buffer_size: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            send_timeout: Duration::from_secs(5),
            buffer_size: CLIENT_CHANNEL_BUFFER_SIZE,
        }
    }
}

/// Register a new connection, regenerating the id on collision.
fn register(
    state: &AppState,
    channel: &dyn MessageChannel,
) -> Result<(Arc<Connection>, mpsc::Receiver<Frame>)> {
    let mut attempt = 1;
    loop {
        let (tx, rx) = mpsc::channel(state.settings.buffer_size.max(1));
        let connection = Arc::new(Connection::new(
            channel.kind(),
            tx,
            state.shutdown.child_token(),
        ));
        match state.registry.register(Arc::clone(&connection)) {
            Ok(_) => return Ok((connection, rx)),
            Err(e) if attempt < REGISTER_ATTEMPTS => {
                warn!("Connection id collision ({}), regenerating", e);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn send_frame(
    channel: &mut dyn MessageChannel,
    frame: Frame,
    send_timeout: Duration,
) -> Result<()> {
    match tokio::time::timeout(send_timeout, channel.send(frame)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(GatewayError::SendTimeout),
    }
}

async fn send_reply(
    channel: &mut dyn MessageChannel,
    reply: &ServerMessage,
    send_timeout: Duration,
) -> Result<()> {
    send_frame(channel, Frame::Text(reply.to_json()?), send_timeout).await
}

/// Drive one connection until it closes, is cancelled or goes stale.
///
/// `credential` is the connect-time token (`?token=` on WebSocket). A valid
/// one authenticates the connection silently; an invalid one is answered
/// with an error and the connection stays open.
pub async fn run_session(
    state: Arc<AppState>,
    mut channel: Box<dyn MessageChannel>,
    credential: Option<String>,
) {
    let transport = channel.kind();
    let (connection, mut outbound) = match register(&state, channel.as_ref()) {
        Ok(registered) => registered,
        Err(e) => {
            error!("Failed to register {} connection: {}", transport, e);
            channel.close().await;
            return;
        }
    };
    let id = connection.id;
    let send_timeout = state.settings.send_timeout;

    counter!("gateway_connections_total").increment(1);
    gauge!("gateway_active_connections").set(state.registry.connection_count() as f64);
    info!(connection_id = %id, %transport, "Client connected");

    let mut healthy = true;
    if let Some(token) = credential.filter(|token| !token.is_empty()) {
        if !authenticate(&state, &connection, &token) {
            healthy = send_reply(channel.as_mut(), &ServerMessage::error(AUTH_FAILED), send_timeout)
                .await
                .is_ok();
        }
    }

    let period = state.settings.ping_interval;
    let mut ping = interval_at(Instant::now() + period, period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while healthy {
        tokio::select! {
            biased;

            _ = connection.cancelled() => {
                debug!(connection_id = %id, "Session cancelled");
                break;
            }

            inbound = channel.recv() => {
                let frame = match inbound {
                    Some(Ok(frame)) => frame,
                    Some(Err(Error::Framing(e))) => {
                        connection.touch();
                        debug!(connection_id = %id, "Unreadable frame: {}", e);
                        let reply = ProtocolError::Malformed.to_reply();
                        healthy = send_reply(channel.as_mut(), &reply, send_timeout).await.is_ok();
                        continue;
                    }
                    Some(Err(e)) => {
                        debug!(connection_id = %id, "Transport error: {}", e);
                        break;
                    }
                    None => break,
                };

                connection.touch();
                match frame {
                    Frame::Text(text) => {
                        if let Some(reply) = handle_text(&state, &connection, &text) {
                            healthy = send_reply(channel.as_mut(), &reply, send_timeout).await.is_ok();
                        }
                    }
                    // WebSocket answers control pings itself
                    Frame::Ping | Frame::Pong => {}
                    Frame::Close => {
                        debug!(connection_id = %id, "Client closed connection");
                        break;
                    }
                }
            }

            Some(frame) = outbound.recv() => {
                if let Err(e) = send_frame(channel.as_mut(), frame, send_timeout).await {
                    debug!(connection_id = %id, "Send failed: {}", e);
                    counter!("gateway_send_failures_total").increment(1);
                    healthy = false;
                }
            }

            _ = ping.tick() => {
                healthy = send_frame(channel.as_mut(), Frame::Ping, send_timeout).await.is_ok();
            }
        }
    }

    // Mandatory cleanup
    state.registry.remove(&id);
    connection.set_state(ConnectionState::Closed);
    let _ = tokio::time::timeout(send_timeout, channel.close()).await;

    counter!("gateway_disconnections_total").increment(1);
    gauge!("gateway_active_connections").set(state.registry.connection_count() as f64);
    info!(connection_id = %id, "Client disconnected");
}

/// Decode and dispatch one text message. Returns the reply, if any.
pub fn handle_text(state: &AppState, connection: &Connection, text: &str) -> Option<ServerMessage> {
    match decode_client_message(text) {
        Ok(msg) => dispatch(state, connection, msg),
        Err(e) => {
            debug!(connection_id = %connection.id, "Rejected message: {}", e);
            Some(e.to_reply())
        }
    }
}

/// Apply one client message to the connection.
pub fn dispatch(state: &AppState, connection: &Connection, msg: ClientMessage) -> Option<ServerMessage> {
    match msg {
        ClientMessage::Authenticate { data } => {
            let token = data.and_then(|data| data.token).filter(|t| !t.trim().is_empty());
            let Some(token) = token else {
                return Some(ProtocolError::MissingToken.to_reply());
            };
            if authenticate(state, connection, &token) {
                Some(ServerMessage::success(AUTH_SUCCESS))
            } else {
                Some(ServerMessage::error(AUTH_FAILED))
            }
        }
        ClientMessage::Subscribe { event_type } => {
            let topic = match authorized_topic(connection, event_type) {
                Ok(topic) => topic,
                Err(e) => return Some(e.to_reply()),
            };
            if !state.registry.subscribe(&connection.id, &topic) {
                // Connection is being removed
                return None;
            }
            counter!("gateway_subscriptions_total").increment(1);
            Some(ServerMessage::success(format!("Subscribed to {topic}")))
        }
        ClientMessage::Unsubscribe { event_type } => {
            let topic = match authorized_topic(connection, event_type) {
                Ok(topic) => topic,
                Err(e) => return Some(e.to_reply()),
            };
            state.registry.unsubscribe(&connection.id, &topic);
            Some(ServerMessage::success(format!("Unsubscribed from {topic}")))
        }
        ClientMessage::Ping => Some(ServerMessage::Pong),
        ClientMessage::Pong => None,
    }
}

fn authorized_topic(
    connection: &Connection,
    event_type: Option<String>,
) -> std::result::Result<String, ProtocolError> {
    if !connection.is_authenticated() {
        return Err(ProtocolError::AuthenticationRequired);
    }
    require_topic(event_type)
}

/// Verify a token and attach or clear the principal. Returns success.
fn authenticate(state: &AppState, connection: &Connection, token: &str) -> bool {
    connection.begin_authentication();
    match state.verifier.verify(token) {
        Ok(principal) => {
            state.registry.authenticate(&connection.id, principal);
            true
        }
        Err(e) => {
            debug!(connection_id = %connection.id, "Authentication failed: {}", e);
            counter!("gateway_auth_failures_total").increment(1);
            state.registry.deauthenticate(&connection.id);
            false
        }
    }
}
