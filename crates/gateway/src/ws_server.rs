//! HTTP surface: WebSocket upgrade and health check, using Axum.

use crate::auth::TokenVerifier;
use crate::bridge::EventBridge;
use crate::bus::EventBus;
use crate::connection::ConnectionRegistry;
use crate::session::{run_session, SessionSettings};
use crate::transport::{TransportSet, WebSocketChannel};
use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

/// Service name reported by `/health` unless configured otherwise.
pub const DEFAULT_SERVICE_NAME: &str = "realtime-gateway";

/// Shared application state.
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub verifier: Arc<TokenVerifier>,
    pub settings: SessionSettings,
    pub service_name: String,
    pub transports: TransportSet,
    /// Upstream bus; `None` when it was unreachable at startup.
    pub bus: Option<Arc<dyn EventBus>>,
    /// Cancelled on shutdown; every session token is a child of it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(registry: Arc<ConnectionRegistry>, verifier: Arc<TokenVerifier>) -> Self {
        Self {
            registry,
            verifier,
            settings: SessionSettings::default(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            transports: TransportSet::websocket_only(),
            bus: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn with_transports(mut self, transports: TransportSet) -> Self {
        self.transports = transports;
        self
    }

    pub fn with_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Start `bridge` under this state's shutdown token. The bus is reported
    /// by `/health` only once the bridge is running.
    pub async fn with_bridge(self, bridge: Arc<EventBridge>) -> (Self, Vec<JoinHandle<()>>) {
        let bus = bridge.bus();
        match bridge.start(self.shutdown.clone()).await {
            Ok(handles) => (self.with_bus(bus), handles),
            Err(e) => {
                error!("Event bridge not running, broadcasts disabled: {}", e);
                (self, Vec::new())
            }
        }
    }

    pub(crate) fn bus_status(&self) -> &'static str {
        match &self.bus {
            Some(bus) if bus.is_connected() => "connected",
            _ => "degraded",
        }
    }
}

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let transports: Vec<&'static str> = state
        .transports
        .active()
        .iter()
        .map(|kind| kind.as_str())
        .collect();
    Json(json!({
        "status": "ok",
        "service": state.service_name,
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "transportsActive": transports,
        "connections": state.registry.connection_count(),
        "topics": state.registry.topic_count(),
        "bus": state.bus_status(),
    }))
}

/// Connect-time query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Credential that pre-authenticates the connection.
    pub token: Option<String>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    debug!("WebSocket upgrade (token supplied: {})", params.token.is_some());
    ws.on_upgrade(move |socket| {
        run_session(state, Box::new(WebSocketChannel::new(socket)), params.token)
    })
}
