//! Realtime gateway entry point.
//!
//! Streams platform lifecycle events to authenticated WebSocket and QUIC
//! clients.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use nats_client::client::{DEFAULT_CONNECT_RETRIES, DEFAULT_RETRY_DELAY};
use nats_client::NatsClient;
use realtime_gateway::access::DEFAULT_LOOKUP_TIMEOUT;
use realtime_gateway::{
    create_router, spawn_liveness_sweeper, AccessDirectory, AppState, AuthorizationFilter,
    ConnectionRegistry, DenyAllDirectory, EventBridge, EventBus, GatewayConfig,
    HttpAccessDirectory, TokenVerifier, TransportSet,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Realtime Gateway");

    let config = GatewayConfig::from_env().context("invalid configuration")?;

    info!("Configuration:");
    info!("  HTTP_PORT: {}", config.http_port);
    info!("  METRICS_PORT: {}", config.metrics_port);
    info!("  NATS_URL: {}", config.nats_url);
    info!("  JWT_AUDIENCE: {}", config.audience);
    info!("  JWT_ISSUER: {}", config.issuer);
    info!("  PING_INTERVAL: {:?}", config.session.ping_interval);
    info!("  SEND_TIMEOUT: {:?}", config.session.send_timeout);
    info!("  CLIENT_BUFFER_SIZE: {}", config.session.buffer_size);
    info!("  QUIC: {:?}", config.quic.as_ref().map(|quic| quic.addr));

    #[cfg(feature = "quic")]
    {
        // Fails only if a provider is already installed
        let _ = rustls::crypto::ring::default_provider().install_default();
    }

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
        .context("Failed to start Prometheus exporter")?;
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    // No usable key, no gateway
    let pem = config.key_source.load()?;
    let verifier = Arc::new(TokenVerifier::from_pem(&pem, &config.audience, &config.issuer)?);

    let directory: Arc<dyn AccessDirectory> = match &config.access_service_url {
        Some(url) => {
            info!("Access lookups via {}", url);
            Arc::new(HttpAccessDirectory::new(url, DEFAULT_LOOKUP_TIMEOUT)?)
        }
        None => {
            warn!("ACCESS_SERVICE_URL not set, enrollment and teaching checks will deny");
            Arc::new(DenyAllDirectory)
        }
    };

    let registry = Arc::new(ConnectionRegistry::new());
    let shutdown = CancellationToken::new();
    let mut background = Vec::new();

    // Transport probe
    #[cfg(feature = "quic")]
    let quic_listener = config
        .quic
        .as_ref()
        .and_then(realtime_gateway::transport::quic::QuicListener::probe);
    #[cfg(feature = "quic")]
    let transports = match quic_listener.as_ref().and_then(|l| l.local_addr().ok()) {
        Some(addr) => TransportSet::with_quic(addr),
        None => TransportSet::websocket_only(),
    };
    #[cfg(not(feature = "quic"))]
    let transports = {
        if config.quic.is_some() {
            warn!("QUIC configured but not compiled in, serving WebSocket only");
        }
        TransportSet::websocket_only()
    };

    // Connect to NATS; without it the gateway runs with broadcasts disabled
    let bus: Option<Arc<dyn EventBus>> = match NatsClient::connect_with_retry(
        &config.nats_url,
        DEFAULT_CONNECT_RETRIES,
        DEFAULT_RETRY_DELAY,
    )
    .await
    {
        Ok(client) => {
            info!("Connected to NATS");
            Some(Arc::new(client))
        }
        Err(e) => {
            error!(
                "NATS unreachable at {} ({:#}), running WITHOUT event broadcasts",
                config.nats_url, e
            );
            None
        }
    };

    let mut state = AppState::new(registry.clone(), verifier)
        .with_settings(config.session)
        .with_service_name(&config.service_name)
        .with_transports(transports)
        .with_shutdown(shutdown.clone());

    if let Some(bus) = bus {
        let bridge = Arc::new(EventBridge::new(
            registry.clone(),
            AuthorizationFilter::new(directory),
            bus,
        ));
        let (bridged, handles) = state.with_bridge(bridge).await;
        state = bridged;
        background.extend(handles);
    }
    let state = Arc::new(state);

    background.push(spawn_liveness_sweeper(
        registry.clone(),
        config.session.ping_interval,
        shutdown.clone(),
    ));

    #[cfg(feature = "quic")]
    {
        if let Some(listener) = quic_listener {
            background.push(tokio::spawn(listener.serve(state.clone())));
        }
    }

    // Create HTTP router
    let app = create_router(state);

    // Start HTTP server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    // Run server with graceful shutdown
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await?;

    info!("Shutting down background tasks...");
    shutdown.cancel();
    let closed = registry.close_all();
    info!("Closed {} connections", closed);
    for handle in background {
        let _ = handle.await;
    }

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
