//! Shared harness: a gateway on an ephemeral port fed by an in-memory bus.

#![allow(dead_code)]

use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use realtime_gateway::{
    create_router, AppState, AuthorizationFilter, ConnectionRegistry, DenyAllDirectory,
    EventBridge, InMemoryBus, Role, SessionSettings, TokenVerifier, TransportSet,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub const SIGNING_KEY: &[u8] = include_bytes!("../fixtures/signing_key.pem");
pub const VERIFYING_KEY: &[u8] = include_bytes!("../fixtures/verifying_key.pem");

pub fn fixture(name: &str) -> std::path::PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

pub fn sign_token(id: &str, role: Role) -> String {
    let claims = json!({
        "id": id,
        "email": format!("{id}@school.test"),
        "role": role.as_str(),
        "aud": "edu-platform",
        "iss": "auth-service",
        "exp": Utc::now().timestamp() + 3600,
    });
    let key = EncodingKey::from_ed_pem(SIGNING_KEY).unwrap();
    encode(&Header::new(Algorithm::EdDSA), &claims, &key).unwrap()
}

pub struct TestGateway {
    pub addr: SocketAddr,
    pub state: Arc<AppState>,
    pub registry: Arc<ConnectionRegistry>,
    pub bus: Arc<InMemoryBus>,
    pub shutdown: CancellationToken,
}

impl TestGateway {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Wait until `check` holds, polling the registry state.
    pub async fn wait_for(&self, check: impl Fn(&ConnectionRegistry) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check(&self.registry) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub async fn spawn_gateway() -> TestGateway {
    spawn_gateway_with(SessionSettings::default(), TransportSet::websocket_only()).await
}

pub async fn spawn_gateway_with(settings: SessionSettings, transports: TransportSet) -> TestGateway {
    let verifier = TokenVerifier::from_pem(VERIFYING_KEY, "edu-platform", "auth-service").unwrap();
    let registry = Arc::new(ConnectionRegistry::new());
    let bus = Arc::new(InMemoryBus::new());
    let shutdown = CancellationToken::new();

    let bridge = Arc::new(EventBridge::new(
        registry.clone(),
        AuthorizationFilter::new(Arc::new(DenyAllDirectory)),
        bus.clone(),
    ));
    bridge.start(shutdown.clone()).await.unwrap();

    let state = Arc::new(
        AppState::new(registry.clone(), Arc::new(verifier))
            .with_settings(settings)
            .with_service_name("realtime-gateway-test")
            .with_transports(transports)
            .with_bus(bus.clone())
            .with_shutdown(shutdown.clone()),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_router(state.clone());
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
            .unwrap();
    });

    TestGateway {
        addr,
        state,
        registry,
        bus,
        shutdown,
    }
}
