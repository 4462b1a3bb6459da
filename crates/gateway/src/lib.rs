//! Realtime event gateway for the education platform.
//!
//! This service:
//! - Accepts client connections over WebSocket and, when configured, QUIC
//! - Authenticates clients with platform-issued bearer tokens
//! - Manages per-connection topic subscriptions
//! - Subscribes to lifecycle events on the upstream bus (NATS)
//! - Fans each event out to the subscribers allowed to see it
//!
//! ## Architecture
//!
//! ```text
//! NATS: user.* / assessment.* / submission.* / grading.* / notification.*
//!         ↓
//! EventBridge (one task per bus topic)
//!         ↓
//! ConnectionRegistry + SubscriptionRouter (DashMap-based)
//!         ↓
//! AuthorizationFilter (per subscriber)
//!         ↓
//! bounded outbound queue → session task → WebSocket / QUIC client
//! ```
//!
//! ## Delivery
//!
//! - Events are serialized once per broadcast
//! - Bounded per-connection queues; a slow client loses events, others don't wait
//! - Every transport write is bounded by the send timeout

pub mod access;
pub mod auth;
pub mod authz;
pub mod bridge;
pub mod bus;
pub mod config;
pub mod connection;
pub mod error;
pub mod liveness;
pub mod protocol;
pub mod session;
pub mod subscription;
pub mod transport;
pub mod ws_server;

pub use access::{AccessDirectory, DenyAllDirectory, HttpAccessDirectory};
pub use auth::{AuthError, Principal, Role, TokenVerifier};
pub use authz::{AuthorizationFilter, TopicClass};
pub use bridge::{BroadcastReport, EventBridge, BRIDGED_TOPICS, CATALOG_VERSION};
pub use bus::{BusMessage, Event, EventBus, InMemoryBus};
pub use config::{GatewayConfig, KeySource};
pub use connection::{Connection, ConnectionId, ConnectionRegistry, ConnectionState};
pub use error::{GatewayError, Result};
pub use liveness::spawn_liveness_sweeper;
pub use session::{run_session, SessionSettings};
pub use subscription::SubscriptionRouter;
pub use transport::{QuicSettings, TransportSet};
pub use ws_server::{create_router, AppState};
