//! NATS client implementation.

use anyhow::{Context, Result};
use async_nats::connection::State;
use async_nats::{Client, Subscriber};
use std::time::Duration;
use tracing::{info, warn};

/// Default number of extra connection attempts at startup.
pub const DEFAULT_CONNECT_RETRIES: u32 = 1;

/// Default delay between startup connection attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Wrapper around the NATS client.
#[derive(Clone)]
pub struct NatsClient {
    client: Client,
}

impl NatsClient {
    /// Connect to a NATS server.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);
        let client = async_nats::connect(url)
            .await
            .with_context(|| format!("failed to connect to NATS at {url}"))?;
        Ok(Self { client })
    }

    /// Connect, retrying up to `retries` extra times with a fixed delay.
    pub async fn connect_with_retry(url: &str, retries: u32, delay: Duration) -> Result<Self> {
        let mut attempt = 0;
        loop {
            match Self::connect(url).await {
                Ok(client) => return Ok(client),
                Err(e) if attempt < retries => {
                    attempt += 1;
                    warn!(
                        "NATS connection attempt {} failed: {:#}, retrying in {:?}",
                        attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Subscribe to a subject using NATS Core push delivery.
    pub async fn subscribe(&self, subject: &str) -> Result<Subscriber> {
        info!("Subscribing to subject: {}", subject);
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .with_context(|| format!("failed to subscribe to {subject}"))?;
        Ok(subscriber)
    }

    /// Whether the underlying connection is currently up.
    pub fn is_connected(&self) -> bool {
        matches!(self.client.connection_state(), State::Connected)
    }
}
