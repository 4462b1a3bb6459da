//! Periodic liveness sweep.
//!
//! Sessions ping their clients every `ping_interval`; any inbound frame
//! refreshes liveness. A connection silent for more than twice the interval
//! is removed from the registry, which also cancels its session.

use crate::connection::ConnectionRegistry;
use metrics::{counter, gauge};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Silence after which a connection counts as stale.
pub fn stale_threshold(ping_interval: Duration) -> Duration {
    ping_interval.saturating_mul(2)
}

/// Remove every connection silent for longer than `threshold`. Returns how
/// many were removed.
pub fn sweep(registry: &ConnectionRegistry, threshold: Duration) -> usize {
    let mut removed = 0;
    for id in registry.list_stale(threshold) {
        if registry.remove(&id).is_some() {
            info!(connection_id = %id, "Removed stale connection");
            removed += 1;
        }
    }
    if removed > 0 {
        counter!("gateway_stale_connections_total").increment(removed as u64);
        gauge!("gateway_active_connections").set(registry.connection_count() as f64);
    }
    removed
}

/// Spawn the sweeper. It runs once per `ping_interval` until `shutdown`.
pub fn spawn_liveness_sweeper(
    registry: Arc<ConnectionRegistry>,
    ping_interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let threshold = stale_threshold(ping_interval);
    tokio::spawn(async move {
        info!(
            "Liveness sweeper running every {:?} (stale after {:?})",
            ping_interval, threshold
        );
        let mut ticker = tokio::time::interval(ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = sweep(&registry, threshold);
                    debug!("Liveness sweep removed {} connections", removed);
                }
            }
        }
        info!("Liveness sweeper stopped");
    })
}
