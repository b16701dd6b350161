//! Background workers.
//!
//! - one fan-out consumer per broker partition
//! - the pending fan-out republisher
//! - periodic cleanup of expired offline frames and idempotency claims
//!
//! All of them stop when the state's shutdown signal flips. A consumer
//! that stops on a fatal error flips it for everyone.

use crate::state::AppState;

/// Start every background task over `state`.
pub fn spawn(state: &AppState) {
    for partition in 0..state.config.partitions {
        let state = state.clone();
        let shutdown = state.shutdown_signal();
        tokio::spawn(async move {
            if let Err(e) = state.consumer.run_partition(partition, shutdown).await {
                tracing::error!(partition, error = %e, "Fan-out consumer stopped");
                if e.is_fatal() {
                    state.trigger_shutdown();
                }
            }
        });
    }

    let republish = state.clone();
    tokio::spawn(async move {
        let mut shutdown = republish.shutdown_signal();
        let mut interval = tokio::time::interval(republish.config.republish_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            match republish.service.republish_pending().await {
                Ok(0) => {}
                Ok(n) => tracing::info!(republished = n, "Republished pending fan-out"),
                Err(e) => tracing::warn!(error = %e, "Republish sweep failed"),
            }
        }
    });

    let cleanup = state.clone();
    tokio::spawn(async move {
        let mut shutdown = cleanup.shutdown_signal();
        let mut interval = tokio::time::interval(cleanup.config.cleanup_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            cleanup.offline.cleanup_expired();
            match cleanup.claims.purge_expired().await {
                Ok(0) => {}
                Ok(n) => tracing::debug!(purged = n, "Purged expired claims"),
                Err(e) => tracing::warn!(error = %e, "Claim purge failed"),
            }
        }
    });
}
