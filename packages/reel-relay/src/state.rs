//! Server state management.
//!
//! Wires the messaging core to the live-delivery pieces: connection
//! manager, offline buffer and presence tracker. Cloned into every handler.

use std::sync::Arc;
use std::time::Duration;

use reel_core::broker::SqliteBroker;
use reel_core::claims::{ClaimStore, SqliteClaimStore};
use reel_core::consumer::FanoutConsumer;
use reel_core::directory::{PermissionGate, SocialGraph};
use reel_core::storage::Database;
use reel_core::{CoreConfig, IdGenerator, MessagingService, Result};
use tokio::sync::watch;

use crate::connection::ConnectionManager;
use crate::offline::OfflineBuffer;
use crate::presence::PresenceTracker;
use crate::push::RelayPush;

/// Default offline frame TTL in seconds (7 days).
const DEFAULT_OFFLINE_TTL_SECS: i64 = 7 * 24 * 3600;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// HTTP/WebSocket listen port
    pub port: u16,
    /// Snowflake node id for this instance
    pub node_id: i64,
    /// Broker partitions; one consumer task each
    pub partitions: u32,
    /// How long offline frames are kept
    pub offline_ttl_secs: i64,
    /// Pause between replayed offline frames
    pub drain_delay: Duration,
    /// Period of offline and claim cleanup
    pub cleanup_interval: Duration,
    /// Period of the pending fan-out republisher
    pub republish_interval: Duration,
    /// Messaging core settings
    pub core: CoreConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            node_id: 1,
            partitions: 4,
            offline_ttl_secs: DEFAULT_OFFLINE_TTL_SECS,
            drain_delay: Duration::from_millis(50),
            cleanup_interval: Duration::from_secs(300),
            republish_interval: Duration::from_secs(30),
            core: CoreConfig::default(),
        }
    }
}

/// Shared server state.
#[derive(Clone)]
pub struct AppState {
    /// Messaging operations
    pub service: Arc<MessagingService>,
    /// Fan-out consumer shared by the partition workers
    pub consumer: Arc<FanoutConsumer>,
    /// Idempotency claims, purged by the cleanup worker
    pub claims: Arc<dyn ClaimStore>,
    /// Live connection registry
    pub connections: ConnectionManager,
    /// Frames waiting for offline users
    pub offline: Arc<OfflineBuffer>,
    /// Per-user online status
    pub presence: Arc<PresenceTracker>,
    /// Settings the state was built with
    pub config: RelayConfig,
    shutdown: Arc<watch::Sender<bool>>,
}

impl AppState {
    /// Build the core and the live-delivery pieces over one database.
    ///
    /// Must run inside a Tokio runtime: the connection manager task is
    /// spawned here.
    pub fn new(config: RelayConfig, database: Arc<Database>, graph: Arc<dyn SocialGraph>) -> Result<Self> {
        let ids = Arc::new(IdGenerator::new(config.node_id)?);
        let broker = Arc::new(SqliteBroker::new(database.clone(), config.partitions)?);
        let claims: Arc<dyn ClaimStore> = Arc::new(SqliteClaimStore::new(database.clone()));

        let offline = Arc::new(OfflineBuffer::new(config.offline_ttl_secs));
        let presence = Arc::new(PresenceTracker::new());
        let connections = ConnectionManager::spawn(offline.clone(), presence.clone(), config.drain_delay);

        let service = Arc::new(MessagingService::new(
            database,
            PermissionGate::new(graph),
            ids,
            broker,
            Arc::new(RelayPush::new(connections.clone())),
            config.core.clone(),
        ));
        let consumer = Arc::new(service.fanout_consumer(claims.clone()));

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            service,
            consumer,
            claims,
            connections,
            offline,
            presence,
            config,
            shutdown: Arc::new(shutdown),
        })
    }

    /// Receiver that flips to `true` when the process should stop.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Ask every background task and the server to stop.
    pub fn trigger_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Whether shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reel_core::StaticDirectory;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.partitions, 4);
        assert_eq!(config.offline_ttl_secs, 7 * 24 * 3600);
        assert_eq!(config.core.recall_window, Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_state_creation_and_shutdown() {
        let db = Arc::new(Database::open(None).unwrap());
        let state = AppState::new(RelayConfig::default(), db, Arc::new(StaticDirectory::new())).unwrap();
        assert_eq!(state.connections.online_users(), 0);
        assert_eq!(state.offline.total(), 0);

        let mut rx = state.shutdown_signal();
        assert!(!state.is_shutting_down());
        state.trigger_shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_invalid_node_id_is_rejected() {
        let db = Arc::new(Database::open(None).unwrap());
        let config = RelayConfig {
            node_id: 5000,
            ..RelayConfig::default()
        };
        assert!(AppState::new(config, db, Arc::new(StaticDirectory::new())).is_err());
    }
}
