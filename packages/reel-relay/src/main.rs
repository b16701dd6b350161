//! Reel relay server binary.
//!
//! Parses configuration, opens the database, builds the shared state and
//! runs the HTTP/WebSocket server next to the background workers.
//!
//! Ctrl-C or a fatal core error (clock moved backwards) stops everything.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use reel_core::directory::SocialGraph;
use reel_core::storage::{self, StorageConfig};
use reel_core::{CoreConfig, StaticDirectory};
use reel_relay::directory::HttpDirectory;
use reel_relay::state::{AppState, RelayConfig};

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "reel-relay", version, about = "Reel messaging relay server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "RELAY_PORT")]
    port: u16,

    /// SQLite database file (in-memory if unset)
    #[arg(long, env = "DATABASE_PATH")]
    database_path: Option<String>,

    /// Node id for message ids, unique per running instance (0..=1023)
    #[arg(long, default_value_t = 1, env = "NODE_ID")]
    node_id: i64,

    /// Broker partitions (one consumer task each)
    #[arg(long, default_value_t = 4, env = "BROKER_PARTITIONS")]
    partitions: u32,

    /// Base URL of the friend/group/profile services
    #[arg(long, env = "DIRECTORY_URL")]
    directory_url: Option<String>,

    /// JSON file with friends, groups and profiles, used when no directory URL is set
    #[arg(long, env = "DIRECTORY_SEED")]
    directory_seed: Option<String>,

    /// Offline frame TTL in days
    #[arg(long, default_value_t = 7, env = "OFFLINE_TTL_DAYS")]
    offline_ttl_days: i64,

    /// Idempotency claim TTL in hours
    #[arg(long, default_value_t = 24, env = "CLAIM_TTL_HOURS")]
    claim_ttl_hours: u64,

    /// Cleanup interval in seconds
    #[arg(long, default_value_t = 300, env = "CLEANUP_INTERVAL_SECS")]
    cleanup_interval_secs: u64,

    /// Pending fan-out republish interval in seconds
    #[arg(long, default_value_t = 30, env = "REPUBLISH_INTERVAL_SECS")]
    republish_interval_secs: u64,

    /// Pause between replayed offline frames, in milliseconds
    #[arg(long, default_value_t = 50, env = "DRAIN_DELAY_MS")]
    drain_delay_ms: u64,

    /// Log as JSON lines
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            port: self.port,
            node_id: self.node_id,
            partitions: self.partitions,
            offline_ttl_secs: self.offline_ttl_days * 24 * 3600,
            drain_delay: Duration::from_millis(self.drain_delay_ms),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            republish_interval: Duration::from_secs(self.republish_interval_secs),
            core: CoreConfig {
                claim_ttl: Duration::from_secs(self.claim_ttl_hours * 3600),
                ..CoreConfig::default()
            },
        }
    }

    fn social_graph(&self) -> reel_core::Result<Arc<dyn SocialGraph>> {
        if let Some(url) = &self.directory_url {
            tracing::info!(url = %url, "Using HTTP directory");
            return Ok(Arc::new(HttpDirectory::new(url)?));
        }
        if let Some(path) = &self.directory_seed {
            tracing::info!(path = %path, "Using seeded in-memory directory");
            return Ok(Arc::new(StaticDirectory::from_json_file(path)?));
        }
        tracing::warn!("No directory configured, nobody is authorized to message");
        Ok(Arc::new(StaticDirectory::new()))
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "reel_relay=info,reel_core=info,tower_http=info".into());

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = args.relay_config();
    let database = storage::init(&StorageConfig {
        database_path: args.database_path.clone(),
    })?;
    let state = AppState::new(config.clone(), database, args.social_graph()?)?;

    reel_relay::workers::spawn(&state);

    let app = reel_relay::build_router(state.clone());
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Reel relay server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    state.trigger_shutdown();
    tracing::info!("Reel relay server stopped");
    Ok(())
}

/// Resolves on Ctrl-C or when any task requests shutdown.
async fn shutdown_signal(state: AppState) {
    let mut requested = state.shutdown_signal();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Ctrl-C received, shutting down");
        }
        _ = requested.wait_for(|stop| *stop) => {
            tracing::warn!("Shutdown requested");
        }
    }
    state.trigger_shutdown();
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_fold_into_config() {
        let args = Args::parse_from(["reel-relay", "--port", "9000", "--claim-ttl-hours", "2", "--partitions", "8"]);
        let config = args.relay_config();
        assert_eq!(config.port, 9000);
        assert_eq!(config.partitions, 8);
        assert_eq!(config.core.claim_ttl, Duration::from_secs(7200));
        assert_eq!(config.offline_ttl_secs, 7 * 24 * 3600);
        assert_eq!(config.drain_delay, Duration::from_millis(50));
    }

    #[test]
    fn test_args_defaults_match_relay_config() {
        let config = Args::parse_from(["reel-relay"]).relay_config();
        let defaults = RelayConfig::default();
        assert_eq!(config.port, defaults.port);
        assert_eq!(config.node_id, defaults.node_id);
        assert_eq!(config.cleanup_interval, defaults.cleanup_interval);
        assert_eq!(config.republish_interval, defaults.republish_interval);
    }
}
