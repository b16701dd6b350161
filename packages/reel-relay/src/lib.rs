//! Reel Relay
//!
//! HTTP and WebSocket front end for the Reel messaging core:
//!
//! 1. **HTTP API**: send, history, recall, read marks and per-user
//!    conversation management, on behalf of the caller named by the
//!    gateway's `X-User-Id` header.
//!
//! 2. **Live push channel**: one WebSocket per device. The connection
//!    manager routes core notifications to every live device of a user.
//!
//! 3. **Offline buffer**: notifications for users with no live device are
//!    queued and replayed in order when they reconnect.
//!
//! 4. **Background workers** (started by the binary): one fan-out consumer
//!    per broker partition, the pending fan-out republisher and periodic
//!    cleanup.

pub mod api;
pub mod connection;
pub mod directory;
pub mod offline;
pub mod presence;
pub mod protocol;
pub mod push;
pub mod session;
pub mod state;
pub mod workers;

use axum::http::Method;
use axum::routing::{get, post, put};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use state::AppState;

/// Build the full router over `state`.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    let api = Router::new()
        .route("/messages", post(api::send_message).get(api::list_messages))
        .route("/messages/read", post(api::mark_read))
        .route("/messages/:id/recall", post(api::recall_message))
        .route("/conversations", get(api::list_conversations))
        .route(
            "/conversations/:id",
            get(api::get_conversation).delete(api::delete_conversation),
        )
        .route("/conversations/:id/clear", post(api::clear_history))
        .route("/conversations/:id/pin", put(api::set_pinned))
        .route("/conversations/:id/mute", put(api::set_muted))
        .route("/presence", get(api::presence));

    Router::new()
        .nest("/api", api)
        .route("/ws", get(api::ws_handler))
        .route("/health", get(api::health_handler))
        .route("/stats", get(api::stats_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}
