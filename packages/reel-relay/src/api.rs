//! HTTP API.
//!
//! The upstream gateway authenticates users and forwards the caller's id in
//! the `X-User-Id` header. Handlers translate requests into
//! `MessagingService` calls and core errors into status codes:
//!
//! | Core error                                        | Status |
//! |---------------------------------------------------|--------|
//! | `InvalidContent`, `InvalidConfig`                 | 400    |
//! | `NotAuthorized`, `NotMessageSender`               | 403    |
//! | `MessageNotFound`, `ConversationNotFound`         | 404    |
//! | `RecallWindowExpired`, `AlreadyRecalled`          | 409    |
//! | storage / broker / collaborator (retryable)       | 503    |
//! | everything else                                   | 500    |

use axum::async_trait;
use axum::extract::{FromRequestParts, Path, Query, State, WebSocketUpgrade};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use reel_core::model::{ConversationType, MessageContent, MessageId, MessageKind};
use reel_core::{Error, SendCommand, UserId};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::protocol::{default_conversation_type, default_kind};
use crate::session;
use crate::state::AppState;

/// Header carrying the authenticated caller id.
pub const USER_ID_HEADER: &str = "x-user-id";

// ── Errors ────────────────────────────────────────────────────────────────────

/// Error body: `{ "code", "error" }`.
#[derive(Debug)]
pub enum ApiError {
    /// Missing or malformed caller identity
    Unauthenticated,
    /// Malformed request outside the core's validation
    BadRequest(String),
    Core(Error),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError::Core(e)
    }
}

fn status_for(e: &Error) -> StatusCode {
    match e {
        Error::InvalidContent(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        Error::NotAuthorized | Error::NotMessageSender => StatusCode::FORBIDDEN,
        Error::MessageNotFound | Error::ConversationNotFound => StatusCode::NOT_FOUND,
        Error::RecallWindowExpired { .. } | Error::AlreadyRecalled => StatusCode::CONFLICT,
        e if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                401,
                "Missing or invalid X-User-Id header".to_string(),
            ),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, 400, message),
            ApiError::Core(e) => (status_for(&e), e.code(), e.to_string()),
        };
        (status, Json(json!({ "code": code, "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Run a core call; a fatal error also stops the process.
fn check<T>(state: &AppState, result: reel_core::Result<T>) -> Result<T, ApiError> {
    result.map_err(|e| {
        if e.is_fatal() {
            tracing::error!(error = %e, "Fatal error, shutting down");
            state.trigger_shutdown();
        }
        ApiError::Core(e)
    })
}

// ── Caller ────────────────────────────────────────────────────────────────────

/// The authenticated caller, from `X-User-Id`.
pub struct Caller(pub UserId);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<UserId>().ok())
            .filter(|&id| id > 0)
            .map(Caller)
            .ok_or(ApiError::Unauthenticated)
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// Body of `POST /api/messages`.
#[derive(Debug, Deserialize)]
pub struct SendMessageBody {
    pub target_id: i64,
    #[serde(default = "default_conversation_type")]
    pub conversation_type: ConversationType,
    #[serde(default = "default_kind")]
    pub kind: MessageKind,
    pub content: MessageContent,
    pub client_msg_id: String,
}

/// `POST /api/messages`: send as the caller.
pub async fn send_message(
    State(state): State<AppState>,
    Caller(user): Caller,
    Json(body): Json<SendMessageBody>,
) -> ApiResult<Value> {
    let receipt = check(
        &state,
        state
            .service
            .send_message(SendCommand {
                sender_id: user,
                target_id: body.target_id,
                conversation_type: body.conversation_type,
                kind: body.kind,
                content: body.content,
                client_msg_id: body.client_msg_id,
            })
            .await,
    )?;
    Ok(Json(json!(receipt)))
}

/// Query of `GET /api/messages`. `limit = 0` means the default page.
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub target_id: i64,
    #[serde(default = "default_conversation_type")]
    pub conversation_type: ConversationType,
    pub last_msg_id: Option<MessageId>,
    #[serde(default)]
    pub limit: usize,
}

/// `GET /api/messages`: newest first, keyset on `last_msg_id`.
pub async fn list_messages(
    State(state): State<AppState>,
    Caller(user): Caller,
    Query(q): Query<HistoryQuery>,
) -> ApiResult<Value> {
    let page = check(
        &state,
        state
            .service
            .list_messages(user, q.target_id, q.conversation_type, q.last_msg_id, q.limit)
            .await,
    )?;
    Ok(Json(json!(page)))
}

/// `POST /api/messages/:id/recall`
pub async fn recall_message(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(message_id): Path<MessageId>,
) -> ApiResult<Value> {
    let outcome = check(&state, state.service.recall_message(message_id, user).await)?;
    Ok(Json(json!({ "message_id": message_id, "outcome": outcome })))
}

/// Body of `POST /api/messages/read`.
#[derive(Debug, Deserialize)]
pub struct ReadBody {
    pub target_id: i64,
    #[serde(default = "default_conversation_type")]
    pub conversation_type: ConversationType,
    pub last_msg_id: MessageId,
}

/// `POST /api/messages/read`: no-op success for groups.
pub async fn mark_read(
    State(state): State<AppState>,
    Caller(user): Caller,
    Json(body): Json<ReadBody>,
) -> ApiResult<Value> {
    let updated = check(
        &state,
        state
            .service
            .mark_messages_read(user, body.target_id, body.conversation_type, body.last_msg_id)
            .await,
    )?;
    Ok(Json(json!({ "updated": updated })))
}

// ── Conversations ─────────────────────────────────────────────────────────────

/// Page selector for the conversation list.
#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "first_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn first_page() -> usize {
    1
}

fn default_page_size() -> usize {
    20
}

/// `GET /api/conversations`: pinned first, then most recent.
pub async fn list_conversations(
    State(state): State<AppState>,
    Caller(user): Caller,
    Query(q): Query<PageQuery>,
) -> ApiResult<Value> {
    let page = check(&state, state.service.list_conversations(user, q.page, q.page_size))?;
    Ok(Json(json!(page)))
}

/// `GET /api/conversations/:id`
pub async fn get_conversation(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(conversation_id): Path<String>,
) -> ApiResult<Value> {
    let view = check(&state, state.service.get_conversation(user, &conversation_id))?;
    Ok(Json(json!(view)))
}

/// `DELETE /api/conversations/:id`: hides it for the caller only.
pub async fn delete_conversation(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(conversation_id): Path<String>,
) -> ApiResult<Value> {
    check(&state, state.service.delete_conversation(user, &conversation_id))?;
    Ok(Json(json!({ "deleted": true })))
}

/// `POST /api/conversations/:id/clear`
pub async fn clear_history(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(conversation_id): Path<String>,
) -> ApiResult<Value> {
    check(&state, state.service.clear_history(user, &conversation_id))?;
    Ok(Json(json!({ "cleared": true })))
}

/// Body of `PUT /api/conversations/:id/pin`.
#[derive(Debug, Deserialize)]
pub struct PinBody {
    pub pinned: bool,
}

/// `PUT /api/conversations/:id/pin`
pub async fn set_pinned(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(conversation_id): Path<String>,
    Json(body): Json<PinBody>,
) -> ApiResult<Value> {
    check(&state, state.service.set_pinned(user, &conversation_id, body.pinned))?;
    Ok(Json(json!({ "pinned": body.pinned })))
}

/// Body of `PUT /api/conversations/:id/mute`.
#[derive(Debug, Deserialize)]
pub struct MuteBody {
    pub muted: bool,
}

/// `PUT /api/conversations/:id/mute`
pub async fn set_muted(
    State(state): State<AppState>,
    Caller(user): Caller,
    Path(conversation_id): Path<String>,
    Json(body): Json<MuteBody>,
) -> ApiResult<Value> {
    check(&state, state.service.set_muted(user, &conversation_id, body.muted))?;
    Ok(Json(json!({ "muted": body.muted })))
}

// ── Presence ──────────────────────────────────────────────────────────────────

/// `user_ids` is a comma-separated list.
#[derive(Debug, Deserialize)]
pub struct PresenceQuery {
    pub user_ids: String,
}

/// Most users answered by one presence query.
const MAX_PRESENCE_BATCH: usize = 200;

/// `GET /api/presence`: batch online status.
pub async fn presence(State(state): State<AppState>, Query(q): Query<PresenceQuery>) -> ApiResult<Value> {
    let users = q
        .user_ids
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<UserId>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ApiError::BadRequest(format!("Invalid user_ids: {}", e)))?;

    if users.len() > MAX_PRESENCE_BATCH {
        return Err(ApiError::BadRequest(format!(
            "At most {} user ids per query",
            MAX_PRESENCE_BATCH
        )));
    }

    Ok(Json(json!({ "statuses": state.presence.batch(&users) })))
}

// ── Live channel ──────────────────────────────────────────────────────────────

/// Identity of a connecting device.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub user_id: UserId,
    #[serde(default = "default_device")]
    pub device: String,
}

fn default_device() -> String {
    "unknown".to_string()
}

/// WebSocket upgrade for the live push channel.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(q): Query<WsQuery>,
) -> Result<Response, ApiError> {
    if q.user_id <= 0 {
        return Err(ApiError::Unauthenticated);
    }
    if state.is_shutting_down() {
        return Err(ApiError::Core(Error::Internal("Server is shutting down".into())));
    }

    Ok(ws.on_upgrade(move |socket| session::handle_websocket(socket, state, q.user_id, q.device)))
}

// ── Operations ────────────────────────────────────────────────────────────────

/// Liveness check.
pub async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "reel-relay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Connection, queue and consumer counters.
pub async fn stats_handler(State(state): State<AppState>) -> ApiResult<Value> {
    let consumer_lag = check(&state, state.consumer.lag().await)?;
    let pending_fanout = check(&state, state.service.pending_fanout())?;

    Ok(Json(json!({
        "online_users": state.connections.online_users(),
        "connections": state.connections.connection_count(),
        "offline_queue_size": state.offline.total(),
        "pending_fanout": pending_fanout,
        "consumer_lag": consumer_lag,
        "timestamp": chrono::Utc::now().timestamp_millis(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&Error::InvalidContent("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&Error::NotAuthorized), StatusCode::FORBIDDEN);
        assert_eq!(status_for(&Error::NotMessageSender), StatusCode::FORBIDDEN);
        assert_eq!(status_for(&Error::ConversationNotFound), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&Error::RecallWindowExpired { window_secs: 120 }),
            StatusCode::CONFLICT
        );
        assert_eq!(status_for(&Error::AlreadyRecalled), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&Error::DatabaseError("locked".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&Error::ClockMovedBackwards { last_ms: 2, now_ms: 1 }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_page_query_defaults() {
        let q: PageQuery = serde_json::from_value(json!({})).unwrap();
        assert_eq!(q.page, 1);
        assert_eq!(q.page_size, 20);
    }
}
