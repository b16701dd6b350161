//! WebSocket connection handler.
//!
//! Each live connection runs two loops:
//!
//! - **read loop**: decodes client frames, dispatches them by action and
//!   drops the connection after `READ_IDLE_TIMEOUT` without traffic.
//! - **write loop**: drains the outbound channel, packs whatever is already
//!   queued into one `\n`-separated text message, pings every
//!   `PING_INTERVAL` and gives up on a write that takes longer than
//!   `WRITE_TIMEOUT`.
//!
//! Whichever loop ends first tears the connection down and unregisters it.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use reel_core::{Error, SendCommand, UserId};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::connection::{FrameSender, OUTBOUND_CAPACITY};
use crate::protocol::{Action, Frame, ReadMessageData, RecallMessageData, SendMessageData};
use crate::state::AppState;

/// No client traffic (frames or pongs) for this long closes the connection.
pub const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Keepalive ping period; below the idle timeout so a healthy peer's pong
/// keeps the read loop alive.
pub const PING_INTERVAL: Duration = Duration::from_secs(54);

/// A single socket write longer than this closes the connection.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Most frames packed into one text message.
const MAX_BATCH: usize = 32;

/// Serve one authenticated connection until it closes.
pub async fn handle_websocket(socket: WebSocket, state: AppState, user: UserId, device: String) {
    let (ws_sender, ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<Frame>(OUTBOUND_CAPACITY);

    let connection_id = state.connections.register(user, &device, tx.clone());
    let mut writer = tokio::spawn(write_loop(ws_sender, rx, user));

    tokio::select! {
        _ = read_loop(ws_receiver, &state, user, &tx) => {}
        _ = &mut writer => {
            tracing::debug!(user_id = user, "Write loop ended first");
        }
    }

    state.connections.unregister(user, connection_id);
    writer.abort();
    tracing::info!(user_id = user, device = %device, "WebSocket disconnected");
}

// ── Read Loop ─────────────────────────────────────────────────────────────────

async fn read_loop(mut ws_receiver: SplitStream<WebSocket>, state: &AppState, user: UserId, reply: &FrameSender) {
    loop {
        let next = match timeout(READ_IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(next) => next,
            Err(_) => {
                tracing::warn!(user_id = user, "Read idle timeout, closing connection");
                break;
            }
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                for line in text.split('\n').filter(|l| !l.trim().is_empty()) {
                    match Frame::decode(line) {
                        Ok(frame) => dispatch(state, user, reply, frame).await,
                        Err(e) => {
                            tracing::warn!(user_id = user, error = %e, "Failed to parse client frame");
                            let err = Error::InvalidContent(format!("Invalid frame: {}", e));
                            respond(reply, user, Frame::from_error(&err));
                        }
                    }
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                tracing::debug!(user_id = user, "Client closed connection");
                break;
            }
            Some(Err(e)) => {
                tracing::warn!(user_id = user, error = %e, "WebSocket error");
                break;
            }
            // Ping is answered by axum; Pong and Binary only count as traffic
            Some(Ok(_)) => {}
        }
    }
}

/// Handle one decoded client frame.
async fn dispatch(state: &AppState, user: UserId, reply: &FrameSender, frame: Frame) {
    let client_msg_id = frame.client_msg_id.clone();

    let result = match frame.action {
        Action::Ping => {
            respond(reply, user, Frame::pong());
            return;
        }
        Action::Pong => return,
        Action::SendMessage => handle_send(state, user, frame).await,
        Action::ReadMessage => handle_read(state, user, frame).await,
        Action::RecallMessage => handle_recall(state, user, frame).await,
        other => Err(Error::InvalidContent(format!("Unsupported action {:?}", other))),
    };

    match result {
        Ok(Some(ack)) => respond(reply, user, ack.with_client_msg_id(client_msg_id)),
        Ok(None) => {}
        Err(e) => {
            if e.is_fatal() {
                tracing::error!(user_id = user, error = %e, "Fatal error, shutting down");
                state.trigger_shutdown();
            }
            respond(reply, user, Frame::from_error(&e).with_client_msg_id(client_msg_id));
        }
    }
}

fn parse_data<T: DeserializeOwned>(frame: Frame) -> Result<T, Error> {
    let action = frame.action;
    serde_json::from_value(frame.data).map_err(|e| Error::InvalidContent(format!("Invalid {:?} data: {}", action, e)))
}

async fn handle_send(state: &AppState, user: UserId, frame: Frame) -> Result<Option<Frame>, Error> {
    let client_msg_id = frame.client_msg_id.clone().unwrap_or_default();
    let data: SendMessageData = parse_data(frame)?;

    let receipt = state
        .service
        .send_message(SendCommand {
            sender_id: user,
            target_id: data.target_id,
            conversation_type: data.conversation_type,
            kind: data.kind,
            content: data.content,
            client_msg_id,
        })
        .await?;

    let data = serde_json::to_value(&receipt)?;
    Ok(Some(Frame::new(Action::SendMessage, data)))
}

async fn handle_read(state: &AppState, user: UserId, frame: Frame) -> Result<Option<Frame>, Error> {
    let data: ReadMessageData = parse_data(frame)?;
    state
        .service
        .mark_messages_read(user, data.target_id, data.conversation_type, data.last_msg_id)
        .await?;
    Ok(None)
}

async fn handle_recall(state: &AppState, user: UserId, frame: Frame) -> Result<Option<Frame>, Error> {
    let data: RecallMessageData = parse_data(frame)?;
    state.service.recall_message(data.message_id, user).await?;
    Ok(None)
}

fn respond(reply: &FrameSender, user: UserId, frame: Frame) {
    if reply.try_send(frame).is_err() {
        tracing::warn!(user_id = user, "Outbound buffer full, dropping reply");
    }
}

// ── Write Loop ────────────────────────────────────────────────────────────────

async fn write_loop(mut ws_sender: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Frame>, user: UserId) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    // Skip the immediate first tick
    ping.tick().await;

    loop {
        let message = tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                let mut batch = Vec::with_capacity(MAX_BATCH);
                push_encoded(&mut batch, &frame, user);
                while batch.len() < MAX_BATCH {
                    match rx.try_recv() {
                        Ok(next) => push_encoded(&mut batch, &next, user),
                        Err(_) => break,
                    }
                }
                if batch.is_empty() {
                    continue;
                }
                Message::Text(batch.join("\n"))
            }
            _ = ping.tick() => Message::Ping(Vec::new()),
        };

        match timeout(WRITE_TIMEOUT, ws_sender.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(user_id = user, error = %e, "Socket write failed");
                break;
            }
            Err(_) => {
                tracing::warn!(user_id = user, "Write timeout, closing connection");
                break;
            }
        }
    }

    let _ = ws_sender.close().await;
}

fn push_encoded(batch: &mut Vec<String>, frame: &Frame, user: UserId) {
    match serde_json::to_string(frame) {
        Ok(json) => batch.push(json),
        Err(e) => tracing::error!(user_id = user, error = %e, "Failed to serialize frame"),
    }
}
