//! Live channel frame definitions.
//!
//! Every frame on the WebSocket is a JSON object
//! `{ "action", "data", "clientMsgId", "timestamp" }`. The server may pack
//! several frames into one text message, separated by `\n`.

use reel_core::model::{ConversationType, MessageContent, MessageId, MessageKind};
use reel_core::Notification;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Actions ───────────────────────────────────────────────────────────────────

/// What a frame is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Keepalive from the client
    Ping,
    /// Keepalive reply
    Pong,
    /// Client → relay: send a message. Relay → client: the send receipt.
    SendMessage,
    /// A new message for the recipient
    ReceiveMessage,
    /// Delivered / read status for messages the recipient sent
    MessageStatus,
    /// Client → relay: recall a message. Relay → client: a recall happened.
    RecallMessage,
    /// Client → relay: mark read. Relay → client: own read mark from another device.
    ReadMessage,
    /// A request failed
    Error,
}

impl Action {
    fn from_notification(n: &Notification) -> Self {
        match n {
            Notification::ReceiveMessage(_) => Action::ReceiveMessage,
            Notification::MessageStatus(_) => Action::MessageStatus,
            Notification::RecallMessage(_) => Action::RecallMessage,
            Notification::ReadMessage(_) => Action::ReadMessage,
        }
    }
}

// ── Frame ─────────────────────────────────────────────────────────────────────

/// One unit on the live channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// What the frame is
    pub action: Action,
    /// Action-specific payload
    #[serde(default)]
    pub data: Value,
    /// Echoed back on replies to client frames
    #[serde(rename = "clientMsgId", default, skip_serializing_if = "Option::is_none")]
    pub client_msg_id: Option<String>,
    /// Creation time (ms)
    #[serde(default)]
    pub timestamp: i64,
}

impl Frame {
    /// A frame stamped with the current time.
    pub fn new(action: Action, data: Value) -> Self {
        Self {
            action,
            data,
            client_msg_id: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Echo a client message id.
    pub fn with_client_msg_id(mut self, client_msg_id: Option<String>) -> Self {
        self.client_msg_id = client_msg_id;
        self
    }

    /// Reply to a client ping.
    pub fn pong() -> Self {
        Self::new(Action::Pong, Value::Null)
    }

    /// An `error` frame carrying the core error code.
    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self::new(
            Action::Error,
            serde_json::json!({ "code": code, "error": message.into() }),
        )
    }

    /// An `error` frame for a core error.
    pub fn from_error(e: &reel_core::Error) -> Self {
        Self::error(e.code(), e.to_string())
    }

    /// Render a core notification.
    pub fn from_notification(n: &Notification) -> Self {
        Self::new(Action::from_notification(n), n.data())
            .with_client_msg_id(n.client_msg_id().map(str::to_string))
    }

    /// Decode one frame of an inbound text message.
    pub fn decode(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

// ── Client payloads ───────────────────────────────────────────────────────────

/// `data` of a client `send_message` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageData {
    pub target_id: i64,
    #[serde(default = "default_conversation_type")]
    pub conversation_type: ConversationType,
    #[serde(default = "default_kind")]
    pub kind: MessageKind,
    pub content: MessageContent,
}

/// `data` of a client `read_message` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadMessageData {
    pub target_id: i64,
    #[serde(default = "default_conversation_type")]
    pub conversation_type: ConversationType,
    pub last_msg_id: MessageId,
}

/// `data` of a client `recall_message` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct RecallMessageData {
    pub message_id: MessageId,
}

pub(crate) fn default_conversation_type() -> ConversationType {
    ConversationType::Single
}

pub(crate) fn default_kind() -> MessageKind {
    MessageKind::Text
}

// ── Tests ─────────────────────────────────────────────────────────────────────
