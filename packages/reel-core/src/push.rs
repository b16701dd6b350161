//! Push notifications produced by the core and the sink they are handed to.
//!
//! Pushing is best-effort: a sink never blocks and never fails the caller.
//! It only reports what it did with the notification.

use async_trait::async_trait;
use serde::Serialize;

use crate::directory::UserProfile;
use crate::model::{ConversationType, Message, MessageId, MessageStatus, UserId};

/// A new message for a recipient
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceivedMessage {
    /// The message
    #[serde(flatten)]
    pub message: Message,
    /// Sender display data, when the profile service answered in time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<UserProfile>,
}

/// A status change for messages the recipient sent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusUpdate {
    /// The message (for `read`: every message up to and including this one)
    pub message_id: MessageId,
    /// The user whose action changed the status
    pub peer_id: UserId,
    /// New status
    pub status: MessageStatus,
}

/// A message was recalled
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecallNotice {
    /// Recalled message
    pub message_id: MessageId,
    /// Original sender
    pub sender_id: UserId,
    /// Peer user id (single) or group id (group)
    pub target_id: i64,
    /// Single or group
    pub conversation_type: ConversationType,
}

/// The recipient's own read mark, for their other devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadNotice {
    /// Conversation that was read
    pub conversation_id: String,
    /// The other participant
    pub peer_id: UserId,
    /// Read up to and including this message
    pub last_msg_id: MessageId,
}

/// Everything the core pushes to connected users
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// `receive_message`
    ReceiveMessage(ReceivedMessage),
    /// `message_status`
    MessageStatus(StatusUpdate),
    /// `recall_message`
    RecallMessage(RecallNotice),
    /// `read_message`
    ReadMessage(ReadNotice),
}

impl Notification {
    /// Wire action name
    pub fn action(&self) -> &'static str {
        match self {
            Notification::ReceiveMessage(_) => "receive_message",
            Notification::MessageStatus(_) => "message_status",
            Notification::RecallMessage(_) => "recall_message",
            Notification::ReadMessage(_) => "read_message",
        }
    }

    /// Frame payload
    pub fn data(&self) -> serde_json::Value {
        let value = match self {
            Notification::ReceiveMessage(n) => serde_json::to_value(n),
            Notification::MessageStatus(n) => serde_json::to_value(n),
            Notification::RecallMessage(n) => serde_json::to_value(n),
            Notification::ReadMessage(n) => serde_json::to_value(n),
        };
        value.unwrap_or(serde_json::Value::Null)
    }

    /// Client message id to echo on the frame, if any
    pub fn client_msg_id(&self) -> Option<&str> {
        match self {
            Notification::ReceiveMessage(n) => Some(&n.message.client_msg_id),
            _ => None,
        }
    }

    /// Message the notification is about
    pub fn message_id(&self) -> MessageId {
        match self {
            Notification::ReceiveMessage(n) => n.message.id,
            Notification::MessageStatus(n) => n.message_id,
            Notification::RecallMessage(n) => n.message_id,
            Notification::ReadMessage(n) => n.last_msg_id,
        }
    }
}

/// What a sink did with a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Accepted by at least one live connection
    Live,
    /// User offline; stored for delivery on reconnect
    Queued,
    /// User online but every connection refused it (outbound buffer full)
    Dropped,
}

/// Destination for notifications.
#[async_trait]
pub trait PushSink: Send + Sync {
    /// Deliver to every connection of `user`
    ///
    /// Never waits on a socket; the outcome reflects whether a connection
    /// actually took the notification.
    async fn push(&self, user: UserId, notification: Notification) -> PushOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessageContent, MessageKind};

    #[test]
    fn test_receive_message_payload_is_flat() {
        let n = Notification::ReceiveMessage(ReceivedMessage {
            message: Message {
                id: 42,
                sender_id: 1,
                receiver_id: 2,
                conversation_type: ConversationType::Single,
                kind: MessageKind::Text,
                content: MessageContent::text("hi"),
                status: MessageStatus::Sent,
                is_recalled: false,
                client_msg_id: "c-42".into(),
                created_at: 0,
                updated_at: 0,
            },
            sender: Some(UserProfile {
                name: "ana".into(),
                avatar: None,
            }),
        });

        assert_eq!(n.action(), "receive_message");
        assert_eq!(n.client_msg_id(), Some("c-42"));
        let data = n.data();
        assert_eq!(data["id"], 42);
        assert_eq!(data["content"]["text"], "hi");
        assert_eq!(data["sender"]["name"], "ana");
    }

    #[test]
    fn test_status_payload() {
        let n = Notification::MessageStatus(StatusUpdate {
            message_id: 7,
            peer_id: 2,
            status: MessageStatus::Read,
        });
        assert_eq!(n.action(), "message_status");
        assert_eq!(n.data()["status"], "read");
        assert_eq!(n.client_msg_id(), None);
    }
}
