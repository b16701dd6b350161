//! # Messaging Data Model
//!
//! Messages, conversation kinds and the kind-specific content payload.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        MESSAGE LIFECYCLE                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   send ──► sent ──► delivered ──► read          (single chats)          │
//! │              │                                                          │
//! │              └──► recalled (flag, within the recall window)             │
//! │                                                                         │
//! │  Status only moves forward. Content is immutable once persisted.        │
//! │  Messages are never physically deleted.                                 │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// User identifier (issued by the account service).
pub type UserId = i64;

/// Message identifier (issued by [`crate::ids::IdGenerator`]).
pub type MessageId = i64;

/// Summary shown in place of a recalled message.
pub const RECALLED_SUMMARY: &str = "[recalled]";

/// Maximum length of a conversation's last-message preview.
const SUMMARY_MAX_CHARS: usize = 50;

/// Whether a conversation is 1:1 or a group chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationType {
    /// Two users
    Single,
    /// A group; the target id is the group id
    Group,
}

impl ConversationType {
    /// Convert to database string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Group => "group",
        }
    }

    /// Parse from database string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "single" => Some(Self::Single),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

/// What a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Plain text
    Text,
    /// Image resource
    Image,
    /// Voice clip
    Voice,
    /// Video resource
    Video,
    /// Generic file
    File,
    /// Platform-generated notice
    System,
}

impl MessageKind {
    /// Convert to database string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Voice => "voice",
            Self::Video => "video",
            Self::File => "file",
            Self::System => "system",
        }
    }

    /// Parse from database string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "voice" => Some(Self::Voice),
            "video" => Some(Self::Video),
            "file" => Some(Self::File),
            "system" => Some(Self::System),
            _ => None,
        }
    }

    /// Whether the kind points at an uploaded resource
    pub fn is_media(&self) -> bool {
        matches!(self, Self::Image | Self::Voice | Self::Video | Self::File)
    }
}

/// Delivery status. Ordered: a status never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Persisted by the send pipeline
    Sent,
    /// Pushed to a live connection of the recipient
    Delivered,
    /// Recipient marked it read
    Read,
}

impl MessageStatus {
    /// Numeric code stored in the database
    pub fn code(&self) -> i64 {
        match self {
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read => 3,
        }
    }

    /// Parse from numeric code
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Sent),
            2 => Some(Self::Delivered),
            3 => Some(Self::Read),
            _ => None,
        }
    }
}

/// Kind-specific message payload.
///
/// Text and system messages use `text`; media kinds use `url` plus optional
/// metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    /// Text body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Resource URL (from the upload service)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Preview image for video/image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    /// Duration for voice/video
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u32>,
    /// Original file name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl MessageContent {
    /// Create a text payload
    pub fn text(s: impl Into<String>) -> Self {
        Self {
            text: Some(s.into()),
            ..Default::default()
        }
    }

    /// Create a media payload
    pub fn media(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// Check the payload against the rules for `kind`.
    pub fn validate(&self, kind: MessageKind, max_text_chars: usize) -> Result<()> {
        if kind.is_media() {
            if self.url.as_deref().map(str::trim).unwrap_or_default().is_empty() {
                return Err(Error::InvalidContent(format!(
                    "{} message requires a resource url",
                    kind.as_str()
                )));
            }
            return Ok(());
        }

        let body = self.text.as_deref().unwrap_or_default();
        if body.trim().is_empty() {
            return Err(Error::InvalidContent("text body is empty".to_string()));
        }
        let chars = body.chars().count();
        if chars > max_text_chars {
            return Err(Error::InvalidContent(format!(
                "text body has {} characters, limit is {}",
                chars, max_text_chars
            )));
        }
        Ok(())
    }

    /// Short preview used as a conversation's last-message summary.
    pub fn summary(&self, kind: MessageKind) -> String {
        match kind {
            MessageKind::Text | MessageKind::System => {
                let text = self.text.as_deref().unwrap_or_default();
                if text.chars().count() > SUMMARY_MAX_CHARS {
                    let cut: String = text.chars().take(SUMMARY_MAX_CHARS).collect();
                    format!("{}...", cut)
                } else {
                    text.to_string()
                }
            }
            MessageKind::Image => "[image]".to_string(),
            MessageKind::Voice => "[voice]".to_string(),
            MessageKind::Video => "[video]".to_string(),
            MessageKind::File => "[file]".to_string(),
        }
    }
}

/// A persisted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique, time-sortable id
    pub id: MessageId,
    /// Sender
    pub sender_id: UserId,
    /// Peer user id (single) or group id (group)
    pub receiver_id: i64,
    /// Single or group
    pub conversation_type: ConversationType,
    /// Payload kind
    pub kind: MessageKind,
    /// Payload
    pub content: MessageContent,
    /// Delivery status
    pub status: MessageStatus,
    /// Whether the sender recalled it
    pub is_recalled: bool,
    /// Caller-supplied idempotency key
    pub client_msg_id: String,
    /// Unix timestamp (ms)
    pub created_at: i64,
    /// Unix timestamp (ms) of the last status/recall change
    pub updated_at: i64,
}

impl Message {
    /// Copy with content stripped if the message was recalled.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.is_recalled {
            copy.content = MessageContent::default();
        }
        copy
    }

    /// Preview for conversation lists
    pub fn summary(&self) -> String {
        if self.is_recalled {
            RECALLED_SUMMARY.to_string()
        } else {
            self.content.summary(self.kind)
        }
    }
}

/// A page of history, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct MessagePage {
    /// Messages in reverse-chronological order
    pub messages: Vec<Message>,
    /// Whether older messages exist
    pub has_more: bool,
    /// Cursor for the next page (smallest id on this page)
    pub last_msg_id: Option<MessageId>,
}
