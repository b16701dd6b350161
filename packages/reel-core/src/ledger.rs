//! # Conversation Ledger
//!
//! Per-user conversation state: last message, unread count, read pointer,
//! pin/mute and single-sided delete/clear.
//!
//! ## Conversation Identity
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      CONVERSATION IDS                                   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Single chat (A, B):                                                    │
//! │    id = hex(SHA256("single|" || min(A,B) || "|" || max(A,B)))[..32]     │
//! │    Both participants resolve the same id; one shared row, one member    │
//! │    record per participant.                                              │
//! │                                                                         │
//! │  Group chat (member M, group G):                                        │
//! │    id = hex(SHA256("group|" || G || "|" || M))[..32]                    │
//! │    Every member owns an independent conversation row.                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Read state is tracked for single chats only. Marking a group
//! conversation read succeeds and changes nothing.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::model::{ConversationType, Message, MessageId, MessageKind, UserId, RECALLED_SUMMARY};
use crate::storage::{ConversationRecord, Database, LastMessage, MemberTouch};

/// Largest page a conversation list request may ask for.
pub const MAX_CONVERSATION_PAGE_SIZE: usize = 100;

/// Conversation id shared by both participants of a single chat
pub fn single_conversation_id(a: UserId, b: UserId) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };

    let mut hasher = Sha256::new();
    hasher.update(b"single|");
    hasher.update(first.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(second.to_string().as_bytes());

    let hash = hasher.finalize();
    hex::encode(&hash[..16])
}

/// Conversation id owned by one member of a group
pub fn group_conversation_id(member: UserId, group_id: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"group|");
    hasher.update(group_id.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(member.to_string().as_bytes());

    let hash = hasher.finalize();
    hex::encode(&hash[..16])
}

/// Conversation id as seen by `user` talking to `target`
pub fn conversation_id_for(user: UserId, target: i64, conversation_type: ConversationType) -> String {
    match conversation_type {
        ConversationType::Single => single_conversation_id(user, target),
        ConversationType::Group => group_conversation_id(user, target),
    }
}

/// Read-only projection of one user's view of a conversation.
///
/// Fields are private; nothing on this type writes back to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationView {
    conversation_id: String,
    conversation_type: ConversationType,
    target_id: i64,
    last_message_id: MessageId,
    last_message_summary: String,
    last_message_kind: Option<MessageKind>,
    last_message_time: i64,
    unread_count: i64,
    is_pinned: bool,
    is_muted: bool,
}

impl ConversationView {
    fn from_record(record: &ConversationRecord) -> Self {
        Self {
            conversation_id: record.conversation_id.clone(),
            conversation_type: record.conversation_type,
            target_id: record.peer_id,
            last_message_id: record.last_message_id,
            last_message_summary: record.last_message_summary.clone(),
            last_message_kind: record.last_message_kind,
            last_message_time: record.last_message_time,
            unread_count: record.unread_count,
            is_pinned: record.is_pinned,
            is_muted: record.is_muted,
        }
    }

    /// Conversation id
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Single or group
    pub fn conversation_type(&self) -> ConversationType {
        self.conversation_type
    }

    /// Peer user id (single) or group id (group)
    pub fn target_id(&self) -> i64 {
        self.target_id
    }

    /// Id of the newest message (0 if none)
    pub fn last_message_id(&self) -> MessageId {
        self.last_message_id
    }

    /// Preview of the newest message
    pub fn last_message_summary(&self) -> &str {
        &self.last_message_summary
    }

    /// Kind of the newest message
    pub fn last_message_kind(&self) -> Option<MessageKind> {
        self.last_message_kind
    }

    /// Timestamp (ms) of the newest message
    pub fn last_message_time(&self) -> i64 {
        self.last_message_time
    }

    /// Unread messages for the viewing user
    pub fn unread_count(&self) -> i64 {
        self.unread_count
    }

    /// Pinned by the viewing user
    pub fn is_pinned(&self) -> bool {
        self.is_pinned
    }

    /// Muted by the viewing user
    pub fn is_muted(&self) -> bool {
        self.is_muted
    }
}

/// One page of a user's conversation list
#[derive(Debug, Clone, Serialize)]
pub struct ConversationPage {
    /// Conversations on this page
    pub conversations: Vec<ConversationView>,
    /// Total visible conversations
    pub total: i64,
    /// 1-based page number
    pub page: usize,
    /// Page size used
    pub page_size: usize,
}

/// Persistent conversation bookkeeping
pub struct ConversationLedger {
    database: Arc<Database>,
}

impl ConversationLedger {
    /// Create a ledger over the shared database
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }

    /// Record `msg` as the newest activity for every participant
    ///
    /// `members` is the group membership snapshot captured at send time and
    /// is ignored for single chats. The sender's record is refreshed without
    /// touching its unread count.
    pub fn apply_message(&self, msg: &Message, members: &[UserId]) -> Result<()> {
        let last = LastMessage {
            id: msg.id,
            conversation_type: msg.conversation_type,
            target_id: match msg.conversation_type {
                ConversationType::Single => msg.sender_id.min(msg.receiver_id),
                ConversationType::Group => msg.receiver_id,
            },
            summary: msg.summary(),
            kind: msg.kind,
            time: msg.created_at,
        };

        let touches = match msg.conversation_type {
            ConversationType::Single => {
                let conversation_id = single_conversation_id(msg.sender_id, msg.receiver_id);
                vec![
                    MemberTouch {
                        conversation_id: conversation_id.clone(),
                        user_id: msg.sender_id,
                        peer_id: msg.receiver_id,
                        counts_as_unread: false,
                    },
                    MemberTouch {
                        conversation_id,
                        user_id: msg.receiver_id,
                        peer_id: msg.sender_id,
                        counts_as_unread: true,
                    },
                ]
            }
            ConversationType::Group => {
                let group_id = msg.receiver_id;
                let mut touches = vec![MemberTouch {
                    conversation_id: group_conversation_id(msg.sender_id, group_id),
                    user_id: msg.sender_id,
                    peer_id: group_id,
                    counts_as_unread: false,
                }];
                for &member in members.iter().filter(|&&m| m != msg.sender_id) {
                    touches.push(MemberTouch {
                        conversation_id: group_conversation_id(member, group_id),
                        user_id: member,
                        peer_id: group_id,
                        counts_as_unread: true,
                    });
                }
                touches
            }
        };

        self.database.apply_message(&last, &touches)?;

        tracing::debug!(
            message_id = msg.id,
            members = touches.len(),
            "Applied message to conversations"
        );
        Ok(())
    }

    /// Replace the preview of conversations whose newest message was recalled
    pub fn apply_recall(&self, message_id: MessageId) -> Result<usize> {
        self.database.refresh_last_summary(message_id, RECALLED_SUMMARY)
    }

    /// Mark a conversation read up to `last_msg_id`
    ///
    /// Returns how many messages moved to `read`. Group conversations are
    /// not read-tracked: the call succeeds and returns 0.
    pub fn mark_read(
        &self,
        user: UserId,
        target: i64,
        conversation_type: ConversationType,
        last_msg_id: MessageId,
    ) -> Result<usize> {
        match conversation_type {
            ConversationType::Group => {
                tracing::debug!(user_id = user, group_id = target, "Group read marks are not tracked");
                Ok(0)
            }
            ConversationType::Single => {
                let conversation_id = single_conversation_id(user, target);
                self.database.mark_single_read(&conversation_id, user, target, last_msg_id)
            }
        }
    }

    /// One user's view of a conversation
    pub fn get_view(&self, conversation_id: &str, user: UserId) -> Result<ConversationView> {
        self.visible_record(conversation_id, user)
            .map(|record| ConversationView::from_record(&record))
    }

    /// A user's conversations, pinned first, then most recent
    pub fn list(&self, user: UserId, page: usize, page_size: usize) -> Result<ConversationPage> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, MAX_CONVERSATION_PAGE_SIZE);

        // Pages past the end come back empty instead of overflowing
        let offset = (page - 1).saturating_mul(page_size);
        let records = self.database.list_member_conversations(user, page_size, offset)?;
        let total = self.database.count_member_conversations(user)?;

        Ok(ConversationPage {
            conversations: records.iter().map(ConversationView::from_record).collect(),
            total,
            page,
            page_size,
        })
    }

    /// Hide a conversation from one user's list (the peer keeps theirs)
    pub fn delete(&self, user: UserId, conversation_id: &str) -> Result<()> {
        self.visible_record(conversation_id, user)?;
        self.database.delete_member_conversation(conversation_id, user)?;
        tracing::info!(user_id = user, conversation_id, "Conversation deleted for user");
        Ok(())
    }

    /// Hide one user's history up to the current newest message
    pub fn clear_history(&self, user: UserId, conversation_id: &str) -> Result<()> {
        self.visible_record(conversation_id, user)?;
        self.database.clear_member_history(conversation_id, user)?;
        tracing::info!(user_id = user, conversation_id, "History cleared for user");
        Ok(())
    }

    /// Pin or unpin for one user
    pub fn set_pinned(&self, user: UserId, conversation_id: &str, pinned: bool) -> Result<()> {
        if !self.database.set_member_pinned(conversation_id, user, pinned)? {
            return Err(Error::ConversationNotFound);
        }
        Ok(())
    }

    /// Mute or unmute for one user
    pub fn set_muted(&self, user: UserId, conversation_id: &str, muted: bool) -> Result<()> {
        if !self.database.set_member_muted(conversation_id, user, muted)? {
            return Err(Error::ConversationNotFound);
        }
        Ok(())
    }

    /// Messages with an id at or below this are hidden from `user`
    pub fn cleared_before(&self, user: UserId, conversation_id: &str) -> Result<MessageId> {
        Ok(self
            .database
            .get_member_conversation(conversation_id, user)?
            .map(|record| record.cleared_before_id)
            .unwrap_or(0))
    }

    fn visible_record(&self, conversation_id: &str, user: UserId) -> Result<ConversationRecord> {
        match self.database.get_member_conversation(conversation_id, user)? {
            Some(record) if !record.is_deleted => Ok(record),
            _ => Err(Error::ConversationNotFound),
        }
    }
}
