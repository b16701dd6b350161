//! # Messaging Service
//!
//! Transport-agnostic entry point used by the relay's HTTP and WebSocket
//! handlers.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      MESSAGING SERVICE                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  send_message ──────────► SendPipeline ──► Database + Broker           │
//! │  recall_message ────────► Database ──► Broker (recall event)           │
//! │  list_messages ─────────► Database (keyset, newest first)              │
//! │  mark_messages_read ────► ConversationLedger ──► PushSink (status)     │
//! │  list/get/delete/clear/pin/mute conversations ──► ConversationLedger   │
//! │                                                                         │
//! │  fanout_consumer() wires a FanoutConsumer over the same ledger,        │
//! │  database and push sink.                                               │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use crate::broker::{Broker, FanoutEvent, RecallEvent};
use crate::claims::ClaimStore;
use crate::consumer::{FanoutConsumer, FanoutProcessor};
use crate::directory::PermissionGate;
use crate::error::{Error, Result};
use crate::ids::IdGenerator;
use crate::ledger::{conversation_id_for, ConversationLedger, ConversationPage, ConversationView};
use crate::model::{ConversationType, MessageId, MessagePage, MessageStatus, UserId};
use crate::pipeline::{SendCommand, SendOutcome, SendPipeline, SendReceipt};
use crate::push::{Notification, PushSink, ReadNotice, StatusUpdate};
use crate::storage::Database;
use crate::CoreConfig;

/// Page size used when a history request does not give one
pub const DEFAULT_MESSAGE_PAGE_SIZE: usize = 20;

/// Facade over the messaging core
pub struct MessagingService {
    database: Arc<Database>,
    ledger: Arc<ConversationLedger>,
    gate: PermissionGate,
    broker: Arc<dyn Broker>,
    push: Arc<dyn PushSink>,
    pipeline: SendPipeline,
    config: CoreConfig,
}

impl MessagingService {
    /// Wire the service
    pub fn new(
        database: Arc<Database>,
        gate: PermissionGate,
        ids: Arc<IdGenerator>,
        broker: Arc<dyn Broker>,
        push: Arc<dyn PushSink>,
        config: CoreConfig,
    ) -> Self {
        let ledger = Arc::new(ConversationLedger::new(database.clone()));
        let pipeline = SendPipeline::new(
            database.clone(),
            gate.clone(),
            ids,
            broker.clone(),
            config.max_text_chars,
        );

        Self {
            database,
            ledger,
            gate,
            broker,
            push,
            pipeline,
            config,
        }
    }

    /// Build a consumer that applies fan-out events for this service
    pub fn fanout_consumer(&self, claims: Arc<dyn ClaimStore>) -> FanoutConsumer {
        let processor = FanoutProcessor::new(
            self.database.clone(),
            self.ledger.clone(),
            self.gate.graph().clone(),
            self.push.clone(),
            self.config.profile_timeout,
        );
        FanoutConsumer::new(self.broker.clone(), claims, processor, self.config.clone())
    }

    /// Send a message
    pub async fn send_message(&self, cmd: SendCommand) -> Result<SendReceipt> {
        self.pipeline.send(cmd).await
    }

    /// One page of history between `user` and `target`, newest first
    ///
    /// `last_msg_id` is the cursor from the previous page. Messages the user
    /// cleared are skipped; recalled messages come back without content.
    pub async fn list_messages(
        &self,
        user: UserId,
        target: i64,
        conversation_type: ConversationType,
        last_msg_id: Option<MessageId>,
        limit: usize,
    ) -> Result<MessagePage> {
        let limit = match limit {
            0 => DEFAULT_MESSAGE_PAGE_SIZE,
            n => n.min(self.config.max_page_size),
        };

        let conversation_id = conversation_id_for(user, target, conversation_type);
        let cleared = self.ledger.cleared_before(user, &conversation_id)?;

        if conversation_type == ConversationType::Group
            && cleared == 0
            && self.ledger.get_view(&conversation_id, user).is_err()
            && !self.gate.graph().is_group_member(target, user).await?
        {
            return Err(Error::NotAuthorized);
        }

        let mut rows = self.database.list_messages(
            conversation_type,
            user,
            target,
            last_msg_id.filter(|&id| id > 0),
            cleared,
            limit + 1,
        )?;

        let has_more = rows.len() > limit;
        rows.truncate(limit);
        let next_cursor = rows.last().map(|m| m.id);

        Ok(MessagePage {
            messages: rows.iter().map(|m| m.redacted()).collect(),
            has_more,
            last_msg_id: next_cursor,
        })
    }

    /// Recall a message
    ///
    /// Only the sender may recall, and only within the recall window.
    pub async fn recall_message(&self, message_id: MessageId, user: UserId) -> Result<SendOutcome> {
        let msg = self
            .database
            .get_message(message_id)?
            .ok_or(Error::MessageNotFound)?;

        if msg.sender_id != user {
            return Err(Error::NotMessageSender);
        }
        if msg.is_recalled {
            return Err(Error::AlreadyRecalled);
        }

        let now = crate::time::now_timestamp_millis();
        let window = self.config.recall_window;
        if now - msg.created_at > window.as_millis() as i64 {
            return Err(Error::RecallWindowExpired {
                window_secs: window.as_secs(),
            });
        }

        if !self.database.set_recalled(message_id)? {
            return Err(Error::AlreadyRecalled);
        }

        let recipients = match msg.conversation_type {
            ConversationType::Single => Vec::new(),
            ConversationType::Group => match self.gate.graph().group_members(msg.receiver_id).await {
                Ok(members) => members,
                Err(e) => {
                    tracing::warn!(message_id, error = %e, "Group lookup failed, recall reaches sender only");
                    Vec::new()
                }
            },
        };

        let event = FanoutEvent::Recall(RecallEvent {
            message_id,
            sender_id: msg.sender_id,
            target_id: msg.receiver_id,
            conversation_type: msg.conversation_type,
            recipients,
            recalled_at: now,
        });

        let outcome = self.pipeline.publish_or_defer(&event).await;
        tracing::info!(message_id, user_id = user, "Message recalled");
        Ok(outcome)
    }

    /// Mark a conversation read up to `last_msg_id`
    ///
    /// Group conversations are not read-tracked: returns `Ok(0)` and
    /// changes nothing.
    pub async fn mark_messages_read(
        &self,
        user: UserId,
        target: i64,
        conversation_type: ConversationType,
        last_msg_id: MessageId,
    ) -> Result<usize> {
        let changed = self.ledger.mark_read(user, target, conversation_type, last_msg_id)?;

        if conversation_type == ConversationType::Single {
            if changed > 0 {
                self.push
                    .push(
                        target,
                        Notification::MessageStatus(StatusUpdate {
                            message_id: last_msg_id,
                            peer_id: user,
                            status: MessageStatus::Read,
                        }),
                    )
                    .await;
            }
            self.push
                .push(
                    user,
                    Notification::ReadMessage(ReadNotice {
                        conversation_id: conversation_id_for(user, target, conversation_type),
                        peer_id: target,
                        last_msg_id,
                    }),
                )
                .await;
        }

        Ok(changed)
    }

    /// A user's conversations, pinned first, then most recent
    pub fn list_conversations(&self, user: UserId, page: usize, page_size: usize) -> Result<ConversationPage> {
        self.ledger.list(user, page, page_size)
    }

    /// One user's view of a conversation
    pub fn get_conversation(&self, user: UserId, conversation_id: &str) -> Result<ConversationView> {
        self.ledger.get_view(conversation_id, user)
    }

    /// Single-sided soft delete
    pub fn delete_conversation(&self, user: UserId, conversation_id: &str) -> Result<()> {
        self.ledger.delete(user, conversation_id)
    }

    /// Single-sided history clear
    pub fn clear_history(&self, user: UserId, conversation_id: &str) -> Result<()> {
        self.ledger.clear_history(user, conversation_id)
    }

    /// Pin or unpin
    pub fn set_pinned(&self, user: UserId, conversation_id: &str, pinned: bool) -> Result<()> {
        self.ledger.set_pinned(user, conversation_id, pinned)
    }

    /// Mute or unmute
    pub fn set_muted(&self, user: UserId, conversation_id: &str, muted: bool) -> Result<()> {
        self.ledger.set_muted(user, conversation_id, muted)
    }

    /// Republish fan-out events whose publish failed
    pub async fn republish_pending(&self) -> Result<usize> {
        self.pipeline.republish_pending().await
    }

    /// Fan-out events waiting for republish
    pub fn pending_fanout(&self) -> Result<i64> {
        self.database.count_pending_fanout()
    }

    /// Core configuration in effect
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }
}
