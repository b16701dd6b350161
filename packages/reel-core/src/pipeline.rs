//! # Send Pipeline
//!
//! Synchronous half of sending a message: everything up to the durable
//! write and the fan-out publish.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SEND PIPELINE                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  SendCommand                                                           │
//! │     │                                                                   │
//! │     ├─► 1. validate content ──────────────► InvalidContent              │
//! │     ├─► 2. same client_msg_id seen? ──────► original receipt            │
//! │     ├─► 3. permission gate ───────────────► NotAuthorized               │
//! │     ├─► 4. group membership snapshot                                   │
//! │     ├─► 5. next id, persist message + pending_fanout (one tx)          │
//! │     └─► 6. publish fan-out event                                       │
//! │             ├── ok ─► drop pending row ──► Published                    │
//! │             └── failed ─► keep row ──────► DeliveryPending              │
//! │                                                                         │
//! │  Delivery and conversation updates happen later in the consumer.      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::broker::{message_event_key, Broker, FanoutEvent, MessageEvent};
use crate::directory::PermissionGate;
use crate::error::{Error, Result};
use crate::ids::IdGenerator;
use crate::model::{ConversationType, Message, MessageContent, MessageId, MessageKind, MessageStatus, UserId};
use crate::storage::Database;

/// Pending fan-out events republished per sweep
const REPUBLISH_BATCH: usize = 100;

/// A request to send one message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendCommand {
    /// Sender
    pub sender_id: UserId,
    /// Peer user id (single) or group id (group)
    pub target_id: i64,
    /// Single or group
    pub conversation_type: ConversationType,
    /// Payload kind
    pub kind: MessageKind,
    /// Payload
    pub content: MessageContent,
    /// Caller-supplied idempotency key, unique per logical send
    pub client_msg_id: String,
}

/// How far a send got
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SendOutcome {
    /// Persisted and handed to the broker
    Published,
    /// Persisted; the fan-out publish failed and will be retried out-of-band
    DeliveryPending,
}

/// Result of a send
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendReceipt {
    /// Id of the persisted message
    pub message_id: MessageId,
    /// Creation time (ms)
    pub created_at: i64,
    /// Publish outcome
    pub outcome: SendOutcome,
    /// Whether this repeated an earlier send with the same client id
    pub duplicate: bool,
}

/// Validates, authorizes, persists and publishes messages
pub struct SendPipeline {
    database: Arc<Database>,
    gate: PermissionGate,
    ids: Arc<IdGenerator>,
    broker: Arc<dyn Broker>,
    max_text_chars: usize,
}

impl SendPipeline {
    /// Assemble a pipeline
    pub fn new(
        database: Arc<Database>,
        gate: PermissionGate,
        ids: Arc<IdGenerator>,
        broker: Arc<dyn Broker>,
        max_text_chars: usize,
    ) -> Self {
        Self {
            database,
            gate,
            ids,
            broker,
            max_text_chars,
        }
    }

    /// Send a message
    ///
    /// Returns the message id as soon as the message is durable. A publish
    /// failure is reported as [`SendOutcome::DeliveryPending`], not as an
    /// error.
    pub async fn send(&self, cmd: SendCommand) -> Result<SendReceipt> {
        if cmd.client_msg_id.trim().is_empty() {
            return Err(Error::InvalidContent("client_msg_id is required".to_string()));
        }
        if cmd.conversation_type == ConversationType::Single && cmd.sender_id == cmd.target_id {
            return Err(Error::InvalidContent("cannot send a message to yourself".to_string()));
        }
        cmd.content.validate(cmd.kind, self.max_text_chars)?;

        if let Some(existing) = self.database.find_by_client_msg_id(cmd.sender_id, &cmd.client_msg_id)? {
            tracing::debug!(
                sender_id = cmd.sender_id,
                message_id = existing.id,
                "Repeated send, returning original message"
            );
            return self.duplicate_receipt(&existing).await;
        }

        if !self
            .gate
            .is_authorized_to_message(cmd.sender_id, cmd.target_id, cmd.conversation_type)
            .await?
        {
            tracing::info!(
                sender_id = cmd.sender_id,
                target_id = cmd.target_id,
                conversation_type = cmd.conversation_type.as_str(),
                "Send refused"
            );
            return Err(Error::NotAuthorized);
        }

        let recipients = match cmd.conversation_type {
            ConversationType::Single => Vec::new(),
            ConversationType::Group => self.gate.graph().group_members(cmd.target_id).await?,
        };

        let id = self.ids.next_id()?;
        let now = crate::time::now_timestamp_millis();
        let msg = Message {
            id,
            sender_id: cmd.sender_id,
            receiver_id: cmd.target_id,
            conversation_type: cmd.conversation_type,
            kind: cmd.kind,
            content: cmd.content,
            status: MessageStatus::Sent,
            is_recalled: false,
            client_msg_id: cmd.client_msg_id,
            created_at: now,
            updated_at: now,
        };

        let event = FanoutEvent::Message(MessageEvent {
            message_id: msg.id,
            sender_id: msg.sender_id,
            target_id: msg.receiver_id,
            conversation_type: msg.conversation_type,
            kind: msg.kind,
            content: msg.content.clone(),
            client_msg_id: msg.client_msg_id.clone(),
            created_at: msg.created_at,
            recipients,
        });
        let key = event.idempotency_key();
        let payload = serde_json::to_string(&event)?;

        if !self.database.insert_message_with_fanout(&msg, &key, &payload)? {
            // Lost a race with a concurrent send of the same client id
            return match self.database.find_by_client_msg_id(msg.sender_id, &msg.client_msg_id)? {
                Some(existing) => self.duplicate_receipt(&existing).await,
                None => Err(Error::Internal("message insert ignored without a conflicting row".to_string())),
            };
        }

        let outcome = self.publish_recorded(&event, &key).await;

        tracing::info!(
            message_id = msg.id,
            sender_id = msg.sender_id,
            target_id = msg.receiver_id,
            outcome = ?outcome,
            "Message sent"
        );

        Ok(SendReceipt {
            message_id: msg.id,
            created_at: msg.created_at,
            outcome,
            duplicate: false,
        })
    }

    /// Publish an event; on failure record it for the republisher
    pub async fn publish_or_defer(&self, event: &FanoutEvent) -> SendOutcome {
        match self.broker.publish(event).await {
            Ok(_) => SendOutcome::Published,
            Err(e) => {
                tracing::warn!(
                    message_id = event.message_id(),
                    error = %e,
                    "Fan-out publish failed, deferring"
                );
                let saved = serde_json::to_string(event)
                    .map_err(Error::from)
                    .and_then(|payload| {
                        self.database
                            .save_pending_fanout(&event.idempotency_key(), event.message_id(), &payload)
                    });
                if let Err(e) = saved {
                    tracing::error!(
                        message_id = event.message_id(),
                        error = %e,
                        "Failed to record pending fan-out"
                    );
                }
                SendOutcome::DeliveryPending
            }
        }
    }

    /// Republish deferred fan-out events, oldest first
    ///
    /// Never re-validates or re-authorizes. Stops at the first publish
    /// failure. Returns how many events were published.
    pub async fn republish_pending(&self) -> Result<usize> {
        let pending = self.database.list_pending_fanout(REPUBLISH_BATCH)?;
        let mut published = 0;

        for record in pending {
            let event: FanoutEvent = match serde_json::from_str(&record.payload) {
                Ok(event) => event,
                Err(e) => {
                    tracing::error!(key = %record.event_key, error = %e, "Dropping undecodable pending fan-out");
                    self.database.remove_pending_fanout(&record.event_key)?;
                    continue;
                }
            };

            match self.broker.publish(&event).await {
                Ok(_) => {
                    self.database.remove_pending_fanout(&record.event_key)?;
                    published += 1;
                }
                Err(e) => {
                    self.database.bump_pending_attempts(&record.event_key)?;
                    tracing::warn!(
                        key = %record.event_key,
                        attempts = record.attempts + 1,
                        error = %e,
                        "Republish failed"
                    );
                    break;
                }
            }
        }

        if published > 0 {
            tracing::info!(published, "Republished pending fan-out events");
        }
        Ok(published)
    }

    /// Publish an event whose pending row is already stored
    ///
    /// The row is dropped once the broker has the event. On failure it stays
    /// for the republisher.
    async fn publish_recorded(&self, event: &FanoutEvent, key: &str) -> SendOutcome {
        match self.broker.publish(event).await {
            Ok(_) => {
                if let Err(e) = self.database.remove_pending_fanout(key) {
                    // The republisher sends it again; the consumer's claim absorbs it
                    tracing::warn!(key = %key, error = %e, "Failed to clear pending fan-out");
                }
                SendOutcome::Published
            }
            Err(e) => {
                tracing::warn!(
                    message_id = event.message_id(),
                    error = %e,
                    "Fan-out publish failed, deferring"
                );
                SendOutcome::DeliveryPending
            }
        }
    }

    /// Receipt for a repeated send
    ///
    /// Reports `Published` only if nothing is left to publish. A still
    /// pending event is published again on the spot.
    async fn duplicate_receipt(&self, existing: &Message) -> Result<SendReceipt> {
        let key = message_event_key(existing.sender_id, &existing.client_msg_id);

        let outcome = match self.database.get_pending_fanout(&key)? {
            None => SendOutcome::Published,
            Some(record) => match serde_json::from_str::<FanoutEvent>(&record.payload) {
                Ok(event) => self.publish_recorded(&event, &key).await,
                Err(e) => {
                    tracing::error!(key = %key, error = %e, "Undecodable pending fan-out");
                    SendOutcome::DeliveryPending
                }
            },
        };

        Ok(SendReceipt {
            message_id: existing.id,
            created_at: existing.created_at,
            outcome,
            duplicate: true,
        })
    }
}
