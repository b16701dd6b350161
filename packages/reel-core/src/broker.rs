//! # Fan-out Broker
//!
//! Durable, partitioned event log between the send pipeline and the
//! fan-out consumers.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         PARTITIONED LOG                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  publish(event)                                                        │
//! │     │  partition = u32(SHA256(conversation key)[..4]) % partitions      │
//! │     ▼                                                                   │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────┐                    │
//! │  │  p0      │ │  p1      │ │  p2      │ │  p3      │   append-only      │
//! │  │ 1  5  9  │ │ 2  6     │ │ 3  7  8  │ │ 4        │                    │
//! │  └────┬─────┘ └────┬─────┘ └────┬─────┘ └────┬─────┘                    │
//! │       ▼            ▼            ▼            ▼                          │
//! │   consumer 0   consumer 1   consumer 2   consumer 3   (sequential)      │
//! │                                                                         │
//! │  Every event of one conversation lands on the same partition, so it    │
//! │  is processed in publish order by one worker. Offsets are committed    │
//! │  per consumer group after side effects.                                 │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::ledger::single_conversation_id;
use crate::model::{ConversationType, MessageContent, MessageId, MessageKind, UserId};
use crate::storage::Database;

/// A new message to fan out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    /// Persisted message id
    pub message_id: MessageId,
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
    /// Caller-supplied idempotency key
    pub client_msg_id: String,
    /// Message creation time (ms)
    pub created_at: i64,
    /// Group membership snapshot at send time (empty for single chats)
    #[serde(default)]
    pub recipients: Vec<UserId>,
}

/// A recalled message to fan out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallEvent {
    /// Recalled message id
    pub message_id: MessageId,
    /// Original sender
    pub sender_id: UserId,
    /// Peer user id (single) or group id (group)
    pub target_id: i64,
    /// Single or group
    pub conversation_type: ConversationType,
    /// Group members to notify (empty for single chats)
    #[serde(default)]
    pub recipients: Vec<UserId>,
    /// When the recall happened (ms)
    pub recalled_at: i64,
}

/// An event on the fan-out log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FanoutEvent {
    /// New message
    Message(MessageEvent),
    /// Message recalled
    Recall(RecallEvent),
}

/// Idempotency key of a message event
pub fn message_event_key(sender_id: UserId, client_msg_id: &str) -> String {
    format!("msg:{}:{}", sender_id, client_msg_id)
}

impl FanoutEvent {
    /// Key used to collapse redelivery of the same logical event
    ///
    /// Client message ids are unique per sender, so the key is scoped by
    /// sender.
    pub fn idempotency_key(&self) -> String {
        match self {
            FanoutEvent::Message(e) => message_event_key(e.sender_id, &e.client_msg_id),
            FanoutEvent::Recall(e) => format!("recall:{}", e.message_id),
        }
    }

    /// Key that decides the partition; stable per conversation
    pub fn partition_key(&self) -> String {
        let (sender, target, conversation_type) = match self {
            FanoutEvent::Message(e) => (e.sender_id, e.target_id, e.conversation_type),
            FanoutEvent::Recall(e) => (e.sender_id, e.target_id, e.conversation_type),
        };
        match conversation_type {
            ConversationType::Single => single_conversation_id(sender, target),
            ConversationType::Group => format!("group:{}", target),
        }
    }

    /// Message the event refers to
    pub fn message_id(&self) -> MessageId {
        match self {
            FanoutEvent::Message(e) => e.message_id,
            FanoutEvent::Recall(e) => e.message_id,
        }
    }
}

/// Raw record read from a partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerRecord {
    /// Position in the log
    pub offset: i64,
    /// Partition the record was read from
    pub partition: u32,
    /// Idempotency key stored alongside the event
    pub key: String,
    /// Serialized [`FanoutEvent`]
    pub payload: String,
}

impl BrokerRecord {
    /// Decode the event
    pub fn event(&self) -> Result<FanoutEvent> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// Durable fan-out log.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append an event; returns its offset
    async fn publish(&self, event: &FanoutEvent) -> Result<i64>;

    /// Up to `max` records of `partition` not yet committed by `group`
    async fn poll(&self, group: &str, partition: u32, max: usize) -> Result<Vec<BrokerRecord>>;

    /// Mark everything up to `offset` as processed by `group`
    async fn commit(&self, group: &str, partition: u32, offset: i64) -> Result<()>;

    /// Uncommitted records of `partition` for `group`
    async fn lag(&self, group: &str, partition: u32) -> Result<i64>;

    /// Wait until `partition` may have new records or `timeout` passes
    async fn wait_for_records(&self, partition: u32, timeout: Duration);

    /// Number of partitions
    fn partitions(&self) -> u32;
}

/// Partition for a key among `partitions`
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let hash = Sha256::digest(key.as_bytes());
    let prefix = u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]);
    prefix % partitions.max(1)
}

/// Broker backed by the SQLite log tables
pub struct SqliteBroker {
    database: Arc<Database>,
    signals: Vec<Notify>,
}

impl SqliteBroker {
    /// Create a broker with `partitions` partitions
    pub fn new(database: Arc<Database>, partitions: u32) -> Result<Self> {
        if partitions == 0 {
            return Err(Error::InvalidConfig("broker needs at least one partition".to_string()));
        }
        Ok(Self {
            database,
            signals: (0..partitions).map(|_| Notify::new()).collect(),
        })
    }
}

#[async_trait]
impl Broker for SqliteBroker {
    async fn publish(&self, event: &FanoutEvent) -> Result<i64> {
        let payload = serde_json::to_string(event)?;
        let key = event.idempotency_key();
        let partition = partition_for(&event.partition_key(), self.partitions());

        let offset = self
            .database
            .append_log(partition, &key, &payload)
            .map_err(|e| Error::BrokerError(e.to_string()))?;

        // Stores a permit if the consumer is busy, so the wakeup is not lost
        self.signals[partition as usize].notify_one();

        tracing::debug!(partition, offset, key = %key, "Published fan-out event");
        Ok(offset)
    }

    async fn poll(&self, group: &str, partition: u32, max: usize) -> Result<Vec<BrokerRecord>> {
        let committed = self
            .database
            .committed_offset(group, partition)
            .map_err(|e| Error::BrokerError(e.to_string()))?;

        let records = self
            .database
            .read_log(partition, committed, max)
            .map_err(|e| Error::BrokerError(e.to_string()))?;

        Ok(records
            .into_iter()
            .map(|r| BrokerRecord {
                offset: r.offset,
                partition: r.partition,
                key: r.event_key,
                payload: r.payload,
            })
            .collect())
    }

    async fn commit(&self, group: &str, partition: u32, offset: i64) -> Result<()> {
        self.database
            .commit_offset(group, partition, offset)
            .map_err(|e| Error::BrokerError(e.to_string()))
    }

    async fn lag(&self, group: &str, partition: u32) -> Result<i64> {
        self.database
            .log_lag(group, partition)
            .map_err(|e| Error::BrokerError(e.to_string()))
    }

    async fn wait_for_records(&self, partition: u32, timeout: Duration) {
        if let Some(signal) = self.signals.get(partition as usize) {
            let _ = tokio::time::timeout(timeout, signal.notified()).await;
        } else {
            tokio::time::sleep(timeout).await;
        }
    }

    fn partitions(&self) -> u32 {
        self.signals.len() as u32
    }
}
