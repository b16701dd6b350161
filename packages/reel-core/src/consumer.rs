//! # Fan-out Consumer
//!
//! Drains broker partitions, suppresses duplicates and drives the ledger
//! update and push for each event.
//!
//! ## Per-event State Machine
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         EVENT HANDLING                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  received                                                              │
//! │     │ decode ── fails ───────────────────────────────► poisoned        │
//! │     ▼                                                                   │
//! │  claim key (set-if-absent, TTL)                                        │
//! │     │ already claimed ───────────────────────────────► duplicate       │
//! │     ▼                                                                   │
//! │  process: ledger update, then push                                     │
//! │     │ retryable error ─► release claim, backoff, re-claim, retry       │
//! │     │ permanent / exhausted ─► release claim ────────► poisoned        │
//! │     ▼                                                                   │
//! │  processed                                                             │
//! │                                                                         │
//! │  The offset is committed after every outcome above, always after the   │
//! │  side effects. A crash in between means redelivery, which the claim    │
//! │  absorbs.                                                              │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::broker::{Broker, BrokerRecord, FanoutEvent, MessageEvent, RecallEvent};
use crate::claims::ClaimStore;
use crate::directory::{SocialGraph, UserProfile};
use crate::error::{Error, Result};
use crate::ledger::ConversationLedger;
use crate::model::{ConversationType, MessageStatus, UserId};
use crate::push::{Notification, PushOutcome, PushSink, RecallNotice, ReceivedMessage, StatusUpdate};
use crate::storage::Database;
use crate::CoreConfig;

/// Upper bound for one retry backoff
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// What happened to one consumed event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Side effects applied
    Processed,
    /// Already handled by an earlier delivery; skipped
    DuplicateSuppressed,
    /// Could not be processed; logged and skipped
    Poisoned,
}

/// Applies one event's side effects
pub struct FanoutProcessor {
    database: Arc<Database>,
    ledger: Arc<ConversationLedger>,
    graph: Arc<dyn SocialGraph>,
    push: Arc<dyn PushSink>,
    profile_timeout: Duration,
}

impl FanoutProcessor {
    /// Assemble a processor
    pub fn new(
        database: Arc<Database>,
        ledger: Arc<ConversationLedger>,
        graph: Arc<dyn SocialGraph>,
        push: Arc<dyn PushSink>,
        profile_timeout: Duration,
    ) -> Self {
        Self {
            database,
            ledger,
            graph,
            push,
            profile_timeout,
        }
    }

    /// Apply an event
    ///
    /// Only the durable steps can fail. Pushes and status marks after the
    /// ledger update are best-effort, so a retry never double-counts.
    pub async fn process(&self, event: &FanoutEvent) -> Result<()> {
        match event {
            FanoutEvent::Message(e) => self.process_message(e).await,
            FanoutEvent::Recall(e) => self.process_recall(e).await,
        }
    }

    async fn process_message(&self, event: &MessageEvent) -> Result<()> {
        let msg = self
            .database
            .get_message(event.message_id)?
            .ok_or(Error::MessageNotFound)?;

        self.ledger.apply_message(&msg, &event.recipients)?;

        let sender = self.sender_profile(msg.sender_id).await;
        let recipients: Vec<UserId> = match msg.conversation_type {
            ConversationType::Single => vec![msg.receiver_id],
            ConversationType::Group => event
                .recipients
                .iter()
                .copied()
                .filter(|&m| m != msg.sender_id)
                .collect(),
        };

        let payload = ReceivedMessage {
            message: msg.redacted(),
            sender,
        };

        for user in recipients {
            let outcome = self
                .push
                .push(user, Notification::ReceiveMessage(payload.clone()))
                .await;

            if outcome == PushOutcome::Live && msg.conversation_type == ConversationType::Single {
                self.mark_delivered(msg.id, msg.sender_id, user).await;
            }
        }

        Ok(())
    }

    async fn process_recall(&self, event: &RecallEvent) -> Result<()> {
        self.ledger.apply_recall(event.message_id)?;

        let mut participants = match event.conversation_type {
            ConversationType::Single => vec![event.sender_id, event.target_id],
            ConversationType::Group => event.recipients.clone(),
        };
        if !participants.contains(&event.sender_id) {
            participants.push(event.sender_id);
        }

        let notice = RecallNotice {
            message_id: event.message_id,
            sender_id: event.sender_id,
            target_id: event.target_id,
            conversation_type: event.conversation_type,
        };
        for user in participants {
            self.push.push(user, Notification::RecallMessage(notice.clone())).await;
        }

        Ok(())
    }

    async fn mark_delivered(&self, message_id: i64, sender_id: UserId, recipient: UserId) {
        match self.database.advance_status(message_id, MessageStatus::Delivered) {
            Ok(true) => {
                self.push
                    .push(
                        sender_id,
                        Notification::MessageStatus(StatusUpdate {
                            message_id,
                            peer_id: recipient,
                            status: MessageStatus::Delivered,
                        }),
                    )
                    .await;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(message_id, error = %e, "Failed to mark message delivered");
            }
        }
    }

    async fn sender_profile(&self, user: UserId) -> Option<UserProfile> {
        match tokio::time::timeout(self.profile_timeout, self.graph.user_profile(user)).await {
            Ok(Ok(profile)) => profile,
            Ok(Err(e)) => {
                tracing::debug!(user_id = user, error = %e, "Profile lookup failed");
                None
            }
            Err(_) => {
                tracing::debug!(user_id = user, "Profile lookup timed out");
                None
            }
        }
    }
}

/// Sequential consumer over the broker's partitions
pub struct FanoutConsumer {
    broker: Arc<dyn Broker>,
    claims: Arc<dyn ClaimStore>,
    processor: FanoutProcessor,
    config: CoreConfig,
}

impl FanoutConsumer {
    /// Assemble a consumer
    pub fn new(
        broker: Arc<dyn Broker>,
        claims: Arc<dyn ClaimStore>,
        processor: FanoutProcessor,
        config: CoreConfig,
    ) -> Self {
        Self {
            broker,
            claims,
            processor,
            config,
        }
    }

    /// Consume one partition until `shutdown` flips to `true`
    ///
    /// Exits between records without committing unprocessed work. Returns
    /// an error only for fatal conditions.
    pub async fn run_partition(&self, partition: u32, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!(partition, group = %self.config.consumer_group, "Fan-out consumer started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let polled = tokio::select! {
                polled = self.broker.poll(&self.config.consumer_group, partition, self.config.poll_batch) => polled,
                _ = shutdown.changed() => break,
            };

            let records = match polled {
                Ok(records) => records,
                Err(e) => {
                    tracing::warn!(partition, error = %e, "Poll failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown.changed() => break,
                    }
                    continue;
                }
            };

            if records.is_empty() {
                tokio::select! {
                    _ = self.broker.wait_for_records(partition, self.config.poll_interval) => {}
                    _ = shutdown.changed() => break,
                }
                continue;
            }

            for record in &records {
                if *shutdown.borrow() {
                    tracing::info!(partition, offset = record.offset, "Stopping mid-batch, leaving rest uncommitted");
                    return Ok(());
                }
                self.handle_and_commit(record).await?;
            }
        }

        tracing::info!(partition, "Fan-out consumer stopped");
        Ok(())
    }

    /// Process everything currently in `partition`; returns the event count
    pub async fn drain_partition(&self, partition: u32) -> Result<usize> {
        let mut handled = 0;
        loop {
            let records = self
                .broker
                .poll(&self.config.consumer_group, partition, self.config.poll_batch)
                .await?;
            if records.is_empty() {
                return Ok(handled);
            }
            for record in &records {
                self.handle_and_commit(record).await?;
                handled += 1;
            }
        }
    }

    /// Process everything currently in every partition
    pub async fn drain_all(&self) -> Result<usize> {
        let mut handled = 0;
        for partition in 0..self.broker.partitions() {
            handled += self.drain_partition(partition).await?;
        }
        Ok(handled)
    }

    async fn handle_and_commit(&self, record: &BrokerRecord) -> Result<EventOutcome> {
        let outcome = self.handle_record(record).await?;

        if let Err(e) = self
            .broker
            .commit(&self.config.consumer_group, record.partition, record.offset)
            .await
        {
            // Redelivery is absorbed by the claim
            tracing::warn!(partition = record.partition, offset = record.offset, error = %e, "Offset commit failed");
        }

        Ok(outcome)
    }

    /// Run one record through dedup and processing
    ///
    /// Only fatal errors are returned; everything else maps to an outcome.
    pub async fn handle_record(&self, record: &BrokerRecord) -> Result<EventOutcome> {
        let event = match record.event() {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Undecodable fan-out event, skipping"
                );
                return Ok(EventOutcome::Poisoned);
            }
        };

        let key = event.idempotency_key();
        let mut attempt: u32 = 1;

        loop {
            match self.claims.try_claim(&key, self.config.claim_ttl).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(key = %key, offset = record.offset, "Duplicate fan-out event suppressed");
                    return Ok(EventOutcome::DuplicateSuppressed);
                }
                Err(e) if attempt < self.config.max_attempts => {
                    tracing::warn!(key = %key, attempt, error = %e, "Claim failed, retrying");
                    tokio::time::sleep(self.backoff(attempt)).await;
                    attempt += 1;
                    continue;
                }
                Err(e) => {
                    tracing::error!(key = %key, error = %e, "Claim store unavailable, giving up on event");
                    return Ok(EventOutcome::Poisoned);
                }
            }

            match self.processor.process(&event).await {
                Ok(()) => {
                    tracing::debug!(key = %key, message_id = event.message_id(), "Fan-out event processed");
                    return Ok(EventOutcome::Processed);
                }
                Err(e) => {
                    self.release(&key).await;

                    if e.is_fatal() {
                        return Err(e);
                    }
                    if e.is_retryable() && attempt < self.config.max_attempts {
                        tracing::warn!(key = %key, attempt, error = %e, "Fan-out processing failed, retrying");
                        tokio::time::sleep(self.backoff(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    tracing::error!(
                        key = %key,
                        message_id = event.message_id(),
                        attempts = attempt,
                        error = %e,
                        "Fan-out event poisoned, committing anyway"
                    );
                    return Ok(EventOutcome::Poisoned);
                }
            }
        }
    }

    /// Uncommitted events per partition
    pub async fn lag(&self) -> Result<Vec<i64>> {
        let mut lag = Vec::new();
        for partition in 0..self.broker.partitions() {
            lag.push(self.broker.lag(&self.config.consumer_group, partition).await?);
        }
        Ok(lag)
    }

    async fn release(&self, key: &str) {
        if let Err(e) = self.claims.release(key).await {
            tracing::warn!(key = %key, error = %e, "Failed to release claim");
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.retry_base_delay;
        let exp = base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis().max(1) as u64 / 2);
        (exp + Duration::from_millis(jitter_ms)).min(MAX_BACKOFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SqliteBroker;
    use crate::claims::MemoryClaimStore;
    use crate::directory::StaticDirectory;
    use crate::model::{Message, MessageContent, MessageKind};
    use crate::testing::RecordingPush;

    struct Fixture {
        db: Arc<Database>,
        broker: Arc<SqliteBroker>,
        push: Arc<RecordingPush>,
        consumer: FanoutConsumer,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open(None).unwrap());
        let broker = Arc::new(SqliteBroker::new(db.clone(), 2).unwrap());
        let push = Arc::new(RecordingPush::new());
        let dir = Arc::new(StaticDirectory::new().with_profile(1, "ana"));
        let config = CoreConfig {
            retry_base_delay: Duration::from_millis(1),
            ..CoreConfig::default()
        };

        let processor = FanoutProcessor::new(
            db.clone(),
            Arc::new(ConversationLedger::new(db.clone())),
            dir,
            push.clone(),
            config.profile_timeout,
        );
        let consumer = FanoutConsumer::new(broker.clone(), Arc::new(MemoryClaimStore::new()), processor, config);

        Fixture {
            db,
            broker,
            push,
            consumer,
        }
    }

    fn store(db: &Database, id: i64, from: i64, to: i64) -> FanoutEvent {
        let msg = Message {
            id,
            sender_id: from,
            receiver_id: to,
            conversation_type: ConversationType::Single,
            kind: MessageKind::Text,
            content: MessageContent::text("hi"),
            status: MessageStatus::Sent,
            is_recalled: false,
            client_msg_id: format!("c-{}", id),
            created_at: id,
            updated_at: id,
        };
        db.insert_message(&msg).unwrap();
        FanoutEvent::Message(MessageEvent {
            message_id: id,
            sender_id: from,
            target_id: to,
            conversation_type: ConversationType::Single,
            kind: MessageKind::Text,
            content: msg.content.clone(),
            client_msg_id: msg.client_msg_id.clone(),
            created_at: id,
            recipients: vec![],
        })
    }

    fn unread(db: &Database, user: i64, peer: i64) -> i64 {
        let conv = crate::ledger::single_conversation_id(user, peer);
        db.get_member_conversation(&conv, user).unwrap().unwrap().unread_count
    }

    #[tokio::test]
    async fn test_redelivery_counts_once() {
        let f = fixture();
        let event = store(&f.db, 1, 1, 2);

        // Same event published three times
        for _ in 0..3 {
            f.broker.publish(&event).await.unwrap();
        }

        assert_eq!(f.consumer.drain_all().await.unwrap(), 3);
        assert_eq!(unread(&f.db, 2, 1), 1);
        assert_eq!(f.push.received_by(2).len(), 1);
        assert_eq!(f.consumer.lag().await.unwrap().iter().sum::<i64>(), 0);
    }

    #[tokio::test]
    async fn test_live_push_marks_delivered_and_notifies_sender() {
        let f = fixture();
        f.push.set_online(2, true);
        f.broker.publish(&store(&f.db, 1, 1, 2)).await.unwrap();

        f.consumer.drain_all().await.unwrap();

        assert_eq!(f.db.get_message(1).unwrap().unwrap().status, MessageStatus::Delivered);
        let to_sender = f.push.received_by(1);
        assert_eq!(to_sender.len(), 1);
        assert_eq!(to_sender[0].action(), "message_status");

        let to_receiver = f.push.received_by(2);
        assert_eq!(to_receiver[0].data()["sender"]["name"], "ana");
    }

    #[tokio::test]
    async fn test_dropped_push_is_not_delivered() {
        let f = fixture();
        f.push.set_online(2, true);
        f.push.set_full(2);
        f.broker.publish(&store(&f.db, 1, 1, 2)).await.unwrap();

        f.consumer.drain_all().await.unwrap();

        assert_eq!(f.db.get_message(1).unwrap().unwrap().status, MessageStatus::Sent);
        assert!(f.push.received_by(1).is_empty());
        // Ledger still counted it
        assert_eq!(unread(&f.db, 2, 1), 1);
    }

    #[tokio::test]
    async fn test_offline_recipient_stays_sent() {
        let f = fixture();
        f.broker.publish(&store(&f.db, 1, 1, 2)).await.unwrap();
        f.consumer.drain_all().await.unwrap();

        assert_eq!(f.db.get_message(1).unwrap().unwrap().status, MessageStatus::Sent);
        assert!(f.push.received_by(1).is_empty());
    }

    #[tokio::test]
    async fn test_missing_message_is_poisoned_and_committed() {
        let f = fixture();
        let event = store(&f.db, 1, 1, 2);
        let ghost = match event {
            FanoutEvent::Message(mut e) => {
                e.message_id = 999;
                e.client_msg_id = "ghost".into();
                FanoutEvent::Message(e)
            }
            other => other,
        };
        f.broker.publish(&ghost).await.unwrap();

        let partition = crate::broker::partition_for(&ghost.partition_key(), 2);
        let records = f.broker.poll("fanout", partition, 10).await.unwrap();
        assert_eq!(f.consumer.handle_record(&records[0]).await.unwrap(), EventOutcome::Poisoned);

        // Claim was released: a later legitimate delivery is not blocked
        f.consumer.drain_all().await.unwrap();
        assert_eq!(f.consumer.lag().await.unwrap().iter().sum::<i64>(), 0);
    }

    #[tokio::test]
    async fn test_undecodable_record_is_poisoned() {
        let f = fixture();
        let record = BrokerRecord {
            offset: 1,
            partition: 0,
            key: "bad".into(),
            payload: "not json".into(),
        };
        assert_eq!(f.consumer.handle_record(&record).await.unwrap(), EventOutcome::Poisoned);
    }

    #[tokio::test]
    async fn test_recall_event_refreshes_and_notifies() {
        let f = fixture();
        f.broker.publish(&store(&f.db, 1, 1, 2)).await.unwrap();
        f.consumer.drain_all().await.unwrap();

        f.db.set_recalled(1).unwrap();
        f.broker
            .publish(&FanoutEvent::Recall(RecallEvent {
                message_id: 1,
                sender_id: 1,
                target_id: 2,
                conversation_type: ConversationType::Single,
                recipients: vec![],
                recalled_at: 5,
            }))
            .await
            .unwrap();
        f.consumer.drain_all().await.unwrap();

        let conv = crate::ledger::single_conversation_id(1, 2);
        let record = f.db.get_member_conversation(&conv, 2).unwrap().unwrap();
        assert_eq!(record.last_message_summary, crate::model::RECALLED_SUMMARY);
        assert!(f.push.received_by(1).iter().any(|n| n.action() == "recall_message"));
        assert!(f.push.received_by(2).iter().any(|n| n.action() == "recall_message"));
    }

    #[tokio::test]
    async fn test_run_partition_stops_on_shutdown() {
        let f = fixture();
        let (tx, rx) = watch::channel(false);
        let consumer = Arc::new(f.consumer);

        let runner = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.run_partition(0, rx).await })
        };

        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), runner).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let f = fixture();
        let config = CoreConfig::default();
        let consumer = FanoutConsumer::new(
            f.broker.clone(),
            Arc::new(MemoryClaimStore::new()),
            FanoutProcessor::new(
                f.db.clone(),
                Arc::new(ConversationLedger::new(f.db.clone())),
                Arc::new(StaticDirectory::new()),
                f.push.clone(),
                config.profile_timeout,
            ),
            config.clone(),
        );

        let first = consumer.backoff(1);
        assert!(first >= config.retry_base_delay);
        assert!(consumer.backoff(3) >= config.retry_base_delay * 4);
        assert!(consumer.backoff(30) <= MAX_BACKOFF);
    }
}
