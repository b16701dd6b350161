//! # Reel Core
//!
//! Messaging core for the Reel short-video platform: one-to-one and group
//! chat with a durable message log, per-user conversation ledger and
//! at-least-once fan-out to recipients.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         REEL CORE MODULES                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────┐     ┌─────────────┐     ┌─────────────────────────┐   │
//! │  │  Service    │────►│  Pipeline   │────►│  Broker (partitioned)   │   │
//! │  │             │     │             │     │                         │   │
//! │  │ - Send      │     │ - Validate  │     │ - SQLite log            │   │
//! │  │ - History   │     │ - Dedup     │     │ - Per-group offsets     │   │
//! │  │ - Recall    │     │ - Authorize │     └────────────┬────────────┘   │
//! │  │ - Read      │     │ - Persist   │                  │                │
//! │  └──────┬──────┘     └──────┬──────┘                  ▼                │
//! │         │                   │              ┌─────────────────────────┐ │
//! │         │                   │              │  Consumer               │ │
//! │         │                   │              │                         │ │
//! │         ▼                   ▼              │ - Claim (idempotency)   │ │
//! │  ┌─────────────┐     ┌─────────────┐       │ - Ledger update         │ │
//! │  │  Ledger     │◄────│  Storage    │◄──────│ - Push + delivered      │ │
//! │  │             │     │  (SQLite)   │       └────────────┬────────────┘ │
//! │  │ - Unread    │     └─────────────┘                    │              │
//! │  │ - Pin/Mute  │                                        ▼              │
//! │  │ - Delete    │     ┌─────────────┐            ┌───────────────┐      │
//! │  └─────────────┘     │  Directory  │            │   PushSink    │      │
//! │                      │ (friends,   │            │  (the relay)  │      │
//! │                      │  groups)    │            └───────────────┘      │
//! │                      └─────────────┘                                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the entire library
//! - [`ids`] - Time-ordered 64-bit message ids
//! - [`model`] - Messages, content and statuses
//! - [`storage`] - SQLite schema and queries
//! - [`ledger`] - Per-user conversation state
//! - [`directory`] - Friendship and group membership lookups
//! - [`broker`] - Durable partitioned fan-out log
//! - [`claims`] - Idempotency claims for duplicate suppression
//! - [`push`] - Notifications and the sink they go to
//! - [`pipeline`] - The send path
//! - [`consumer`] - Fan-out processing
//! - [`service`] - Facade used by transports

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod broker;
pub mod claims;
pub mod consumer;
pub mod directory;
pub mod error;
pub mod ids;
pub mod ledger;
pub mod model;
pub mod pipeline;
pub mod push;
pub mod service;
pub mod storage;
/// Wall-clock helpers.
pub mod time;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use broker::{Broker, FanoutEvent, SqliteBroker};
pub use claims::{ClaimStore, MemoryClaimStore, SqliteClaimStore};
pub use consumer::{EventOutcome, FanoutConsumer};
pub use directory::{FriendStatus, PermissionGate, SocialGraph, StaticDirectory, UserProfile};
pub use error::{Error, Result};
pub use ids::IdGenerator;
pub use model::{ConversationType, Message, MessageContent, MessageKind, MessageStatus, UserId};
pub use pipeline::{SendCommand, SendOutcome, SendReceipt};
pub use push::{Notification, PushOutcome, PushSink};
pub use service::MessagingService;

// ============================================================================
// CONFIGURATION
// ============================================================================

use std::time::Duration;

/// Tunables for the messaging core
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Longest accepted text body, in characters
    pub max_text_chars: usize,
    /// How long after sending a message may still be recalled
    pub recall_window: Duration,
    /// Upper bound for history page sizes
    pub max_page_size: usize,
    /// Lifetime of an idempotency claim
    pub claim_ttl: Duration,
    /// Consumer group the fan-out consumers commit offsets under
    pub consumer_group: String,
    /// Attempts per event before it is dropped as poisoned
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt
    pub retry_base_delay: Duration,
    /// Records fetched per poll
    pub poll_batch: usize,
    /// Longest idle wait between polls
    pub poll_interval: Duration,
    /// Budget for the sender profile lookup on delivery
    pub profile_timeout: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_text_chars: 5000,
            recall_window: Duration::from_secs(120),
            max_page_size: 100,
            claim_ttl: Duration::from_secs(24 * 60 * 60),
            consumer_group: "fanout".to_string(),
            max_attempts: 5,
            retry_base_delay: Duration::from_millis(200),
            poll_batch: 64,
            poll_interval: Duration::from_secs(1),
            profile_timeout: Duration::from_millis(300),
        }
    }
}

// ============================================================================
// TEST SUPPORT
// ============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use crate::broker::{Broker, BrokerRecord, FanoutEvent, SqliteBroker};
    use crate::error::{Error, Result};
    use crate::model::UserId;
    use crate::push::{Notification, PushOutcome, PushSink};

    /// Push sink that records everything; users are offline unless set online
    #[derive(Default)]
    pub struct RecordingPush {
        sent: Mutex<Vec<(UserId, Notification)>>,
        online: Mutex<HashSet<UserId>>,
        full: Mutex<HashSet<UserId>>,
    }

    impl RecordingPush {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_online(&self, user: UserId, online: bool) {
            let mut set = self.online.lock();
            if online {
                set.insert(user);
            } else {
                set.remove(&user);
            }
        }

        /// Online, but every push is refused
        pub fn set_full(&self, user: UserId) {
            self.full.lock().insert(user);
        }

        pub fn received_by(&self, user: UserId) -> Vec<Notification> {
            self.sent
                .lock()
                .iter()
                .filter(|(to, _)| *to == user)
                .map(|(_, n)| n.clone())
                .collect()
        }
    }

    #[async_trait]
    impl PushSink for RecordingPush {
        async fn push(&self, user: UserId, notification: Notification) -> PushOutcome {
            self.sent.lock().push((user, notification));
            if self.full.lock().contains(&user) {
                PushOutcome::Dropped
            } else if self.online.lock().contains(&user) {
                PushOutcome::Live
            } else {
                PushOutcome::Queued
            }
        }
    }

    /// Broker whose publishes can be switched to fail
    pub struct FlakyBroker {
        inner: SqliteBroker,
        failing: AtomicBool,
    }

    impl FlakyBroker {
        pub fn new(inner: SqliteBroker) -> Self {
            Self {
                inner,
                failing: AtomicBool::new(false),
            }
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Broker for FlakyBroker {
        async fn publish(&self, event: &FanoutEvent) -> Result<i64> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::BrokerError("broker unavailable".into()));
            }
            self.inner.publish(event).await
        }

        async fn poll(&self, group: &str, partition: u32, max: usize) -> Result<Vec<BrokerRecord>> {
            self.inner.poll(group, partition, max).await
        }

        async fn commit(&self, group: &str, partition: u32, offset: i64) -> Result<()> {
            self.inner.commit(group, partition, offset).await
        }

        async fn lag(&self, group: &str, partition: u32) -> Result<i64> {
            self.inner.lag(group, partition).await
        }

        async fn wait_for_records(&self, partition: u32, timeout: Duration) {
            self.inner.wait_for_records(partition, timeout).await
        }

        fn partitions(&self) -> u32 {
            self.inner.partitions()
        }
    }
}
