//! Core notifications → live frames.

use async_trait::async_trait;
use reel_core::{Notification, PushOutcome, PushSink, UserId};

use crate::connection::ConnectionManager;
use crate::protocol::Frame;

/// Hands core notifications to the connection manager.
///
/// The outcome is what the owner task did with the frame: accepted by a
/// live connection, queued offline, or dropped on full buffers.
pub struct RelayPush {
    connections: ConnectionManager,
}

impl RelayPush {
    /// Push through `connections`.
    pub fn new(connections: ConnectionManager) -> Self {
        Self { connections }
    }
}

#[async_trait]
impl PushSink for RelayPush {
    async fn push(&self, user: UserId, notification: Notification) -> PushOutcome {
        self.connections
            .deliver(user, Frame::from_notification(&notification))
            .await
    }
}
