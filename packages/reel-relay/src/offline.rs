//! Offline buffer.
//!
//! Frames pushed to a user with no live connection are appended to that
//! user's queue and replayed, oldest first, when they reconnect. Queues are
//! bounded by age, not length.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reel_core::UserId;

use crate::protocol::Frame;

/// A frame waiting for its recipient.
#[derive(Debug, Clone)]
pub struct OfflineEnvelope {
    /// Frame to replay
    pub frame: Frame,
    /// When it was queued; drives TTL expiry
    pub queued_at: DateTime<Utc>,
}

/// Per-user FIFO queues of undelivered frames.
pub struct OfflineBuffer {
    queues: DashMap<UserId, VecDeque<OfflineEnvelope>>,
    ttl_secs: i64,
}

impl OfflineBuffer {
    /// Buffer whose frames expire after `ttl_secs`.
    pub fn new(ttl_secs: i64) -> Self {
        Self {
            queues: DashMap::new(),
            ttl_secs,
        }
    }

    /// Append a frame to `user`'s queue.
    pub fn push(&self, user: UserId, frame: Frame) {
        let mut queue = self.queues.entry(user).or_default();
        queue.push_back(OfflineEnvelope {
            frame,
            queued_at: Utc::now(),
        });
        tracing::debug!(user_id = user, queued = queue.len(), "Queued offline frame");
    }

    /// Unexpired frames for `user` in enqueue order. The queue is left intact.
    pub fn pending(&self, user: UserId) -> Vec<Frame> {
        let now = Utc::now().timestamp();
        self.queues
            .get(&user)
            .map(|queue| {
                queue
                    .iter()
                    .filter(|e| now - e.queued_at.timestamp() < self.ttl_secs)
                    .map(|e| e.frame.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop everything that was queued at or before `until`.
    ///
    /// Called after a drain attempt; frames queued while the drain ran stay.
    pub fn remove_drained(&self, user: UserId, until: DateTime<Utc>) {
        let now_empty = match self.queues.get_mut(&user) {
            Some(mut queue) => {
                while queue.front().is_some_and(|e| e.queued_at <= until) {
                    queue.pop_front();
                }
                queue.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.queues.remove_if(&user, |_, queue| queue.is_empty());
        }
    }

    /// Queued frames for one user.
    pub fn len(&self, user: UserId) -> usize {
        self.queues.get(&user).map(|q| q.len()).unwrap_or(0)
    }

    /// Queued frames across all users.
    pub fn total(&self) -> usize {
        self.queues.iter().map(|entry| entry.value().len()).sum()
    }

    /// Evict frames older than the TTL. Returns how many were evicted.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now().timestamp();
        let mut evicted = 0;

        self.queues.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|e| now - e.queued_at.timestamp() < self.ttl_secs);
            evicted += before - queue.len();
            !queue.is_empty()
        });

        if evicted > 0 {
            tracing::info!(evicted, "Evicted expired offline frames");
        }
        evicted
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Action;

    fn frame(n: i64) -> Frame {
        Frame::new(Action::ReceiveMessage, serde_json::json!({ "id": n }))
    }

    #[test]
    fn test_pending_preserves_order() {
        let buffer = OfflineBuffer::new(3600);
        for n in 1..=3 {
            buffer.push(7, frame(n));
        }
        let ids: Vec<i64> = buffer
            .pending(7)
            .iter()
            .map(|f| f.data["id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(buffer.len(7), 3);
        assert_eq!(buffer.pending(8).len(), 0);
    }

    #[test]
    fn test_remove_drained_keeps_later_frames() {
        let buffer = OfflineBuffer::new(3600);
        buffer.push(7, frame(1));
        buffer.push(7, frame(2));
        let cutoff = Utc::now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        buffer.push(7, frame(3));

        buffer.remove_drained(7, cutoff);
        let left = buffer.pending(7);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].data["id"], 3);

        buffer.remove_drained(7, Utc::now());
        assert_eq!(buffer.len(7), 0);
        assert_eq!(buffer.total(), 0);
    }

    #[test]
    fn test_expired_frames_are_hidden_and_evicted() {
        let buffer = OfflineBuffer::new(0);
        buffer.push(7, frame(1));
        buffer.push(8, frame(2));
        assert!(buffer.pending(7).is_empty());
        assert_eq!(buffer.cleanup_expired(), 2);
        assert_eq!(buffer.total(), 0);
    }
}
