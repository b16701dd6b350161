//! Online-status tracker.
//!
//! Updated by the connection manager on register and unregister. A user is
//! online while at least one device class has a live connection.

use std::collections::BTreeMap;

use chrono::Utc;
use dashmap::DashMap;
use reel_core::UserId;
use serde::Serialize;

/// Batch presence answer for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OnlineStatus {
    /// User the status is for
    pub user_id: UserId,
    /// At least one device connected
    pub online: bool,
    /// Device classes with a live connection
    pub devices: Vec<String>,
    /// Last disconnect (ms), if the user was ever seen
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
}

#[derive(Debug, Default)]
struct PresenceRecord {
    /// device class → live connection count
    devices: BTreeMap<String, usize>,
    last_seen: Option<i64>,
}

/// Tracks which users are online, per device class.
#[derive(Default)]
pub struct PresenceTracker {
    records: DashMap<UserId, PresenceRecord>,
}

impl PresenceTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a device connecting.
    pub fn connected(&self, user: UserId, device: &str) {
        let mut record = self.records.entry(user).or_default();
        *record.devices.entry(device.to_string()).or_insert(0) += 1;
    }

    /// Record a device disconnecting; updates last seen.
    pub fn disconnected(&self, user: UserId, device: &str) {
        if let Some(mut record) = self.records.get_mut(&user) {
            if let Some(count) = record.devices.get_mut(device) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    record.devices.remove(device);
                }
            }
            record.last_seen = Some(Utc::now().timestamp_millis());
        }
    }

    /// Whether any device of `user` is connected.
    pub fn is_online(&self, user: UserId) -> bool {
        self.records
            .get(&user)
            .map(|r| !r.devices.is_empty())
            .unwrap_or(false)
    }

    /// Status of one user; unknown users are offline.
    pub fn status(&self, user: UserId) -> OnlineStatus {
        match self.records.get(&user) {
            Some(record) => OnlineStatus {
                user_id: user,
                online: !record.devices.is_empty(),
                devices: record.devices.keys().cloned().collect(),
                last_seen: record.last_seen,
            },
            None => OnlineStatus {
                user_id: user,
                online: false,
                devices: Vec::new(),
                last_seen: None,
            },
        }
    }

    /// Statuses in the order asked.
    pub fn batch(&self, users: &[UserId]) -> Vec<OnlineStatus> {
        users.iter().map(|&u| self.status(u)).collect()
    }

    /// Users with at least one device connected.
    pub fn online_count(&self) -> usize {
        self.records.iter().filter(|r| !r.devices.is_empty()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_online_across_devices() {
        let presence = PresenceTracker::new();
        presence.connected(1, "mobile");
        presence.connected(1, "web");
        presence.connected(1, "web");

        let status = presence.status(1);
        assert!(status.online);
        assert_eq!(status.devices, vec!["mobile".to_string(), "web".to_string()]);

        presence.disconnected(1, "web");
        presence.disconnected(1, "mobile");
        assert!(presence.is_online(1));
        assert_eq!(presence.status(1).devices, vec!["web".to_string()]);

        presence.disconnected(1, "web");
        let status = presence.status(1);
        assert!(!status.online);
        assert!(status.last_seen.is_some());
        assert_eq!(presence.online_count(), 0);
    }

    #[test]
    fn test_batch_keeps_order_and_unknowns() {
        let presence = PresenceTracker::new();
        presence.connected(2, "web");
        let statuses = presence.batch(&[3, 2]);
        assert_eq!(statuses[0].user_id, 3);
        assert!(!statuses[0].online);
        assert!(statuses[0].last_seen.is_none());
        assert!(statuses[1].online);
    }
}
