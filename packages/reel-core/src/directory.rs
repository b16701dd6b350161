//! # Directory
//!
//! Narrow interface to the friend, group and profile services, plus the
//! permission gate built on top of it.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SEND AUTHORIZATION                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  single:  friend_status(sender, target) == Accepted                     │
//! │  group:   is_group_member(target_group, sender)                         │
//! │                                                                         │
//! │  Pending, blocked or unknown relations are refused. A collaborator      │
//! │  failure surfaces as CollaboratorError, never as a silent "allowed".    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::model::{ConversationType, UserId};

/// Relation between two users as reported by the friend service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FriendStatus {
    /// No relation
    None,
    /// Request sent, not yet accepted
    Pending,
    /// Friends
    Accepted,
    /// One side blocked the other
    Blocked,
}

/// Display data for a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    /// Display name
    pub name: String,
    /// Avatar URL
    #[serde(default)]
    pub avatar: Option<String>,
}

/// Friend, group and profile lookups consumed by the messaging core.
#[async_trait]
pub trait SocialGraph: Send + Sync {
    /// Relation between `a` and `b`
    async fn friend_status(&self, a: UserId, b: UserId) -> Result<FriendStatus>;

    /// Whether `user` currently belongs to `group_id`
    async fn is_group_member(&self, group_id: i64, user: UserId) -> Result<bool>;

    /// Current members of `group_id`
    async fn group_members(&self, group_id: i64) -> Result<Vec<UserId>>;

    /// Display data for `user`, if known
    async fn user_profile(&self, user: UserId) -> Result<Option<UserProfile>>;
}

/// Answers "may this sender message this target?"
#[derive(Clone)]
pub struct PermissionGate {
    graph: Arc<dyn SocialGraph>,
}

impl PermissionGate {
    /// Create a gate over a social graph
    pub fn new(graph: Arc<dyn SocialGraph>) -> Self {
        Self { graph }
    }

    /// Whether `sender` may send to `target`
    pub async fn is_authorized_to_message(
        &self,
        sender: UserId,
        target: i64,
        conversation_type: ConversationType,
    ) -> Result<bool> {
        match conversation_type {
            ConversationType::Single => {
                let status = self.graph.friend_status(sender, target).await?;
                Ok(status == FriendStatus::Accepted)
            }
            ConversationType::Group => self.graph.is_group_member(target, sender).await,
        }
    }

    /// The underlying graph
    pub fn graph(&self) -> &Arc<dyn SocialGraph> {
        &self.graph
    }
}

/// Seed file for [`StaticDirectory`]
///
/// ```json
/// {
///   "friends": [[1, 2]],
///   "pending": [[1, 3]],
///   "blocked": [[4, 1]],
///   "groups": { "500": [1, 2, 3] },
///   "profiles": { "1": { "name": "ana", "avatar": null } }
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectorySeed {
    /// Accepted friend pairs
    #[serde(default)]
    pub friends: Vec<(UserId, UserId)>,
    /// Pending friend pairs
    #[serde(default)]
    pub pending: Vec<(UserId, UserId)>,
    /// (blocker, blocked) pairs
    #[serde(default)]
    pub blocked: Vec<(UserId, UserId)>,
    /// Group id to member list
    #[serde(default)]
    pub groups: HashMap<i64, Vec<UserId>>,
    /// User id to profile
    #[serde(default)]
    pub profiles: HashMap<UserId, UserProfile>,
}

#[derive(Default)]
struct DirectoryState {
    friends: HashSet<(UserId, UserId)>,
    pending: HashSet<(UserId, UserId)>,
    blocked: HashSet<(UserId, UserId)>,
    groups: HashMap<i64, Vec<UserId>>,
    profiles: HashMap<UserId, UserProfile>,
}

fn pair(a: UserId, b: UserId) -> (UserId, UserId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// In-memory social graph, for local runs and tests.
#[derive(Default)]
pub struct StaticDirectory {
    state: RwLock<DirectoryState>,
}

impl StaticDirectory {
    /// Empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a parsed seed
    pub fn from_seed(seed: DirectorySeed) -> Self {
        let dir = Self::new();
        {
            let mut state = dir.state.write();
            state.friends = seed.friends.into_iter().map(|(a, b)| pair(a, b)).collect();
            state.pending = seed.pending.into_iter().map(|(a, b)| pair(a, b)).collect();
            state.blocked = seed.blocked.into_iter().collect();
            state.groups = seed.groups;
            state.profiles = seed.profiles;
        }
        dir
    }

    /// Load a JSON seed file
    pub fn from_json_file(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfig(format!("Failed to read directory seed {}: {}", path, e)))?;
        let seed: DirectorySeed = serde_json::from_str(&raw)?;
        Ok(Self::from_seed(seed))
    }

    /// Make `a` and `b` friends
    pub fn with_friends(self, a: UserId, b: UserId) -> Self {
        self.state.write().friends.insert(pair(a, b));
        self
    }

    /// Register a group and its members
    pub fn with_group(self, group_id: i64, members: &[UserId]) -> Self {
        self.state.write().groups.insert(group_id, members.to_vec());
        self
    }

    /// Register a profile
    pub fn with_profile(self, user: UserId, name: &str) -> Self {
        self.state.write().profiles.insert(
            user,
            UserProfile {
                name: name.to_string(),
                avatar: None,
            },
        );
        self
    }

    /// `blocker` blocks `blocked`
    pub fn block(&self, blocker: UserId, blocked: UserId) {
        self.state.write().blocked.insert((blocker, blocked));
    }

    /// Remove a member from a group
    pub fn leave_group(&self, group_id: i64, user: UserId) {
        if let Some(members) = self.state.write().groups.get_mut(&group_id) {
            members.retain(|&m| m != user);
        }
    }
}

#[async_trait]
impl SocialGraph for StaticDirectory {
    async fn friend_status(&self, a: UserId, b: UserId) -> Result<FriendStatus> {
        let state = self.state.read();
        if state.blocked.contains(&(a, b)) || state.blocked.contains(&(b, a)) {
            return Ok(FriendStatus::Blocked);
        }
        let key = pair(a, b);
        if state.friends.contains(&key) {
            Ok(FriendStatus::Accepted)
        } else if state.pending.contains(&key) {
            Ok(FriendStatus::Pending)
        } else {
            Ok(FriendStatus::None)
        }
    }

    async fn is_group_member(&self, group_id: i64, user: UserId) -> Result<bool> {
        Ok(self
            .state
            .read()
            .groups
            .get(&group_id)
            .map(|members| members.contains(&user))
            .unwrap_or(false))
    }

    async fn group_members(&self, group_id: i64) -> Result<Vec<UserId>> {
        Ok(self.state.read().groups.get(&group_id).cloned().unwrap_or_default())
    }

    async fn user_profile(&self, user: UserId) -> Result<Option<UserProfile>> {
        Ok(self.state.read().profiles.get(&user).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(dir: StaticDirectory) -> PermissionGate {
        PermissionGate::new(Arc::new(dir))
    }

    #[tokio::test]
    async fn test_single_requires_accepted_friendship() {
        let dir = StaticDirectory::new().with_friends(1, 2);
        dir.block(3, 1);
        let gate = gate(dir);

        assert!(gate.is_authorized_to_message(1, 2, ConversationType::Single).await.unwrap());
        assert!(gate.is_authorized_to_message(2, 1, ConversationType::Single).await.unwrap());
        assert!(!gate.is_authorized_to_message(1, 3, ConversationType::Single).await.unwrap());
        assert!(!gate.is_authorized_to_message(1, 9, ConversationType::Single).await.unwrap());
    }

    #[tokio::test]
    async fn test_block_overrides_friendship() {
        let dir = StaticDirectory::new().with_friends(1, 2);
        dir.block(2, 1);
        assert_eq!(dir.friend_status(1, 2).await.unwrap(), FriendStatus::Blocked);
    }

    #[tokio::test]
    async fn test_group_requires_membership() {
        let dir = Arc::new(StaticDirectory::new().with_group(500, &[1, 2]));
        let gate = PermissionGate::new(dir.clone());

        assert!(gate.is_authorized_to_message(1, 500, ConversationType::Group).await.unwrap());
        assert!(!gate.is_authorized_to_message(3, 500, ConversationType::Group).await.unwrap());

        dir.leave_group(500, 1);
        assert!(!gate.is_authorized_to_message(1, 500, ConversationType::Group).await.unwrap());
    }

    #[tokio::test]
    async fn test_seed_parsing() {
        let raw = r#"{
            "friends": [[1, 2]],
            "pending": [[1, 3]],
            "groups": { "500": [1, 2, 3] },
            "profiles": { "1": { "name": "ana" } }
        }"#;
        let seed: DirectorySeed = serde_json::from_str(raw).unwrap();
        let dir = StaticDirectory::from_seed(seed);

        assert_eq!(dir.friend_status(2, 1).await.unwrap(), FriendStatus::Accepted);
        assert_eq!(dir.friend_status(3, 1).await.unwrap(), FriendStatus::Pending);
        assert_eq!(dir.group_members(500).await.unwrap(), vec![1, 2, 3]);
        assert_eq!(dir.user_profile(1).await.unwrap().unwrap().name, "ana");
        assert!(dir.user_profile(2).await.unwrap().is_none());
    }

    #[test]
    fn test_seed_file_loading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed.json");
        std::fs::write(&path, r#"{"friends": [[4, 5]]}"#).unwrap();

        assert!(StaticDirectory::from_json_file(path.to_str().unwrap()).is_ok());
        assert!(StaticDirectory::from_json_file("/nonexistent/seed.json").is_err());
    }
}
