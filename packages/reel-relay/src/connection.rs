//! Connection manager.
//!
//! One task owns the registry of live connections and serves three inputs:
//! register, unregister and broadcast. Everything else talks to it over a
//! channel. Presence checks read a snapshot kept behind a short lock.
//!
//! ```text
//!   session ──register──►┌──────────────────────┐──try_send──► conn outbound (256)
//!   session ─unregister─►│  registry owner task │
//!   push ────broadcast──►└──────────┬───────────┘
//!                                   │ user not registered
//!                                   ▼
//!                             OfflineBuffer ──(first register, throttled)──► new connection
//! ```
//!
//! A user has at most one drain in flight. Drained frames go only to the
//! connection whose registration started the drain, so each queued frame is
//! handed out once even when several devices connect together.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reel_core::{PushOutcome, UserId};
use tokio::sync::{mpsc, oneshot};
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::offline::OfflineBuffer;
use crate::presence::PresenceTracker;
use crate::protocol::Frame;

/// Capacity of each connection's outbound channel.
pub const OUTBOUND_CAPACITY: usize = 256;

/// Outbound side of one live connection.
pub type FrameSender = mpsc::Sender<Frame>;

struct Connection {
    id: Uuid,
    device: String,
    outbound: FrameSender,
}

enum Command {
    Register {
        user: UserId,
        connection: Connection,
    },
    Unregister {
        user: UserId,
        id: Uuid,
    },
    Broadcast {
        user: UserId,
        frame: Frame,
        ack: Option<oneshot::Sender<PushOutcome>>,
    },
    DeliverTo {
        user: UserId,
        id: Uuid,
        frame: Frame,
    },
    DrainFinished {
        user: UserId,
    },
}

/// Handle to the registry owner task.
#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    online: Arc<RwLock<HashMap<UserId, usize>>>,
}

impl ConnectionManager {
    /// Start the owner task.
    pub fn spawn(offline: Arc<OfflineBuffer>, presence: Arc<PresenceTracker>, drain_delay: Duration) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let manager = Self {
            commands,
            online: Arc::new(RwLock::new(HashMap::new())),
        };

        let owner = Owner {
            registry: HashMap::new(),
            online: manager.online.clone(),
            offline,
            presence,
            draining: HashSet::new(),
            drain_delay,
            handle: manager.clone(),
        };
        tokio::spawn(owner.run(rx));

        manager
    }

    /// Add a connection. Returns its id, used to unregister it.
    pub fn register(&self, user: UserId, device: &str, outbound: FrameSender) -> Uuid {
        let id = Uuid::new_v4();
        let connection = Connection {
            id,
            device: device.to_string(),
            outbound,
        };
        if self.commands.send(Command::Register { user, connection }).is_err() {
            tracing::error!(user_id = user, "Connection manager stopped, register lost");
        }
        id
    }

    /// Remove a connection; unknown ids are ignored.
    pub fn unregister(&self, user: UserId, id: Uuid) {
        let _ = self.commands.send(Command::Unregister { user, id });
    }

    /// Queue a frame for every connection of `user`, or for the offline
    /// buffer if there is none. Never blocks.
    pub fn broadcast_to_user(&self, user: UserId, frame: Frame) {
        if self.commands.send(Command::Broadcast { user, frame, ack: None }).is_err() {
            tracing::error!(user_id = user, "Connection manager stopped, frame lost");
        }
    }

    /// Broadcast one frame to each of `users`.
    pub fn broadcast_to_users(&self, users: &[UserId], frame: &Frame) {
        for &user in users {
            self.broadcast_to_user(user, frame.clone());
        }
    }

    /// Like [`broadcast_to_user`](Self::broadcast_to_user), but reports what
    /// the owner did with the frame.
    ///
    /// `Live` means at least one outbound channel accepted it. Waits only for
    /// the owner task, never for a socket.
    pub async fn deliver(&self, user: UserId, frame: Frame) -> PushOutcome {
        let (ack, outcome) = oneshot::channel();
        if self
            .commands
            .send(Command::Broadcast {
                user,
                frame,
                ack: Some(ack),
            })
            .is_err()
        {
            tracing::error!(user_id = user, "Connection manager stopped, frame lost");
            return PushOutcome::Dropped;
        }
        outcome.await.unwrap_or(PushOutcome::Dropped)
    }

    fn deliver_to(&self, user: UserId, id: Uuid, frame: Frame) {
        let _ = self.commands.send(Command::DeliverTo { user, id, frame });
    }

    fn drain_finished(&self, user: UserId) {
        let _ = self.commands.send(Command::DrainFinished { user });
    }

    /// Whether `user` had a live connection when last registered/unregistered.
    pub fn is_online(&self, user: UserId) -> bool {
        self.online.read().contains_key(&user)
    }

    /// Users with at least one live connection.
    pub fn online_users(&self) -> usize {
        self.online.read().len()
    }

    /// Live connections across all users.
    pub fn connection_count(&self) -> usize {
        self.online.read().values().sum()
    }
}

struct Owner {
    registry: HashMap<UserId, Vec<Connection>>,
    online: Arc<RwLock<HashMap<UserId, usize>>>,
    offline: Arc<OfflineBuffer>,
    presence: Arc<PresenceTracker>,
    draining: HashSet<UserId>,
    drain_delay: Duration,
    handle: ConnectionManager,
}

impl Owner {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Register { user, connection } => self.register(user, connection),
                Command::Unregister { user, id } => self.unregister(user, id),
                Command::Broadcast { user, frame, ack } => {
                    let outcome = self.broadcast(user, frame);
                    if let Some(ack) = ack {
                        let _ = ack.send(outcome);
                    }
                }
                Command::DeliverTo { user, id, frame } => self.deliver_to(user, id, frame),
                Command::DrainFinished { user } => {
                    self.draining.remove(&user);
                }
            }
        }
    }

    fn register(&mut self, user: UserId, connection: Connection) {
        tracing::info!(user_id = user, device = %connection.device, connection = %connection.id, "Connection registered");
        self.presence.connected(user, &connection.device);

        let id = connection.id;
        let connections = self.registry.entry(user).or_default();
        connections.push(connection);
        self.online.write().insert(user, connections.len());

        if self.draining.contains(&user) {
            return;
        }
        let cutoff = Utc::now();
        let pending = self.offline.pending(user);
        if !pending.is_empty() {
            self.draining.insert(user);
            tokio::spawn(drain_offline(
                self.handle.clone(),
                self.offline.clone(),
                user,
                id,
                pending,
                cutoff,
                self.drain_delay,
            ));
        }
    }

    fn unregister(&mut self, user: UserId, id: Uuid) {
        let Some(connections) = self.registry.get_mut(&user) else {
            return;
        };
        let Some(pos) = connections.iter().position(|c| c.id == id) else {
            return;
        };

        let connection = connections.remove(pos);
        self.presence.disconnected(user, &connection.device);
        tracing::info!(user_id = user, device = %connection.device, connection = %id, "Connection unregistered");

        if connections.is_empty() {
            self.registry.remove(&user);
            self.online.write().remove(&user);
        } else {
            self.online.write().insert(user, connections.len());
        }
    }

    fn broadcast(&mut self, user: UserId, frame: Frame) -> PushOutcome {
        let Some(connections) = self.registry.get(&user) else {
            self.offline.push(user, frame);
            return PushOutcome::Queued;
        };

        let mut accepted = false;
        for connection in connections {
            accepted |= try_queue(user, connection, frame.clone());
        }

        if accepted {
            PushOutcome::Live
        } else {
            PushOutcome::Dropped
        }
    }

    fn deliver_to(&mut self, user: UserId, id: Uuid, frame: Frame) {
        let connection = self
            .registry
            .get(&user)
            .and_then(|connections| connections.iter().find(|c| c.id == id));

        match connection {
            Some(connection) => {
                try_queue(user, connection, frame);
            }
            None => {
                tracing::debug!(user_id = user, connection = %id, "Drain target gone, frame discarded");
            }
        }
    }
}

fn try_queue(user: UserId, connection: &Connection, frame: Frame) -> bool {
    let action = frame.action;
    match connection.outbound.try_send(frame) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            tracing::warn!(
                user_id = user,
                connection = %connection.id,
                action = ?action,
                "Outbound buffer full, dropping frame"
            );
            false
        }
        Err(TrySendError::Closed(_)) => {
            tracing::debug!(user_id = user, connection = %connection.id, "Outbound channel closed");
            false
        }
    }
}

/// Replay queued frames to the connection `target`, one per `delay`.
///
/// Frames are removed from the buffer only after the attempt; a frame that
/// was sent but not received is not replayed again.
async fn drain_offline(
    manager: ConnectionManager,
    offline: Arc<OfflineBuffer>,
    user: UserId,
    target: Uuid,
    frames: Vec<Frame>,
    cutoff: DateTime<Utc>,
    delay: Duration,
) {
    let count = frames.len();
    tracing::info!(user_id = user, connection = %target, count, "Draining offline frames");

    for frame in frames {
        manager.deliver_to(user, target, frame);
        tokio::time::sleep(delay).await;
    }

    offline.remove_drained(user, cutoff);
    manager.drain_finished(user);
    tracing::debug!(user_id = user, count, "Offline drain finished");
}

// ── Tests ─────────────────────────────────────────────────────────────────────
