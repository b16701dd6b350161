//! # Database
//!
//! SQLite wrapper for messages, conversation state, the fan-out log and
//! idempotency claims.
//!
//! ## Database Operations
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      DATABASE OPERATIONS                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────┐          │
//! │  │  Send Pipeline  │  │ Ledger/Consumer │  │ Broker / Claims │          │
//! │  └────────┬────────┘  └────────┬────────┘  └────────┬────────┘          │
//! │           │                    │                    │                   │
//! │           ▼                    ▼                    ▼                   │
//! │  ┌─────────────────────────────────────────────────────────┐            │
//! │  │    Database (this file)                                 │            │
//! │  │    - Message storage, status and recall flags           │            │
//! │  │    - Per-member conversation state (one transaction     │            │
//! │  │      per fan-out)                                       │            │
//! │  │    - Partitioned log + committed offsets                │            │
//! │  │    - Set-if-absent claims with expiry                   │            │
//! │  └────────┬────────────────────────────────────────────────┘            │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  ┌─────────────────┐                                                    │
//! │  │   SQLite DB     │  - In-memory for tests                             │
//! │  │                 │  - File for production                             │
//! │  └─────────────────┘                                                    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use std::sync::Arc;

use super::schema;
use crate::error::{Error, Result};
use crate::model::{ConversationType, Message, MessageContent, MessageId, MessageKind, MessageStatus, UserId};

const MESSAGE_COLUMNS: &str = "id, sender_id, receiver_id, conversation_type, kind, content, \
     status, is_recalled, client_msg_id, created_at, updated_at";

const MEMBER_VIEW_COLUMNS: &str = "m.conversation_id, c.conversation_type, m.user_id, m.peer_id, \
     c.last_message_id, c.last_message_summary, c.last_message_kind, c.last_message_time, \
     m.unread_count, m.last_read_message_id, m.cleared_before_id, \
     m.is_pinned, m.is_muted, m.is_deleted, m.join_time, m.updated_at";

/// The main database handle
///
/// Wraps a single SQLite connection. Every public method takes the lock for
/// its whole duration, so multi-statement updates are atomic.
pub struct Database {
    /// The underlying SQLite connection
    conn: Arc<Mutex<Connection>>,
}

/// A member's view of one conversation (joined with conversation metadata)
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRecord {
    /// Conversation id
    pub conversation_id: String,
    /// Single or group
    pub conversation_type: ConversationType,
    /// Owning user
    pub user_id: UserId,
    /// Peer user id (single) or group id (group)
    pub peer_id: i64,
    /// Id of the newest message applied to the conversation (0 if none)
    pub last_message_id: MessageId,
    /// Preview of the newest message
    pub last_message_summary: String,
    /// Kind of the newest message
    pub last_message_kind: Option<MessageKind>,
    /// Timestamp (ms) of the newest message
    pub last_message_time: i64,
    /// Unread messages for this member
    pub unread_count: i64,
    /// Highest message id the member has read
    pub last_read_message_id: MessageId,
    /// History up to and including this id is hidden from the member
    pub cleared_before_id: MessageId,
    /// Pinned to the top of the list
    pub is_pinned: bool,
    /// Notifications muted
    pub is_muted: bool,
    /// Soft-deleted from the member's list
    pub is_deleted: bool,
    /// When the member record was created (ms)
    pub join_time: i64,
    /// Last change to the member record (ms)
    pub updated_at: i64,
}

/// One member touched by a fan-out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberTouch {
    /// Conversation the member record belongs to
    pub conversation_id: String,
    /// Member
    pub user_id: UserId,
    /// Peer user id (single) or group id (group)
    pub peer_id: i64,
    /// Whether the message counts as unread for this member
    pub counts_as_unread: bool,
}

/// The message being applied as a conversation's newest activity
#[derive(Debug, Clone, PartialEq)]
pub struct LastMessage {
    /// Message id
    pub id: MessageId,
    /// Single or group
    pub conversation_type: ConversationType,
    /// Target id stored on the conversation row
    pub target_id: i64,
    /// Preview text
    pub summary: String,
    /// Message kind
    pub kind: MessageKind,
    /// Message creation time (ms)
    pub time: i64,
}

/// A fan-out event that could not be published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFanoutRecord {
    /// Idempotency key of the event
    pub event_key: String,
    /// Message the event belongs to
    pub message_id: MessageId,
    /// Serialized event
    pub payload: String,
    /// Republish attempts so far
    pub attempts: i64,
    /// When it was recorded (ms)
    pub created_at: i64,
}

/// A record in the partitioned fan-out log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Position in the log (monotonic across partitions)
    pub offset: i64,
    /// Partition
    pub partition: u32,
    /// Idempotency key of the event
    pub event_key: String,
    /// Serialized event
    pub payload: String,
    /// When it was appended (ms)
    pub published_at: i64,
}

impl Database {
    /// Open or create a database
    ///
    /// If path is None, creates an in-memory database (useful for testing).
    pub fn open(path: Option<&str>) -> Result<Self> {
        let conn = match path {
            Some(p) => Connection::open(p)
                .map_err(|e| Error::DatabaseError(format!("Failed to open database: {}", e)))?,
            None => Connection::open_in_memory()
                .map_err(|e| Error::DatabaseError(format!("Failed to create in-memory database: {}", e)))?,
        };

        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| Error::DatabaseError(format!("Failed to enable foreign keys: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        Ok(db)
    }

    /// Initialize the database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        let table_exists: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n > 0)
            .map_err(|e| Error::DatabaseError(format!("Failed to inspect schema: {}", e)))?;

        let version: Option<i32> = if table_exists {
            conn.query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
                .ok()
        } else {
            None
        };

        match version {
            None => {
                conn.execute_batch(schema::CREATE_TABLES)
                    .map_err(|e| Error::DatabaseError(format!("Failed to create tables: {}", e)))?;

                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    params![schema::SCHEMA_VERSION],
                )
                .map_err(|e| Error::DatabaseError(format!("Failed to set schema version: {}", e)))?;

                tracing::info!("Database schema created (version {})", schema::SCHEMA_VERSION);
            }
            Some(v) if v > schema::SCHEMA_VERSION => {
                return Err(Error::DatabaseError(format!(
                    "Database schema version {} is newer than supported {}",
                    v,
                    schema::SCHEMA_VERSION
                )));
            }
            Some(v) => {
                tracing::debug!("Database schema is at version {}", v);
            }
        }

        Ok(())
    }

    // ========================================================================
    // MESSAGE OPERATIONS
    // ========================================================================

    /// Persist a message
    ///
    /// Returns `false` without touching the row if the sender already has a
    /// message with the same `client_msg_id`.
    pub fn insert_message(&self, msg: &Message) -> Result<bool> {
        let conn = self.conn.lock();
        insert_message_row(&conn, msg)
    }

    /// Persist a message together with its outstanding fan-out event
    ///
    /// Both rows commit in one transaction, so a crash after this call
    /// leaves the event for the republisher rather than losing it. Returns
    /// `false`, and writes nothing, if the client id was already used.
    pub fn insert_message_with_fanout(&self, msg: &Message, event_key: &str, payload: &str) -> Result<bool> {
        let mut conn = self.conn.lock();
        let now = crate::time::now_timestamp_millis();

        let tx = conn
            .transaction()
            .map_err(|e| Error::DatabaseError(format!("Failed to begin transaction: {}", e)))?;

        if !insert_message_row(&tx, msg)? {
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO pending_fanout (event_key, message_id, payload, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(event_key) DO NOTHING",
            params![event_key, msg.id, payload, now],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to save pending fan-out: {}", e)))?;

        tx.commit()
            .map_err(|e| Error::DatabaseError(format!("Failed to commit message: {}", e)))?;

        Ok(true)
    }

    /// Get a single message by id
    pub fn get_message(&self, id: MessageId) -> Result<Option<Message>> {
        let conn = self.conn.lock();

        let result = conn.query_row(
            &format!("SELECT {} FROM messages WHERE id = ?", MESSAGE_COLUMNS),
            params![id],
            message_from_row,
        );

        match result {
            Ok(msg) => Ok(Some(msg)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::DatabaseError(format!("Failed to get message: {}", e))),
        }
    }

    /// Find a sender's message by its client-supplied id
    pub fn find_by_client_msg_id(&self, sender_id: UserId, client_msg_id: &str) -> Result<Option<Message>> {
        let conn = self.conn.lock();

        let result = conn.query_row(
            &format!(
                "SELECT {} FROM messages WHERE sender_id = ? AND client_msg_id = ?",
                MESSAGE_COLUMNS
            ),
            params![sender_id, client_msg_id],
            message_from_row,
        );

        match result {
            Ok(msg) => Ok(Some(msg)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::DatabaseError(format!("Failed to find message: {}", e))),
        }
    }

    /// Page through a conversation's history, newest first
    ///
    /// Returns messages with `after_id < id < before_id`. For single chats
    /// `a` and `b` are the two participants; for groups `a` is ignored and
    /// `b` is the group id.
    pub fn list_messages(
        &self,
        conversation_type: ConversationType,
        a: i64,
        b: i64,
        before_id: Option<MessageId>,
        after_id: MessageId,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        let before = before_id.unwrap_or(i64::MAX);

        let (sql, args): (String, Vec<i64>) = match conversation_type {
            ConversationType::Single => (
                format!(
                    "SELECT {} FROM messages
                     WHERE conversation_type = 'single'
                       AND ((sender_id = ?1 AND receiver_id = ?2) OR (sender_id = ?2 AND receiver_id = ?1))
                       AND id < ?3 AND id > ?4
                     ORDER BY id DESC LIMIT ?5",
                    MESSAGE_COLUMNS
                ),
                vec![a, b, before, after_id, limit as i64],
            ),
            ConversationType::Group => (
                format!(
                    "SELECT {} FROM messages
                     WHERE conversation_type = 'group' AND receiver_id = ?1
                       AND id < ?2 AND id > ?3
                     ORDER BY id DESC LIMIT ?4",
                    MESSAGE_COLUMNS
                ),
                vec![b, before, after_id, limit as i64],
            ),
        };

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(rusqlite::params_from_iter(args), message_from_row)
            .map_err(|e| Error::DatabaseError(format!("Failed to query messages: {}", e)))?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row.map_err(|e| Error::DatabaseError(format!("Failed to read message: {}", e)))?);
        }

        Ok(messages)
    }

    /// Move a message's status forward
    ///
    /// Returns `false` if the message already has `status` or a later one.
    pub fn advance_status(&self, id: MessageId, status: MessageStatus) -> Result<bool> {
        let conn = self.conn.lock();
        let now = crate::time::now_timestamp_millis();

        let rows = conn
            .execute(
                "UPDATE messages SET status = ?, updated_at = ? WHERE id = ? AND status < ?",
                params![status.code(), now, id, status.code()],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to update status: {}", e)))?;

        Ok(rows > 0)
    }

    /// Flag a message as recalled
    ///
    /// Returns `false` if it was already recalled.
    pub fn set_recalled(&self, id: MessageId) -> Result<bool> {
        let conn = self.conn.lock();
        let now = crate::time::now_timestamp_millis();

        let rows = conn
            .execute(
                "UPDATE messages SET is_recalled = 1, updated_at = ? WHERE id = ? AND is_recalled = 0",
                params![now, id],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to recall message: {}", e)))?;

        Ok(rows > 0)
    }

    // ========================================================================
    // CONVERSATION OPERATIONS
    // ========================================================================

    /// Apply one message to every touched member record in a single transaction
    ///
    /// Conversation rows are created on first use. The last-message fields
    /// only move forward (by message id). A member's unread count grows only
    /// when the message is newer than what the member has already read, and
    /// a touched member record is revived if it had been soft-deleted.
    pub fn apply_message(&self, last: &LastMessage, members: &[MemberTouch]) -> Result<()> {
        let mut conn = self.conn.lock();
        let now = crate::time::now_timestamp_millis();

        let tx = conn
            .transaction()
            .map_err(|e| Error::DatabaseError(format!("Failed to begin transaction: {}", e)))?;

        for member in members {
            tx.execute(
                "INSERT INTO conversations (id, conversation_type, target_id, created_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(id) DO NOTHING",
                params![member.conversation_id, last.conversation_type.as_str(), last.target_id, now],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to create conversation: {}", e)))?;

            tx.execute(
                "UPDATE conversations
                 SET last_message_id = ?1, last_message_summary = ?2, last_message_kind = ?3,
                     last_message_time = ?4
                 WHERE id = ?5 AND last_message_id <= ?1",
                params![last.id, last.summary, last.kind.as_str(), last.time, member.conversation_id],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to update conversation: {}", e)))?;

            tx.execute(
                "INSERT INTO conversation_members
                 (conversation_id, user_id, peer_id, unread_count, join_time, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(conversation_id, user_id) DO UPDATE SET
                     unread_count = conversation_members.unread_count
                         + CASE WHEN ?6 > conversation_members.last_read_message_id
                                THEN excluded.unread_count ELSE 0 END,
                     is_deleted = 0,
                     updated_at = excluded.updated_at",
                params![
                    member.conversation_id,
                    member.user_id,
                    member.peer_id,
                    member.counts_as_unread as i64,
                    now,
                    last.id,
                ],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to update member: {}", e)))?;
        }

        tx.commit()
            .map_err(|e| Error::DatabaseError(format!("Failed to commit fan-out: {}", e)))?;

        Ok(())
    }

    /// Replace the preview of every conversation whose newest message is `message_id`
    pub fn refresh_last_summary(&self, message_id: MessageId, summary: &str) -> Result<usize> {
        let conn = self.conn.lock();

        let rows = conn
            .execute(
                "UPDATE conversations SET last_message_summary = ? WHERE last_message_id = ?",
                params![summary, message_id],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to refresh summary: {}", e)))?;

        Ok(rows)
    }

    /// Mark a single chat read for `user_id` up to `up_to`
    ///
    /// Marks the peer's messages with `id <= up_to` as read, resets the
    /// member's unread count and advances the last-read pointer (never
    /// backwards). Returns the number of messages whose status changed.
    pub fn mark_single_read(
        &self,
        conversation_id: &str,
        user_id: UserId,
        peer_id: UserId,
        up_to: MessageId,
    ) -> Result<usize> {
        let mut conn = self.conn.lock();
        let now = crate::time::now_timestamp_millis();

        let tx = conn
            .transaction()
            .map_err(|e| Error::DatabaseError(format!("Failed to begin transaction: {}", e)))?;

        let changed = tx
            .execute(
                "UPDATE messages SET status = ?1, updated_at = ?2
                 WHERE conversation_type = 'single' AND sender_id = ?3 AND receiver_id = ?4
                   AND id <= ?5 AND status < ?1",
                params![MessageStatus::Read.code(), now, peer_id, user_id, up_to],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to mark messages read: {}", e)))?;

        tx.execute(
            "UPDATE conversation_members
             SET unread_count = 0,
                 last_read_message_id = MAX(last_read_message_id, ?1),
                 updated_at = ?2
             WHERE conversation_id = ?3 AND user_id = ?4",
            params![up_to, now, conversation_id, user_id],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to reset unread count: {}", e)))?;

        tx.commit()
            .map_err(|e| Error::DatabaseError(format!("Failed to commit read mark: {}", e)))?;

        Ok(changed)
    }

    /// Get one member's view of a conversation
    pub fn get_member_conversation(&self, conversation_id: &str, user_id: UserId) -> Result<Option<ConversationRecord>> {
        let conn = self.conn.lock();

        let result = conn.query_row(
            &format!(
                "SELECT {} FROM conversation_members m
                 JOIN conversations c ON c.id = m.conversation_id
                 WHERE m.conversation_id = ? AND m.user_id = ?",
                MEMBER_VIEW_COLUMNS
            ),
            params![conversation_id, user_id],
            conversation_from_row,
        );

        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::DatabaseError(format!("Failed to get conversation: {}", e))),
        }
    }

    /// List a member's visible conversations: pinned first, then most recent
    pub fn list_member_conversations(&self, user_id: UserId, limit: usize, offset: usize) -> Result<Vec<ConversationRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM conversation_members m
                 JOIN conversations c ON c.id = m.conversation_id
                 WHERE m.user_id = ? AND m.is_deleted = 0
                 ORDER BY m.is_pinned DESC, c.last_message_time DESC, c.last_message_id DESC
                 LIMIT ? OFFSET ?",
                MEMBER_VIEW_COLUMNS
            ))
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(
                params![user_id, sql_count(limit), sql_count(offset)],
                conversation_from_row,
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to query conversations: {}", e)))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(|e| Error::DatabaseError(format!("Failed to read conversation: {}", e)))?);
        }

        Ok(records)
    }

    /// Count a member's visible conversations
    pub fn count_member_conversations(&self, user_id: UserId) -> Result<i64> {
        let conn = self.conn.lock();

        conn.query_row(
            "SELECT COUNT(*) FROM conversation_members WHERE user_id = ? AND is_deleted = 0",
            params![user_id],
            |row| row.get(0),
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to count conversations: {}", e)))
    }

    /// Soft-delete a conversation for one member
    ///
    /// Also resets the member's unread count and moves the read pointer to
    /// the conversation's newest message.
    pub fn delete_member_conversation(&self, conversation_id: &str, user_id: UserId) -> Result<bool> {
        self.update_member(
            "UPDATE conversation_members
             SET is_deleted = 1, unread_count = 0,
                 last_read_message_id = MAX(last_read_message_id,
                     (SELECT last_message_id FROM conversations WHERE id = ?1)),
                 updated_at = ?3
             WHERE conversation_id = ?1 AND user_id = ?2",
            conversation_id,
            user_id,
            "delete conversation",
        )
    }

    /// Hide a member's history up to the conversation's newest message
    pub fn clear_member_history(&self, conversation_id: &str, user_id: UserId) -> Result<bool> {
        self.update_member(
            "UPDATE conversation_members
             SET cleared_before_id = (SELECT last_message_id FROM conversations WHERE id = ?1),
                 last_read_message_id = MAX(last_read_message_id,
                     (SELECT last_message_id FROM conversations WHERE id = ?1)),
                 unread_count = 0,
                 updated_at = ?3
             WHERE conversation_id = ?1 AND user_id = ?2",
            conversation_id,
            user_id,
            "clear history",
        )
    }

    /// Pin or unpin a conversation for one member
    pub fn set_member_pinned(&self, conversation_id: &str, user_id: UserId, pinned: bool) -> Result<bool> {
        let conn = self.conn.lock();
        let now = crate::time::now_timestamp_millis();

        let rows = conn
            .execute(
                "UPDATE conversation_members SET is_pinned = ?, updated_at = ?
                 WHERE conversation_id = ? AND user_id = ?",
                params![pinned, now, conversation_id, user_id],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to set pinned: {}", e)))?;

        Ok(rows > 0)
    }

    /// Mute or unmute a conversation for one member
    pub fn set_member_muted(&self, conversation_id: &str, user_id: UserId, muted: bool) -> Result<bool> {
        let conn = self.conn.lock();
        let now = crate::time::now_timestamp_millis();

        let rows = conn
            .execute(
                "UPDATE conversation_members SET is_muted = ?, updated_at = ?
                 WHERE conversation_id = ? AND user_id = ?",
                params![muted, now, conversation_id, user_id],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to set muted: {}", e)))?;

        Ok(rows > 0)
    }

    fn update_member(&self, sql: &str, conversation_id: &str, user_id: UserId, what: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let now = crate::time::now_timestamp_millis();

        let rows = conn
            .execute(sql, params![conversation_id, user_id, now])
            .map_err(|e| Error::DatabaseError(format!("Failed to {}: {}", what, e)))?;

        Ok(rows > 0)
    }

    // ========================================================================
    // PENDING FAN-OUT OPERATIONS
    // ========================================================================

    /// Record a fan-out event whose publish failed
    pub fn save_pending_fanout(&self, event_key: &str, message_id: MessageId, payload: &str) -> Result<()> {
        let conn = self.conn.lock();
        let now = crate::time::now_timestamp_millis();

        conn.execute(
            "INSERT INTO pending_fanout (event_key, message_id, payload, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(event_key) DO NOTHING",
            params![event_key, message_id, payload, now],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to save pending fan-out: {}", e)))?;

        Ok(())
    }

    /// Look up one pending fan-out event
    pub fn get_pending_fanout(&self, event_key: &str) -> Result<Option<PendingFanoutRecord>> {
        let conn = self.conn.lock();

        let result = conn.query_row(
            "SELECT event_key, message_id, payload, attempts, created_at
             FROM pending_fanout WHERE event_key = ?",
            params![event_key],
            pending_from_row,
        );

        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::DatabaseError(format!("Failed to get pending fan-out: {}", e))),
        }
    }

    /// Oldest pending fan-out events first
    pub fn list_pending_fanout(&self, limit: usize) -> Result<Vec<PendingFanoutRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT event_key, message_id, payload, attempts, created_at
                 FROM pending_fanout ORDER BY created_at ASC, message_id ASC LIMIT ?",
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params![limit as i64], pending_from_row)
            .map_err(|e| Error::DatabaseError(format!("Failed to query pending fan-out: {}", e)))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(|e| Error::DatabaseError(format!("Failed to read pending fan-out: {}", e)))?);
        }

        Ok(records)
    }

    /// Drop a pending fan-out event once it has been published
    pub fn remove_pending_fanout(&self, event_key: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute("DELETE FROM pending_fanout WHERE event_key = ?", params![event_key])
            .map_err(|e| Error::DatabaseError(format!("Failed to remove pending fan-out: {}", e)))?;
        Ok(rows > 0)
    }

    /// Count a failed republish attempt
    pub fn bump_pending_attempts(&self, event_key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE pending_fanout SET attempts = attempts + 1 WHERE event_key = ?",
            params![event_key],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to update pending fan-out: {}", e)))?;
        Ok(())
    }

    /// Number of events waiting for republish
    pub fn count_pending_fanout(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM pending_fanout", [], |row| row.get(0))
            .map_err(|e| Error::DatabaseError(format!("Failed to count pending fan-out: {}", e)))
    }

    // ========================================================================
    // IDEMPOTENCY CLAIMS
    // ========================================================================

    /// Set-if-absent: claim `key` until `expires_at` (ms)
    ///
    /// An expired claim on the same key is replaced.
    pub fn try_claim(&self, key: &str, now: i64, expires_at: i64) -> Result<bool> {
        let mut conn = self.conn.lock();

        let tx = conn
            .transaction()
            .map_err(|e| Error::DatabaseError(format!("Failed to begin transaction: {}", e)))?;

        tx.execute(
            "DELETE FROM idempotency_claims WHERE claim_key = ? AND expires_at <= ?",
            params![key, now],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to expire claim: {}", e)))?;

        let rows = tx
            .execute(
                "INSERT OR IGNORE INTO idempotency_claims (claim_key, expires_at) VALUES (?, ?)",
                params![key, expires_at],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to claim key: {}", e)))?;

        tx.commit()
            .map_err(|e| Error::DatabaseError(format!("Failed to commit claim: {}", e)))?;

        Ok(rows > 0)
    }

    /// Release a claim so a retry can take it
    pub fn release_claim(&self, key: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute("DELETE FROM idempotency_claims WHERE claim_key = ?", params![key])
            .map_err(|e| Error::DatabaseError(format!("Failed to release claim: {}", e)))?;
        Ok(rows > 0)
    }

    /// Delete claims that expired at or before `now` (ms)
    pub fn purge_expired_claims(&self, now: i64) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM idempotency_claims WHERE expires_at <= ?", params![now])
            .map_err(|e| Error::DatabaseError(format!("Failed to purge claims: {}", e)))
    }

    // ========================================================================
    // FAN-OUT LOG
    // ========================================================================

    /// Append a record to a partition, returning its offset
    pub fn append_log(&self, partition: u32, event_key: &str, payload: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let now = crate::time::now_timestamp_millis();

        conn.execute(
            "INSERT INTO broker_log (partition_id, event_key, payload, published_at) VALUES (?, ?, ?, ?)",
            params![partition, event_key, payload, now],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to append to log: {}", e)))?;

        Ok(conn.last_insert_rowid())
    }

    /// Records in `partition` after `after_offset`, oldest first
    pub fn read_log(&self, partition: u32, after_offset: i64, limit: usize) -> Result<Vec<LogRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT log_offset, partition_id, event_key, payload, published_at
                 FROM broker_log WHERE partition_id = ? AND log_offset > ?
                 ORDER BY log_offset ASC LIMIT ?",
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params![partition, after_offset, limit as i64], |row| {
                Ok(LogRecord {
                    offset: row.get(0)?,
                    partition: row.get(1)?,
                    event_key: row.get(2)?,
                    payload: row.get(3)?,
                    published_at: row.get(4)?,
                })
            })
            .map_err(|e| Error::DatabaseError(format!("Failed to query log: {}", e)))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(|e| Error::DatabaseError(format!("Failed to read log: {}", e)))?);
        }

        Ok(records)
    }

    /// Committed offset of a consumer group on a partition (0 if none)
    pub fn committed_offset(&self, group: &str, partition: u32) -> Result<i64> {
        let conn = self.conn.lock();

        let result = conn.query_row(
            "SELECT committed FROM broker_offsets WHERE consumer_group = ? AND partition_id = ?",
            params![group, partition],
            |row| row.get(0),
        );

        match result {
            Ok(offset) => Ok(offset),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
            Err(e) => Err(Error::DatabaseError(format!("Failed to read offset: {}", e))),
        }
    }

    /// Commit an offset; a lower offset than the stored one is ignored
    pub fn commit_offset(&self, group: &str, partition: u32, offset: i64) -> Result<()> {
        let conn = self.conn.lock();
        let now = crate::time::now_timestamp_millis();

        conn.execute(
            "INSERT INTO broker_offsets (consumer_group, partition_id, committed, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(consumer_group, partition_id) DO UPDATE SET
                 committed = MAX(broker_offsets.committed, excluded.committed),
                 updated_at = excluded.updated_at",
            params![group, partition, offset, now],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to commit offset: {}", e)))?;

        Ok(())
    }

    /// Records in `partition` not yet committed by `group`
    pub fn log_lag(&self, group: &str, partition: u32) -> Result<i64> {
        let committed = self.committed_offset(group, partition)?;
        let conn = self.conn.lock();

        conn.query_row(
            "SELECT COUNT(*) FROM broker_log WHERE partition_id = ? AND log_offset > ?",
            params![partition, committed],
            |row| row.get(0),
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to compute lag: {}", e)))
    }
}

/// SQLite integers are signed; anything larger saturates
fn sql_count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn pending_from_row(row: &Row<'_>) -> rusqlite::Result<PendingFanoutRecord> {
    Ok(PendingFanoutRecord {
        event_key: row.get(0)?,
        message_id: row.get(1)?,
        payload: row.get(2)?,
        attempts: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn insert_message_row(conn: &Connection, msg: &Message) -> Result<bool> {
    let content = serde_json::to_string(&msg.content)?;

    let rows = conn
        .execute(
            "INSERT OR IGNORE INTO messages
             (id, sender_id, receiver_id, conversation_type, kind, content, status, is_recalled,
              client_msg_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                msg.id,
                msg.sender_id,
                msg.receiver_id,
                msg.conversation_type.as_str(),
                msg.kind.as_str(),
                content,
                msg.status.code(),
                msg.is_recalled,
                msg.client_msg_id,
                msg.created_at,
                msg.updated_at,
            ],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to store message: {}", e)))?;

    Ok(rows > 0)
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let conversation_type: String = row.get(3)?;
    let kind: String = row.get(4)?;
    let content: String = row.get(5)?;
    let status: i64 = row.get(6)?;

    Ok(Message {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        receiver_id: row.get(2)?,
        conversation_type: ConversationType::parse(&conversation_type)
            .ok_or_else(|| invalid_column(3, "conversation_type", &conversation_type))?,
        kind: MessageKind::parse(&kind).ok_or_else(|| invalid_column(4, "kind", &kind))?,
        content: serde_json::from_str::<MessageContent>(&content)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?,
        status: MessageStatus::from_code(status).ok_or_else(|| invalid_column(6, "status", &status.to_string()))?,
        is_recalled: row.get(7)?,
        client_msg_id: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationRecord> {
    let conversation_type: String = row.get(1)?;
    let last_kind: Option<String> = row.get(6)?;

    Ok(ConversationRecord {
        conversation_id: row.get(0)?,
        conversation_type: ConversationType::parse(&conversation_type)
            .ok_or_else(|| invalid_column(1, "conversation_type", &conversation_type))?,
        user_id: row.get(2)?,
        peer_id: row.get(3)?,
        last_message_id: row.get(4)?,
        last_message_summary: row.get(5)?,
        last_message_kind: last_kind.as_deref().and_then(MessageKind::parse),
        last_message_time: row.get(7)?,
        unread_count: row.get(8)?,
        last_read_message_id: row.get(9)?,
        cleared_before_id: row.get(10)?,
        is_pinned: row.get(11)?,
        is_muted: row.get(12)?,
        is_deleted: row.get(13)?,
        join_time: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

fn invalid_column(idx: usize, column: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(idx, format!("{}={}", column, value), Type::Text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_message(id: i64, from: i64, to: i64, client_msg_id: &str) -> Message {
        Message {
            id,
            sender_id: from,
            receiver_id: to,
            conversation_type: ConversationType::Single,
            kind: MessageKind::Text,
            content: MessageContent::text(format!("message {}", id)),
            status: MessageStatus::Sent,
            is_recalled: false,
            client_msg_id: client_msg_id.to_string(),
            created_at: id,
            updated_at: id,
        }
    }

    fn touch(conversation_id: &str, user_id: i64, peer_id: i64, unread: bool) -> MemberTouch {
        MemberTouch {
            conversation_id: conversation_id.to_string(),
            user_id,
            peer_id,
            counts_as_unread: unread,
        }
    }

    fn last(id: i64) -> LastMessage {
        LastMessage {
            id,
            conversation_type: ConversationType::Single,
            target_id: 1,
            summary: format!("message {}", id),
            kind: MessageKind::Text,
            time: id,
        }
    }

    #[test]
    fn test_database_creation() {
        let db = Database::open(None).unwrap();
        assert!(db.get_message(1).unwrap().is_none());
    }

    #[test]
    fn test_reopen_file_database_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reel.db");
        let path = path.to_str().unwrap();

        {
            let db = Database::open(Some(path)).unwrap();
            db.insert_message(&text_message(10, 1, 2, "c-10")).unwrap();
        }

        let db = Database::open(Some(path)).unwrap();
        assert_eq!(db.get_message(10).unwrap().unwrap().client_msg_id, "c-10");
    }

    #[test]
    fn test_insert_is_idempotent_per_client_msg_id() {
        let db = Database::open(None).unwrap();
        assert!(db.insert_message(&text_message(10, 1, 2, "c-1")).unwrap());
        assert!(!db.insert_message(&text_message(11, 1, 2, "c-1")).unwrap());
        // Same client id from another sender is a different message
        assert!(db.insert_message(&text_message(12, 3, 2, "c-1")).unwrap());

        let found = db.find_by_client_msg_id(1, "c-1").unwrap().unwrap();
        assert_eq!(found.id, 10);
        assert!(db.get_message(11).unwrap().is_none());
    }

    #[test]
    fn test_keyset_pagination() {
        let db = Database::open(None).unwrap();
        for id in 1..=5 {
            let (from, to) = if id % 2 == 0 { (1, 2) } else { (2, 1) };
            db.insert_message(&text_message(id, from, to, &format!("c-{}", id))).unwrap();
        }
        // Unrelated chat
        db.insert_message(&text_message(6, 1, 3, "c-6")).unwrap();

        let page = db.list_messages(ConversationType::Single, 1, 2, None, 0, 3).unwrap();
        assert_eq!(page.iter().map(|m| m.id).collect::<Vec<_>>(), vec![5, 4, 3]);

        let page = db.list_messages(ConversationType::Single, 2, 1, Some(3), 0, 3).unwrap();
        assert_eq!(page.iter().map(|m| m.id).collect::<Vec<_>>(), vec![2, 1]);

        let page = db.list_messages(ConversationType::Single, 1, 2, None, 3, 10).unwrap();
        assert_eq!(page.iter().map(|m| m.id).collect::<Vec<_>>(), vec![5, 4]);
    }

    #[test]
    fn test_status_never_regresses() {
        let db = Database::open(None).unwrap();
        db.insert_message(&text_message(1, 1, 2, "c-1")).unwrap();

        assert!(db.advance_status(1, MessageStatus::Read).unwrap());
        assert!(!db.advance_status(1, MessageStatus::Delivered).unwrap());
        assert_eq!(db.get_message(1).unwrap().unwrap().status, MessageStatus::Read);
    }

    #[test]
    fn test_recall_flag_set_once() {
        let db = Database::open(None).unwrap();
        db.insert_message(&text_message(1, 1, 2, "c-1")).unwrap();
        assert!(db.set_recalled(1).unwrap());
        assert!(!db.set_recalled(1).unwrap());
        assert!(db.get_message(1).unwrap().unwrap().is_recalled);
    }

    #[test]
    fn test_apply_message_counts_unread_and_revives() {
        let db = Database::open(None).unwrap();

        for id in 1..=3 {
            db.apply_message(&last(id), &[touch("conv", 1, 2, false), touch("conv", 2, 1, true)])
                .unwrap();
        }

        let receiver = db.get_member_conversation("conv", 2).unwrap().unwrap();
        assert_eq!(receiver.unread_count, 3);
        assert_eq!(receiver.last_message_id, 3);
        let sender = db.get_member_conversation("conv", 1).unwrap().unwrap();
        assert_eq!(sender.unread_count, 0);

        assert!(db.delete_member_conversation("conv", 2).unwrap());
        assert!(db.list_member_conversations(2, 10, 0).unwrap().is_empty());

        db.apply_message(&last(4), &[touch("conv", 1, 2, false), touch("conv", 2, 1, true)])
            .unwrap();
        let revived = db.list_member_conversations(2, 10, 0).unwrap();
        assert_eq!(revived.len(), 1);
        assert_eq!(revived[0].unread_count, 1);
    }

    #[test]
    fn test_last_message_only_moves_forward() {
        let db = Database::open(None).unwrap();
        db.apply_message(&last(5), &[touch("conv", 1, 2, false)]).unwrap();
        db.apply_message(&last(3), &[touch("conv", 1, 2, false)]).unwrap();

        let record = db.get_member_conversation("conv", 1).unwrap().unwrap();
        assert_eq!(record.last_message_id, 5);
        assert_eq!(record.last_message_summary, "message 5");
    }

    #[test]
    fn test_mark_single_read() {
        let db = Database::open(None).unwrap();
        for id in 1..=3 {
            db.insert_message(&text_message(id, 1, 2, &format!("c-{}", id))).unwrap();
            db.apply_message(&last(id), &[touch("conv", 1, 2, false), touch("conv", 2, 1, true)])
                .unwrap();
        }

        let changed = db.mark_single_read("conv", 2, 1, 3).unwrap();
        assert_eq!(changed, 3);

        let record = db.get_member_conversation("conv", 2).unwrap().unwrap();
        assert_eq!(record.unread_count, 0);
        assert_eq!(record.last_read_message_id, 3);

        // Older pointer never moves the read position back
        db.mark_single_read("conv", 2, 1, 1).unwrap();
        let record = db.get_member_conversation("conv", 2).unwrap().unwrap();
        assert_eq!(record.last_read_message_id, 3);

        // A late replay of an already-read message does not count again
        db.apply_message(&last(2), &[touch("conv", 2, 1, true)]).unwrap();
        assert_eq!(db.get_member_conversation("conv", 2).unwrap().unwrap().unread_count, 0);
    }

    #[test]
    fn test_clear_history_is_single_sided() {
        let db = Database::open(None).unwrap();
        db.apply_message(&last(7), &[touch("conv", 1, 2, false), touch("conv", 2, 1, true)])
            .unwrap();

        assert!(db.clear_member_history("conv", 2).unwrap());

        let cleared = db.get_member_conversation("conv", 2).unwrap().unwrap();
        assert_eq!(cleared.cleared_before_id, 7);
        assert_eq!(cleared.unread_count, 0);
        let other = db.get_member_conversation("conv", 1).unwrap().unwrap();
        assert_eq!(other.cleared_before_id, 0);
    }

    #[test]
    fn test_pinned_sorts_first() {
        let db = Database::open(None).unwrap();
        db.apply_message(&last(1), &[touch("old", 1, 2, false)]).unwrap();
        db.apply_message(&last(2), &[touch("new", 1, 3, false)]).unwrap();

        let list = db.list_member_conversations(1, 10, 0).unwrap();
        assert_eq!(list[0].conversation_id, "new");

        db.set_member_pinned("old", 1, true).unwrap();
        let list = db.list_member_conversations(1, 10, 0).unwrap();
        assert_eq!(list[0].conversation_id, "old");
        assert!(list[0].is_pinned);
        assert_eq!(db.count_member_conversations(1).unwrap(), 2);
    }

    #[test]
    fn test_claims_set_if_absent_with_expiry() {
        let db = Database::open(None).unwrap();
        assert!(db.try_claim("k", 100, 200).unwrap());
        assert!(!db.try_claim("k", 150, 250).unwrap());

        // Expired claim is replaced
        assert!(db.try_claim("k", 200, 300).unwrap());

        assert!(db.release_claim("k").unwrap());
        assert!(db.try_claim("k", 210, 310).unwrap());

        assert_eq!(db.purge_expired_claims(400).unwrap(), 1);
    }

    #[test]
    fn test_log_offsets_and_lag() {
        let db = Database::open(None).unwrap();
        let first = db.append_log(0, "a", "{}").unwrap();
        let second = db.append_log(0, "b", "{}").unwrap();
        db.append_log(1, "c", "{}").unwrap();

        let records = db.read_log(0, 0, 10).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].offset, first);
        assert_eq!(db.log_lag("g", 0).unwrap(), 2);

        db.commit_offset("g", 0, second).unwrap();
        db.commit_offset("g", 0, first).unwrap();
        assert_eq!(db.committed_offset("g", 0).unwrap(), second);
        assert_eq!(db.log_lag("g", 0).unwrap(), 0);
        assert!(db.read_log(0, second, 10).unwrap().is_empty());
    }

    #[test]
    fn test_pending_fanout_lifecycle() {
        let db = Database::open(None).unwrap();
        db.save_pending_fanout("c-1", 1, "{}").unwrap();
        db.save_pending_fanout("c-1", 1, "{}").unwrap();
        assert_eq!(db.count_pending_fanout().unwrap(), 1);

        db.bump_pending_attempts("c-1").unwrap();
        assert_eq!(db.list_pending_fanout(10).unwrap()[0].attempts, 1);

        assert!(db.remove_pending_fanout("c-1").unwrap());
        assert_eq!(db.count_pending_fanout().unwrap(), 0);
    }

    #[test]
    fn test_message_and_fanout_commit_together() {
        let db = Database::open(None).unwrap();
        assert!(db
            .insert_message_with_fanout(&text_message(1, 1, 2, "c-1"), "msg:1:c-1", "{}")
            .unwrap());
        assert!(db.get_message(1).unwrap().is_some());
        let pending = db.get_pending_fanout("msg:1:c-1").unwrap().unwrap();
        assert_eq!(pending.message_id, 1);

        // A reused client id writes neither row
        assert!(!db
            .insert_message_with_fanout(&text_message(2, 1, 2, "c-1"), "msg:1:c-1-other", "{}")
            .unwrap());
        assert!(db.get_message(2).unwrap().is_none());
        assert!(db.get_pending_fanout("msg:1:c-1-other").unwrap().is_none());
        assert_eq!(db.count_pending_fanout().unwrap(), 1);
    }
}
