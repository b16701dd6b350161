//! # Database Schema
//!
//! SQL schema definitions for the messaging database.
//!
//! ## Schema Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         DATABASE SCHEMA                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────┐    ┌─────────────────┐    ┌──────────────────────┐ │
//! │  │    messages     │    │  conversations  │    │ conversation_members │ │
//! │  ├─────────────────┤    ├─────────────────┤    ├──────────────────────┤ │
//! │  │ id (snowflake)  │    │ id              │◄───│ conversation_id      │ │
//! │  │ sender_id       │    │ conv_type       │    │ user_id              │ │
//! │  │ receiver_id     │    │ target_id       │    │ peer_id              │ │
//! │  │ conv_type       │    │ last_message_*  │    │ unread_count         │ │
//! │  │ kind, content   │    └─────────────────┘    │ last_read_message_id │ │
//! │  │ status          │                           │ cleared_before_id    │ │
//! │  │ is_recalled     │                           │ pinned/muted/deleted │ │
//! │  │ client_msg_id   │                           └──────────────────────┘ │
//! │  └─────────────────┘                                                    │
//! │                                                                         │
//! │  ┌─────────────────┐    ┌─────────────────┐    ┌──────────────────────┐ │
//! │  │  broker_log     │    │ broker_offsets  │    │ idempotency_claims   │ │
//! │  ├─────────────────┤    ├─────────────────┤    ├──────────────────────┤ │
//! │  │ log_offset      │    │ consumer_group  │    │ claim_key            │ │
//! │  │ partition_id    │    │ partition_id    │    │ expires_at           │ │
//! │  │ event_key       │    │ committed       │    └──────────────────────┘ │
//! │  │ payload         │    └─────────────────┘                             │
//! │  └─────────────────┘                           ┌──────────────────────┐ │
//! │                                                │   pending_fanout     │ │
//! │                                                ├──────────────────────┤ │
//! │                                                │ event_key, payload   │ │
//! │                                                └──────────────────────┘ │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL to create all tables
pub const CREATE_TABLES: &str = r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);

-- Messages table
-- One row per logical send; never physically deleted
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY,
    sender_id INTEGER NOT NULL,
    -- Peer user id (single) or group id (group)
    receiver_id INTEGER NOT NULL,
    -- 'single' or 'group'
    conversation_type TEXT NOT NULL,
    kind TEXT NOT NULL,
    -- Kind-specific payload (JSON)
    content TEXT NOT NULL,
    -- 1 = sent, 2 = delivered, 3 = read
    status INTEGER NOT NULL DEFAULT 1,
    is_recalled INTEGER NOT NULL DEFAULT 0,
    client_msg_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE(sender_id, client_msg_id)
);
CREATE INDEX IF NOT EXISTS idx_messages_pair ON messages(sender_id, receiver_id, conversation_type, id);
CREATE INDEX IF NOT EXISTS idx_messages_receiver ON messages(receiver_id, conversation_type, id);

-- Conversations table
-- Shared row for a single chat, one row per member for group chats
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    conversation_type TEXT NOT NULL,
    -- Group id for groups, lower user id for single chats
    target_id INTEGER NOT NULL,
    last_message_id INTEGER NOT NULL DEFAULT 0,
    last_message_summary TEXT NOT NULL DEFAULT '',
    last_message_kind TEXT,
    last_message_time INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

-- Per-user conversation state
CREATE TABLE IF NOT EXISTS conversation_members (
    conversation_id TEXT NOT NULL,
    user_id INTEGER NOT NULL,
    -- The other user (single) or the group id (group)
    peer_id INTEGER NOT NULL,
    unread_count INTEGER NOT NULL DEFAULT 0,
    last_read_message_id INTEGER NOT NULL DEFAULT 0,
    -- Messages with id <= this are hidden from the member's history
    cleared_before_id INTEGER NOT NULL DEFAULT 0,
    is_pinned INTEGER NOT NULL DEFAULT 0,
    is_muted INTEGER NOT NULL DEFAULT 0,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    join_time INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (conversation_id, user_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id)
);
CREATE INDEX IF NOT EXISTS idx_members_user ON conversation_members(user_id, is_deleted);

-- Fan-out events whose publish failed; republished out-of-band
CREATE TABLE IF NOT EXISTS pending_fanout (
    event_key TEXT PRIMARY KEY,
    message_id INTEGER NOT NULL,
    payload TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

-- Set-if-absent idempotency claims with expiry
CREATE TABLE IF NOT EXISTS idempotency_claims (
    claim_key TEXT PRIMARY KEY,
    expires_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_claims_expiry ON idempotency_claims(expires_at);

-- Partitioned append-only fan-out log
CREATE TABLE IF NOT EXISTS broker_log (
    log_offset INTEGER PRIMARY KEY AUTOINCREMENT,
    partition_id INTEGER NOT NULL,
    event_key TEXT NOT NULL,
    payload TEXT NOT NULL,
    published_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_broker_partition ON broker_log(partition_id, log_offset);

-- Committed offsets per consumer group and partition
CREATE TABLE IF NOT EXISTS broker_offsets (
    consumer_group TEXT NOT NULL,
    partition_id INTEGER NOT NULL,
    committed INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (consumer_group, partition_id)
);
"#;
