//! # Storage Module
//!
//! Durable state for the messaging core, kept in one SQLite database.
//!
//! ## Storage Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         STORAGE SYSTEM                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  Message Store                                                  │   │
//! │  │  • messages - immutable content, status + recall flags         │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  Conversation Ledger                                            │   │
//! │  │  • conversations - last message per conversation               │   │
//! │  │  • conversation_members - unread, read pointer, pin/mute       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  Fan-out plumbing                                               │   │
//! │  │  • broker_log / broker_offsets - partitioned event log         │   │
//! │  │  • idempotency_claims - set-if-absent keys with TTL            │   │
//! │  │  • pending_fanout - events waiting for republish               │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod database;
mod schema;

pub use database::{ConversationRecord, Database, LastMessage, LogRecord, MemberTouch, PendingFanoutRecord};

use std::sync::Arc;

use crate::error::Result;

/// Storage configuration
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    /// Path to the database file (None for in-memory)
    pub database_path: Option<String>,
}

/// Open the shared database handle
pub fn init(config: &StorageConfig) -> Result<Arc<Database>> {
    let db = Database::open(config.database_path.as_deref())?;
    match &config.database_path {
        Some(path) => tracing::info!(path = %path, "Opened message database"),
        None => tracing::warn!("No database path configured, using in-memory storage"),
    }
    Ok(Arc::new(db))
}
