//! Idempotency claims: set-if-absent keys with a time-to-live.
//!
//! The consumer claims an event's key before processing it. A failed claim
//! means another delivery of the same event already ran (or is running).

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::storage::Database;

/// Fast expiring key-value store used for duplicate suppression.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Claim `key` for `ttl`. Returns `false` if a live claim already exists.
    async fn try_claim(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Drop a claim so a retry can take it
    async fn release(&self, key: &str) -> Result<()>;

    /// Remove expired claims; returns how many were removed
    async fn purge_expired(&self) -> Result<usize>;
}

/// Claims kept in the SQLite database, surviving restarts
pub struct SqliteClaimStore {
    database: Arc<Database>,
}

impl SqliteClaimStore {
    /// Create a claim store over the shared database
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }
}

#[async_trait]
impl ClaimStore for SqliteClaimStore {
    async fn try_claim(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = crate::time::now_timestamp_millis();
        self.database.try_claim(key, now, now + ttl.as_millis() as i64)
    }

    async fn release(&self, key: &str) -> Result<()> {
        self.database.release_claim(key)?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        self.database.purge_expired_claims(crate::time::now_timestamp_millis())
    }
}

/// Process-local claims
#[derive(Default)]
pub struct MemoryClaimStore {
    claims: DashMap<String, i64>,
}

impl MemoryClaimStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClaimStore for MemoryClaimStore {
    async fn try_claim(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = crate::time::now_timestamp_millis();
        let expires_at = now + ttl.as_millis() as i64;

        let mut entry = self.claims.entry(key.to_string()).or_insert(i64::MIN);
        if *entry > now {
            return Ok(false);
        }
        *entry = expires_at;
        Ok(true)
    }

    async fn release(&self, key: &str) -> Result<()> {
        self.claims.remove(key);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = crate::time::now_timestamp_millis();
        let before = self.claims.len();
        self.claims.retain(|_, expires_at| *expires_at > now);
        Ok(before - self.claims.len())
    }
}
