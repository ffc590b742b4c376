//! SQLite-backed history store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;

use super::{HistoryStore, NewMessage, StoredMessage};

/// History store over the shared SQLite pool.
#[derive(Debug, Clone)]
pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

impl SqliteHistoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a message by ID.
    pub async fn get_by_id(&self, id: i64) -> Result<StoredMessage> {
        sqlx::query_as::<_, StoredMessage>(
            "SELECT id, sender_id, receiver_id, message, timestamp FROM messages WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .context("fetching message")
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn append(&self, message: NewMessage) -> Result<StoredMessage> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO messages (sender_id, receiver_id, message, timestamp)
            VALUES (?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&message.sender_id)
        .bind(&message.receiver_id)
        .bind(&message.message)
        .bind(&message.timestamp)
        .fetch_one(&self.pool)
        .await
        .context("inserting message")?;

        self.get_by_id(id).await
    }

    async fn find_between(&self, a: &str, b: &str) -> Result<Vec<StoredMessage>> {
        // Timestamps are fixed-width RFC 3339 UTC, so text order is time order.
        sqlx::query_as::<_, StoredMessage>(
            r#"
            SELECT id, sender_id, receiver_id, message, timestamp
            FROM messages
            WHERE (sender_id = ?1 AND receiver_id = ?2)
               OR (sender_id = ?2 AND receiver_id = ?1)
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(a)
        .bind(b)
        .fetch_all(&self.pool)
        .await
        .context("fetching conversation")
    }
}
