//! History data models.

use serde::{Deserialize, Serialize};

/// A message to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: String,
    pub receiver_id: String,
    pub message: String,
    /// RFC 3339 timestamp assigned by the sending connection.
    pub timestamp: String,
}

/// A persisted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoredMessage {
    pub id: i64,
    pub sender_id: String,
    pub receiver_id: String,
    pub message: String,
    pub timestamp: String,
}
