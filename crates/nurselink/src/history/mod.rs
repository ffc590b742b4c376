//! Message history for point-to-point chat.
//!
//! The chat core only needs two operations from persistence: append one
//! direct message, and read back the conversation between two identities.

mod models;
mod repository;

pub use models::{NewMessage, StoredMessage};
pub use repository::SqliteHistoryStore;

use anyhow::Result;
use async_trait::async_trait;

/// Append-only store of direct messages.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Persist one message.
    async fn append(&self, message: NewMessage) -> Result<StoredMessage>;

    /// All messages exchanged between `a` and `b`, oldest first.
    async fn find_between(&self, a: &str, b: &str) -> Result<Vec<StoredMessage>>;
}
