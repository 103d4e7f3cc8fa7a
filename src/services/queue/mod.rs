//! Durable, at-least-once work queue with visibility leases.
//!
//! A leased message stays invisible to other consumers until its visibility
//! deadline passes. Unless it is acknowledged or dead-lettered first, it then
//! becomes leasable again and its read count goes up. `read_ct` counts every
//! lease, so the first delivery reports 1.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::submission::JobMessage;

pub mod memory;
pub mod redis_queue;

pub use self::memory::MemoryQueue;
pub use self::redis_queue::RedisQueue;

/// Queue-assigned message identifier, reused to acknowledge or archive.
pub type MessageId = i64;

/// A leased message.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub msg_id: MessageId,
    pub read_ct: i64,
    pub enqueued_at: DateTime<Utc>,
    /// When the lease expires and the message becomes visible again.
    pub vt: DateTime<Utc>,
    pub payload: JobMessage,
}

#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Append a message; it is visible immediately.
    async fn enqueue(&self, payload: &JobMessage) -> Result<MessageId, QueueError>;

    /// Lease up to `max_batch` visible messages for `visibility`.
    /// Returns an empty batch immediately when nothing is visible.
    async fn lease(
        &self,
        visibility: Duration,
        max_batch: usize,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Permanently delete a processed message.
    async fn acknowledge(&self, msg_id: MessageId) -> Result<(), QueueError>;

    /// Move a message to the archive for manual inspection.
    async fn dead_letter(&self, msg_id: MessageId) -> Result<(), QueueError>;

    /// Messages in the active queue, leased or not.
    async fn depth(&self) -> Result<u64, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
