use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

use super::{MessageId, QueueError, QueueMessage, QueueTransport};
use crate::models::submission::JobMessage;

/// In-process queue with the same lease semantics as [`super::RedisQueue`].
///
/// Visibility runs on `tokio::time::Instant`, so paused-clock tests can
/// expire leases with `tokio::time::advance`.
#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: MessageId,
    active: BTreeMap<MessageId, Entry>,
    archived: BTreeMap<MessageId, QueueMessage>,
    acknowledged: Vec<MessageId>,
}

struct Entry {
    payload: JobMessage,
    enqueued_at: DateTime<Utc>,
    read_ct: i64,
    visible_at: Instant,
    vt: DateTime<Utc>,
}

impl Entry {
    fn to_message(&self, msg_id: MessageId) -> QueueMessage {
        QueueMessage {
            msg_id,
            read_ct: self.read_ct,
            enqueued_at: self.enqueued_at,
            vt: self.vt,
            payload: self.payload.clone(),
        }
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids acknowledged so far, in call order.
    pub fn acknowledged(&self) -> Vec<MessageId> {
        self.lock().acknowledged.clone()
    }

    /// Dead-lettered messages as they were when archived.
    pub fn archived(&self) -> Vec<QueueMessage> {
        self.lock().archived.values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl QueueTransport for MemoryQueue {
    async fn enqueue(&self, payload: &JobMessage) -> Result<MessageId, QueueError> {
        let mut inner = self.lock();
        inner.next_id += 1;
        let msg_id = inner.next_id;
        let now = Utc::now();
        inner.active.insert(
            msg_id,
            Entry {
                payload: payload.clone(),
                enqueued_at: now,
                read_ct: 0,
                visible_at: Instant::now(),
                vt: now,
            },
        );
        Ok(msg_id)
    }

    async fn lease(
        &self,
        visibility: Duration,
        max_batch: usize,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let mut inner = self.lock();
        let now = Instant::now();
        let vt = Utc::now() + chrono::Duration::milliseconds(visibility.as_millis() as i64);

        let batch = inner
            .active
            .iter_mut()
            .filter(|(_, entry)| entry.visible_at <= now)
            .take(max_batch.max(1))
            .map(|(msg_id, entry)| {
                entry.read_ct += 1;
                entry.visible_at = now + visibility;
                entry.vt = vt;
                entry.to_message(*msg_id)
            })
            .collect();
        Ok(batch)
    }

    async fn acknowledge(&self, msg_id: MessageId) -> Result<(), QueueError> {
        let mut inner = self.lock();
        if inner.active.remove(&msg_id).is_some() {
            inner.acknowledged.push(msg_id);
        }
        Ok(())
    }

    async fn dead_letter(&self, msg_id: MessageId) -> Result<(), QueueError> {
        let mut inner = self.lock();
        if let Some(entry) = inner.active.remove(&msg_id) {
            let message = entry.to_message(msg_id);
            inner.archived.insert(msg_id, message);
        }
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.lock().active.len() as u64)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
