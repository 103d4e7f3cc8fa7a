use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use super::{MessageId, QueueError, QueueMessage, QueueTransport};
use crate::models::submission::JobMessage;

/// Moves every visible message (score <= now) to the new deadline, bumps its
/// read count and returns `{id, read_ct, body}` triples. One script call so
/// two workers never lease the same message.
const LEASE_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[3])
local out = {}
for _, id in ipairs(ids) do
  redis.call('ZADD', KEYS[1], ARGV[2], id)
  local ct = redis.call('HINCRBY', KEYS[3], id, 1)
  local body = redis.call('HGET', KEYS[2], id)
  table.insert(out, {id, ct, body})
end
return out
"#;

const ARCHIVE_SCRIPT: &str = r#"
local body = redis.call('HGET', KEYS[2], ARGV[1])
if not body then
  return 0
end
redis.call('HSET', KEYS[4], ARGV[1], body)
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
return 1
"#;

/// Message body as stored in the messages hash.
#[derive(Debug, Serialize, Deserialize)]
struct StoredMessage {
    enqueued_at: DateTime<Utc>,
    payload: JobMessage,
}

/// Redis-backed queue.
///
/// Layout under the queue name `q`:
/// - `q:seq` message id counter
/// - `q:messages` hash of id -> body
/// - `q:vt` sorted set of id scored by visibility deadline (epoch ms)
/// - `q:read_ct` hash of id -> lease count
/// - `q:archive` hash of dead-lettered id -> body
pub struct RedisQueue {
    client: redis::Client,
    keys: QueueKeys,
    lease_script: redis::Script,
    archive_script: redis::Script,
}

struct QueueKeys {
    seq: String,
    messages: String,
    vt: String,
    read_ct: String,
    archive: String,
}

impl QueueKeys {
    fn new(queue: &str) -> Self {
        Self {
            seq: format!("{queue}:seq"),
            messages: format!("{queue}:messages"),
            vt: format!("{queue}:vt"),
            read_ct: format!("{queue}:read_ct"),
            archive: format!("{queue}:archive"),
        }
    }
}

impl RedisQueue {
    pub fn new(redis_url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            keys: QueueKeys::new(queue_name),
            lease_script: redis::Script::new(LEASE_SCRIPT),
            archive_script: redis::Script::new(ARCHIVE_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    /// Move a message body into the archive. Returns false if it was already gone.
    async fn archive(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        msg_id: MessageId,
    ) -> Result<bool, QueueError> {
        let archived: i64 = self
            .archive_script
            .key(&self.keys.vt)
            .key(&self.keys.messages)
            .key(&self.keys.read_ct)
            .key(&self.keys.archive)
            .arg(msg_id)
            .invoke_async(conn)
            .await?;
        Ok(archived == 1)
    }
}

#[async_trait]
impl QueueTransport for RedisQueue {
    async fn enqueue(&self, payload: &JobMessage) -> Result<MessageId, QueueError> {
        let mut conn = self.connection().await?;
        let body = serde_json::to_string(&StoredMessage {
            enqueued_at: Utc::now(),
            payload: payload.clone(),
        })?;

        let msg_id: MessageId = conn.incr(&self.keys.seq, 1).await?;
        redis::pipe()
            .atomic()
            .hset(&self.keys.messages, msg_id, &body)
            .ignore()
            .zadd(&self.keys.vt, msg_id, Utc::now().timestamp_millis())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        Ok(msg_id)
    }

    async fn lease(
        &self,
        visibility: Duration,
        max_batch: usize,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let mut conn = self.connection().await?;
        let now = Utc::now();
        let vt = now + chrono::Duration::milliseconds(visibility.as_millis() as i64);

        let leased: Vec<(MessageId, i64, Option<String>)> = self
            .lease_script
            .key(&self.keys.vt)
            .key(&self.keys.messages)
            .key(&self.keys.read_ct)
            .arg(now.timestamp_millis())
            .arg(vt.timestamp_millis())
            .arg(max_batch.max(1))
            .invoke_async(&mut conn)
            .await?;

        let mut batch = Vec::with_capacity(leased.len());
        for (msg_id, read_ct, body) in leased {
            let Some(body) = body else {
                // Deadline without a body: the message was removed mid-lease.
                conn.zrem::<_, _, ()>(&self.keys.vt, msg_id).await?;
                continue;
            };
            let stored: StoredMessage = match serde_json::from_str(&body) {
                Ok(stored) => stored,
                Err(e) => {
                    tracing::error!(msg_id, read_ct, error = %e, "Undecodable message, archiving");
                    self.archive(&mut conn, msg_id).await?;
                    continue;
                }
            };
            batch.push(QueueMessage {
                msg_id,
                read_ct,
                enqueued_at: stored.enqueued_at,
                vt,
                payload: stored.payload,
            });
        }
        Ok(batch)
    }

    async fn acknowledge(&self, msg_id: MessageId) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::pipe()
            .atomic()
            .zrem(&self.keys.vt, msg_id)
            .ignore()
            .hdel(&self.keys.messages, msg_id)
            .ignore()
            .hdel(&self.keys.read_ct, msg_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn dead_letter(&self, msg_id: MessageId) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        if !self.archive(&mut conn, msg_id).await? {
            tracing::warn!(msg_id, "Dead-letter requested for unknown message");
        }
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.zcard(&self.keys.vt).await?;
        Ok(depth)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}
