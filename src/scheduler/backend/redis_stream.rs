//! Redis Streams backend.
//!
//! # Key layout
//!
//! - `{channel}`: the stream itself; entries carry `payload` and `attempt` fields
//! - `{channel}:dead`: entries that exhausted their reclaim budget
//! - `{channel}:init`: expiring lease naming the worker populating the job
//! - `{channel}:initialized`: set once every chunk was enqueued
//!
//! Consumer groups track delivery. A claimed entry stays in the group's
//! pending entries list (PEL) until `XACK`; entries whose consumer died
//! are moved to a live consumer with `XAUTOCLAIM`.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingReply, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, FromRedisValue};
use tracing::debug;

use super::{
    BackendKind, Delivery, DeliveryHandle, Envelope, MessageId, QueueBackend,
};
use crate::error::QueueError;

const PAYLOAD_FIELD: &str = "payload";
const ATTEMPT_FIELD: &str = "attempt";

/// Cursor value that starts and ends an `XAUTOCLAIM` scan.
const SCAN_START: &str = "0-0";

/// Queue backend on Redis Streams with consumer groups.
pub struct RedisStreamBackend {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
}

impl RedisStreamBackend {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::BackendUnavailable` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::InvalidConfig(format!("redis url: {}", e)))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::BackendUnavailable(e.to_string()))?;

        Ok(Self { redis })
    }

    /// Wraps an existing connection manager.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    fn to_delivery(entry: StreamId, group: &str, redelivered: bool) -> Result<Delivery, QueueError> {
        let payload: Vec<u8> = entry.get(PAYLOAD_FIELD).ok_or_else(|| {
            QueueError::Protocol(format!("entry {} has no '{}' field", entry.id, PAYLOAD_FIELD))
        })?;
        let attempt: u32 = entry.get(ATTEMPT_FIELD).unwrap_or(0);

        Ok(Delivery {
            message_id: entry.id.clone(),
            payload,
            attempt,
            redelivered,
            handle: DeliveryHandle::Stream {
                entry_id: entry.id,
                group: group.to_string(),
            },
        })
    }
}

fn is_missing_group(err: &redis::RedisError) -> bool {
    err.code() == Some("NOGROUP") || err.to_string().contains("NOGROUP")
}

#[async_trait]
impl QueueBackend for RedisStreamBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Stream
    }

    fn dead_letter_channel(&self, channel: &str) -> String {
        format!("{}:dead", channel)
    }

    async fn initialize(&self, channel: &str, group: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let created: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(channel)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created.map_err(QueueError::from) {
            Ok(()) => {
                debug!(channel = %channel, group = %group, "Created consumer group");
                Ok(())
            }
            Err(QueueError::ChannelAlreadyExists(_)) => {
                debug!(channel = %channel, group = %group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn enqueue_envelope(
        &self,
        channel: &str,
        envelope: &Envelope,
    ) -> Result<MessageId, QueueError> {
        let mut conn = self.redis.clone();
        let id: String = redis::cmd("XADD")
            .arg(channel)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(envelope.payload.as_slice())
            .arg(ATTEMPT_FIELD)
            .arg(envelope.attempt)
            .query_async(&mut conn)
            .await?;
        Ok(id)
    }

    async fn dequeue(
        &self,
        channel: &str,
        group: &str,
        consumer_id: &str,
        block_timeout: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.redis.clone();
        // BLOCK 0 would wait forever.
        let block_ms = block_timeout.as_millis().max(1) as usize;
        let options = StreamReadOptions::default()
            .group(group, consumer_id)
            .count(1)
            .block(block_ms);

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[channel], &[">"], &options)
            .await?;

        let entry = reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|key| key.ids)
            .next();

        entry
            .map(|entry| Self::to_delivery(entry, group, false))
            .transpose()
    }

    async fn acknowledge(
        &self,
        channel: &str,
        group: &str,
        handle: &DeliveryHandle,
    ) -> Result<bool, QueueError> {
        let DeliveryHandle::Stream {
            entry_id,
            group: handle_group,
        } = handle
        else {
            return Err(QueueError::Protocol(format!(
                "stream backend cannot acknowledge {}",
                handle
            )));
        };
        if handle_group != group {
            return Ok(false);
        }

        let mut conn = self.redis.clone();
        let acked: u64 = conn.xack(channel, group, &[entry_id.as_str()]).await?;
        Ok(acked > 0)
    }

    async fn pending_count(&self, channel: &str, group: &str) -> Result<u64, QueueError> {
        let mut conn = self.redis.clone();
        let reply: Result<StreamPendingReply, redis::RedisError> =
            conn.xpending(channel, group).await;
        match reply {
            Ok(reply) => Ok(reply.count() as u64),
            Err(e) if is_missing_group(&e) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn channel_depth(&self, channel: &str) -> Result<u64, QueueError> {
        let mut conn = self.redis.clone();
        let len: u64 = conn.xlen(channel).await?;
        Ok(len)
    }

    async fn reclaim_stale(
        &self,
        channel: &str,
        group: &str,
        staleness: Duration,
        new_consumer_id: &str,
        max_entries: usize,
    ) -> Result<Vec<Delivery>, QueueError> {
        let mut conn = self.redis.clone();
        let min_idle_ms = staleness.as_millis() as u64;
        let mut cursor = SCAN_START.to_string();
        let mut reclaimed = Vec::new();

        while reclaimed.len() < max_entries {
            let remaining = max_entries - reclaimed.len();
            // Reply: [next-cursor, [entries...], [deleted ids...]]
            let reply: Vec<redis::Value> = redis::cmd("XAUTOCLAIM")
                .arg(channel)
                .arg(group)
                .arg(new_consumer_id)
                .arg(min_idle_ms)
                .arg(&cursor)
                .arg("COUNT")
                .arg(remaining)
                .query_async(&mut conn)
                .await?;

            let (next_cursor, entries) = match reply.as_slice() {
                [next, entries, ..] => (
                    String::from_redis_value(next)?,
                    StreamClaimReply::from_redis_value(entries)?,
                ),
                _ => {
                    return Err(QueueError::Protocol(format!(
                        "unexpected XAUTOCLAIM reply with {} elements",
                        reply.len()
                    )))
                }
            };

            for entry in entries.ids {
                debug!(
                    entry_id = %entry.id,
                    consumer = %new_consumer_id,
                    "Reclaimed stale entry"
                );
                reclaimed.push(Self::to_delivery(entry, group, true)?);
            }

            if next_cursor == SCAN_START {
                break;
            }
            cursor = next_cursor;
        }

        Ok(reclaimed)
    }

    async fn claim_initialization(
        &self,
        channel: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<bool, QueueError> {
        if self.is_initialized(channel).await? {
            return Ok(false);
        }
        let mut conn = self.redis.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(format!("{}:init", channel))
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(lease.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }

    async fn mark_initialized(&self, channel: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(format!("{}:initialized", channel), 1)
            .await?;
        Ok(())
    }

    async fn is_initialized(&self, channel: &str) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let exists: bool = conn.exists(format!("{}:initialized", channel)).await?;
        Ok(exists)
    }
}
