//! Redis-backed distributed queue implementation
//!
//! Uses Redis Streams for reliable message delivery with:
//! - At-least-once delivery semantics
//! - A consumer group shared by every consumer process
//! - Automatic redelivery of messages whose consumer died (XAUTOCLAIM)
//! - A dead-letter stream for exhausted or undecodable messages

use crate::error::{QueueError, QueueResult};
use crate::queue::{has_retries_left, Delivery, JobQueue, QueueStats, RejectOutcome};

use redis::{
    aio::MultiplexedConnection,
    streams::{
        StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamPendingReply,
        StreamRangeReply, StreamReadOptions, StreamReadReply,
    },
    AsyncCommands, Client, RedisResult, Script,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Consumer group name
pub const CONSUMER_GROUP: &str = "archiver-workers";

/// Acknowledge a leased entry and, if ARGV[3] is set, re-add its payload to
/// KEYS[2]. Returns 0 when the entry is no longer pending.
const SETTLE_SCRIPT: &str = r#"
if redis.call('XACK', KEYS[1], ARGV[1], ARGV[2]) == 0 then
    return 0
end
redis.call('XDEL', KEYS[1], ARGV[2])
if ARGV[3] == '1' then
    redis.call('XADD', KEYS[2], '*', 'payload', ARGV[4], 'attempts', ARGV[5])
end
return 1
"#;

/// Reset the idle time of an entry still leased by ARGV[2]. Returns 0 when
/// the entry was settled or claimed by another consumer.
const EXTEND_SCRIPT: &str = r#"
local entry = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[3], ARGV[3], 1)[1]
if not entry or entry[2] ~= ARGV[2] then
    return 0
end
redis.call('XCLAIM', KEYS[1], ARGV[1], ARGV[2], 0, ARGV[3], 'IDLE', 0, 'JUSTID')
return 1
"#;

/// Configuration for Redis queue
#[derive(Debug, Clone)]
pub struct RedisQueueConfig {
    /// Redis connection URL
    pub url: String,
    /// Queue name
    pub name: String,
    /// Key prefix for namespacing
    pub key_prefix: String,
    /// Maximum attempts before moving to the dead-letter stream
    pub max_retries: u32,
    /// Idle time after which a leased message is handed to another consumer
    pub claim_timeout: Duration,
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            name: "jobs".to_string(),
            key_prefix: "repo-archiver".to_string(),
            max_retries: super::DEFAULT_MAX_RETRIES,
            claim_timeout: super::DEFAULT_CLAIM_TIMEOUT,
        }
    }
}

impl RedisQueueConfig {
    /// Create config with custom Redis URL and queue name
    pub fn with_url(url: &str, name: &str) -> Self {
        Self {
            url: url.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Set the retry budget
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the lease expiry for abandoned messages
    pub fn claim_timeout(mut self, claim_timeout: Duration) -> Self {
        self.claim_timeout = claim_timeout;
        self
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}:{}", self.key_prefix, self.name, suffix)
    }

    /// Main stream key
    pub fn stream_key(&self) -> String {
        self.key("stream")
    }

    /// Dead-letter stream key
    pub fn dead_key(&self) -> String {
        self.key("dead")
    }

    /// Statistics hash key
    pub fn stats_key(&self) -> String {
        self.key("stats")
    }
}

/// Redis-backed distributed queue
pub struct RedisQueue {
    client: Client,
    connection: Arc<RwLock<MultiplexedConnection>>,
    config: RedisQueueConfig,
    settle: Script,
    renew: Script,
}

impl RedisQueue {
    /// Connect and make sure the consumer group exists
    pub async fn new(config: RedisQueueConfig) -> QueueResult<Self> {
        let client =
            Client::open(config.url.as_str()).map_err(|e| QueueError::ConnectionFailed {
                url: config.url.clone(),
                reason: e.to_string(),
            })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                url: config.url.clone(),
                reason: e.to_string(),
            })?;

        let queue = Self {
            client,
            connection: Arc::new(RwLock::new(connection)),
            config,
            settle: Script::new(SETTLE_SCRIPT),
            renew: Script::new(EXTEND_SCRIPT),
        };

        queue.init_consumer_group().await?;

        Ok(queue)
    }

    /// Create the stream and consumer group if missing
    async fn init_consumer_group(&self) -> QueueResult<()> {
        let mut conn = self.connection.write().await;

        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(self.config.stream_key())
            .arg(CONSUMER_GROUP)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut *conn)
            .await;

        // BUSYGROUP: group already exists
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(QueueError::OperationFailed(e.to_string())),
        }
    }

    /// Dedicated connection for blocking reads
    async fn get_conn(&self) -> QueueResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                url: self.config.url.clone(),
                reason: e.to_string(),
            })
    }

    fn to_delivery(entry: StreamId) -> QueueResult<Delivery> {
        let payload: Vec<u8> = entry.get("payload").ok_or_else(|| {
            QueueError::Serialization(format!("entry {} has no payload", entry.id))
        })?;
        let attempts: u32 = entry.get("attempts").unwrap_or(0);

        Ok(Delivery {
            id: entry.id,
            payload,
            attempts,
        })
    }

    /// Take over one message whose consumer has been idle past the claim timeout
    async fn claim_abandoned(&self, consumer: &str) -> QueueResult<Option<Delivery>> {
        let mut conn = self.connection.write().await;
        let claim_ms = self.config.claim_timeout.as_millis() as usize;
        let opts = StreamAutoClaimOptions::default().count(1);

        let result: RedisResult<StreamAutoClaimReply> = conn
            .xautoclaim_options(
                self.config.stream_key(),
                CONSUMER_GROUP,
                consumer,
                claim_ms,
                "0-0",
                opts,
            )
            .await;

        match result {
            Ok(reply) => match reply.claimed.into_iter().next() {
                Some(entry) => {
                    tracing::warn!(id = %entry.id, consumer, "Claimed abandoned message");
                    Self::to_delivery(entry).map(Some)
                }
                None => Ok(None),
            },
            Err(e) if e.to_string().contains("NOGROUP") => Ok(None),
            Err(e) => Err(QueueError::OperationFailed(e.to_string())),
        }
    }

    /// Settle a leased entry, optionally re-adding it to `target`
    async fn settle(
        &self,
        delivery: &Delivery,
        target: Option<(&str, u32)>,
    ) -> QueueResult<()> {
        let mut conn = self.connection.write().await;
        let stream = self.config.stream_key();
        let (target_key, requeue, attempts) = match target {
            Some((key, attempts)) => (key.to_string(), "1", attempts),
            None => (stream.clone(), "0", 0),
        };

        let settled: i64 = self
            .settle
            .key(&stream)
            .key(&target_key)
            .arg(CONSUMER_GROUP)
            .arg(&delivery.id)
            .arg(requeue)
            .arg(delivery.payload.as_slice())
            .arg(attempts)
            .invoke_async(&mut *conn)
            .await?;

        if settled == 0 {
            return Err(QueueError::UnknownDelivery(delivery.id.clone()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobQueue for RedisQueue {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn publish(&self, payload: Vec<u8>) -> QueueResult<()> {
        let mut conn = self.connection.write().await;

        let _id: String = redis::cmd("XADD")
            .arg(self.config.stream_key())
            .arg("*")
            .arg("payload")
            .arg(payload.as_slice())
            .arg("attempts")
            .arg(0)
            .query_async(&mut *conn)
            .await?;

        let _: i64 = conn.hincr(self.config.stats_key(), "published", 1).await?;
        Ok(())
    }

    async fn consume(&self, consumer: &str, wait: Duration) -> QueueResult<Option<Delivery>> {
        if let Some(delivery) = self.claim_abandoned(consumer).await? {
            return Ok(Some(delivery));
        }

        let mut conn = self.get_conn().await?;
        let opts = StreamReadOptions::default()
            .group(CONSUMER_GROUP, consumer)
            .count(1)
            .block(wait.as_millis().max(1) as usize);

        let result: RedisResult<Option<StreamReadReply>> = conn
            .xread_options(&[self.config.stream_key()], &[">"], &opts)
            .await;

        let reply = match result {
            Ok(Some(reply)) => reply,
            Ok(None) => return Ok(None),
            Err(e) if e.to_string().contains("NOGROUP") => {
                // Stream was deleted under us
                self.init_consumer_group().await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match reply.keys.into_iter().flat_map(|k| k.ids).next() {
            Some(entry) => Self::to_delivery(entry).map(Some),
            None => Ok(None),
        }
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        self.settle(delivery, None).await?;

        let mut conn = self.connection.write().await;
        let _: i64 = conn.hincr(self.config.stats_key(), "acked", 1).await?;
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> QueueResult<()> {
        let stream = self.config.stream_key();
        self.settle(delivery, Some((&stream, delivery.attempts))).await
    }

    async fn reject(&self, delivery: &Delivery) -> QueueResult<RejectOutcome> {
        if has_retries_left(delivery.attempts, self.config.max_retries) {
            let attempts = delivery.attempts + 1;
            let stream = self.config.stream_key();
            self.settle(delivery, Some((&stream, attempts))).await?;
            Ok(RejectOutcome::Requeued { attempts })
        } else {
            self.dead_letter(delivery).await?;
            Ok(RejectOutcome::DeadLettered)
        }
    }

    async fn dead_letter(&self, delivery: &Delivery) -> QueueResult<()> {
        let dead = self.config.dead_key();
        self.settle(delivery, Some((&dead, delivery.attempts))).await
    }

    fn lease_timeout(&self) -> Option<Duration> {
        Some(self.config.claim_timeout)
    }

    async fn extend(&self, consumer: &str, delivery: &Delivery) -> QueueResult<()> {
        let mut conn = self.connection.write().await;

        let extended: i64 = self
            .renew
            .key(self.config.stream_key())
            .arg(CONSUMER_GROUP)
            .arg(consumer)
            .arg(&delivery.id)
            .invoke_async(&mut *conn)
            .await?;

        if extended == 0 {
            return Err(QueueError::UnknownDelivery(delivery.id.clone()));
        }
        Ok(())
    }

    async fn retry_dead_letters(&self) -> QueueResult<u64> {
        let mut conn = self.connection.write().await;
        let dead_key = self.config.dead_key();
        let stream = self.config.stream_key();

        let range: StreamRangeReply = conn.xrange_all(&dead_key).await?;
        let mut moved = 0u64;

        for entry in range.ids {
            let payload: Vec<u8> = match entry.get("payload") {
                Some(payload) => payload,
                None => continue,
            };

            let mut pipe = redis::pipe();
            pipe.atomic()
                .cmd("XADD")
                .arg(&stream)
                .arg("*")
                .arg("payload")
                .arg(payload.as_slice())
                .arg("attempts")
                .arg(0)
                .ignore()
                .cmd("XDEL")
                .arg(&dead_key)
                .arg(&entry.id)
                .ignore();
            let () = pipe.query_async(&mut *conn).await?;
            moved += 1;
        }

        Ok(moved)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let mut conn = self.connection.write().await;
        let stream = self.config.stream_key();

        let length: u64 = conn.xlen(&stream).await?;
        let dead_letters: u64 = conn.xlen(self.config.dead_key()).await?;
        let pending: StreamPendingReply = conn.xpending(&stream, CONSUMER_GROUP).await?;
        let in_flight = pending.count() as u64;

        let values: Vec<Option<u64>> = redis::cmd("HMGET")
            .arg(self.config.stats_key())
            .arg("published")
            .arg("acked")
            .query_async(&mut *conn)
            .await?;

        Ok(QueueStats {
            pending: length.saturating_sub(in_flight),
            in_flight,
            dead_letters,
            published: values.first().copied().flatten().unwrap_or(0),
            acked: values.get(1).copied().flatten().unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Exercising the queue itself needs a running Redis; these cover config

    #[test]
    fn test_config_defaults() {
        let config = RedisQueueConfig::default();
        assert_eq!(config.url, "redis://127.0.0.1:6379");
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.claim_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_config_with_url() {
        let config = RedisQueueConfig::with_url("redis://custom:6380", "mentions")
            .max_retries(5)
            .claim_timeout(Duration::from_secs(30));
        assert_eq!(config.url, "redis://custom:6380");
        assert_eq!(config.name, "mentions");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.claim_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_keys_are_namespaced_by_queue() {
        let jobs = RedisQueueConfig::with_url("redis://h", "jobs");
        let mentions = RedisQueueConfig::with_url("redis://h", "mentions");

        assert_eq!(jobs.stream_key(), "repo-archiver:jobs:stream");
        assert_eq!(jobs.dead_key(), "repo-archiver:jobs:dead");
        assert_eq!(jobs.stats_key(), "repo-archiver:jobs:stats");
        assert_ne!(jobs.stream_key(), mentions.stream_key());
    }
}
