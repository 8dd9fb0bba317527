//! Queue module for job distribution
//!
//! Provides the queue abstraction shared by producers and consumers, with an
//! in-process implementation and a Redis Streams implementation.
//!
//! Delivery is at-least-once. A consumer holds a lease on each [`Delivery`]
//! until it acknowledges, releases, rejects or dead-letters it.
//!
//! # Retry policy
//!
//! - [`JobQueue::release`]: put back without counting an attempt (lock
//!   contention)
//! - [`JobQueue::reject`]: put back with one more attempt, or dead-letter
//!   once `max_retries` attempts have been made
//! - [`JobQueue::dead_letter`]: never retry (undecodable payload)
//!
//! # Leases
//!
//! A transport whose leases expire reports it through
//! [`JobQueue::lease_timeout`]. Long jobs keep their delivery with
//! [`JobQueue::extend`]; an expired lease is handed to another consumer.

mod memory_queue;
mod redis_queue;

pub use memory_queue::MemoryQueue;
pub use redis_queue::{RedisQueue, RedisQueueConfig, CONSUMER_GROUP};

use crate::error::{QueueError, QueueResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Default number of attempts before a job is dead-lettered
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default idle time after which an unrenewed lease expires
pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// A leased message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Transport-assigned message id
    pub id: String,
    /// Opaque encoded payload
    pub payload: Vec<u8>,
    /// Failed processing attempts so far
    pub attempts: u32,
}

/// What happened to a rejected delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectOutcome {
    /// Put back on the queue for another attempt
    Requeued { attempts: u32 },
    /// Retries exhausted, moved to the dead-letter list
    DeadLettered,
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Messages waiting to be consumed
    pub pending: u64,
    /// Messages leased by a consumer
    pub in_flight: u64,
    /// Messages parked in the dead-letter list
    pub dead_letters: u64,
    /// Total messages published
    pub published: u64,
    /// Total messages acknowledged
    pub acked: u64,
}

/// Trait for queue implementations
#[async_trait::async_trait]
pub trait JobQueue: Send + Sync {
    /// Queue name
    fn name(&self) -> &str;

    /// Publish a payload
    async fn publish(&self, payload: Vec<u8>) -> QueueResult<()>;

    /// Lease the next message, waiting at most `wait` for one to arrive
    async fn consume(&self, consumer: &str, wait: Duration) -> QueueResult<Option<Delivery>>;

    /// Acknowledge and remove a delivery
    async fn ack(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Return a delivery to the queue without counting an attempt
    async fn release(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Return a failed delivery for retry, or dead-letter it when exhausted
    async fn reject(&self, delivery: &Delivery) -> QueueResult<RejectOutcome>;

    /// Move a delivery straight to the dead-letter list
    async fn dead_letter(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Idle time after which a lease expires, or `None` if leases last
    /// until settled
    fn lease_timeout(&self) -> Option<Duration> {
        None
    }

    /// Renew `consumer`'s lease on an in-flight delivery
    async fn extend(&self, consumer: &str, delivery: &Delivery) -> QueueResult<()>;

    /// Move every dead letter back to the queue with a fresh attempt count
    async fn retry_dead_letters(&self) -> QueueResult<u64>;

    /// Queue statistics
    async fn stats(&self) -> QueueResult<QueueStats>;
}

/// Open a queue from a broker URL (`memory:` or `redis://...`)
///
/// `claim_timeout` only applies to transports whose leases expire.
pub async fn open(
    url: &str,
    name: &str,
    max_retries: u32,
    claim_timeout: Duration,
) -> QueueResult<Arc<dyn JobQueue>> {
    if url == "memory:" || url == "memory://" {
        return Ok(Arc::new(MemoryQueue::new(name, max_retries)));
    }

    if url.starts_with("redis://") || url.starts_with("rediss://") {
        let config = RedisQueueConfig::with_url(url, name)
            .max_retries(max_retries)
            .claim_timeout(claim_timeout);
        let queue = RedisQueue::new(config).await?;
        return Ok(Arc::new(queue));
    }

    Err(QueueError::ConnectionFailed {
        url: url.to_string(),
        reason: "unsupported broker scheme (expected memory: or redis://)".into(),
    })
}

/// Whether a delivery that failed `attempts` times has retries left
pub(crate) fn has_retries_left(attempts: u32, max_retries: u32) -> bool {
    attempts.saturating_add(1) < max_retries
}
