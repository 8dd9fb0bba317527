//! In-process queue
//!
//! Single-node and test transport. Leases live as long as the process, so
//! there is no redelivery of abandoned messages: a crashed process loses its
//! in-flight set together with the queue itself.

use crate::error::{QueueError, QueueResult};
use crate::queue::{has_retries_left, Delivery, JobQueue, QueueStats, RejectOutcome};

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Envelope {
    payload: Vec<u8>,
    attempts: u32,
}

#[derive(Debug, Default)]
struct Inner {
    pending: VecDeque<Envelope>,
    in_flight: HashMap<String, Envelope>,
    dead: Vec<Envelope>,
    published: u64,
    acked: u64,
}

/// In-memory queue
#[derive(Debug)]
pub struct MemoryQueue {
    name: String,
    max_retries: u32,
    inner: Mutex<Inner>,
    available: Notify,
}

impl MemoryQueue {
    /// Create an empty queue
    pub fn new(name: impl Into<String>, max_retries: u32) -> Self {
        Self {
            name: name.into(),
            max_retries,
            inner: Mutex::new(Inner::default()),
            available: Notify::new(),
        }
    }

    fn push(&self, envelope: Envelope) {
        self.inner.lock().pending.push_back(envelope);
        self.available.notify_one();
    }

    fn take_in_flight(&self, delivery: &Delivery) -> QueueResult<Envelope> {
        self.inner
            .lock()
            .in_flight
            .remove(&delivery.id)
            .ok_or_else(|| QueueError::UnknownDelivery(delivery.id.clone()))
    }

    /// Payloads currently in the dead-letter list
    pub fn dead_letters(&self) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .dead
            .iter()
            .map(|e| e.payload.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl JobQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, payload: Vec<u8>) -> QueueResult<()> {
        self.inner.lock().published += 1;
        self.push(Envelope {
            payload,
            attempts: 0,
        });
        Ok(())
    }

    async fn consume(&self, _consumer: &str, wait: Duration) -> QueueResult<Option<Delivery>> {
        let deadline = Instant::now() + wait;

        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(envelope) = inner.pending.pop_front() {
                    let id = Uuid::new_v4().to_string();
                    let delivery = Delivery {
                        id: id.clone(),
                        payload: envelope.payload.clone(),
                        attempts: envelope.attempts,
                    };
                    inner.in_flight.insert(id, envelope);
                    // Other waiters may still have work to pick up
                    if !inner.pending.is_empty() {
                        self.available.notify_one();
                    }
                    return Ok(Some(delivery));
                }
            }

            if tokio::time::timeout_at(deadline, self.available.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        self.take_in_flight(delivery)?;
        self.inner.lock().acked += 1;
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> QueueResult<()> {
        let envelope = self.take_in_flight(delivery)?;
        self.push(envelope);
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery) -> QueueResult<RejectOutcome> {
        let mut envelope = self.take_in_flight(delivery)?;

        if has_retries_left(envelope.attempts, self.max_retries) {
            envelope.attempts += 1;
            let attempts = envelope.attempts;
            self.push(envelope);
            Ok(RejectOutcome::Requeued { attempts })
        } else {
            self.inner.lock().dead.push(envelope);
            Ok(RejectOutcome::DeadLettered)
        }
    }

    async fn dead_letter(&self, delivery: &Delivery) -> QueueResult<()> {
        let envelope = self.take_in_flight(delivery)?;
        self.inner.lock().dead.push(envelope);
        Ok(())
    }

    async fn extend(&self, _consumer: &str, delivery: &Delivery) -> QueueResult<()> {
        if self.inner.lock().in_flight.contains_key(&delivery.id) {
            Ok(())
        } else {
            Err(QueueError::UnknownDelivery(delivery.id.clone()))
        }
    }

    async fn retry_dead_letters(&self) -> QueueResult<u64> {
        let dead = std::mem::take(&mut self.inner.lock().dead);
        let count = dead.len() as u64;
        for mut envelope in dead {
            envelope.attempts = 0;
            self.push(envelope);
        }
        Ok(count)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let inner = self.inner.lock();
        Ok(QueueStats {
            pending: inner.pending.len() as u64,
            in_flight: inner.in_flight.len() as u64,
            dead_letters: inner.dead.len() as u64,
            published: inner.published,
            acked: inner.acked,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_publish_consume_ack() {
        let queue = MemoryQueue::new("jobs", 3);
        queue.publish(b"one".to_vec()).await.unwrap();

        let delivery = queue.consume("c", WAIT).await.unwrap().unwrap();
        assert_eq!(delivery.payload, b"one");
        assert_eq!(delivery.attempts, 0);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.in_flight, 1);

        queue.ack(&delivery).await.unwrap();
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.published, 1);

        // Double ack is an error
        assert!(queue.ack(&delivery).await.is_err());
    }

    #[tokio::test]
    async fn test_consume_times_out_when_empty() {
        let queue = MemoryQueue::new("jobs", 3);
        let start = Instant::now();
        assert!(queue.consume("c", WAIT).await.unwrap().is_none());
        assert!(start.elapsed() >= WAIT);
    }

    #[tokio::test]
    async fn test_consume_wakes_on_publish() {
        let queue = Arc::new(MemoryQueue::new("jobs", 3));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.consume("c", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.publish(b"late".to_vec()).await.unwrap();

        let delivery = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.payload, b"late");
    }

    #[tokio::test]
    async fn test_release_does_not_count_attempt() {
        let queue = MemoryQueue::new("jobs", 3);
        queue.publish(b"job".to_vec()).await.unwrap();

        let first = queue.consume("c", WAIT).await.unwrap().unwrap();
        queue.release(&first).await.unwrap();

        let second = queue.consume("c", WAIT).await.unwrap().unwrap();
        assert_eq!(second.attempts, 0);
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_reject_until_dead_letter() {
        let queue = MemoryQueue::new("jobs", 3);
        queue.publish(b"poison".to_vec()).await.unwrap();

        let d = queue.consume("c", WAIT).await.unwrap().unwrap();
        assert_eq!(
            queue.reject(&d).await.unwrap(),
            RejectOutcome::Requeued { attempts: 1 }
        );

        let d = queue.consume("c", WAIT).await.unwrap().unwrap();
        assert_eq!(d.attempts, 1);
        assert_eq!(
            queue.reject(&d).await.unwrap(),
            RejectOutcome::Requeued { attempts: 2 }
        );

        let d = queue.consume("c", WAIT).await.unwrap().unwrap();
        assert_eq!(queue.reject(&d).await.unwrap(), RejectOutcome::DeadLettered);

        assert!(queue.consume("c", WAIT).await.unwrap().is_none());
        assert_eq!(queue.dead_letters(), vec![b"poison".to_vec()]);

        assert_eq!(queue.retry_dead_letters().await.unwrap(), 1);
        let d = queue.consume("c", WAIT).await.unwrap().unwrap();
        assert_eq!(d.attempts, 0);
        assert_eq!(queue.stats().await.unwrap().dead_letters, 0);
    }

    #[tokio::test]
    async fn test_extend_only_in_flight() {
        let queue = MemoryQueue::new("jobs", 3);
        queue.publish(b"job".to_vec()).await.unwrap();

        let d = queue.consume("c", WAIT).await.unwrap().unwrap();
        queue.extend("c", &d).await.unwrap();

        queue.ack(&d).await.unwrap();
        assert!(matches!(
            queue.extend("c", &d).await,
            Err(QueueError::UnknownDelivery(_))
        ));
    }

    #[tokio::test]
    async fn test_dead_letter_immediately() {
        let queue = MemoryQueue::new("jobs", 3);
        queue.publish(b"garbage".to_vec()).await.unwrap();

        let d = queue.consume("c", WAIT).await.unwrap().unwrap();
        queue.dead_letter(&d).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.dead_letters, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.in_flight, 0);
    }
}
