//! Queue consumer
//!
//! Runs a fixed number of worker tasks that each consume one message at a
//! time and settle it according to the outcome of its unit of work:
//!
//! | Outcome                    | Queue           | Done notification |
//! |----------------------------|-----------------|-------------------|
//! | committed                  | ack             | success           |
//! | repository/root locked     | release         | none              |
//! | aborted by forced shutdown | release         | error             |
//! | retryable failure          | reject          | error             |
//! | permanent failure          | dead-letter     | error             |
//! | undecodable payload        | dead-letter     | queue error       |
//!
//! On queues whose leases expire, the lease of a message is renewed for as
//! long as its unit of work runs.

use super::pool::ArchiverWorkerPool;
use super::stats::{WorkerCounters, WorkerStats};
use crate::error::{ArchiverError, QueueError};
use crate::job::Job;
use crate::lifecycle::{Lifecycle, State};
use crate::notify::Notifiers;
use crate::queue::{Delivery, JobQueue, RejectOutcome};

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinHandle, JoinSet};

/// State shared by the worker tasks of one run
struct Inner {
    queue: Arc<dyn JobQueue>,
    pool: Arc<ArchiverWorkerPool>,
    notifiers: Notifiers,
    lifecycle: Arc<Lifecycle>,
    consumer_id: String,
    counters: Arc<WorkerCounters>,
}

/// Consumes jobs from a queue with a pool of workers
pub struct Consumer {
    queue: Arc<dyn JobQueue>,
    pool: Arc<ArchiverWorkerPool>,
    notifiers: Notifiers,
    lifecycle: Arc<Lifecycle>,
    consumer_id: String,
    counters: Arc<WorkerCounters>,
}

fn default_consumer_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{}-{}", host, std::process::id())
}

impl Consumer {
    pub fn new(queue: Arc<dyn JobQueue>, pool: ArchiverWorkerPool) -> Self {
        Self {
            queue,
            pool: Arc::new(pool),
            notifiers: Notifiers::default(),
            lifecycle: Arc::new(Lifecycle::new()),
            consumer_id: default_consumer_id(),
            counters: Arc::new(WorkerCounters::default()),
        }
    }

    pub fn with_notifiers(mut self, notifiers: Notifiers) -> Self {
        self.notifiers = notifiers;
        self
    }

    /// Name this process uses on the queue; workers append their index
    pub fn with_consumer_id(mut self, id: impl Into<String>) -> Self {
        self.consumer_id = id.into();
        self
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    pub fn state(&self) -> State {
        self.lifecycle.state()
    }

    /// Handle that can stop or abort this consumer from elsewhere
    pub fn stop_handle(&self) -> Arc<Lifecycle> {
        self.lifecycle.clone()
    }

    /// Run the workers until stopped. Only the first call runs them.
    pub async fn start(&self) -> WorkerStats {
        let start = Instant::now();

        if !self.lifecycle.try_start() {
            tracing::warn!(state = ?self.lifecycle.state(), "Consumer already started or stopped");
            return self.counters.snapshot(start.elapsed());
        }
        let _finish = self.lifecycle.run_guard();

        let workers = self.pool.config().workers.max(1);
        tracing::info!(
            queue = self.queue.name(),
            consumer = %self.consumer_id,
            workers,
            "Consumer started"
        );

        let inner = Arc::new(Inner {
            queue: self.queue.clone(),
            pool: self.pool.clone(),
            notifiers: self.notifiers.clone(),
            lifecycle: self.lifecycle.clone(),
            consumer_id: self.consumer_id.clone(),
            counters: self.counters.clone(),
        });

        let mut set = JoinSet::new();
        for id in 0..workers {
            set.spawn(Inner::worker_loop(inner.clone(), id));
        }

        while let Some(result) = set.join_next().await {
            if let Err(e) = result {
                tracing::error!("Worker task failed: {}", e);
            }
        }

        let stats = self.counters.snapshot(start.elapsed());
        tracing::info!(
            processed = stats.processed,
            failed = stats.failed,
            contended = stats.contended,
            dead_lettered = stats.dead_lettered,
            "Consumer stopped"
        );
        stats
    }

    /// Let in-flight units of work finish, then wait for every worker to exit
    pub async fn stop(&self) {
        self.lifecycle.stop().await;
    }

    /// Interrupt in-flight units of work (locks are still released), then
    /// wait for every worker to exit
    pub async fn abort(&self) {
        self.lifecycle.abort();
        self.lifecycle.stopped().await;
    }

    /// Counters so far
    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot(Duration::ZERO)
    }
}

impl Inner {
    async fn worker_loop(self: Arc<Self>, id: usize) {
        let name = format!("{}-{}", self.consumer_id, id);
        let shutdown = self.lifecycle.shutdown_token().clone();
        let wait = self.pool.config().consume_wait;

        tracing::debug!(worker = id, "Worker started");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = self.queue.consume(&name, wait) => next,
            };

            match next {
                Ok(Some(delivery)) => self.handle(id, &name, delivery).await,
                Ok(None) => {}
                Err(e) => {
                    WorkerCounters::incr(&self.counters.queue_errors);
                    let err = ArchiverError::Queue(e);
                    tracing::error!(worker = id, "Failed to consume: {}", err);
                    self.notifiers.notify_queue_error(&err);
                    self.pause(self.pool.config().error_backoff).await;
                }
            }
        }

        tracing::debug!(worker = id, "Worker stopped");
    }

    async fn handle(&self, worker: usize, name: &str, delivery: Delivery) {
        let job = match Job::decode(&delivery.payload) {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(worker, id = %delivery.id, "Dead-lettering undecodable message: {}", e);
                self.settle(self.queue.dead_letter(&delivery).await);
                WorkerCounters::incr(&self.counters.dead_lettered);
                self.notifiers.notify_queue_error(&ArchiverError::Job(e));
                return;
            }
        };
        let repository = job.repository_id();

        let lease = self.queue.lease_timeout().map(|timeout| {
            LeaseKeepalive::spawn(self.queue.clone(), name.to_string(), delivery.clone(), timeout)
        });
        let outcome = self.pool.process(&job, self.lifecycle.abort_token()).await;
        drop(lease);

        match outcome {
            Ok(root) => {
                self.settle(self.queue.ack(&delivery).await);
                WorkerCounters::incr(&self.counters.processed);
                tracing::info!(worker, %repository, %root, endpoint = %job.endpoint, "Archived repository");
                self.notifiers.notify_done(&job, None);
            }
            Err(e) if e.is_contention() => {
                tracing::debug!(worker, %repository, "Repository busy, releasing: {}", e);
                self.settle(self.queue.release(&delivery).await);
                WorkerCounters::incr(&self.counters.contended);
                self.pause(self.pool.config().contention_backoff).await;
            }
            Err(e @ ArchiverError::Aborted) => {
                tracing::warn!(worker, %repository, "Job aborted, releasing");
                self.settle(self.queue.release(&delivery).await);
                self.notifiers.notify_done(&job, Some(&e));
            }
            Err(e) => {
                WorkerCounters::incr(&self.counters.failed);
                self.pool.record_failure(&job, &e).await;

                if e.is_retryable() {
                    match self.queue.reject(&delivery).await {
                        Ok(RejectOutcome::Requeued { attempts }) => {
                            tracing::warn!(worker, %repository, attempts, "Job failed, requeued: {}", e);
                        }
                        Ok(RejectOutcome::DeadLettered) => {
                            WorkerCounters::incr(&self.counters.dead_lettered);
                            tracing::error!(worker, %repository, "Job failed, retries exhausted: {}", e);
                        }
                        Err(qe) => self.settle(Err(qe)),
                    }
                } else {
                    tracing::error!(worker, %repository, "Job failed permanently: {}", e);
                    self.settle(self.queue.dead_letter(&delivery).await);
                    WorkerCounters::incr(&self.counters.dead_lettered);
                }

                self.notifiers.notify_done(&job, Some(&e));
            }
        }
    }

    /// Report a failed queue settlement; the lease will expire on its own
    fn settle(&self, result: crate::error::QueueResult<()>) {
        if let Err(e) = result {
            WorkerCounters::incr(&self.counters.queue_errors);
            let err = ArchiverError::Queue(e);
            tracing::error!("Failed to settle delivery: {}", err);
            self.notifiers.notify_queue_error(&err);
        }
    }

    async fn pause(&self, backoff: Duration) {
        tokio::select! {
            _ = self.lifecycle.shutdown_token().cancelled() => {}
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}

/// Renews a delivery's lease every third of its timeout until dropped
struct LeaseKeepalive(JoinHandle<()>);

impl LeaseKeepalive {
    fn spawn(
        queue: Arc<dyn JobQueue>,
        consumer: String,
        delivery: Delivery,
        timeout: Duration,
    ) -> Self {
        let period = (timeout / 3).max(Duration::from_millis(1));

        Self(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match queue.extend(&consumer, &delivery).await {
                    Ok(()) => {}
                    Err(e @ QueueError::UnknownDelivery(_)) => {
                        tracing::warn!(id = %delivery.id, "Lease lost: {}", e);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(id = %delivery.id, "Failed to renew lease: {}", e);
                    }
                }
            }
        }))
    }
}

impl Drop for LeaseKeepalive {
    fn drop(&mut self) {
        self.0.abort();
    }
}
