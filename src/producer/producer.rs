use crate::error::{ArchiverError, SourceError};
use crate::job::{Job, JobSource};
use crate::lifecycle::{Lifecycle, State};
use crate::notify::Notifiers;
use crate::queue::JobQueue;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Final statistics from a producer run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerStats {
    /// Jobs published
    pub published: u64,
    /// Jobs that failed to encode or publish
    pub failed: u64,
    /// Errors returned by the source
    pub source_errors: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    failed: AtomicU64,
    source_errors: AtomicU64,
}

/// Publishes jobs from a source onto a queue
pub struct Producer {
    source: Mutex<Box<dyn JobSource>>,
    queue: Arc<dyn JobQueue>,
    notifiers: Notifiers,
    lifecycle: Arc<Lifecycle>,
    idle_backoff: Duration,
    error_backoff: Duration,
    counters: Counters,
}

impl Producer {
    pub fn new(source: Box<dyn JobSource>, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            source: Mutex::new(source),
            queue,
            notifiers: Notifiers::default(),
            lifecycle: Arc::new(Lifecycle::new()),
            idle_backoff: Duration::from_millis(100),
            error_backoff: Duration::from_secs(1),
            counters: Counters::default(),
        }
    }

    pub fn with_notifiers(mut self, notifiers: Notifiers) -> Self {
        self.notifiers = notifiers;
        self
    }

    /// Pause after the source reports nothing available
    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }

    /// Pause after a source error
    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    pub fn state(&self) -> State {
        self.lifecycle.state()
    }

    /// Handle that can stop this producer from another task or a signal handler
    pub fn stop_handle(&self) -> Arc<Lifecycle> {
        self.lifecycle.clone()
    }

    /// Run the publish loop until stopped or the source closes.
    ///
    /// Only the first call runs the loop; later calls return immediately.
    pub async fn start(&self) -> ProducerStats {
        if !self.lifecycle.try_start() {
            tracing::warn!(state = ?self.lifecycle.state(), "Producer already started or stopped");
            return self.stats();
        }

        let _finish = self.lifecycle.run_guard();
        tracing::info!(queue = self.queue.name(), "Producer started");

        self.run().await;

        let stats = self.stats();
        tracing::info!(
            published = stats.published,
            failed = stats.failed,
            source_errors = stats.source_errors,
            "Producer stopped"
        );
        stats
    }

    /// Stop the loop and wait for the current iteration to finish
    pub async fn stop(&self) {
        self.lifecycle.stop().await;
    }

    /// Counters so far
    pub fn stats(&self) -> ProducerStats {
        ProducerStats {
            published: self.counters.published.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            source_errors: self.counters.source_errors.load(Ordering::Relaxed),
        }
    }

    async fn run(&self) {
        let shutdown = self.lifecycle.shutdown_token();
        let mut source = self.source.lock().await;

        while !shutdown.is_cancelled() {
            // Not raced against shutdown: a source may have leased upstream
            // input that it only settles before returning.
            match source.next().await {
                Ok(Some(job)) => self.publish(&job).await,
                Ok(None) => self.pause(self.idle_backoff).await,
                Err(SourceError::Closed) => {
                    tracing::info!("Job source closed");
                    break;
                }
                Err(e) => {
                    self.counters.source_errors.fetch_add(1, Ordering::Relaxed);
                    let err = ArchiverError::Source(e);
                    tracing::error!("Job source error: {}", err);
                    self.notifiers.notify_queue_error(&err);
                    self.pause(self.error_backoff).await;
                }
            }
        }
    }

    async fn publish(&self, job: &Job) {
        let result = match job.encode() {
            Ok(payload) => self.queue.publish(payload).await.map_err(ArchiverError::from),
            Err(e) => Err(ArchiverError::from(e)),
        };

        match &result {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(repository = %job.repository_id(), endpoint = %job.endpoint, "Published job");
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(repository = %job.repository_id(), error = %e, "Failed to publish job");
            }
        }

        self.notifiers.notify_done(job, result.as_ref().err());
    }

    async fn pause(&self, backoff: Duration) {
        if backoff.is_zero() {
            tokio::task::yield_now().await;
            return;
        }
        tokio::select! {
            _ = self.lifecycle.shutdown_token().cancelled() => {}
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}
