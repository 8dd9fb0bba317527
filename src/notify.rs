//! Observer callbacks
//!
//! Both the producer and the consumer report through the same pair of
//! optional hooks. Hooks are called from worker tasks and must not block.

use crate::error::ArchiverError;
use crate::job::Job;
use std::fmt;
use std::sync::Arc;

/// Called once per job outcome; `None` means success
pub type DoneFn = dyn Fn(&Job, Option<&ArchiverError>) + Send + Sync;

/// Called for source/queue errors not tied to a specific job
pub type QueueErrorFn = dyn Fn(&ArchiverError) + Send + Sync;

/// Optional observer hooks
#[derive(Clone, Default)]
pub struct Notifiers {
    done: Option<Arc<DoneFn>>,
    queue_error: Option<Arc<QueueErrorFn>>,
}

impl Notifiers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-job outcome hook
    pub fn with_done<F>(mut self, f: F) -> Self
    where
        F: Fn(&Job, Option<&ArchiverError>) + Send + Sync + 'static,
    {
        self.done = Some(Arc::new(f));
        self
    }

    /// Set the queue/source error hook
    pub fn with_queue_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&ArchiverError) + Send + Sync + 'static,
    {
        self.queue_error = Some(Arc::new(f));
        self
    }

    pub fn notify_done(&self, job: &Job, err: Option<&ArchiverError>) {
        if let Some(done) = &self.done {
            done(job, err);
        }
    }

    pub fn notify_queue_error(&self, err: &ArchiverError) {
        if let Some(queue_error) = &self.queue_error {
            queue_error(err);
        }
    }
}

impl fmt::Debug for Notifiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifiers")
            .field("done", &self.done.is_some())
            .field("queue_error", &self.queue_error.is_some())
            .finish()
    }
}
