use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Final statistics from a consumer run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Jobs committed and acknowledged
    pub processed: u64,
    /// Jobs that failed (requeued or dead-lettered)
    pub failed: u64,
    /// Jobs released because their repository or root was locked elsewhere
    pub contended: u64,
    /// Messages moved to the dead-letter list
    pub dead_lettered: u64,
    /// Queue transport errors
    pub queue_errors: u64,
    /// Total duration
    pub duration: Duration,
}

/// Counters shared by all workers of one consumer
#[derive(Debug, Default)]
pub(crate) struct WorkerCounters {
    pub processed: AtomicU64,
    pub failed: AtomicU64,
    pub contended: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub queue_errors: AtomicU64,
}

impl WorkerCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, duration: Duration) -> WorkerStats {
        WorkerStats {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            queue_errors: self.queue_errors.load(Ordering::Relaxed),
            duration,
        }
    }
}
