//! The archival unit of work
//!
//! ```text
//! acquire "repo:<id>" ─► clone ─► acquire "root:<hash>" ─► begin ─► apply ─► commit ─► mark processed
//!        │                                                                                  │
//!        └──────────────── released on every path (success, error, deadline, abort) ◄───────┘
//! ```

use crate::cloner::TemporaryCloner;
use crate::db::RepositoryStore;
use crate::error::{ArchiverError, ConfigError, LockError, Result, StorageError};
use crate::job::Job;
use crate::lock::{HeldLock, Locker, DEFAULT_LOCK_TTL};
use crate::storage::{RootId, RootedTransactioner, Transaction};

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Upper bound on concurrent workers per consumer
pub const MAX_WORKERS: usize = 512;

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Concurrent workers
    pub workers: usize,
    /// Deadline for one unit of work
    pub timeout: Duration,
    /// Lock TTL; locks are renewed every third of it while held
    pub lock_ttl: Duration,
    /// Pause after releasing a contended job
    pub contention_backoff: Duration,
    /// Pause after a queue transport error
    pub error_backoff: Duration,
    /// How long one consume call waits for a message
    pub consume_wait: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            timeout: Duration::from_secs(10 * 60 * 60),
            lock_ttl: DEFAULT_LOCK_TTL,
            contention_backoff: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
            consume_wait: Duration::from_secs(1),
        }
    }
}

/// Runs archival units of work
pub struct ArchiverWorkerPool {
    locker: Arc<dyn Locker>,
    cloner: TemporaryCloner,
    transactioner: RootedTransactioner,
    store: Arc<dyn RepositoryStore>,
    config: PoolConfig,
}

impl ArchiverWorkerPool {
    pub fn new(
        locker: Arc<dyn Locker>,
        cloner: TemporaryCloner,
        transactioner: RootedTransactioner,
        store: Arc<dyn RepositoryStore>,
        config: PoolConfig,
    ) -> Self {
        Self {
            locker,
            cloner,
            transactioner,
            store,
            config,
        }
    }

    /// Set the number of concurrent workers
    pub fn set_worker_count(&mut self, count: usize) -> std::result::Result<(), ConfigError> {
        if count == 0 || count > MAX_WORKERS {
            return Err(ConfigError::InvalidWorkerCount {
                count,
                max: MAX_WORKERS,
            });
        }
        self.config.workers = count;
        Ok(())
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Archive one job under its repository lock and deadline.
    ///
    /// Returns the committed root. Every lock taken here is released before
    /// returning, whatever the outcome. The deadline and `abort` only cut the
    /// work short before the commit starts; a started commit always runs to
    /// completion so its outcome is what gets reported.
    pub async fn process(&self, job: &Job, abort: &CancellationToken) -> Result<RootId> {
        let repo_lock =
            HeldLock::acquire(self.locker.as_ref(), &job.lock_key(), self.config.lock_ttl).await?;
        let mut root_lock: Option<HeldLock> = None;

        let result = self.archive(job, abort, &repo_lock, &mut root_lock).await;

        if let Some(lock) = root_lock {
            let key = lock.key().to_string();
            if let Err(e) = lock.release().await {
                tracing::warn!(key = %key, "Failed to release root lock: {}", e);
            }
        }
        let key = repo_lock.key().to_string();
        if let Err(e) = repo_lock.release().await {
            tracing::warn!(key = %key, "Failed to release repository lock: {}", e);
        }

        result
    }

    async fn archive(
        &self,
        job: &Job,
        abort: &CancellationToken,
        repo_lock: &HeldLock,
        root_lock: &mut Option<HeldLock>,
    ) -> Result<RootId> {
        let timeout = self.config.timeout;
        let prepared = tokio::select! {
            biased;
            _ = abort.cancelled() => Err(ArchiverError::Aborted),
            outcome = tokio::time::timeout(timeout, self.prepare(job, root_lock)) => {
                outcome.unwrap_or(Err(ArchiverError::DeadlineExceeded(timeout)))
            }
        };
        let (root, tx) = prepared?;

        for lock in std::iter::once(repo_lock).chain(root_lock.as_ref()) {
            if lock.is_lost() {
                return Err(LockError::Lost {
                    key: lock.key().to_string(),
                }
                .into());
            }
        }

        // Detached so that dropping this future cannot interrupt the swap
        tokio::spawn(tx.commit())
            .await
            .map_err(|e| StorageError::Archive(format!("commit task failed: {}", e)))??;

        self.store.mark_processed(job, root.as_str()).await?;
        Ok(root)
    }

    /// Clone, take the root lock and stage the new contents
    async fn prepare(
        &self,
        job: &Job,
        root_lock: &mut Option<HeldLock>,
    ) -> Result<(RootId, Transaction)> {
        let fetched = self.cloner.clone_job(job).await?;
        let root = fetched.root().clone();

        // Forks share a root; their transactions must not interleave
        let lock = HeldLock::acquire(
            self.locker.as_ref(),
            &format!("root:{}", root),
            self.config.lock_ttl,
        )
        .await?;
        *root_lock = Some(lock);

        let tx = self.transactioner.begin(root.clone()).await?;
        tx.apply_from(fetched.path(), &job.repository_id().to_string())
            .await?;
        Ok((root, tx))
    }

    /// Record a failed attempt in the metadata sink
    pub async fn record_failure(&self, job: &Job, err: &ArchiverError) {
        if let Err(e) = self.store.mark_failed(job, &err.to_string()).await {
            tracing::error!(repository = %job.repository_id(), "Failed to record failure: {}", e);
        }
    }
}
