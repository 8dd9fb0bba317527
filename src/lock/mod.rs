//! Distributed locking
//!
//! Keyed mutual exclusion with a TTL. Acquisition never blocks: a held key
//! fails with [`LockError::Held`], which callers treat as "try later". A lock
//! whose owner dies without releasing it expires after its TTL.
//!
//! Backends:
//! - [`LocalLocker`]: in-process, for a single node and tests
//! - [`RedisLocker`]: shared by every process pointed at the same Redis
//!
//! [`HeldLock`] wraps a handle with a keepalive task that renews the lock
//! every `ttl / 3` while work is running.

mod local;
mod redis_lock;

pub use local::LocalLocker;
pub use redis_lock::RedisLocker;

use crate::error::{LockError, LockResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Default lock TTL
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);

/// Lock service
#[async_trait::async_trait]
pub trait Locker: Send + Sync {
    /// Take exclusive ownership of `key` for `ttl`
    async fn acquire(&self, key: &str, ttl: Duration) -> LockResult<Box<dyn LockHandle>>;
}

/// Proof of ownership of one key
#[async_trait::async_trait]
pub trait LockHandle: Send + Sync {
    fn key(&self) -> &str;

    /// Extend ownership to `ttl` from now. Fails with `Lost` if the lock expired
    /// and was taken by someone else.
    async fn renew(&self, ttl: Duration) -> LockResult<()>;

    /// Give up ownership
    async fn release(&self) -> LockResult<()>;
}

/// Open a lock service from its configuration string.
///
/// `local:` selects the in-process backend, `redis://host[:port][/db]` the
/// Redis backend.
pub async fn from_url(config: &str) -> LockResult<Arc<dyn Locker>> {
    let config = config.trim();

    if config == "local:" || config == "local" || config == "local://" {
        return Ok(Arc::new(LocalLocker::new()));
    }

    if config.starts_with("redis://") || config.starts_with("rediss://") {
        return Ok(Arc::new(RedisLocker::connect(config).await?));
    }

    Err(LockError::InvalidConfig {
        config: config.to_string(),
        reason: "expected 'local:' or a redis:// URL".into(),
    })
}

/// A lock held for the duration of a unit of work
///
/// Renews itself in the background. Call [`HeldLock::release`] to give the
/// lock back; dropping it without releasing schedules a best-effort release.
pub struct HeldLock {
    handle: Arc<dyn LockHandle>,
    keepalive: Option<JoinHandle<()>>,
    lost: Arc<AtomicBool>,
    released: bool,
}

impl HeldLock {
    /// Acquire `key` and start renewing it every `ttl / 3`
    pub async fn acquire(locker: &dyn Locker, key: &str, ttl: Duration) -> LockResult<Self> {
        let handle: Arc<dyn LockHandle> = Arc::from(locker.acquire(key, ttl).await?);
        let lost = Arc::new(AtomicBool::new(false));

        let keepalive = {
            let handle = handle.clone();
            let lost = lost.clone();
            let period = (ttl / 3).max(Duration::from_millis(1));

            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                loop {
                    ticker.tick().await;
                    match handle.renew(ttl).await {
                        Ok(()) => {}
                        Err(e @ LockError::Lost { .. }) => {
                            tracing::warn!(key = handle.key(), "Lock lost: {}", e);
                            lost.store(true, Ordering::SeqCst);
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(key = handle.key(), "Failed to renew lock: {}", e);
                        }
                    }
                }
            })
        };

        Ok(Self {
            handle,
            keepalive: Some(keepalive),
            lost,
            released: false,
        })
    }

    pub fn key(&self) -> &str {
        self.handle.key()
    }

    /// Whether a renewal found the lock taken by someone else
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Stop renewing and release the lock
    pub async fn release(mut self) -> LockResult<()> {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
        }
        self.released = true;
        self.handle.release().await
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
        }
        if self.released {
            return;
        }

        // Dropped mid-hold (cancelled task); don't wait for the TTL
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let handle = self.handle.clone();
            runtime.spawn(async move {
                if let Err(e) = handle.release().await {
                    tracing::debug!(key = handle.key(), "Release on drop failed: {}", e);
                }
            });
        }
    }
}

impl std::fmt::Debug for HeldLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeldLock")
            .field("key", &self.key())
            .field("lost", &self.is_lost())
            .finish()
    }
}
