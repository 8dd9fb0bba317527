//! Integration tests for repo-archiver
//!
//! Drive the whole pipeline in process: producer, in-memory queue, consumer
//! with the local locker, a local storage directory and an in-memory SQLite
//! metadata store. The fetcher is faked; no git or Redis server is needed.

use repo_archiver::cloner::{Fetcher, TemporaryCloner};
use repo_archiver::db::{RepositoryStatus, RepositoryStore, SqliteRepositoryStore};
use repo_archiver::error::{ArchiverError, CloneError, CloneResult, QueueResult, SourceError};
use repo_archiver::job::{Job, JobSource, RepositoryId};
use repo_archiver::lock::{LocalLocker, Locker};
use repo_archiver::queue::{Delivery, JobQueue, MemoryQueue, QueueStats, RejectOutcome};
use repo_archiver::storage::{LocalFs, RootId, RootedTransactioner};
use repo_archiver::worker::{ArchiverWorkerPool, Consumer, PoolConfig};
use repo_archiver::{Notifiers, Producer, State};

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const ROOT: &str = "abcdef0123";

/// Writes the endpoint into the clone and reports a fixed root.
///
/// Tracks how many fetches of the same endpoint run at once.
struct FakeFetcher {
    delay: Duration,
    fail: bool,
    started: AtomicUsize,
    active: Mutex<HashMap<String, usize>>,
    max_overlap: AtomicUsize,
}

impl FakeFetcher {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            fail: false,
            started: AtomicUsize::new(0),
            active: Mutex::new(HashMap::new()),
            max_overlap: AtomicUsize::new(0),
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Duration::ZERO)
        }
    }
}

#[async_trait::async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, endpoint: &str, dest: &Path) -> CloneResult<RootId> {
        self.started.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(CloneError::FetchFailed {
                endpoint: endpoint.to_string(),
                stderr: "connection reset by peer".into(),
            });
        }

        {
            let mut active = self.active.lock();
            let count = active.entry(endpoint.to_string()).or_insert(0);
            *count += 1;
            self.max_overlap.fetch_max(*count, Ordering::SeqCst);
        }

        tokio::time::sleep(self.delay).await;
        let written = tokio::fs::write(dest.join("HEAD"), endpoint).await;

        if let Some(count) = self.active.lock().get_mut(endpoint) {
            *count -= 1;
        }
        written?;
        ROOT.parse()
    }
}

/// Yields a fixed list of jobs, then nothing
struct VecSource(VecDeque<Job>);

#[async_trait::async_trait]
impl JobSource for VecSource {
    async fn next(&mut self) -> Result<Option<Job>, SourceError> {
        Ok(self.0.pop_front())
    }
}

/// Fails on every call
struct BrokenSource;

#[async_trait::async_trait]
impl JobSource for BrokenSource {
    async fn next(&mut self) -> Result<Option<Job>, SourceError> {
        Err(SourceError::Io(std::io::Error::other("upstream unavailable")))
    }
}

/// Outcomes reported through the done hook
#[derive(Default)]
struct Outcomes {
    done: Mutex<Vec<(RepositoryId, Option<String>)>>,
    queue_errors: AtomicUsize,
}

impl Outcomes {
    fn notifiers(self: &Arc<Self>) -> Notifiers {
        let done = self.clone();
        let errors = self.clone();
        Notifiers::new()
            .with_done(move |job, err| {
                done.done
                    .lock()
                    .push((job.repository_id(), err.map(|e| e.to_string())));
            })
            .with_queue_error(move |_| {
                errors.queue_errors.fetch_add(1, Ordering::SeqCst);
            })
    }

    fn done_count(&self) -> usize {
        self.done.lock().len()
    }
}

/// MemoryQueue with expiring leases that counts renewals
struct LeasedQueue {
    inner: Arc<MemoryQueue>,
    lease: Duration,
    renewals: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl JobQueue for LeasedQueue {
    fn name(&self) -> &str {
        self.inner.name()
    }
    async fn publish(&self, payload: Vec<u8>) -> QueueResult<()> {
        self.inner.publish(payload).await
    }
    async fn consume(&self, consumer: &str, wait: Duration) -> QueueResult<Option<Delivery>> {
        self.inner.consume(consumer, wait).await
    }
    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        self.inner.ack(delivery).await
    }
    async fn release(&self, delivery: &Delivery) -> QueueResult<()> {
        self.inner.release(delivery).await
    }
    async fn reject(&self, delivery: &Delivery) -> QueueResult<RejectOutcome> {
        self.inner.reject(delivery).await
    }
    async fn dead_letter(&self, delivery: &Delivery) -> QueueResult<()> {
        self.inner.dead_letter(delivery).await
    }
    fn lease_timeout(&self) -> Option<Duration> {
        Some(self.lease)
    }
    async fn extend(&self, consumer: &str, delivery: &Delivery) -> QueueResult<()> {
        self.renewals.fetch_add(1, Ordering::SeqCst);
        self.inner.extend(consumer, delivery).await
    }
    async fn retry_dead_letters(&self) -> QueueResult<u64> {
        self.inner.retry_dead_letters().await
    }
    async fn stats(&self) -> QueueResult<QueueStats> {
        self.inner.stats().await
    }
}

struct Pipeline {
    _dirs: Vec<TempDir>,
    storage: PathBuf,
    queue: Arc<MemoryQueue>,
    locker: LocalLocker,
    store: Arc<SqliteRepositoryStore>,
    fetcher: Arc<FakeFetcher>,
    outcomes: Arc<Outcomes>,
    consumer: Arc<Consumer>,
}

fn pipeline(fetcher: FakeFetcher, workers: usize, max_retries: u32) -> Pipeline {
    pipeline_with(fetcher, workers, max_retries, |queue| -> Arc<dyn JobQueue> { queue })
}

/// Pipeline whose consumer sees the queue through `wrap`
fn pipeline_with(
    fetcher: FakeFetcher,
    workers: usize,
    max_retries: u32,
    wrap: impl FnOnce(Arc<MemoryQueue>) -> Arc<dyn JobQueue>,
) -> Pipeline {
    let storage = tempfile::tempdir().unwrap();
    let temp = tempfile::tempdir().unwrap();
    let queue = Arc::new(MemoryQueue::new("jobs", max_retries));
    let locker = LocalLocker::new();
    let store = Arc::new(SqliteRepositoryStore::open_in_memory().unwrap());
    let fetcher = Arc::new(fetcher);
    let outcomes = Arc::new(Outcomes::default());

    let pool = ArchiverWorkerPool::new(
        Arc::new(locker.clone()),
        TemporaryCloner::new(fetcher.clone(), temp.path().join("clones")),
        RootedTransactioner::new(
            Arc::new(LocalFs::new(storage.path())),
            temp.path().join("workspaces"),
            2,
        ),
        store.clone(),
        PoolConfig {
            workers,
            timeout: Duration::from_secs(10),
            contention_backoff: Duration::from_millis(20),
            error_backoff: Duration::from_millis(20),
            consume_wait: Duration::from_millis(20),
            ..PoolConfig::default()
        },
    );
    let consumer = Arc::new(
        Consumer::new(wrap(queue.clone()), pool)
            .with_consumer_id("test")
            .with_notifiers(outcomes.notifiers()),
    );

    Pipeline {
        storage: storage.path().to_path_buf(),
        _dirs: vec![storage, temp],
        queue,
        locker,
        store,
        fetcher,
        outcomes,
        consumer,
    }
}

/// Poll `cond` until it holds or five seconds pass
async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn produce(queue: Arc<MemoryQueue>, jobs: Vec<Job>) {
    let expected = jobs.len() as u64;
    let producer = Arc::new(Producer::new(Box::new(VecSource(jobs.into())), queue)
        .with_idle_backoff(Duration::from_millis(10)));

    let runner = {
        let producer = producer.clone();
        tokio::spawn(async move { producer.start().await })
    };
    wait_until(|| producer.stats().published == expected).await;
    producer.stop().await;

    let stats = runner.await.unwrap();
    assert_eq!(stats.published, expected);
    assert_eq!(stats.failed, 0);
}

fn archives(storage: &Path) -> Vec<String> {
    let mut names = Vec::new();
    for bucket in std::fs::read_dir(storage).unwrap() {
        let bucket = bucket.unwrap().path();
        for entry in std::fs::read_dir(&bucket).unwrap() {
            names.push(entry.unwrap().file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    names
}

#[tokio::test]
async fn test_single_job_processed() {
    let p = pipeline(FakeFetcher::new(Duration::ZERO), 1, 3);
    let id = RepositoryId::new();
    produce(p.queue.clone(), vec![Job::new(id, "https://example.com/a", "test")]).await;

    let runner = {
        let consumer = p.consumer.clone();
        tokio::spawn(async move { consumer.start().await })
    };
    wait_until(|| p.outcomes.done_count() == 1).await;
    p.consumer.stop().await;
    let stats = runner.await.unwrap();

    assert_eq!(p.outcomes.done.lock().as_slice(), &[(id, None)]);
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.failed, 0);

    let record = p.store.get(id).await.unwrap().unwrap();
    assert_eq!(record.status, RepositoryStatus::Processed);
    assert_eq!(record.root.as_deref(), Some(ROOT));

    assert_eq!(archives(&p.storage), vec![format!("{}.zip", ROOT)]);
    assert_eq!(p.locker.held_count(), 0);

    let queue_stats = p.queue.stats().await.unwrap();
    assert_eq!(queue_stats.acked, 1);
    assert_eq!(queue_stats.pending + queue_stats.in_flight, 0);
}

#[tokio::test]
async fn test_duplicate_jobs_never_overlap() {
    let p = pipeline(FakeFetcher::new(Duration::from_millis(50)), 2, 3);
    let id = RepositoryId::new();
    produce(
        p.queue.clone(),
        vec![
            Job::new(id, "https://example.com/a", "test"),
            Job::new(id, "https://example.com/a", "test"),
        ],
    )
    .await;

    let runner = {
        let consumer = p.consumer.clone();
        tokio::spawn(async move { consumer.start().await })
    };
    wait_until(|| p.outcomes.done_count() == 2).await;
    p.consumer.stop().await;
    let stats = runner.await.unwrap();

    let done = p.outcomes.done.lock().clone();
    assert!(done.iter().all(|(job, err)| *job == id && err.is_none()));
    assert_eq!(stats.processed, 2);
    assert_eq!(p.fetcher.max_overlap.load(Ordering::SeqCst), 1);

    // One final version, no staging leftovers
    assert_eq!(archives(&p.storage), vec![format!("{}.zip", ROOT)]);
    assert_eq!(p.locker.held_count(), 0);
}

#[tokio::test]
async fn test_failing_source_keeps_producer_running() {
    let queue = Arc::new(MemoryQueue::new("jobs", 3));
    let outcomes = Arc::new(Outcomes::default());
    let producer = Arc::new(
        Producer::new(Box::new(BrokenSource), queue.clone())
            .with_error_backoff(Duration::from_millis(5))
            .with_notifiers(outcomes.notifiers()),
    );

    let runner = {
        let producer = producer.clone();
        tokio::spawn(async move { producer.start().await })
    };
    wait_until(|| outcomes.queue_errors.load(Ordering::SeqCst) >= 3).await;
    assert!(producer.is_running());

    producer.stop().await;
    assert_eq!(producer.state(), State::Stopped);
    let stats = runner.await.unwrap();

    assert_eq!(
        stats.source_errors,
        outcomes.queue_errors.load(Ordering::SeqCst) as u64
    );
    assert_eq!(stats.published, 0);
    assert_eq!(outcomes.done_count(), 0);
    assert_eq!(queue.stats().await.unwrap().published, 0);
}

#[tokio::test]
async fn test_abandoned_lock_expires() {
    let locker = LocalLocker::new();
    let ttl = Duration::from_millis(100);

    // Owner dies without releasing
    let handle = locker.acquire("repo:abandoned", ttl).await.unwrap();
    std::mem::forget(handle);

    let err = locker.acquire("repo:abandoned", ttl).await.err().unwrap();
    assert!(err.is_contention());

    tokio::time::sleep(ttl + Duration::from_millis(50)).await;
    let handle = locker.acquire("repo:abandoned", ttl).await.unwrap();
    handle.release().await.unwrap();
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_job() {
    let p = pipeline(FakeFetcher::new(Duration::from_millis(200)), 1, 3);
    let id = RepositoryId::new();
    produce(p.queue.clone(), vec![Job::new(id, "https://example.com/a", "test")]).await;

    let runner = {
        let consumer = p.consumer.clone();
        tokio::spawn(async move { consumer.start().await })
    };
    wait_until(|| p.fetcher.started.load(Ordering::SeqCst) == 1).await;

    p.consumer.stop().await;
    assert_eq!(p.consumer.state(), State::Stopped);

    // The job finished before stop returned
    assert_eq!(p.outcomes.done.lock().as_slice(), &[(id, None)]);
    assert_eq!(p.locker.held_count(), 0);
    assert_eq!(runner.await.unwrap().processed, 1);
}

#[tokio::test]
async fn test_abort_releases_locks_and_requeues() {
    let p = pipeline(FakeFetcher::new(Duration::from_secs(30)), 1, 3);
    let id = RepositoryId::new();
    produce(p.queue.clone(), vec![Job::new(id, "https://example.com/a", "test")]).await;

    let runner = {
        let consumer = p.consumer.clone();
        tokio::spawn(async move { consumer.start().await })
    };
    wait_until(|| p.fetcher.started.load(Ordering::SeqCst) == 1).await;

    p.consumer.abort().await;
    assert_eq!(p.consumer.state(), State::Stopped);
    assert_eq!(p.locker.held_count(), 0);

    let done = p.outcomes.done.lock().clone();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].1.as_deref(), Some(ArchiverError::Aborted.to_string().as_str()));

    // Released without counting an attempt
    let stats = p.queue.stats().await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.dead_letters, 0);
    assert!(archives(&p.storage).is_empty());

    runner.await.unwrap();
}

#[tokio::test]
async fn test_undecodable_message_dead_lettered() {
    let p = pipeline(FakeFetcher::new(Duration::ZERO), 1, 3);
    p.queue.publish(b"not a job".to_vec()).await.unwrap();

    let runner = {
        let consumer = p.consumer.clone();
        tokio::spawn(async move { consumer.start().await })
    };
    wait_until(|| p.queue.dead_letters().len() == 1).await;
    p.consumer.stop().await;
    let stats = runner.await.unwrap();

    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(p.outcomes.queue_errors.load(Ordering::SeqCst), 1);
    assert_eq!(p.outcomes.done_count(), 0);
    assert_eq!(p.fetcher.started.load(Ordering::SeqCst), 0);
    assert_eq!(p.queue.dead_letters(), vec![b"not a job".to_vec()]);
}

#[tokio::test]
async fn test_long_job_keeps_its_lease() {
    let renewals = Arc::new(AtomicUsize::new(0));
    let p = pipeline_with(FakeFetcher::new(Duration::from_millis(400)), 1, 3, {
        let renewals = renewals.clone();
        move |queue| -> Arc<dyn JobQueue> {
            Arc::new(LeasedQueue {
                inner: queue,
                lease: Duration::from_millis(60),
                renewals,
            })
        }
    });
    let id = RepositoryId::new();
    produce(p.queue.clone(), vec![Job::new(id, "https://example.com/a", "test")]).await;

    let runner = {
        let consumer = p.consumer.clone();
        tokio::spawn(async move { consumer.start().await })
    };
    wait_until(|| p.outcomes.done_count() == 1).await;

    // Renewed every 20ms while the 400ms fetch ran
    let renewed = renewals.load(Ordering::SeqCst);
    assert!(renewed >= 5, "only {} renewals", renewed);
    assert_eq!(p.outcomes.done.lock().as_slice(), &[(id, None)]);

    // Renewal stops with the job
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(renewals.load(Ordering::SeqCst), renewed);

    p.consumer.stop().await;
    assert_eq!(runner.await.unwrap().processed, 1);
    assert_eq!(p.queue.stats().await.unwrap().acked, 1);
}

#[tokio::test]
async fn test_retries_exhausted() {
    let p = pipeline(FakeFetcher::failing(), 1, 3);
    let id = RepositoryId::new();
    produce(p.queue.clone(), vec![Job::new(id, "https://example.com/a", "test")]).await;

    let runner = {
        let consumer = p.consumer.clone();
        tokio::spawn(async move { consumer.start().await })
    };
    wait_until(|| p.queue.dead_letters().len() == 1).await;
    p.consumer.stop().await;
    let stats = runner.await.unwrap();

    // One failed attempt per allowed retry, each reported
    assert_eq!(p.fetcher.started.load(Ordering::SeqCst), 3);
    assert_eq!(stats.failed, 3);
    assert_eq!(stats.dead_lettered, 1);
    let done = p.outcomes.done.lock().clone();
    assert_eq!(done.len(), 3);
    assert!(done.iter().all(|(job, err)| *job == id && err.is_some()));

    let record = p.store.get(id).await.unwrap().unwrap();
    assert_eq!(record.status, RepositoryStatus::Failed);
    assert!(record.last_error.unwrap().contains("connection reset"));
    assert_eq!(p.locker.held_count(), 0);

    // Dead letters can be put back
    assert_eq!(p.queue.retry_dead_letters().await.unwrap(), 1);
    assert_eq!(p.queue.stats().await.unwrap().pending, 1);
}
