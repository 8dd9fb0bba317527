//! repo-archiver - Fleet-scale repository archiver
//!
//! Entry point for the CLI application.

use anyhow::{Context, Result};
use clap::Parser;
use repo_archiver::cloner::{GitFetcher, TemporaryCloner};
use repo_archiver::config::{
    CliArgs, Command, ConsumerConfig, OutputFormat, ProducerConfig, SourceConfig,
};
use repo_archiver::db::{RepositoryStatus, SqliteRepositoryStore};
use repo_archiver::job::{JobSource, MentionJobSource, UrlListSource};
use repo_archiver::lifecycle::Lifecycle;
use repo_archiver::queue::{self, DEFAULT_CLAIM_TIMEOUT, DEFAULT_MAX_RETRIES};
use repo_archiver::storage::{self, RootedTransactioner};
use repo_archiver::worker::{ArchiverWorkerPool, Consumer};
use repo_archiver::{lock, Notifiers, Producer};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code after a second interrupt forced shutdown
const EXIT_FORCED: u8 = 130;

fn main() -> ExitCode {
    let args = CliArgs::parse();
    setup_logging(args.verbose);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args)) {
        Ok(Shutdown::Clean) => ExitCode::SUCCESS,
        Ok(Shutdown::Forced) => ExitCode::from(EXIT_FORCED),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// How a long-running role ended
enum Shutdown {
    Clean,
    Forced,
}

async fn run(args: CliArgs) -> Result<Shutdown> {
    match &args.command {
        Command::Producer { .. } => {
            let config = ProducerConfig::from_args(&args).context("Invalid configuration")?;
            run_producer(config).await
        }
        Command::Consumer { .. } => {
            let config = ConsumerConfig::from_args(&args).context("Invalid configuration")?;
            run_consumer(config).await
        }
        Command::Status { format } => {
            show_status(&args, *format).await?;
            Ok(Shutdown::Clean)
        }
        Command::Retry => {
            let queue = queue::open(
                &args.queue,
                &args.queue_name,
                DEFAULT_MAX_RETRIES,
                DEFAULT_CLAIM_TIMEOUT,
            )
            .await
            .context("Failed to connect to queue")?;
            let count = queue
                .retry_dead_letters()
                .await
                .context("Failed to retry dead letters")?;
            println!("Requeued {} dead-lettered jobs", count);
            Ok(Shutdown::Clean)
        }
    }
}

async fn run_producer(config: ProducerConfig) -> Result<Shutdown> {
    let store = Arc::new(
        SqliteRepositoryStore::open(&config.database).context("Failed to open database")?,
    );
    let queue = queue::open(
        &config.queue_url,
        &config.queue_name,
        DEFAULT_MAX_RETRIES,
        DEFAULT_CLAIM_TIMEOUT,
    )
    .await
    .context("Failed to connect to queue")?;

    let source: Box<dyn JobSource> = match &config.source {
        SourceConfig::Mentions { queue: name } => {
            let mentions = queue::open(
                &config.queue_url,
                name,
                DEFAULT_MAX_RETRIES,
                DEFAULT_CLAIM_TIMEOUT,
            )
            .await
            .context("Failed to connect to mentions queue")?;
            Box::new(
                MentionJobSource::new(mentions, store, format!("producer-{}", std::process::id()))
                    .with_wait(config.poll_interval),
            )
        }
        SourceConfig::File { path, provider } => Box::new(
            UrlListSource::open(path, store, provider.clone())
                .await
                .with_context(|| format!("Failed to open '{}'", path.display()))?,
        ),
    };

    let notifiers = Notifiers::new()
        .with_done(|job, err| match err {
            None => info!(repository = %job.repository_id(), endpoint = %job.endpoint, "Published job"),
            Some(e) => warn!(repository = %job.repository_id(), "Failed to publish job: {}", e),
        })
        .with_queue_error(|e| warn!("Source error: {}", e));

    let producer = Producer::new(source, queue)
        .with_idle_backoff(config.poll_interval)
        .with_notifiers(notifiers);

    let forced = install_signal_handler(producer.stop_handle())?;

    info!(queue = %config.queue_name, "Starting producer");
    let stats = producer.start().await;
    info!(
        published = stats.published,
        failed = stats.failed,
        source_errors = stats.source_errors,
        "Producer finished"
    );

    Ok(shutdown_outcome(&forced))
}

async fn run_consumer(config: ConsumerConfig) -> Result<Shutdown> {
    if config.temp_dir_clean {
        match tokio::fs::remove_dir_all(&config.temp_dir).await {
            Ok(()) => info!(dir = %config.temp_dir.display(), "Cleaned temporary directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to clean '{}'", config.temp_dir.display())
                })
            }
        }
    }
    let work_dir = config.process_temp_dir();
    tokio::fs::create_dir_all(&work_dir)
        .await
        .with_context(|| format!("Failed to create '{}'", work_dir.display()))?;

    // Unreachable storage or lock backend is fatal at startup
    let fs = storage::open(&config.root_repositories_dir)
        .context("Invalid root repositories location")?;
    fs.probe()
        .await
        .with_context(|| format!("Storage '{}' is unreachable", config.root_repositories_dir))?;
    let locker = lock::from_url(&config.locking)
        .await
        .context("Failed to connect to locking service")?;

    let store = Arc::new(
        SqliteRepositoryStore::open(&config.database).context("Failed to open database")?,
    );
    let queue = queue::open(
        &config.queue_url,
        &config.queue_name,
        config.max_retries,
        config.claim_timeout,
    )
    .await
    .context("Failed to connect to queue")?;

    let cloner = TemporaryCloner::new(Arc::new(GitFetcher::new()), work_dir.join("clones"));
    let transactioner =
        RootedTransactioner::new(fs, work_dir.join("workspaces"), config.bucket_size);
    let pool = ArchiverWorkerPool::new(locker, cloner, transactioner, store, config.pool_config());

    let notifiers = Notifiers::new().with_queue_error(|e| warn!("Queue error: {}", e));
    let consumer = Consumer::new(queue, pool).with_notifiers(notifiers);

    let forced = install_signal_handler(consumer.stop_handle())?;

    info!(
        workers = config.workers,
        timeout = ?config.timeout,
        claim_timeout = ?config.claim_timeout,
        storage = %config.root_repositories_dir,
        bucket_size = config.bucket_size,
        locking = %config.locking,
        "Starting consumer"
    );
    let stats = consumer.start().await;
    info!(
        processed = stats.processed,
        failed = stats.failed,
        contended = stats.contended,
        dead_lettered = stats.dead_lettered,
        queue_errors = stats.queue_errors,
        duration = ?stats.duration,
        "Consumer finished"
    );

    if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
        warn!(dir = %work_dir.display(), "Failed to remove temporary directory: {}", e);
    }

    Ok(shutdown_outcome(&forced))
}

async fn show_status(args: &CliArgs, format: OutputFormat) -> Result<()> {
    let queue = queue::open(
        &args.queue,
        &args.queue_name,
        DEFAULT_MAX_RETRIES,
        DEFAULT_CLAIM_TIMEOUT,
    )
    .await
    .context("Failed to connect to queue")?;
    let stats = queue.stats().await.context("Failed to read queue stats")?;

    let mut repositories = serde_json::Map::new();
    if args.database.exists() {
        let store =
            SqliteRepositoryStore::open(&args.database).context("Failed to open database")?;
        for status in [
            RepositoryStatus::Pending,
            RepositoryStatus::Processed,
            RepositoryStatus::Failed,
        ] {
            let count = store.count_by_status(status).await?;
            repositories.insert(status.as_str().to_string(), count.into());
        }
    }

    match format {
        OutputFormat::Json => {
            let doc = serde_json::json!({
                "queue": args.queue_name,
                "stats": stats,
                "repositories": repositories,
            });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        OutputFormat::Text => {
            println!("Queue '{}'", args.queue_name);
            println!("  pending:      {}", stats.pending);
            println!("  in flight:    {}", stats.in_flight);
            println!("  dead letters: {}", stats.dead_letters);
            println!("  published:    {}", stats.published);
            println!("  acked:        {}", stats.acked);
            if !repositories.is_empty() {
                println!("Repositories");
                for (status, count) in &repositories {
                    println!("  {:<13} {}", format!("{}:", status), count);
                }
            }
        }
    }

    Ok(())
}

/// First interrupt stops gracefully; the second aborts work in progress.
/// Either way the caller still waits for every lock to be released.
fn install_signal_handler(lifecycle: Arc<Lifecycle>) -> Result<Arc<AtomicBool>> {
    let forced = Arc::new(AtomicBool::new(false));
    let signals = AtomicUsize::new(0);

    let flag = forced.clone();
    ctrlc::set_handler(move || {
        if signals.fetch_add(1, Ordering::SeqCst) == 0 {
            eprintln!("\nInterrupt received, finishing in-flight jobs (again to abort)...");
            lifecycle.request_stop();
        } else {
            eprintln!("\nSecond interrupt, aborting in-flight jobs...");
            flag.store(true, Ordering::SeqCst);
            lifecycle.abort();
        }
    })
    .context("Failed to set signal handler")?;

    Ok(forced)
}

fn shutdown_outcome(forced: &AtomicBool) -> Shutdown {
    if forced.load(Ordering::SeqCst) {
        Shutdown::Forced
    } else {
        Shutdown::Clean
    }
}

fn setup_logging(verbose: bool) {
    let default = if verbose {
        "repo_archiver=debug,warn"
    } else {
        "repo_archiver=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
