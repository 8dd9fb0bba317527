//! Configuration types for repo-archiver
//!
//! Defines CLI arguments, the validated runtime configuration for each
//! process role, and duration parsing.

use crate::error::ConfigError;
use crate::queue::{DEFAULT_CLAIM_TIMEOUT, DEFAULT_MAX_RETRIES};
use crate::worker::{PoolConfig, MAX_WORKERS};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// Longest bucket prefix; a root hash is at most 64 characters
const MAX_BUCKET_SIZE: usize = 64;

/// Fleet-scale repository archiver
#[derive(Parser, Debug, Clone)]
#[command(
    name = "repo-archiver",
    version,
    about = "Fleet-scale repository archiver",
    long_about = "Archives large numbers of repositories into sharded storage.\n\n\
                  Runs in one of two roles:\n\
                  1. Producer: turns repository mentions into jobs on the queue\n\
                  2. Consumer: clones each job's repository under a distributed\n   \
                  lock and commits it to rooted storage\n\n\
                  Scales horizontally by adding more consumers.",
    after_help = "EXAMPLES:\n    \
        # Publish jobs for every endpoint in a file\n    \
        repo-archiver producer --source file --file repos.txt\n\n    \
        # Run 8 workers against a sharded local store with Redis locking\n    \
        repo-archiver consumer -w 8 --locking redis://localhost:6379 \\\n        \
        --root-repositories-dir /srv/rooted --bucket-size 2\n\n    \
        # Check queue status\n    \
        repo-archiver status --format json"
)]
pub struct CliArgs {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Command,

    /// Queue broker URL (redis://... or memory:)
    #[arg(
        long,
        env = "ARCHIVER_QUEUE",
        default_value = "redis://127.0.0.1:6379",
        global = true
    )]
    pub queue: String,

    /// Name of the job queue
    #[arg(long, env = "ARCHIVER_QUEUE_NAME", default_value = "jobs", global = true)]
    pub queue_name: String,

    /// Repository metadata database
    #[arg(
        long,
        env = "ARCHIVER_DATABASE",
        default_value = "archiver.db",
        value_name = "FILE",
        global = true
    )]
    pub database: PathBuf,

    /// Verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

/// Where the producer takes its jobs from
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Mentions consumed from an upstream queue
    Mentions,
    /// Endpoints listed in a text file
    File,
}

/// Status output format
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Publish jobs to the queue
    Producer {
        /// Job source
        #[arg(long, value_enum, default_value_t = SourceKind::Mentions)]
        source: SourceKind,

        /// Upstream queue of mentions (for --source mentions)
        #[arg(long, default_value = "mentions", value_name = "NAME")]
        mentions_queue: String,

        /// File with one endpoint per line (for --source file)
        #[arg(long, value_name = "PATH")]
        file: Option<PathBuf>,

        /// Provider recorded for endpoints read from a file
        #[arg(long, default_value = "git", value_name = "NAME")]
        provider: String,

        /// Pause when the source has nothing to offer (e.g. "500ms", "1s")
        #[arg(long, default_value = "1s", value_name = "DURATION")]
        poll_interval: String,
    },

    /// Consume jobs and archive repositories
    Consumer {
        /// Locking service ("local:" or redis://host:port)
        #[arg(long, env = "ARCHIVER_LOCKING", default_value = "local:", value_name = "URL")]
        locking: String,

        /// Lock TTL; held locks are renewed every third of it
        #[arg(long, default_value = "1m", value_name = "DURATION")]
        lock_ttl: String,

        /// Number of concurrent workers
        #[arg(short = 'w', long, env = "ARCHIVER_WORKERS", default_value_t = 1, value_name = "NUM")]
        workers: usize,

        /// Deadline for archiving one repository
        #[arg(long, env = "ARCHIVER_TIMEOUT", default_value = "10h", value_name = "DURATION")]
        timeout: String,

        /// Rooted storage (local path, file://, s3://, gs://, az://, memory://)
        #[arg(long, env = "ARCHIVER_ROOT_REPOSITORIES_DIR", value_name = "LOCATION")]
        root_repositories_dir: String,

        /// Root hash characters used to shard storage directories (0 = flat)
        #[arg(long, default_value_t = 0, value_name = "NUM")]
        bucket_size: usize,

        /// Directory for clones and transaction workspaces
        #[arg(long, env = "ARCHIVER_TEMP_DIR", default_value = "/tmp/repo-archiver", value_name = "DIR")]
        temp_dir: PathBuf,

        /// Remove the temporary directory at startup
        #[arg(long)]
        temp_dir_clean: bool,

        /// Attempts before a failing job is dead-lettered
        #[arg(long, default_value_t = DEFAULT_MAX_RETRIES, value_name = "NUM")]
        max_retries: u32,

        /// Idle time after which another consumer takes over a job; leases
        /// are renewed every third of it while the job runs
        #[arg(long, env = "ARCHIVER_CLAIM_TIMEOUT", default_value = "5m", value_name = "DURATION")]
        claim_timeout: String,
    },

    /// Show queue and repository statistics
    Status {
        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Move dead-lettered jobs back to the queue
    Retry,
}

/// Parse a duration such as "500ms", "30s", "10m", "1h30m" or "2d".
///
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let input = s.trim();
    let invalid = |reason: &str| ConfigError::InvalidDuration {
        value: s.to_string(),
        reason: reason.to_string(),
    };

    if input.is_empty() {
        return Err(invalid("empty duration"));
    }
    if let Ok(secs) = input.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(invalid("expected a number"));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| invalid("number out of range"))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = match &rest[..unit_len] {
            "ms" => Duration::from_millis(1),
            "s" => Duration::from_secs(1),
            "m" => Duration::from_secs(60),
            "h" => Duration::from_secs(60 * 60),
            "d" => Duration::from_secs(24 * 60 * 60),
            "" => return Err(invalid("missing unit")),
            _ => return Err(invalid("unknown unit (expected ms, s, m, h or d)")),
        };
        rest = &rest[unit_len..];

        let part = u32::try_from(value)
            .ok()
            .and_then(|v| unit.checked_mul(v))
            .ok_or_else(|| invalid("duration too large"))?;
        total = total
            .checked_add(part)
            .ok_or_else(|| invalid("duration too large"))?;
    }

    Ok(total)
}

/// Validated producer source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceConfig {
    /// Consume mentions from this queue
    Mentions { queue: String },
    /// Read endpoints from this file
    File { path: PathBuf, provider: String },
}

/// Validated producer configuration
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Queue broker URL
    pub queue_url: String,
    /// Job queue name
    pub queue_name: String,
    /// Metadata database path
    pub database: PathBuf,
    /// Job source
    pub source: SourceConfig,
    /// Pause when the source is idle
    pub poll_interval: Duration,
}

impl ProducerConfig {
    /// Create and validate configuration from CLI arguments
    pub fn from_args(args: &CliArgs) -> Result<Self, ConfigError> {
        let Command::Producer {
            source,
            mentions_queue,
            file,
            provider,
            poll_interval,
        } = &args.command
        else {
            return Err(ConfigError::MissingRequired("producer subcommand".into()));
        };

        let source = match source {
            SourceKind::Mentions => {
                if mentions_queue.trim().is_empty() {
                    return Err(ConfigError::InvalidValue {
                        name: "--mentions-queue",
                        reason: "queue name is empty".into(),
                    });
                }
                SourceConfig::Mentions {
                    queue: mentions_queue.clone(),
                }
            }
            SourceKind::File => {
                let path = file
                    .clone()
                    .ok_or_else(|| ConfigError::MissingRequired("--file for --source file".into()))?;
                if !path.is_file() {
                    return Err(ConfigError::InvalidPath {
                        path,
                        reason: "not a readable file".into(),
                    });
                }
                SourceConfig::File {
                    path,
                    provider: provider.clone(),
                }
            }
        };

        Ok(Self {
            queue_url: args.queue.clone(),
            queue_name: args.queue_name.clone(),
            database: args.database.clone(),
            source,
            poll_interval: parse_duration(poll_interval)?,
        })
    }
}

/// Validated consumer configuration
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Queue broker URL
    pub queue_url: String,
    /// Job queue name
    pub queue_name: String,
    /// Metadata database path
    pub database: PathBuf,
    /// Locking service URL
    pub locking: String,
    /// Lock TTL
    pub lock_ttl: Duration,
    /// Concurrent workers
    pub workers: usize,
    /// Deadline per job
    pub timeout: Duration,
    /// Rooted storage location
    pub root_repositories_dir: String,
    /// Storage shard prefix length
    pub bucket_size: usize,
    /// Temporary directory
    pub temp_dir: PathBuf,
    /// Remove the temporary directory at startup
    pub temp_dir_clean: bool,
    /// Attempts before dead-lettering
    pub max_retries: u32,
    /// Lease expiry on queues whose leases expire
    pub claim_timeout: Duration,
}

impl ConsumerConfig {
    /// Create and validate configuration from CLI arguments
    pub fn from_args(args: &CliArgs) -> Result<Self, ConfigError> {
        let Command::Consumer {
            locking,
            lock_ttl,
            workers,
            timeout,
            root_repositories_dir,
            bucket_size,
            temp_dir,
            temp_dir_clean,
            max_retries,
            claim_timeout,
        } = &args.command
        else {
            return Err(ConfigError::MissingRequired("consumer subcommand".into()));
        };

        if *workers == 0 || *workers > MAX_WORKERS {
            return Err(ConfigError::InvalidWorkerCount {
                count: *workers,
                max: MAX_WORKERS,
            });
        }

        let timeout = parse_duration(timeout)?;
        if timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                name: "--timeout",
                reason: "must be greater than zero".into(),
            });
        }

        let lock_ttl = parse_duration(lock_ttl)?;
        if lock_ttl < Duration::from_secs(1) {
            return Err(ConfigError::InvalidValue {
                name: "--lock-ttl",
                reason: "must be at least 1s".into(),
            });
        }

        let claim_timeout = parse_duration(claim_timeout)?;
        if claim_timeout < Duration::from_secs(3) {
            return Err(ConfigError::InvalidValue {
                name: "--claim-timeout",
                reason: "must be at least 3s".into(),
            });
        }

        let locking = locking.trim().to_string();
        if !is_known_locking(&locking) {
            return Err(ConfigError::InvalidUrl {
                url: locking,
                reason: "expected 'local:' or a redis:// URL".into(),
            });
        }

        if root_repositories_dir.trim().is_empty() {
            return Err(ConfigError::MissingRequired("--root-repositories-dir".into()));
        }

        if *bucket_size > MAX_BUCKET_SIZE {
            return Err(ConfigError::InvalidValue {
                name: "--bucket-size",
                reason: format!("must be at most {}", MAX_BUCKET_SIZE),
            });
        }

        if *max_retries == 0 {
            return Err(ConfigError::InvalidValue {
                name: "--max-retries",
                reason: "must be at least 1".into(),
            });
        }

        if temp_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidPath {
                path: temp_dir.clone(),
                reason: "empty path".into(),
            });
        }

        Ok(Self {
            queue_url: args.queue.clone(),
            queue_name: args.queue_name.clone(),
            database: args.database.clone(),
            locking,
            lock_ttl,
            workers: *workers,
            timeout,
            root_repositories_dir: root_repositories_dir.clone(),
            bucket_size: *bucket_size,
            temp_dir: temp_dir.clone(),
            temp_dir_clean: *temp_dir_clean,
            max_retries: *max_retries,
            claim_timeout,
        })
    }

    /// Private subdirectory of the temp dir for this process
    pub fn process_temp_dir(&self) -> PathBuf {
        self.temp_dir.join(std::process::id().to_string())
    }

    /// Worker pool settings
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.workers,
            timeout: self.timeout,
            lock_ttl: self.lock_ttl,
            ..PoolConfig::default()
        }
    }
}

fn is_known_locking(locking: &str) -> bool {
    matches!(locking, "local:" | "local" | "local://")
        || locking.starts_with("redis://")
        || locking.starts_with("rediss://")
}
