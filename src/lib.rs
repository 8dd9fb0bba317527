//! repo-archiver - Fleet-scale repository archiver
//!
//! Continuously discovers repositories, turns them into jobs, and archives
//! each repository's content into sharded, possibly remote storage.
//!
//! # Architecture
//!
//! ```text
//!  JobSource ──► Producer ──► JobQueue ──► Consumer (N workers)
//!                                              │
//!                  ┌───────────────────────────┼───────────────────────┐
//!                  ▼                           ▼                       ▼
//!            Locker ("repo:<id>")     TemporaryCloner         RootedTransactioner
//!            (local or Redis)         (fetch into temp)       (begin → apply → commit)
//!                                                                      │
//!                                                                      ▼
//!                                                         Fs (local dir or object store)
//! ```
//!
//! ## Producer
//! - Drains a [`job::JobSource`] and publishes encoded jobs to the queue
//! - Source errors are reported and never stop the loop
//!
//! ## Consumer
//! - A fixed number of workers consume jobs concurrently
//! - Each job runs under a distributed lock keyed by its repository id and
//!   under a deadline; the lock is always released before the next job
//! - Storage commits are all-or-nothing: a failed job never changes the
//!   durable version of a rooted repository
//!
//! # Delivery semantics
//!
//! The queue is at-least-once. Duplicate jobs for the same repository are
//! expected and made safe by the lock, not by the producer.

pub mod cloner;
pub mod config;
pub mod db;
pub mod error;
pub mod job;
pub mod lifecycle;
pub mod lock;
pub mod notify;
pub mod producer;
pub mod queue;
pub mod storage;
pub mod worker;

pub use config::{ConsumerConfig, ProducerConfig};
pub use error::{ArchiverError, Result};
pub use job::{Job, RepositoryId};
pub use lifecycle::{Lifecycle, State};
pub use notify::Notifiers;
pub use producer::Producer;
pub use worker::{ArchiverWorkerPool, Consumer};
