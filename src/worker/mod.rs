//! Consumer side: the worker pool that runs archival units of work and the
//! consumer loop that feeds it from the queue

mod consumer;
mod pool;
mod stats;

pub use consumer::Consumer;
pub use pool::{ArchiverWorkerPool, PoolConfig, MAX_WORKERS};
pub use stats::WorkerStats;
