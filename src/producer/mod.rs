//! Job producer
//!
//! Drains a [`crate::job::JobSource`] into the job queue in a single
//! sequential loop. Source errors are reported and never end the loop; only
//! a stop request or a closed source does.

mod producer;

pub use producer::{Producer, ProducerStats};
