//! Job module
//!
//! A [`Job`] is the unit of work: one repository to archive. Jobs come from a
//! [`JobSource`] and travel through the queue in their encoded form.

mod source;
mod types;

pub use source::{JobSource, MentionJobSource, UrlListSource};
pub use types::{canonical_endpoint, Job, Mention, RepositoryId, Vcs};
